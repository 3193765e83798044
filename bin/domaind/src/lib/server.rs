// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP server callback functions.
//!
//! Functions in this module verify parameters and convert between wire
//! types and engine types before handing operations to the per-VM
//! workers. Nothing here holds VM state; the engine owns all of it.

use std::sync::Arc;
use std::time::Duration;

use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseCreated, HttpResponseOk,
    HttpResponseUpdatedNoContent, Path, Query, RequestContext, TypedBody,
    UntypedBody,
};
use schemars::JsonSchema;
use serde::Deserialize;
use slog::{info, Logger};

use domaind_api_types::{
    DebugTriggerRequest, DeviceStateResponse, DiskBackend, Error, PciSpec,
    ShutdownReason, ShutdownRequest, UpdateBatch, VbdSpec, VifSpec,
    VmConfig, VmCreateResponse, VmId, VmInternalState, VmStateResponse,
};

use crate::store::{ControlTree, TX_NONE};
use crate::vm::request_queue::ExternalRequest;
use crate::vm::Engine;

/// Shared context for every endpoint.
pub struct ApiContext {
    pub engine: Arc<Engine>,
    pub log: Logger,
}

/// Maps the closed error taxonomy onto HTTP statuses, carrying the
/// serialized variant as the body so callers can round-trip it.
fn api_error(e: Error) -> HttpError {
    let body =
        serde_json::to_string(&e).unwrap_or_else(|_| e.to_string());
    match e {
        Error::DoesNotExist => HttpError::for_not_found(None, body),
        Error::AlreadyExists
        | Error::BadCpuidTemplate
        | Error::BadInterfaceName(_)
        | Error::NotSupported => HttpError::for_bad_request(None, body),
        _ => HttpError::for_internal_error(body),
    }
}

#[derive(Deserialize, JsonSchema)]
struct VmPathParams {
    id: String,
}

#[derive(Deserialize, JsonSchema)]
struct VbdPathParams {
    id: String,
    device_id: String,
}

#[derive(Deserialize, JsonSchema)]
struct VifPathParams {
    id: String,
    position: u32,
}

#[derive(Deserialize, JsonSchema)]
struct PciPathParams {
    id: String,
    slot: u32,
}

#[derive(Deserialize, JsonSchema)]
struct DestroyQuery {
    /// Keep the `/vm/<uuid>` subtree in the control tree.
    preserve_vm_node: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
struct UnplugQuery {
    force: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
struct UpdatesQuery {
    last: Option<u64>,
    timeout_ms: Option<u64>,
}

fn vm_id(params: &VmPathParams) -> VmId {
    VmId(params.id.clone())
}

#[endpoint {
    method = PUT,
    path = "/vm/{id}",
}]
async fn vm_create(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
    body: TypedBody<VmConfig>,
) -> Result<HttpResponseCreated<VmCreateResponse>, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    let cfg = body.into_inner();
    if cfg.id != vm {
        return Err(HttpError::for_bad_request(
            None,
            "body id does not match path id".to_string(),
        ));
    }
    let domid = ctx
        .engine
        .run_on(&vm, move |vctx| async move { vctx.create(cfg).await })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseCreated(VmCreateResponse { domid }))
}

#[endpoint {
    method = POST,
    path = "/vm/{id}/build",
}]
async fn vm_build(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    ctx.engine
        .run_on(&vm, |vctx| async move { vctx.build().await })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/vm/{id}/unpause",
}]
async fn vm_unpause(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    ctx.engine
        .submit_lifecycle(&vm, ExternalRequest::Start)
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/vm/{id}/pause",
}]
async fn vm_pause(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    ctx.engine
        .run_on(&vm, |vctx| async move { vctx.pause().await })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/vm/{id}/shutdown",
}]
async fn vm_shutdown(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
    body: TypedBody<ShutdownRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    let req = body.into_inner();
    let request = match req.reason {
        ShutdownReason::Reboot => ExternalRequest::Reboot,
        ShutdownReason::Suspend => ExternalRequest::Suspend,
        reason => ExternalRequest::Stop {
            reason,
            ack_delay: Duration::from_millis(req.ack_delay_ms),
        },
    };
    ctx.engine
        .submit_lifecycle(&vm, request)
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/vm/{id}/suspend",
}]
async fn vm_suspend(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    ctx.engine
        .submit_lifecycle(&vm, ExternalRequest::Suspend)
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/vm/{id}/restore",
}]
async fn vm_restore(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    ctx.engine
        .run_on(&vm, |vctx| async move { vctx.restore().await })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = DELETE,
    path = "/vm/{id}",
}]
async fn vm_destroy(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
    query: Query<DestroyQuery>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    let preserve = query.into_inner().preserve_vm_node.unwrap_or(false);
    ctx.engine
        .run_on(&vm, move |vctx| async move { vctx.destroy(preserve).await })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = GET,
    path = "/vm/{id}",
}]
async fn vm_get_state(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseOk<VmStateResponse>, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    let state = ctx
        .engine
        .run_on(&vm, |vctx| async move { vctx.get_state().await })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseOk(state))
}

#[endpoint {
    method = GET,
    path = "/vm/{id}/domain-action-request",
}]
async fn vm_domain_action_request(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseOk<Option<ShutdownReason>>, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    let action = ctx
        .engine
        .run_on(&vm, |vctx| async move {
            vctx.domain_action_request().await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseOk(action))
}

#[endpoint {
    method = GET,
    path = "/vm/{id}/internal-state",
}]
async fn vm_get_internal_state(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseOk<VmInternalState>, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    let payload = ctx
        .engine
        .run_on(&vm, |vctx| async move { vctx.get_internal_state().await })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseOk(VmInternalState { payload }))
}

#[endpoint {
    method = PUT,
    path = "/vm/{id}/internal-state",
}]
async fn vm_set_internal_state(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
    body: TypedBody<VmInternalState>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    let payload = body.into_inner().payload;
    ctx.engine
        .run_on(&vm, move |vctx| async move {
            vctx.set_internal_state(&payload).await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{id}/memory",
}]
async fn vm_receive_memory(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
    body: UntypedBody,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    let bytes = body.as_bytes().to_vec();
    // Streaming jobs take the slow lane so they cannot starve ordinary
    // lifecycle operations.
    ctx.engine
        .run_slow(&vm, move |vctx| async move {
            vctx.receive_memory(bytes).await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{id}/vbd",
}]
async fn vbd_plug(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
    body: TypedBody<VbdSpec>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    let spec = body.into_inner();
    ctx.engine
        .run_on(&vm, move |vctx| async move { vctx.vbd_plug(spec).await })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = DELETE,
    path = "/vm/{id}/vbd/{device_id}",
}]
async fn vbd_unplug(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VbdPathParams>,
    query: Query<UnplugQuery>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let params = path.into_inner();
    let vm = VmId(params.id.clone());
    let force = query.into_inner().force.unwrap_or(false);
    let device_id = params.device_id;
    ctx.engine
        .run_on(&vm, move |vctx| async move {
            vctx.vbd_unplug(&device_id, force).await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/vm/{id}/vbd/{device_id}/insert",
}]
async fn vbd_insert(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VbdPathParams>,
    body: TypedBody<DiskBackend>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let params = path.into_inner();
    let vm = VmId(params.id.clone());
    let device_id = params.device_id;
    let backend = body.into_inner();
    ctx.engine
        .run_on(&vm, move |vctx| async move {
            vctx.vbd_insert(&device_id, backend).await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/vm/{id}/vbd/{device_id}/eject",
}]
async fn vbd_eject(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VbdPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let params = path.into_inner();
    let vm = VmId(params.id.clone());
    let device_id = params.device_id;
    ctx.engine
        .run_on(&vm, move |vctx| async move {
            vctx.vbd_eject(&device_id).await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = GET,
    path = "/vm/{id}/vbd/{device_id}/state",
}]
async fn vbd_get_state(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VbdPathParams>,
) -> Result<HttpResponseOk<DeviceStateResponse>, HttpError> {
    let ctx = rqctx.context();
    let params = path.into_inner();
    let vm = VmId(params.id.clone());
    let device_id = params.device_id;
    let state = ctx
        .engine
        .run_on(&vm, move |vctx| async move {
            vctx.vbd_state(&device_id).await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseOk(state))
}

#[endpoint {
    method = GET,
    path = "/vm/{id}/vbd/{device_id}/device-action-request",
}]
async fn vbd_device_action_request(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VbdPathParams>,
) -> Result<HttpResponseOk<Option<String>>, HttpError> {
    let ctx = rqctx.context();
    let params = path.into_inner();
    let vm = VmId(params.id.clone());
    let device_id = params.device_id;
    let action = ctx
        .engine
        .run_on(&vm, move |vctx| async move {
            vctx.vbd_action_request(&device_id).await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseOk(action))
}

#[endpoint {
    method = PUT,
    path = "/vm/{id}/vif",
}]
async fn vif_plug(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
    body: TypedBody<VifSpec>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    let spec = body.into_inner();
    ctx.engine
        .run_on(&vm, move |vctx| async move { vctx.vif_plug(spec).await })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = DELETE,
    path = "/vm/{id}/vif/{position}",
}]
async fn vif_unplug(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VifPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let params = path.into_inner();
    let vm = VmId(params.id.clone());
    let position = params.position;
    ctx.engine
        .run_on(&vm, move |vctx| async move {
            vctx.vif_unplug(position).await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = GET,
    path = "/vm/{id}/vif/{position}/state",
}]
async fn vif_get_state(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VifPathParams>,
) -> Result<HttpResponseOk<DeviceStateResponse>, HttpError> {
    let ctx = rqctx.context();
    let params = path.into_inner();
    let vm = VmId(params.id.clone());
    let position = params.position;
    let state = ctx
        .engine
        .run_on(&vm, move |vctx| async move {
            vctx.vif_state(position).await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseOk(state))
}

#[endpoint {
    method = PUT,
    path = "/vm/{id}/pci",
}]
async fn pci_plug(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<VmPathParams>,
    body: TypedBody<PciSpec>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let vm = vm_id(&path.into_inner());
    let spec = body.into_inner();
    ctx.engine
        .run_on(&vm, move |vctx| async move { vctx.pci_plug(spec).await })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = DELETE,
    path = "/vm/{id}/pci/{slot}",
}]
async fn pci_unplug(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<PciPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let params = path.into_inner();
    let vm = VmId(params.id.clone());
    let slot = params.slot;
    ctx.engine
        .run_on(&vm, move |vctx| async move {
            vctx.pci_unplug(slot).await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = GET,
    path = "/vm/{id}/pci/{slot}/state",
}]
async fn pci_get_state(
    rqctx: RequestContext<Arc<ApiContext>>,
    path: Path<PciPathParams>,
) -> Result<HttpResponseOk<DeviceStateResponse>, HttpError> {
    let ctx = rqctx.context();
    let params = path.into_inner();
    let vm = VmId(params.id.clone());
    let slot = params.slot;
    let state = ctx
        .engine
        .run_on(&vm, move |vctx| async move {
            vctx.pci_state(slot).await
        })
        .await
        .map_err(api_error)?;
    Ok(HttpResponseOk(state))
}

#[endpoint {
    method = GET,
    path = "/updates",
}]
async fn updates_get(
    rqctx: RequestContext<Arc<ApiContext>>,
    query: Query<UpdatesQuery>,
) -> Result<HttpResponseOk<UpdateBatch>, HttpError> {
    let ctx = rqctx.context();
    let q = query.into_inner();
    let batch = ctx
        .engine
        .deps()
        .updates
        .get(
            q.last.unwrap_or(0),
            Duration::from_millis(q.timeout_ms.unwrap_or(5_000)),
        )
        .await;
    Ok(HttpResponseOk(batch))
}

#[endpoint {
    method = POST,
    path = "/debug/trigger",
}]
async fn debug_trigger(
    rqctx: RequestContext<Arc<ApiContext>>,
    body: TypedBody<DebugTriggerRequest>,
) -> Result<HttpResponseOk<String>, HttpError> {
    let ctx = rqctx.context();
    let req = body.into_inner();
    info!(ctx.log, "debug trigger"; "cmd" => &req.cmd);
    let deps = ctx.engine.deps();
    match req.cmd.as_str() {
        "balance-memory" => {
            deps.broker.balance().await.map_err(api_error)?;
            Ok(HttpResponseOk("balanced".to_string()))
        }
        "sysrq" => {
            let [vm, key] = req.args.as_slice() else {
                return Err(HttpError::for_bad_request(
                    None,
                    "sysrq takes <vm> <key>".to_string(),
                ));
            };
            let state = ctx
                .engine
                .run_on(&VmId(vm.clone()), |vctx| async move {
                    vctx.get_state().await
                })
                .await
                .map_err(api_error)?;
            let domid = state.domid.ok_or_else(|| {
                api_error(Error::DoesNotExist)
            })?;
            deps.tree
                .write(
                    TX_NONE,
                    &format!("/local/domain/{domid}/control/sysrq"),
                    key,
                )
                .await
                .map_err(api_error)?;
            Ok(HttpResponseOk("sysrq sent".to_string()))
        }
        "dump-tree" => {
            let root =
                req.args.first().map(String::as_str).unwrap_or("/");
            let dump = dump_tree(deps.tree.as_ref(), root)
                .await
                .map_err(api_error)?;
            Ok(HttpResponseOk(dump))
        }
        other => Err(HttpError::for_bad_request(
            None,
            format!("unknown debug command {other:?}"),
        )),
    }
}

/// Walks a subtree into `path = value` lines for debugging.
async fn dump_tree(
    tree: &dyn ControlTree,
    root: &str,
) -> Result<String, Error> {
    let mut out = String::new();
    let mut stack = vec![root.trim_end_matches('/').to_string()];
    while let Some(path) = stack.pop() {
        let display = if path.is_empty() { "/" } else { &path };
        if let Ok(value) = tree.read(TX_NONE, display).await {
            if !value.is_empty() {
                out.push_str(&format!("{display} = {value:?}\n"));
            }
        }
        if let Ok(children) = tree.directory(TX_NONE, display).await {
            for child in children.into_iter().rev() {
                stack.push(format!("{path}/{child}"));
            }
        }
    }
    Ok(out)
}

/// Returns a Dropshot [`ApiDescription`] object to launch a server.
pub fn api() -> ApiDescription<Arc<ApiContext>> {
    let mut api = ApiDescription::new();
    api.register(vm_create).unwrap();
    api.register(vm_build).unwrap();
    api.register(vm_unpause).unwrap();
    api.register(vm_pause).unwrap();
    api.register(vm_shutdown).unwrap();
    api.register(vm_suspend).unwrap();
    api.register(vm_restore).unwrap();
    api.register(vm_destroy).unwrap();
    api.register(vm_get_state).unwrap();
    api.register(vm_domain_action_request).unwrap();
    api.register(vm_get_internal_state).unwrap();
    api.register(vm_set_internal_state).unwrap();
    api.register(vm_receive_memory).unwrap();
    api.register(vbd_plug).unwrap();
    api.register(vbd_unplug).unwrap();
    api.register(vbd_insert).unwrap();
    api.register(vbd_eject).unwrap();
    api.register(vbd_get_state).unwrap();
    api.register(vbd_device_action_request).unwrap();
    api.register(vif_plug).unwrap();
    api.register(vif_unplug).unwrap();
    api.register(vif_get_state).unwrap();
    api.register(pci_plug).unwrap();
    api.register(pci_unplug).unwrap();
    api.register(pci_get_state).unwrap();
    api.register(updates_get).unwrap();
    api.register(debug_trigger).unwrap();
    api
}

#[cfg(test)]
mod test {
    #[test]
    fn api_description_registers_cleanly() {
        let _ = super::api();
    }
}
