// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the ballooning broker: the daemon that squeezes running
//! guests to satisfy a new reservation of host memory.
//!
//! A reservation exists only between `reserve` and either
//! `transfer_to_domain` (which binds it to a domain and ends its life as
//! a reservation) or `release`. [`BrokerHandle::with_reservation`] is the
//! only way the engine acquires one, and it releases on every path unless
//! the body reports a transfer — the engine never ends a call with an
//! orphaned reservation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domaind_api_types::{DomId, Error};
use slog::{info, warn, Logger};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

pub type SessionId = String;
pub type ReservationId = String;

/// Broker-reported failure codes.
pub mod code {
    pub const DOMAINS_REFUSED_TO_COOPERATE: i32 = 1;
    pub const CANNOT_FREE_THIS_MUCH: i32 = 2;
    pub const SESSION_LOST: i32 = 3;
    pub const UNKNOWN_RESERVATION: i32 = 4;
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("domains refused to cooperate")]
    DomainsRefusedToCooperate,
    #[error("cannot free this much memory")]
    CannotFreeThisMuch,
    #[error("session is no longer valid")]
    SessionLost,
    #[error("ballooning service absent")]
    ServiceAbsent,
    #[error("broker error {code}: {message}")]
    Code { code: i32, message: String },
}

impl BrokerError {
    pub fn from_code(code: i32, message: String) -> Self {
        match code {
            code::DOMAINS_REFUSED_TO_COOPERATE => {
                BrokerError::DomainsRefusedToCooperate
            }
            code::CANNOT_FREE_THIS_MUCH => BrokerError::CannotFreeThisMuch,
            code::SESSION_LOST => BrokerError::SessionLost,
            _ => BrokerError::Code { code, message },
        }
    }

    fn wire_code(&self) -> i32 {
        match self {
            BrokerError::DomainsRefusedToCooperate => {
                code::DOMAINS_REFUSED_TO_COOPERATE
            }
            BrokerError::CannotFreeThisMuch => code::CANNOT_FREE_THIS_MUCH,
            BrokerError::SessionLost => code::SESSION_LOST,
            BrokerError::ServiceAbsent => -1,
            BrokerError::Code { code, .. } => *code,
        }
    }
}

impl From<BrokerError> for Error {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::ServiceAbsent => Error::BallooningServiceAbsent,
            other => Error::BallooningError {
                code: other.wire_code(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MemoryBroker: Send + Sync {
    async fn login(&self) -> Result<SessionId, BrokerError>;
    async fn reserve(
        &self,
        session: &str,
        min: u64,
        max: u64,
    ) -> Result<(u64, ReservationId), BrokerError>;
    async fn transfer_to_domain(
        &self,
        session: &str,
        reservation: &str,
        domid: DomId,
    ) -> Result<(), BrokerError>;
    async fn release(
        &self,
        session: &str,
        reservation: &str,
    ) -> Result<(), BrokerError>;
    async fn balance(&self, session: &str) -> Result<(), BrokerError>;
}

/// A live reservation: `min <= amount <= max` held against the handle's
/// session.
#[derive(Clone, Debug)]
pub struct Reservation {
    pub id: ReservationId,
    pub amount: u64,
}

/// What the body of `with_reservation` did with the memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReservationDisposition {
    /// Ownership moved to a domain; there is nothing left to release.
    Transferred,
    /// The reservation is still loose and must be released.
    Release,
}

/// The engine's handle on the broker: one cached session for the whole
/// process, recreated on loss, plus the retry policy for cooperative
/// refusals.
pub struct BrokerHandle {
    broker: Arc<dyn MemoryBroker>,
    session: Mutex<Option<SessionId>>,
    retry_backoff: Duration,
    retry_total: Duration,
    log: Logger,
}

impl BrokerHandle {
    pub fn new(broker: Arc<dyn MemoryBroker>, log: Logger) -> Self {
        Self {
            broker,
            session: Mutex::new(None),
            retry_backoff: Duration::from_secs(10),
            retry_total: Duration::from_secs(60),
            log,
        }
    }

    /// Shrinks the retry cadence; the test suite has no patience.
    pub fn with_retry(mut self, backoff: Duration, total: Duration) -> Self {
        self.retry_backoff = backoff;
        self.retry_total = total;
        self
    }

    async fn session(&self) -> Result<SessionId, Error> {
        let mut guard = self.session.lock().await;
        if let Some(s) = guard.as_ref() {
            return Ok(s.clone());
        }
        let s = self.broker.login().await.map_err(Error::from)?;
        info!(self.log, "logged in to ballooning broker"; "session" => &s);
        *guard = Some(s.clone());
        Ok(s)
    }

    async fn drop_session(&self) {
        *self.session.lock().await = None;
    }

    /// Reserves between `min` and `max` bytes, waiting out transient
    /// refusals within the retry budget.
    pub async fn reserve(
        &self,
        min: u64,
        max: u64,
    ) -> Result<Reservation, Error> {
        let start = tokio::time::Instant::now();
        loop {
            let session = self.session().await?;
            match self.broker.reserve(&session, min, max).await {
                Ok((amount, id)) => {
                    if amount < min || amount > max {
                        // The broker broke its own contract; give the
                        // memory back before failing.
                        let _ = self.broker.release(&session, &id).await;
                        return Err(Error::InternalError(format!(
                            "broker reserved {amount} outside [{min}, {max}]"
                        )));
                    }
                    return Ok(Reservation { id, amount });
                }
                Err(
                    e @ (BrokerError::DomainsRefusedToCooperate
                    | BrokerError::CannotFreeThisMuch),
                ) => {
                    if start.elapsed() + self.retry_backoff > self.retry_total
                    {
                        return Err(e.into());
                    }
                    warn!(self.log, "broker refused, retrying";
                          "error" => %e,
                          "backoff_ms" => self.retry_backoff.as_millis()
                              as u64);
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(BrokerError::SessionLost) => self.drop_session().await,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn transfer(
        &self,
        reservation: &Reservation,
        domid: DomId,
    ) -> Result<(), Error> {
        let session = self.session().await?;
        self.broker
            .transfer_to_domain(&session, &reservation.id, domid)
            .await
            .map_err(Error::from)
    }

    pub async fn release(
        &self,
        reservation: &Reservation,
    ) -> Result<(), Error> {
        let session = self.session().await?;
        self.broker
            .release(&session, &reservation.id)
            .await
            .map_err(Error::from)
    }

    /// Best-effort rebalance hint.
    pub async fn balance(&self) -> Result<(), Error> {
        let session = self.session().await?;
        self.broker.balance(&session).await.map_err(Error::from)
    }

    /// Runs `f` with a fresh reservation. Unless `f` reports that it
    /// transferred the reservation to a domain, the reservation is
    /// released — on success, on error, and on the body's failure alike.
    pub async fn with_reservation<T, F, Fut>(
        &self,
        min: u64,
        max: u64,
        f: F,
    ) -> Result<T, Error>
    where
        F: FnOnce(Reservation) -> Fut,
        Fut: std::future::Future<
            Output = Result<(T, ReservationDisposition), Error>,
        >,
    {
        let reservation = self.reserve(min, max).await?;
        match f(reservation.clone()).await {
            Ok((value, ReservationDisposition::Transferred)) => Ok(value),
            Ok((value, ReservationDisposition::Release)) => {
                self.release(&reservation).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(release_err) = self.release(&reservation).await {
                    warn!(self.log, "failed to release reservation";
                          "reservation" => &reservation.id,
                          "error" => %release_err);
                }
                Err(e)
            }
        }
    }
}

/// The production client: one newline-delimited JSON request/response
/// exchange per call over the broker's unix socket.
pub struct SocketBroker {
    socket: PathBuf,
}

#[derive(serde::Serialize)]
struct WireRequest<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    params: serde_json::Value,
}

#[derive(serde::Deserialize)]
struct WireResponse {
    result: Option<serde_json::Value>,
    error: Option<WireError>,
}

#[derive(serde::Deserialize)]
struct WireError {
    code: i32,
    message: String,
}

impl SocketBroker {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    async fn call(
        &self,
        method: &str,
        session: Option<&str>,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BrokerError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|_| BrokerError::ServiceAbsent)?;
        let (rd, mut wr) = stream.into_split();
        let req = WireRequest { method, session, params };
        let mut line = serde_json::to_vec(&req)
            .map_err(|e| BrokerError::Code { code: -2, message: e.to_string() })?;
        line.push(b'\n');
        wr.write_all(&line)
            .await
            .map_err(|_| BrokerError::ServiceAbsent)?;

        let mut resp_line = String::new();
        BufReader::new(rd)
            .read_line(&mut resp_line)
            .await
            .map_err(|_| BrokerError::ServiceAbsent)?;
        let resp: WireResponse = serde_json::from_str(&resp_line)
            .map_err(|e| BrokerError::Code { code: -2, message: e.to_string() })?;
        if let Some(err) = resp.error {
            return Err(BrokerError::from_code(err.code, err.message));
        }
        Ok(resp.result.unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl MemoryBroker for SocketBroker {
    async fn login(&self) -> Result<SessionId, BrokerError> {
        let v = self.call("login", None, serde_json::json!({})).await?;
        v.as_str().map(str::to_owned).ok_or(BrokerError::Code {
            code: -2,
            message: "login reply was not a session id".into(),
        })
    }

    async fn reserve(
        &self,
        session: &str,
        min: u64,
        max: u64,
    ) -> Result<(u64, ReservationId), BrokerError> {
        let v = self
            .call(
                "reserve",
                Some(session),
                serde_json::json!({ "min": min, "max": max }),
            )
            .await?;
        let amount = v.get("amount").and_then(|a| a.as_u64());
        let id = v.get("id").and_then(|i| i.as_str());
        match (amount, id) {
            (Some(a), Some(i)) => Ok((a, i.to_owned())),
            _ => Err(BrokerError::Code {
                code: -2,
                message: "malformed reserve reply".into(),
            }),
        }
    }

    async fn transfer_to_domain(
        &self,
        session: &str,
        reservation: &str,
        domid: DomId,
    ) -> Result<(), BrokerError> {
        self.call(
            "transfer_to_domain",
            Some(session),
            serde_json::json!({ "reservation": reservation, "domid": domid }),
        )
        .await
        .map(|_| ())
    }

    async fn release(
        &self,
        session: &str,
        reservation: &str,
    ) -> Result<(), BrokerError> {
        self.call(
            "release",
            Some(session),
            serde_json::json!({ "reservation": reservation }),
        )
        .await
        .map(|_| ())
    }

    async fn balance(&self, session: &str) -> Result<(), BrokerError> {
        self.call("balance", Some(session), serde_json::json!({}))
            .await
            .map(|_| ())
    }
}

/// A simulated broker with introspectable accounting, used by tests to
/// assert that no call path leaks a reservation.
#[derive(Default)]
struct SimBrokerInner {
    free: u64,
    next_id: u64,
    /// session -> reservation id -> amount
    sessions: HashMap<String, HashMap<String, u64>>,
    refusals_left: u32,
    fail_transfers: bool,
}

#[derive(Clone, Default)]
pub struct SimBroker {
    inner: Arc<StdMutex<SimBrokerInner>>,
}

impl SimBroker {
    pub fn new(free_bytes: u64) -> Self {
        let sim = Self::default();
        sim.inner.lock().unwrap().free = free_bytes;
        sim
    }

    /// Makes the next `n` reserve calls fail with a cooperative refusal.
    pub fn inject_refusals(&self, n: u32) {
        self.inner.lock().unwrap().refusals_left = n;
    }

    /// Makes every transfer fail, simulating a broker that dies between
    /// reserve and transfer.
    pub fn fail_transfers(&self) {
        self.inner.lock().unwrap().fail_transfers = true;
    }

    /// Count of loose reservations across all sessions.
    pub fn outstanding_reservations(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.sessions.values().map(|m| m.len()).sum()
    }

    pub fn free_bytes(&self) -> u64 {
        self.inner.lock().unwrap().free
    }
}

#[async_trait]
impl MemoryBroker for SimBroker {
    async fn login(&self) -> Result<SessionId, BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let s = format!("session-{}", inner.next_id);
        inner.sessions.insert(s.clone(), HashMap::new());
        Ok(s)
    }

    async fn reserve(
        &self,
        session: &str,
        min: u64,
        max: u64,
    ) -> Result<(u64, ReservationId), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.refusals_left > 0 {
            inner.refusals_left -= 1;
            return Err(BrokerError::DomainsRefusedToCooperate);
        }
        if !inner.sessions.contains_key(session) {
            return Err(BrokerError::SessionLost);
        }
        if inner.free < min {
            return Err(BrokerError::CannotFreeThisMuch);
        }
        let amount = max.min(inner.free);
        inner.free -= amount;
        inner.next_id += 1;
        let id = format!("rsv-{}", inner.next_id);
        inner
            .sessions
            .get_mut(session)
            .expect("session checked above")
            .insert(id.clone(), amount);
        Ok((amount, id))
    }

    async fn transfer_to_domain(
        &self,
        session: &str,
        reservation: &str,
        _domid: DomId,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_transfers {
            return Err(BrokerError::Code {
                code: 17,
                message: "injected transfer failure".into(),
            });
        }
        let session = inner
            .sessions
            .get_mut(session)
            .ok_or(BrokerError::SessionLost)?;
        // The memory now belongs to the domain; it does not return to
        // the free pool.
        session.remove(reservation).map(|_| ()).ok_or(BrokerError::Code {
            code: code::UNKNOWN_RESERVATION,
            message: format!("unknown reservation {reservation}"),
        })
    }

    async fn release(
        &self,
        session: &str,
        reservation: &str,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        let amount = inner
            .sessions
            .get_mut(session)
            .ok_or(BrokerError::SessionLost)?
            .remove(reservation)
            .ok_or(BrokerError::Code {
                code: code::UNKNOWN_RESERVATION,
                message: format!("unknown reservation {reservation}"),
            })?;
        inner.free += amount;
        Ok(())
    }

    async fn balance(&self, _session: &str) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn fast_handle(broker: Arc<dyn MemoryBroker>) -> BrokerHandle {
        BrokerHandle::new(broker, test_logger())
            .with_retry(Duration::from_millis(5), Duration::from_millis(40))
    }

    #[tokio::test]
    async fn reserve_respects_the_requested_range() {
        let sim = SimBroker::new(1 << 30);
        let handle = fast_handle(Arc::new(sim.clone()));
        let r = handle.reserve(256 << 20, 512 << 20).await.unwrap();
        assert!(r.amount >= 256 << 20 && r.amount <= 512 << 20);
        handle.release(&r).await.unwrap();
        assert_eq!(sim.outstanding_reservations(), 0);
        assert_eq!(sim.free_bytes(), 1 << 30);
    }

    #[tokio::test]
    async fn transient_refusals_are_retried() {
        let sim = SimBroker::new(1 << 30);
        sim.inject_refusals(2);
        let handle = fast_handle(Arc::new(sim.clone()));
        let r = handle.reserve(1 << 20, 1 << 20).await.unwrap();
        assert_eq!(r.amount, 1 << 20);
    }

    #[tokio::test]
    async fn refusals_past_the_budget_surface_as_ballooning_error() {
        let sim = SimBroker::new(1 << 30);
        sim.inject_refusals(1000);
        let handle = fast_handle(Arc::new(sim.clone()));
        let err = handle.reserve(1 << 20, 1 << 20).await.unwrap_err();
        assert!(matches!(err, Error::BallooningError { .. }));
    }

    #[tokio::test]
    async fn with_reservation_releases_on_body_failure() {
        let sim = SimBroker::new(1 << 30);
        let handle = fast_handle(Arc::new(sim.clone()));
        let res: Result<(), Error> = handle
            .with_reservation(1 << 20, 1 << 20, |_r| async {
                Err(Error::InternalError("boom".into()))
            })
            .await;
        assert!(res.is_err());
        assert_eq!(sim.outstanding_reservations(), 0);
        assert_eq!(sim.free_bytes(), 1 << 30);
    }

    #[tokio::test]
    async fn with_reservation_keeps_transferred_memory() {
        let sim = SimBroker::new(1 << 30);
        let handle = fast_handle(Arc::new(sim.clone()));
        let amount = handle
            .with_reservation(1 << 20, 1 << 20, |r| async move {
                Ok((r.amount, ReservationDisposition::Transferred))
            })
            .await
            .unwrap();
        assert_eq!(amount, 1 << 20);
        assert_eq!(sim.outstanding_reservations(), 0);
        // Transferred memory belongs to the domain now.
        assert_eq!(sim.free_bytes(), (1 << 30) - (1 << 20));
    }
}
