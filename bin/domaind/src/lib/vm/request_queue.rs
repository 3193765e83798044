// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Admission control for per-VM lifecycle requests.
//!
//! A VM accepts or rejects a request based on its current state and on
//! the requests already queued ahead of it. The queue keeps a
//! disposition for each request kind — enqueue it, silently ignore it
//! (idempotency), or deny it (it can never be satisfied from here, e.g.
//! rebooting after a stop has been requested) — and recomputes those
//! dispositions as requests are queued and as the lifecycle advances.

use std::collections::VecDeque;
use std::time::Duration;

use domaind_api_types::{Error, ShutdownReason};
use slog::{debug, info, Logger};

/// A lifecycle request admitted to a VM's queue. Handled by the VM's
/// worker in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternalRequest {
    /// Unpause the built domain (and start its device model first when
    /// it needs one).
    Start,

    /// Ask the guest to reboot; on acknowledgement the engine tears the
    /// domain down and rebuilds it from the preserved record.
    Reboot,

    /// Suspend the guest to its image file.
    Suspend,

    /// Ask the guest to shut down for good.
    Stop { reason: ShutdownReason, ack_delay: Duration },
}

#[derive(Copy, Clone, Debug, thiserror::Error)]
pub enum RequestDeniedReason {
    #[error("domain is not running")]
    NotRunning,
    #[error("domain is starting")]
    StartInProgress,
    #[error("domain is suspending")]
    SuspendInProgress,
    #[error("domain is preparing to stop")]
    HaltPending,
    #[error("domain is suspended")]
    Suspended,
    #[error("domain failed")]
    Failed,
}

impl From<RequestDeniedReason> for Error {
    fn from(r: RequestDeniedReason) -> Self {
        Error::InternalError(format!("forbidden state change: {r}"))
    }
}

/// Lifecycle transitions that change which requests make sense.
#[derive(Copy, Clone, Debug)]
pub enum LifecycleEvent {
    StartedRunning,
    Rebooted,
    Suspended,
    Stopped,
    Failed,
}

#[derive(Debug)]
enum DispositionChangeReason<'a> {
    ApiRequest(&'a ExternalRequest),
    StateChange(LifecycleEvent),
}

#[derive(Copy, Clone, Debug)]
enum RequestDisposition {
    Enqueue,
    /// Drop silently so repeated requests look idempotent to callers.
    Ignore,
    Deny(RequestDeniedReason),
}

#[derive(Copy, Clone, Debug)]
struct AllowedRequests {
    start: RequestDisposition,
    reboot: RequestDisposition,
    suspend: RequestDisposition,
    stop: RequestDisposition,
}

#[derive(Debug)]
pub struct ExternalRequestQueue {
    queue: VecDeque<ExternalRequest>,
    allowed: AllowedRequests,
    log: Logger,
}

impl ExternalRequestQueue {
    pub fn new(log: Logger) -> Self {
        Self {
            queue: VecDeque::new(),
            allowed: AllowedRequests {
                start: RequestDisposition::Enqueue,
                reboot: RequestDisposition::Deny(
                    RequestDeniedReason::NotRunning,
                ),
                suspend: RequestDisposition::Deny(
                    RequestDeniedReason::NotRunning,
                ),
                stop: RequestDisposition::Enqueue,
            },
            log,
        }
    }

    pub fn pop_front(&mut self) -> Option<ExternalRequest> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Asks to place the supplied request on the queue. If the request
    /// is enqueued, updates the dispositions for future requests.
    pub fn try_queue(
        &mut self,
        request: ExternalRequest,
    ) -> Result<(), RequestDeniedReason> {
        let disposition = match request {
            ExternalRequest::Start => self.allowed.start,
            ExternalRequest::Reboot => self.allowed.reboot,
            ExternalRequest::Suspend => self.allowed.suspend,
            // Requests to stop always succeed; a worker that has not
            // started yet still needs to observe the stop and wind down.
            ExternalRequest::Stop { .. } => self.allowed.stop,
        };

        info!(&self.log, "queuing lifecycle request";
              "request" => ?request, "disposition" => ?disposition);

        match disposition {
            RequestDisposition::Enqueue => {}
            RequestDisposition::Ignore => return Ok(()),
            RequestDisposition::Deny(reason) => return Err(reason),
        }

        self.allowed = self.get_new_dispositions(
            DispositionChangeReason::ApiRequest(&request),
        );
        self.queue.push_back(request);
        Ok(())
    }

    /// Notifies the queue that the VM's lifecycle advanced.
    pub fn notify_lifecycle_event(&mut self, event: LifecycleEvent) {
        self.allowed = self
            .get_new_dispositions(DispositionChangeReason::StateChange(event));
    }

    fn get_new_dispositions(
        &self,
        reason: DispositionChangeReason,
    ) -> AllowedRequests {
        debug!(self.log, "computing new queue dispositions";
               "reason" => ?reason);

        use DispositionChangeReason as ChangeReason;
        use RequestDeniedReason as DenyReason;
        use RequestDisposition as Disposition;
        match reason {
            // A queued start forecloses on everything that needs a
            // running guest until the start actually happens; repeats
            // are idempotent.
            ChangeReason::ApiRequest(ExternalRequest::Start) => {
                AllowedRequests {
                    start: Disposition::Ignore,
                    reboot: Disposition::Deny(DenyReason::StartInProgress),
                    suspend: Disposition::Deny(DenyReason::StartInProgress),
                    stop: self.allowed.stop,
                }
            }

            // Reboots do not affect other requests but are themselves
            // idempotent while one is pending.
            ChangeReason::ApiRequest(ExternalRequest::Reboot) => {
                AllowedRequests { reboot: Disposition::Ignore, ..self.allowed }
            }

            // One suspend at a time; a reboot queued behind a suspend
            // would never find the domain it expects.
            ChangeReason::ApiRequest(ExternalRequest::Suspend) => {
                AllowedRequests {
                    start: Disposition::Deny(DenyReason::SuspendInProgress),
                    reboot: Disposition::Deny(DenyReason::SuspendInProgress),
                    suspend: Disposition::Ignore,
                    stop: self.allowed.stop,
                }
            }

            // A pending stop blocks everything else; repeats are
            // idempotent.
            ChangeReason::ApiRequest(ExternalRequest::Stop { .. }) => {
                AllowedRequests {
                    start: Disposition::Deny(DenyReason::HaltPending),
                    reboot: Disposition::Deny(DenyReason::HaltPending),
                    suspend: Disposition::Deny(DenyReason::HaltPending),
                    stop: Disposition::Ignore,
                }
            }

            ChangeReason::StateChange(LifecycleEvent::StartedRunning) => {
                AllowedRequests {
                    start: Disposition::Ignore,
                    reboot: Disposition::Enqueue,
                    suspend: Disposition::Enqueue,
                    stop: self.allowed.stop,
                }
            }

            // A finished reboot re-opens the reboot disposition unless
            // something started denying reboots in the meantime.
            ChangeReason::StateChange(LifecycleEvent::Rebooted) => {
                let new_reboot =
                    if let Disposition::Ignore = self.allowed.reboot {
                        Disposition::Enqueue
                    } else {
                        self.allowed.reboot
                    };
                AllowedRequests { reboot: new_reboot, ..self.allowed }
            }

            ChangeReason::StateChange(LifecycleEvent::Suspended) => {
                AllowedRequests {
                    start: Disposition::Deny(DenyReason::Suspended),
                    reboot: Disposition::Deny(DenyReason::Suspended),
                    suspend: Disposition::Ignore,
                    stop: self.allowed.stop,
                }
            }

            ChangeReason::StateChange(LifecycleEvent::Stopped) => {
                AllowedRequests {
                    start: Disposition::Deny(DenyReason::NotRunning),
                    reboot: Disposition::Deny(DenyReason::NotRunning),
                    suspend: Disposition::Deny(DenyReason::NotRunning),
                    stop: Disposition::Ignore,
                }
            }

            ChangeReason::StateChange(LifecycleEvent::Failed) => {
                AllowedRequests {
                    start: Disposition::Deny(DenyReason::Failed),
                    reboot: Disposition::Deny(DenyReason::Failed),
                    suspend: Disposition::Deny(DenyReason::Failed),
                    stop: self.allowed.stop,
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn stop_request() -> ExternalRequest {
        ExternalRequest::Stop {
            reason: ShutdownReason::PowerOff,
            ack_delay: Duration::from_secs(30),
        }
    }

    #[test]
    fn start_requests_are_idempotent() {
        let mut queue = ExternalRequestQueue::new(test_logger());
        assert!(queue.try_queue(ExternalRequest::Start).is_ok());
        assert!(queue.try_queue(ExternalRequest::Start).is_ok());
        assert!(matches!(
            queue.pop_front(),
            Some(ExternalRequest::Start)
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn reboot_needs_a_running_domain() {
        let mut queue = ExternalRequestQueue::new(test_logger());
        assert!(queue.try_queue(ExternalRequest::Reboot).is_err());

        assert!(queue.try_queue(ExternalRequest::Start).is_ok());
        queue.pop_front();
        queue.notify_lifecycle_event(LifecycleEvent::StartedRunning);
        assert!(queue.try_queue(ExternalRequest::Reboot).is_ok());
    }

    #[test]
    fn reboots_are_idempotent_until_the_reboot_finishes() {
        let mut queue = ExternalRequestQueue::new(test_logger());
        queue.try_queue(ExternalRequest::Start).unwrap();
        queue.pop_front();
        queue.notify_lifecycle_event(LifecycleEvent::StartedRunning);

        for _ in 0..5 {
            assert!(queue.try_queue(ExternalRequest::Reboot).is_ok());
        }
        assert!(matches!(
            queue.pop_front(),
            Some(ExternalRequest::Reboot)
        ));
        assert!(queue.is_empty());

        queue.notify_lifecycle_event(LifecycleEvent::Rebooted);
        assert!(queue.try_queue(ExternalRequest::Reboot).is_ok());
        assert!(!queue.is_empty());
    }

    #[test]
    fn stop_blocks_everything_else() {
        let mut queue = ExternalRequestQueue::new(test_logger());
        queue.try_queue(ExternalRequest::Start).unwrap();
        queue.pop_front();
        queue.notify_lifecycle_event(LifecycleEvent::StartedRunning);

        assert!(queue.try_queue(stop_request()).is_ok());
        assert!(queue.try_queue(ExternalRequest::Reboot).is_err());
        assert!(queue.try_queue(ExternalRequest::Suspend).is_err());
        assert!(queue.try_queue(ExternalRequest::Start).is_err());
        // Repeated stops are dropped silently.
        assert!(queue.try_queue(stop_request()).is_ok());
        assert!(matches!(
            queue.pop_front(),
            Some(ExternalRequest::Stop { .. })
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn suspend_forecloses_on_reboot_but_not_stop() {
        let mut queue = ExternalRequestQueue::new(test_logger());
        queue.try_queue(ExternalRequest::Start).unwrap();
        queue.pop_front();
        queue.notify_lifecycle_event(LifecycleEvent::StartedRunning);

        assert!(queue.try_queue(ExternalRequest::Suspend).is_ok());
        assert!(queue.try_queue(ExternalRequest::Reboot).is_err());
        assert!(queue.try_queue(stop_request()).is_ok());

        queue.pop_front();
        queue.notify_lifecycle_event(LifecycleEvent::Suspended);
        assert!(queue.try_queue(ExternalRequest::Start).is_err());
    }

    #[test]
    fn stops_are_still_accepted_after_failure() {
        let mut queue = ExternalRequestQueue::new(test_logger());
        queue.try_queue(ExternalRequest::Start).unwrap();
        queue.pop_front();
        queue.notify_lifecycle_event(LifecycleEvent::Failed);

        assert!(queue.try_queue(ExternalRequest::Reboot).is_err());
        assert!(queue.try_queue(stop_request()).is_ok());
        assert!(matches!(
            queue.pop_front(),
            Some(ExternalRequest::Stop { .. })
        ));
    }
}
