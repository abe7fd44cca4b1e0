//! Worker side of the protocol: events, RPCs and reply routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{Message, Outbox, ProtocolError, RequestId};

/// Answer to a renew-link RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    /// The host produced a re-addressed locator.
    Renewed {
        /// Locator URL to continue with.
        locator: String,
        /// `false` if the item's locators changed kind.
        consistent: bool,
    },
    /// The host could not produce a locator.
    Failed {
        /// Why.
        reason: String,
    },
}

/// What the transfer engine may tell its host.
///
/// Events are fire-and-forget; the two RPCs suspend the calling stream until
/// the host answers.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Reports an event.
    fn notify(&self, event: Message);

    /// Asks whether stream `index` may commit its next chunk.
    async fn can_proceed(&self, index: usize) -> Result<bool, ProtocolError>;

    /// Asks the host for a replacement of an expired locator.
    async fn renew_link(
        &self,
        index: usize,
        locator: &str,
        last_successful_url: Option<&str>,
    ) -> Result<RenewOutcome, ProtocolError>;
}

/// Result of routing one inbound host message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A waiting RPC was answered (or the reply was stale).
    Handled,
    /// The host asked the worker to stop.
    Terminate,
}

#[derive(Debug)]
enum Reply {
    Permission(bool),
    Renew(RenewOutcome),
}

#[derive(Debug, Default)]
struct Pending {
    closed: bool,
    slots: HashMap<RequestId, oneshot::Sender<Reply>>,
}

/// [`EventSink`] over a control channel.
///
/// The pending-RPC table is shared between the callers (streams) and the
/// listener loop that feeds [`ControlClient::deliver`].
#[derive(Debug)]
pub struct ControlClient {
    outbox: Outbox,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    rpc_timeout: Option<Duration>,
}

impl ControlClient {
    /// Creates a client writing to `outbox`. `rpc_timeout` of `None` waits
    /// for replies indefinitely.
    #[must_use]
    pub fn new(outbox: Outbox, rpc_timeout: Option<Duration>) -> Self {
        Self {
            outbox,
            pending: Mutex::new(Pending::default()),
            next_id: AtomicU64::new(1),
            rpc_timeout,
        }
    }

    /// The underlying outbox.
    #[must_use]
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Routes one inbound host message.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Unexpected`] for anything the host must not send
    /// after `start`.
    pub fn deliver(&self, message: Message) -> Result<Delivery, ProtocolError> {
        match message {
            Message::DlPermission {
                request_id,
                allowed,
            } => self.fulfil(request_id, Reply::Permission(allowed)),
            Message::LinkRenewed {
                request_id,
                locator,
                consistent,
            } => self.fulfil(
                request_id,
                Reply::Renew(RenewOutcome::Renewed {
                    locator,
                    consistent,
                }),
            ),
            Message::RenewFailed { request_id, reason } => {
                self.fulfil(request_id, Reply::Renew(RenewOutcome::Failed { reason }))
            }
            Message::Terminate => Ok(Delivery::Terminate),
            other => Err(ProtocolError::Unexpected { code: other.code() }),
        }
    }

    /// Refuses further RPCs and resolves every pending one to
    /// [`ProtocolError::Terminated`].
    pub fn close(&self) {
        let mut pending = self.lock();
        pending.closed = true;
        let dropped = pending.slots.len();
        pending.slots.clear();
        if dropped > 0 {
            debug!(dropped, "pending calls cancelled");
        }
    }

    fn fulfil(&self, request_id: RequestId, reply: Reply) -> Result<Delivery, ProtocolError> {
        match self.lock().slots.remove(&request_id) {
            Some(slot) => {
                // The caller may have timed out in the meantime.
                slot.send(reply).ok();
            }
            None => warn!(request_id, "reply for unknown or expired request"),
        }
        Ok(Delivery::Handled)
    }

    async fn call(&self, build: impl FnOnce(RequestId) -> Message) -> Result<Reply, ProtocolError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock();
            if pending.closed {
                return Err(ProtocolError::Terminated);
            }
            pending.slots.insert(request_id, tx);
        }

        let request = build(request_id);
        let code = request.code();
        if let Err(e) = self.outbox.send(request) {
            self.lock().slots.remove(&request_id);
            return Err(e);
        }

        let reply = match self.rpc_timeout {
            None => rx.await,
            Some(limit) => {
                if let Ok(reply) = tokio::time::timeout(limit, rx).await {
                    reply
                } else {
                    self.lock().slots.remove(&request_id);
                    return Err(ProtocolError::Timeout {
                        code,
                        millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
        };
        reply.map_err(|_| ProtocolError::Terminated)
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventSink for ControlClient {
    fn notify(&self, event: Message) {
        let code = event.code();
        if self.outbox.send(event).is_err() {
            debug!(code, "event dropped, channel closed");
        }
    }

    async fn can_proceed(&self, index: usize) -> Result<bool, ProtocolError> {
        match self
            .call(|request_id| Message::CanProceedDl { request_id, index })
            .await?
        {
            Reply::Permission(allowed) => Ok(allowed),
            Reply::Renew(_) => Err(ProtocolError::Unexpected {
                code: "link-renewed",
            }),
        }
    }

    async fn renew_link(
        &self,
        index: usize,
        locator: &str,
        last_successful_url: Option<&str>,
    ) -> Result<RenewOutcome, ProtocolError> {
        let reply = self
            .call(|request_id| Message::RenewLink {
                request_id,
                index,
                locator: locator.to_string(),
                last_successful_url: last_successful_url.map(str::to_string),
            })
            .await?;
        match reply {
            Reply::Renew(outcome) => Ok(outcome),
            Reply::Permission(_) => Err(ProtocolError::Unexpected {
                code: "dl-permission",
            }),
        }
    }
}
