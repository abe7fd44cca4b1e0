//! Per-item renewal coalescing and consistency tracking.
//!
//! Streams of one item expire at about the same time, so several
//! `renew-link` requests tend to arrive together. The coordinator queues
//! them per item and lets exactly one upstream query run at a time; its
//! answer (one fresh URL per MIME type) is then fanned out to every queued
//! request in arrival order.
//!
//! An item is *consistent* while every renewal produced a locator of the
//! same kind as the one it replaces. The first mismatch flips it for good:
//! the partially fetched bytes no longer line up and the task must restart
//! from scratch with fresh locators.
//!
//! The coordinator does no I/O; the scheduler issues the upstream queries it
//! asks for and routes the replies it returns.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::locator::{LocatorError, MediaLocator};
use crate::protocol::{Message, RequestId};
use crate::task::{ItemKey, TaskId};

/// A queued `renew-link` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalRequest {
    /// Task whose worker asked.
    pub task_id: TaskId,
    /// Correlation id to echo.
    pub request_id: RequestId,
    /// Stream index within the task.
    pub index: usize,
    /// The expired locator URL.
    pub locator: String,
    /// URL of the last chunk the stream committed.
    pub last_successful_url: Option<String>,
}

/// A reply to route back to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalReply {
    /// Task whose worker gets the reply.
    pub task_id: TaskId,
    /// `link-renewed` or `renew-failed`.
    pub message: Message,
}

#[derive(Debug)]
struct ItemState {
    consistent: bool,
    query_pending: bool,
    queue: VecDeque<RenewalRequest>,
}

impl Default for ItemState {
    fn default() -> Self {
        Self {
            consistent: true,
            query_pending: false,
            queue: VecDeque::new(),
        }
    }
}

/// Serializes renewals per item. Owned by the scheduler's dispatch task.
#[derive(Debug, Default)]
pub struct ConsistencyCoordinator {
    items: HashMap<ItemKey, ItemState>,
}

impl ConsistencyCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every renewal for `item` so far preserved locator kind.
    #[must_use]
    pub fn is_consistent(&self, item: &ItemKey) -> bool {
        self.items.get(item).is_none_or(|state| state.consistent)
    }

    /// Whether an upstream query for `item` is in flight.
    #[must_use]
    pub fn is_query_pending(&self, item: &ItemKey) -> bool {
        self.items.get(item).is_some_and(|state| state.query_pending)
    }

    /// Number of requests waiting for `item`'s upstream answer.
    #[must_use]
    pub fn queued(&self, item: &ItemKey) -> usize {
        self.items.get(item).map_or(0, |state| state.queue.len())
    }

    /// Forgets everything about `item`; used when it restarts from scratch.
    ///
    /// Requests still queued are dropped without a reply, so only call this
    /// when no worker for the item is alive.
    pub fn reset(&mut self, item: &ItemKey) {
        if self.items.remove(item).is_some() {
            debug!(%item, "consistency state reset");
        }
    }

    /// Queues `request` under `item`.
    ///
    /// Returns `true` when the caller must issue the upstream query; `false`
    /// while one is already outstanding for the item.
    pub fn query_renewal(&mut self, item: &ItemKey, request: RenewalRequest) -> bool {
        let state = self.items.entry(item.clone()).or_default();
        state.queue.push_back(request);
        if state.query_pending {
            debug!(%item, queued = state.queue.len(), "renewal coalesced");
            return false;
        }
        state.query_pending = true;
        info!(%item, "requesting fresh locators");
        true
    }

    /// Applies the upstream answer to every queued request, FIFO.
    pub fn on_locators_fetched(&mut self, item: &ItemKey, urls: &[String]) -> Vec<RenewalReply> {
        let Some(state) = self.items.get_mut(item) else {
            return Vec::new();
        };
        state.query_pending = false;

        let fresh: Vec<MediaLocator> = urls
            .iter()
            .filter_map(|url| match MediaLocator::parse(url) {
                Ok(locator) => Some(locator),
                Err(e) => {
                    warn!(%item, error = %e, "ignoring unusable fresh locator");
                    None
                }
            })
            .collect();

        let mut replies = Vec::with_capacity(state.queue.len());
        while let Some(request) = state.queue.pop_front() {
            let message = renew_one(&mut state.consistent, &request, &fresh);
            replies.push(RenewalReply {
                task_id: request.task_id,
                message,
            });
        }
        if !state.consistent {
            warn!(%item, "item became inconsistent after renewal");
        }
        replies
    }

    /// Fails every queued request for `item`.
    pub fn on_fetch_failed(&mut self, item: &ItemKey, reason: &str) -> Vec<RenewalReply> {
        let Some(state) = self.items.get_mut(item) else {
            return Vec::new();
        };
        state.query_pending = false;
        warn!(%item, reason, queued = state.queue.len(), "upstream renewal failed");
        state
            .queue
            .drain(..)
            .map(|request| RenewalReply {
                task_id: request.task_id,
                message: Message::RenewFailed {
                    request_id: request.request_id,
                    reason: reason.to_string(),
                },
            })
            .collect()
    }
}

fn renew_one(consistent: &mut bool, request: &RenewalRequest, fresh: &[MediaLocator]) -> Message {
    let failed = |reason: String| Message::RenewFailed {
        request_id: request.request_id,
        reason,
    };

    let mut current = match MediaLocator::parse(&request.locator) {
        Ok(locator) => locator,
        Err(e) => return failed(e.to_string()),
    };
    let Some(newer) = fresh.iter().find(|l| l.mime() == current.mime()) else {
        return failed(format!("no fresh locator with MIME type {}", current.mime()));
    };

    let locator = match current.renew(newer, request.last_successful_url.as_deref()) {
        Ok(()) => current.raw_url().to_string(),
        Err(e @ LocatorError::KindMismatch { .. }) => {
            warn!(index = request.index, error = %e, "renewal broke item consistency");
            *consistent = false;
            newer.raw_url().to_string()
        }
        Err(e) => return failed(e.to_string()),
    };

    Message::LinkRenewed {
        request_id: request.request_id,
        locator,
        consistent: *consistent,
    }
}
