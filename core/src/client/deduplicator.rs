use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{NetworkErrorKind, StrataError};
use crate::model::request::RequestConfig;

use super::ApiResult;

/// The two roles a caller can be assigned for an in-flight request key.
pub enum BeginOutcome {
    /// The caller owns the transport call and must invoke
    /// [Deduplicator::complete] with its result.
    Primary,
    /// Another caller already owns the transport call; await the receiver
    /// for its result.
    Duplicate(oneshot::Receiver<ApiResult>),
}

/// Single-flight fan-out for identical in-flight requests. Only configs with
/// `deduplicate = true` participate; at any instant at most one primary
/// exists per config key, and every duplicate waiter receives exactly the
/// result the primary produced. The internal mutex makes begin/complete
/// linearizable: a waiter registered before a completion is observed always
/// receives that completion.
#[derive(Default)]
pub struct Deduplicator {
    in_flight: Mutex<HashMap<RequestConfig, Vec<oneshot::Sender<ApiResult>>>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, config: &RequestConfig) -> BeginOutcome {
        if !config.deduplicate {
            return BeginOutcome::Primary;
        }
        let mut in_flight = self.in_flight.lock().unwrap();
        match in_flight.get_mut(config) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                BeginOutcome::Duplicate(rx)
            }
            None => {
                in_flight.insert(config.clone(), Vec::new());
                BeginOutcome::Primary
            }
        }
    }

    /// Fans the primary's result out to every waiter and releases the key.
    /// Waiters whose receiver was dropped are skipped; their cancellation
    /// never disturbs the rest.
    pub fn complete(&self, config: &RequestConfig, result: &ApiResult) {
        if !config.deduplicate {
            return;
        }
        let waiters = self.in_flight.lock().unwrap().remove(config);
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }
}

/// Completes the deduplication entry with `cancelled` if the primary is
/// dropped before producing a result, so waiters never hang on an abandoned
/// key.
pub(super) struct PrimaryGuard<'a> {
    deduplicator: &'a Deduplicator,
    config: &'a RequestConfig,
    armed: bool,
}

impl<'a> PrimaryGuard<'a> {
    pub fn new(deduplicator: &'a Deduplicator, config: &'a RequestConfig) -> Self {
        Self {
            deduplicator,
            config,
            armed: true,
        }
    }

    /// Publishes the final result and disarms the guard.
    pub fn complete(mut self, result: &ApiResult) {
        self.deduplicator.complete(self.config, result);
        self.armed = false;
    }
}

impl Drop for PrimaryGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.deduplicator.complete(
                self.config,
                &Err(StrataError::Network(NetworkErrorKind::Cancelled)),
            );
        }
    }
}
