use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use object_store::ObjectStore;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::client::{ApiClient, ApiResponse};
use crate::conf;
use crate::error::{NetworkErrorKind, Result, StrataError};
use crate::queue::durable::{DurableMap, ObjectStoreMap};

use super::scheduler::{ProcessDriver, ProcessingResult, Scheduler};
use super::{QueuedRequest, RequestAborter, RequestQueue};

/// Terminal outcome of one queued request, broadcast to registered handlers.
/// Outcomes that lead to a retry are never broadcast, so consumers cannot
/// observe a retrying failure as final.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Success(ApiResponse),
    Failure(StrataError),
    /// The platform expired the background scope before the send finished
    /// and the request could not be rescheduled.
    BackgroundSessionExpired,
    /// The request was aborted externally, never by the processor itself.
    Aborted,
}

/// Consumers of queued-request outcomes, notified in registration order.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle_outcome(&self, request: &QueuedRequest, outcome: &RequestOutcome);
}

/// The processor's view of its queue.
#[async_trait]
pub trait QueueDelegate: Send + Sync {
    async fn next_request(&self) -> Result<Option<QueuedRequest>>;
    async fn prepend(&self, request: QueuedRequest) -> Result<()>;
    async fn remove_requests(
        &self,
        pred: &(dyn for<'a> Fn(&'a QueuedRequest) -> bool + Send + Sync),
    ) -> Result<Vec<QueuedRequest>>;
}

#[async_trait]
impl<Q: RequestQueue> QueueDelegate for Q {
    async fn next_request(&self) -> Result<Option<QueuedRequest>> {
        self.pop_first().await
    }

    async fn prepend(&self, request: QueuedRequest) -> Result<()> {
        RequestQueue::prepend(self, request).await
    }

    async fn remove_requests(
        &self,
        pred: &(dyn for<'a> Fn(&'a QueuedRequest) -> bool + Send + Sync),
    ) -> Result<Vec<QueuedRequest>> {
        self.remove_matching(pred).await
    }
}

/// Handle for one platform background execution scope. The contained
/// callback runs when the scope ends, whether by completion or drop.
pub struct BackgroundScope {
    end: Option<Box<dyn FnOnce() + Send>>,
}

impl BackgroundScope {
    pub fn new(end: impl FnOnce() + Send + 'static) -> Self {
        Self {
            end: Some(Box::new(end)),
        }
    }

    pub fn noop() -> Self {
        Self { end: None }
    }
}

impl Drop for BackgroundScope {
    fn drop(&mut self) {
        if let Some(end) = self.end.take() {
            end();
        }
    }
}

/// UI-level background task support, injected by the embedding application.
/// `on_expire` fires at most once, when the platform reclaims the scope
/// while work is still running.
#[async_trait]
pub trait BackgroundActivity: Send + Sync {
    async fn begin(&self, name: &str, on_expire: Box<dyn FnOnce() + Send>) -> BackgroundScope;
}

struct Operation {
    fut: BoxFuture<'static, ()>,
    barrier: bool,
}

/// The processor's internal task queue. Concurrent operations run in
/// parallel; a barrier operation waits for everything running to drain and
/// then executes alone. While a barrier is enqueued or executing the queue
/// reports itself fenced.
struct OperationQueue {
    tx: mpsc::UnboundedSender<Operation>,
    pending_barriers: Arc<StdMutex<usize>>,
}

impl OperationQueue {
    fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Operation>();
        tokio::spawn(async move {
            let mut running: JoinSet<()> = JoinSet::new();
            while let Some(op) = rx.recv().await {
                if op.barrier {
                    while running.join_next().await.is_some() {}
                    op.fut.await;
                } else {
                    running.spawn(op.fut);
                }
            }
        });
        Self {
            tx,
            pending_barriers: Arc::new(StdMutex::new(0)),
        }
    }

    fn enqueue(&self, barrier: bool, fut: BoxFuture<'static, ()>) {
        if barrier {
            *self.pending_barriers.lock().unwrap() += 1;
        }
        let _ = self.tx.send(Operation { fut, barrier });
    }

    fn barrier_finished(&self) {
        let mut pending = self.pending_barriers.lock().unwrap();
        *pending = pending.saturating_sub(1);
    }

    fn is_fenced(&self) -> bool {
        *self.pending_barriers.lock().unwrap() > 0
    }
}

enum Completion {
    Succeeded,
    Failed,
}

enum SendResult {
    Response(Result<ApiResponse>),
    BackgroundExpired,
}

/// Drives the durable queue through the client: pops requests, maintains the
/// on-disk in-flight cache, enforces barrier discipline, applies retry
/// policies and fans outcomes out to registered handlers.
pub struct Processor {
    inner: Arc<Inner>,
}

struct Inner {
    /// Self-reference for handing owned clones to operation futures.
    weak: Weak<Inner>,
    client: Arc<ApiClient>,
    in_flight: ObjectStoreMap,
    delegate: StdMutex<Option<Arc<dyn QueueDelegate>>>,
    handlers: StdMutex<Vec<(Uuid, Arc<dyn ResponseHandler>)>>,
    scheduler: OnceLock<Scheduler>,
    ops: OperationQueue,
    aborted: StdMutex<HashSet<Uuid>>,
    background: StdMutex<Option<Arc<dyn BackgroundActivity>>>,
}

struct InnerDriver(Weak<Inner>);

#[async_trait]
impl ProcessDriver for InnerDriver {
    async fn process_next(&self) -> ProcessingResult {
        match self.0.upgrade() {
            Some(inner) => inner.process_next().await,
            None => ProcessingResult::DidNotProcess,
        }
    }
}

impl Processor {
    /// Must be called from within a tokio runtime: the processor owns a
    /// worker task and a scheduler actor.
    pub fn new(client: Arc<ApiClient>, store: Arc<dyn ObjectStore>, identifier: &str) -> Self {
        let inner = Arc::new_cyclic(|weak| Inner {
            weak: weak.clone(),
            client,
            in_flight: ObjectStoreMap::new(store, &format!("{}_in_flight", identifier)),
            delegate: StdMutex::new(None),
            handlers: StdMutex::new(Vec::new()),
            scheduler: OnceLock::new(),
            ops: OperationQueue::new(),
            aborted: StdMutex::new(HashSet::new()),
            background: StdMutex::new(None),
        });
        let scheduler = Scheduler::new(
            Arc::new(InnerDriver(Arc::downgrade(&inner))),
            conf::config().scheduler_retry_delay,
        );
        let _ = inner.scheduler.set(scheduler);
        Self { inner }
    }

    pub fn set_background_activity(&self, background: Arc<dyn BackgroundActivity>) {
        *self.inner.background.lock().unwrap() = Some(background);
    }

    /// Attaches the queue and recovers any requests left in the in-flight
    /// cache by a previous process: each is prepended back to the queue in
    /// its on-disk order and deleted after a successful prepend.
    pub async fn set_delegate(&self, delegate: Arc<dyn QueueDelegate>) {
        *self.inner.delegate.lock().unwrap() = Some(delegate.clone());
        self.inner.recover(&delegate).await;
    }

    pub fn register(&self, handler: Arc<dyn ResponseHandler>) -> Uuid {
        let token = Uuid::new_v4();
        self.inner.handlers.lock().unwrap().push((token, handler));
        token
    }

    pub fn unregister(&self, token: Uuid) {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .retain(|(t, _)| *t != token);
    }

    /// Wraps a config for queueing under a fresh token.
    pub fn prepare_request(
        &self,
        config: crate::model::request::RequestConfig,
    ) -> QueuedRequest {
        QueuedRequest::new(config)
    }

    pub fn did_enqueue_new_request(&self) {
        if let Some(scheduler) = self.inner.scheduler.get() {
            scheduler.enqueued();
        }
    }

    pub fn flush(&self) {
        if let Some(scheduler) = self.inner.scheduler.get() {
            scheduler.flush();
        }
    }

    /// Completes a request as aborted on behalf of an external caller,
    /// typically a uniquing queue displacing a coalesced entry.
    pub async fn abort_request(&self, request: &QueuedRequest) {
        self.inner.aborted.lock().unwrap().insert(request.token);
        if let Err(e) = self
            .inner
            .in_flight
            .delete(&request.token.to_string())
            .await
        {
            warn!("failed to clear in-flight entry for {}: {}", request.token, e);
        }
        self.inner
            .broadcast(request, &RequestOutcome::Aborted)
            .await;
        self.inner.notify_scheduler(Completion::Succeeded);
    }

    pub async fn process_next(&self) -> ProcessingResult {
        self.inner.process_next().await
    }
}

#[async_trait]
impl RequestAborter for Processor {
    async fn abort_request(&self, request: QueuedRequest) {
        Processor::abort_request(self, &request).await;
    }
}

impl Inner {
    async fn process_next(&self) -> ProcessingResult {
        if self.ops.is_fenced() {
            return ProcessingResult::DidNotProcess;
        }
        let delegate = match self.delegate.lock().unwrap().clone() {
            Some(delegate) => delegate,
            None => return ProcessingResult::DidNotProcess,
        };
        let request = match delegate.next_request().await {
            Ok(Some(request)) => request,
            Ok(None) => return ProcessingResult::DidNotProcess,
            Err(e) => {
                error!("failed to read the next queued request: {}", e);
                return ProcessingResult::DidNotProcess;
            }
        };

        match request.encode() {
            Ok(encoded) => {
                if let Err(e) = self
                    .in_flight
                    .set(&request.token.to_string(), encoded)
                    .await
                {
                    warn!("failed to persist in-flight entry for {}: {}", request.token, e);
                }
            }
            Err(e) => warn!("failed to encode in-flight entry for {}: {}", request.token, e),
        }

        let barrier = request.config.queueing.is_barrier();
        let inner = match self.weak.upgrade() {
            Some(inner) => inner,
            None => return ProcessingResult::DidNotProcess,
        };
        let fut = async move {
            let completion = inner.execute(request).await;
            if barrier {
                inner.ops.barrier_finished();
            }
            if let Some(completion) = completion {
                inner.notify_scheduler(completion);
            }
        }
        .boxed();
        self.ops.enqueue(barrier, fut);
        if barrier {
            ProcessingResult::ProcessedBarrier
        } else {
            ProcessingResult::ProcessedConcurrent
        }
    }

    async fn execute(&self, request: QueuedRequest) -> Option<Completion> {
        if self.take_aborted(&request.token) {
            // abort_request already finalized this token.
            return None;
        }
        match self.send(&request).await {
            SendResult::Response(Ok(response)) => {
                self.finish(&request, RequestOutcome::Success(response)).await
            }
            SendResult::Response(Err(err)) => self.handle_failure(request, err).await,
            SendResult::BackgroundExpired => {
                warn!("background session expired for request {}", request.token);
                self.reschedule(request, None).await
            }
        }
    }

    async fn send(&self, request: &QueuedRequest) -> SendResult {
        let background = self.background.lock().unwrap().clone();
        if request.config.background {
            if let Some(background) = background {
                let expired = CancellationToken::new();
                let trigger = expired.clone();
                let scope = background
                    .begin("strata.queue.request", Box::new(move || trigger.cancel()))
                    .await;
                let result = tokio::select! {
                    result = self.client.send(request.config.clone()) => {
                        SendResult::Response(result)
                    }
                    _ = expired.cancelled() => SendResult::BackgroundExpired,
                };
                drop(scope);
                return result;
            }
        }
        SendResult::Response(self.client.send(request.config.clone()).await)
    }

    async fn handle_failure(
        &self,
        request: QueuedRequest,
        err: StrataError,
    ) -> Option<Completion> {
        let queueing = request.config.queueing.clone();
        match &err {
            StrataError::Network(kind) if kind.is_network_interrupt() => {
                // Evictions are broadcast before the retry re-enters the
                // queue, so handlers observe them first.
                self.evict(&err, &|r: &QueuedRequest| {
                    !r.config.queueing.retries_on_network_interrupt()
                })
                .await;
                if queueing.retries_on_network_interrupt() {
                    self.reschedule(request, Some(&err)).await
                } else {
                    warn!(
                        "dropping request {} after network interrupt",
                        request.token
                    );
                    self.finish(&request, RequestOutcome::Failure(err)).await
                }
            }
            StrataError::Network(NetworkErrorKind::TimedOut) if queueing.retries_on_timeout() => {
                if queueing.is_barrier() {
                    self.evict(&err, &|r: &QueuedRequest| {
                        !r.config.queueing.retries_on_timeout()
                    })
                    .await;
                }
                self.reschedule(request, Some(&err)).await
            }
            StrataError::Api { status, .. } if queueing.retries_on_status(*status) => {
                self.reschedule(request, Some(&err)).await
            }
            StrataError::Network(NetworkErrorKind::Other(code)) => {
                let retryable = u16::try_from(*code)
                    .map(|code| queueing.retries_on_status(code))
                    .unwrap_or(false);
                if retryable {
                    self.reschedule(request, Some(&err)).await
                } else {
                    self.finish(&request, RequestOutcome::Failure(err)).await
                }
            }
            _ => self.finish(&request, RequestOutcome::Failure(err)).await,
        }
    }

    /// Removes matching queued requests and forwards the same error to their
    /// handlers as a terminal outcome.
    async fn evict(
        &self,
        err: &StrataError,
        pred: &(dyn for<'a> Fn(&'a QueuedRequest) -> bool + Send + Sync),
    ) {
        let delegate = match self.delegate.lock().unwrap().clone() {
            Some(delegate) => delegate,
            None => return,
        };
        match delegate.remove_requests(pred).await {
            Ok(evicted) => {
                for request in evicted {
                    warn!("evicting queued request {} after {}", request.token, err);
                    self.broadcast(&request, &RequestOutcome::Failure(err.clone()))
                        .await;
                }
            }
            Err(e) => error!("failed to evict queued requests: {}", e),
        }
    }

    /// Prepends the request for another attempt. Handlers are not notified;
    /// they only ever observe terminal outcomes. With no usable queue the
    /// failure becomes terminal after all.
    async fn reschedule(
        &self,
        request: QueuedRequest,
        err: Option<&StrataError>,
    ) -> Option<Completion> {
        let delegate = self.delegate.lock().unwrap().clone();
        let terminal = |err: Option<&StrataError>| match err {
            Some(err) => RequestOutcome::Failure(err.clone()),
            None => RequestOutcome::BackgroundSessionExpired,
        };
        let delegate = match delegate {
            Some(delegate) => delegate,
            None => return self.finish(&request, terminal(err)).await,
        };
        debug!("rescheduling request {}", request.token);
        let token = request.token;
        match delegate.prepend(request.clone()).await {
            Ok(()) => {
                // The request is back in the queue, not in flight.
                if let Err(e) = self.in_flight.delete(&token.to_string()).await {
                    warn!("failed to clear in-flight entry for {}: {}", token, e);
                }
                Some(Completion::Failed)
            }
            Err(e) => {
                error!("failed to reschedule request {}: {}", token, e);
                self.finish(&request, terminal(err)).await
            }
        }
    }

    async fn finish(
        &self,
        request: &QueuedRequest,
        outcome: RequestOutcome,
    ) -> Option<Completion> {
        if self.take_aborted(&request.token) {
            // An abort raced the terminal outcome; the abort broadcast wins.
            return None;
        }
        if let Err(e) = self.in_flight.delete(&request.token.to_string()).await {
            warn!("failed to clear in-flight entry for {}: {}", request.token, e);
        }
        self.broadcast(request, &outcome).await;
        match outcome {
            RequestOutcome::Success(_) | RequestOutcome::Aborted => Some(Completion::Succeeded),
            _ => Some(Completion::Failed),
        }
    }

    async fn broadcast(&self, request: &QueuedRequest, outcome: &RequestOutcome) {
        let handlers: Vec<_> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler.handle_outcome(request, outcome).await;
        }
    }

    fn notify_scheduler(&self, completion: Completion) {
        if let Some(scheduler) = self.scheduler.get() {
            match completion {
                Completion::Succeeded => scheduler.request_succeeded(),
                Completion::Failed => scheduler.request_failed(),
            }
        }
    }

    fn take_aborted(&self, token: &Uuid) -> bool {
        self.aborted.lock().unwrap().remove(token)
    }

    async fn recover(&self, delegate: &Arc<dyn QueueDelegate>) {
        let keys = match self.in_flight.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                error!("failed to enumerate the in-flight cache: {}", e);
                return;
            }
        };
        let mut entries = Vec::new();
        for key in keys {
            match self.in_flight.get(&key).await {
                Ok(Some(bytes)) => match QueuedRequest::decode(&bytes) {
                    Ok(request) => entries.push(request),
                    Err(e) => {
                        warn!("dropping undecodable in-flight entry {}: {}", key, e);
                        let _ = self.in_flight.delete(&key).await;
                    }
                },
                Ok(None) => {}
                Err(e) => warn!("failed to read in-flight entry {}: {}", key, e),
            }
        }
        entries.sort_by_key(|r| r.timestamp_ns);
        // Prepending newest-first leaves the oldest request at the head.
        for request in entries.into_iter().rev() {
            let token = request.token;
            match delegate.prepend(request).await {
                Ok(()) => {
                    if let Err(e) = self.in_flight.delete(&token.to_string()).await {
                        warn!("failed to clear recovered entry {}: {}", token, e);
                    }
                }
                Err(e) => error!("failed to recover in-flight request {}: {}", token, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use object_store::memory::InMemory;

    use super::*;
    use crate::client::transport::mock::MockTransport;
    use crate::model::request::{RequestConfig, RetryPolicy};
    use crate::queue::persisted::{PersistedQueue, UniquingQueue};

    struct Recording {
        log: StdMutex<Vec<String>>,
    }

    struct RecordingHandler {
        name: &'static str,
        recording: Arc<Recording>,
    }

    fn outcome_label(outcome: &RequestOutcome) -> String {
        match outcome {
            RequestOutcome::Success(_) => "success".to_string(),
            RequestOutcome::Aborted => "aborted".to_string(),
            RequestOutcome::BackgroundSessionExpired => "expired".to_string(),
            RequestOutcome::Failure(StrataError::Network(kind)) => format!("network({kind:?})"),
            RequestOutcome::Failure(StrataError::Api { status, .. }) => format!("api({status})"),
            RequestOutcome::Failure(err) => format!("failure({err})"),
        }
    }

    fn path_label(request: &QueuedRequest) -> String {
        match &request.config.path {
            crate::model::Path::Component(s) => s.clone(),
            other => format!("{other:?}"),
        }
    }

    #[async_trait]
    impl ResponseHandler for RecordingHandler {
        async fn handle_outcome(&self, request: &QueuedRequest, outcome: &RequestOutcome) {
            self.recording.log.lock().unwrap().push(format!(
                "{}:{}:{}",
                self.name,
                path_label(request),
                outcome_label(outcome)
            ));
        }
    }

    struct Fixture {
        transport: Arc<MockTransport>,
        processor: Processor,
        queue: Arc<PersistedQueue>,
        recording: Arc<Recording>,
    }

    async fn fixture(delay_ms: u64) -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .try_init();
        let mut transport = MockTransport::new();
        if delay_ms > 0 {
            transport = transport.with_delay(Duration::from_millis(delay_ms));
        }
        let transport = Arc::new(transport);
        let client = Arc::new(
            ApiClient::new(transport.clone()).with_host("https://api.example.com"),
        );
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let processor = Processor::new(client, store.clone(), "q");
        let queue = Arc::new(PersistedQueue::open(store, "q").await.unwrap());
        processor.set_delegate(queue.clone()).await;
        let recording = Arc::new(Recording {
            log: StdMutex::new(Vec::new()),
        });
        processor.register(Arc::new(RecordingHandler {
            name: "h",
            recording: recording.clone(),
        }));
        Fixture {
            transport,
            processor,
            queue,
            recording,
        }
    }

    /// Advances paused time far enough to cover transport delays and the
    /// scheduler's retry timer.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn barriers_fence_the_operation_queue() {
        let f = fixture(10).await;
        f.queue
            .append(QueuedRequest::new(RequestConfig::put("a")))
            .await
            .unwrap();
        f.queue
            .append(QueuedRequest::new(RequestConfig::get("b")))
            .await
            .unwrap();
        f.queue
            .append(QueuedRequest::new(RequestConfig::put("c")))
            .await
            .unwrap();
        f.processor.did_enqueue_new_request();
        settle().await;

        assert_eq!(f.transport.logged_paths(), vec!["/a", "/b", "/c"]);
        assert_eq!(
            f.recording.log.lock().unwrap().as_slice(),
            &[
                "h:a:success".to_string(),
                "h:b:success".to_string(),
                "h:c:success".to_string(),
            ]
        );
        assert!(f.queue.contents().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn network_interrupt_evicts_then_reschedules() {
        let f = fixture(0).await;
        f.transport
            .push_error(NetworkErrorKind::NotConnected);
        // The retry after the interrupt succeeds.
        f.transport.push_status(200, "{}");

        // PUT retries on interrupt by default; GET does not and is evicted.
        f.queue
            .append(QueuedRequest::new(RequestConfig::put("a")))
            .await
            .unwrap();
        f.queue
            .append(QueuedRequest::new(RequestConfig::get("b")))
            .await
            .unwrap();
        f.processor.did_enqueue_new_request();
        settle().await;

        let log = f.recording.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "h:b:network(NotConnected)".to_string(),
                "h:a:success".to_string(),
            ]
        );
        assert_eq!(f.transport.call_count(), 2);
        assert!(f.queue.contents().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn barrier_timeout_evicts_non_retrying_requests() {
        let f = fixture(0).await;
        f.transport.push_error(NetworkErrorKind::TimedOut);
        f.transport.push_status(200, "{}");
        f.transport.push_status(200, "{}");

        f.queue
            .append(QueuedRequest::new(RequestConfig::put("a")))
            .await
            .unwrap();
        f.queue
            .append(QueuedRequest::new(RequestConfig::get("b")))
            .await
            .unwrap();
        f.queue
            .append(QueuedRequest::new(RequestConfig::put("c")))
            .await
            .unwrap();
        f.processor.did_enqueue_new_request();
        settle().await;

        let log = f.recording.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "h:b:network(TimedOut)".to_string(),
                "h:a:success".to_string(),
                "h:c:success".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn custom_error_codes_drive_retries() {
        let f = fixture(0).await;
        f.transport.push_status(503, "");
        f.transport.push_status(200, "{}");

        let mut config = RequestConfig::put("a");
        config.queueing.retry_policies = vec![RetryPolicy::OnCustomErrorCodes(vec![503])];
        f.queue.append(QueuedRequest::new(config)).await.unwrap();
        f.processor.did_enqueue_new_request();
        settle().await;

        assert_eq!(
            f.recording.log.lock().unwrap().as_slice(),
            &["h:a:success".to_string()]
        );
        assert_eq!(f.transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_api_errors_reach_handlers_once() {
        let f = fixture(0).await;
        f.transport.push_status(422, "{}");
        f.queue
            .append(QueuedRequest::new(RequestConfig::put("a")))
            .await
            .unwrap();
        f.processor.did_enqueue_new_request();
        settle().await;

        assert_eq!(
            f.recording.log.lock().unwrap().as_slice(),
            &["h:a:api(422)".to_string()]
        );
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_requests_abort_and_the_survivor_runs() {
        let transport = Arc::new(MockTransport::new());
        let client = Arc::new(
            ApiClient::new(transport.clone()).with_host("https://api.example.com"),
        );
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let processor = Arc::new(Processor::new(client, store.clone(), "uq"));
        let queue = Arc::new(
            UniquingQueue::open(store, "uq", |r: &QueuedRequest| path_label(r))
                .await
                .unwrap(),
        );
        queue.set_aborter(processor.clone());
        processor.set_delegate(queue.clone()).await;
        let recording = Arc::new(Recording {
            log: StdMutex::new(Vec::new()),
        });
        processor.register(Arc::new(RecordingHandler {
            name: "h",
            recording: recording.clone(),
        }));

        let first = QueuedRequest::new(RequestConfig::put("user7"));
        let second = QueuedRequest::new(RequestConfig::put("user7"));
        queue.append(first).await.unwrap();
        queue.append(second).await.unwrap();
        processor.did_enqueue_new_request();
        settle().await;

        assert_eq!(
            recording.log.lock().unwrap().as_slice(),
            &[
                "h:user7:aborted".to_string(),
                "h:user7:success".to_string(),
            ]
        );
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_recovery_restores_in_flight_requests() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let in_flight = ObjectStoreMap::new(store.clone(), "q_in_flight");
        let mut older = QueuedRequest::new(RequestConfig::put("older"));
        older.timestamp_ns = 1;
        let mut newer = QueuedRequest::new(RequestConfig::put("newer"));
        newer.timestamp_ns = 2;
        in_flight
            .set(&older.token.to_string(), older.encode().unwrap())
            .await
            .unwrap();
        in_flight
            .set(&newer.token.to_string(), newer.encode().unwrap())
            .await
            .unwrap();

        let transport = Arc::new(MockTransport::new());
        let client = Arc::new(
            ApiClient::new(transport).with_host("https://api.example.com"),
        );
        let processor = Processor::new(client, store.clone(), "q");
        let queue = Arc::new(PersistedQueue::open(store, "q").await.unwrap());
        processor.set_delegate(queue.clone()).await;

        let paths: Vec<_> = queue
            .contents()
            .await
            .unwrap()
            .into_iter()
            .map(|r| path_label(&r))
            .collect();
        assert_eq!(paths, vec!["older", "newer"]);
        assert!(in_flight.keys().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn handlers_fire_in_registration_order_until_unregistered() {
        let f = fixture(0).await;
        let second = f.processor.register(Arc::new(RecordingHandler {
            name: "h2",
            recording: f.recording.clone(),
        }));

        f.queue
            .append(QueuedRequest::new(RequestConfig::put("a")))
            .await
            .unwrap();
        f.processor.did_enqueue_new_request();
        settle().await;
        assert_eq!(
            f.recording.log.lock().unwrap().as_slice(),
            &["h:a:success".to_string(), "h2:a:success".to_string()]
        );

        f.processor.unregister(second);
        f.queue
            .append(QueuedRequest::new(RequestConfig::put("b")))
            .await
            .unwrap();
        f.processor.did_enqueue_new_request();
        settle().await;
        let log = f.recording.log.lock().unwrap().clone();
        assert_eq!(log.last().unwrap(), "h:b:success");
        assert_eq!(log.len(), 3);
    }

    struct ExpiringBackground {
        expired: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl BackgroundActivity for ExpiringBackground {
        async fn begin(
            &self,
            _name: &str,
            on_expire: Box<dyn FnOnce() + Send>,
        ) -> BackgroundScope {
            // Expire the first scope immediately, before the send can
            // finish; later scopes run to completion.
            if !self.expired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                on_expire();
            }
            BackgroundScope::noop()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn background_expiration_reschedules_the_request() {
        let f = fixture(50).await;
        f.processor
            .set_background_activity(Arc::new(ExpiringBackground {
                expired: std::sync::atomic::AtomicBool::new(false),
            }));
        f.transport.push_status(200, "{}");
        f.transport.push_status(200, "{}");

        let mut config = RequestConfig::put("a");
        config.background = true;
        f.queue.append(QueuedRequest::new(config)).await.unwrap();
        f.processor.did_enqueue_new_request();
        settle().await;

        // First attempt expired (not broadcast); the retry succeeded.
        assert_eq!(
            f.recording.log.lock().unwrap().as_slice(),
            &["h:a:success".to_string()]
        );
    }
}
