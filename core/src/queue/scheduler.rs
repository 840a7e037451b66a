use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// What the processor did with the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingResult {
    /// A barrier request was dispatched; nothing may run alongside it.
    ProcessedBarrier,
    /// A concurrent request was dispatched; the next one may follow.
    ProcessedConcurrent,
    /// Nothing was dispatched: the queue is empty or fenced by a barrier.
    DidNotProcess,
}

/// The scheduler's view of the processor.
#[async_trait]
pub trait ProcessDriver: Send + Sync {
    async fn process_next(&self) -> ProcessingResult;
}

#[derive(Debug)]
enum Event {
    Enqueued,
    Flush,
    RequestSucceeded,
    RequestFailed,
    TimerFired,
}

/// Decides when to ask the processor for the next request. All transitions
/// run on an owned actor task: drain events loop `process_next` while it
/// reports concurrent progress; a failure arms a retry timer; any event
/// received while the timer is armed cancels it before draining.
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Event>,
}

impl Scheduler {
    pub fn new(driver: Arc<dyn ProcessDriver>, retry_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer_tx = tx.clone();
        tokio::spawn(run(driver, rx, timer_tx, retry_delay));
        Self { tx }
    }

    pub fn enqueued(&self) {
        let _ = self.tx.send(Event::Enqueued);
    }

    pub fn flush(&self) {
        let _ = self.tx.send(Event::Flush);
    }

    pub fn request_succeeded(&self) {
        let _ = self.tx.send(Event::RequestSucceeded);
    }

    pub fn request_failed(&self) {
        let _ = self.tx.send(Event::RequestFailed);
    }
}

async fn run(
    driver: Arc<dyn ProcessDriver>,
    mut rx: mpsc::UnboundedReceiver<Event>,
    timer_tx: mpsc::UnboundedSender<Event>,
    retry_delay: Duration,
) {
    let mut timer: Option<JoinHandle<()>> = None;
    while let Some(event) = rx.recv().await {
        if let Some(timer) = timer.take() {
            timer.abort();
        }
        match event {
            Event::Enqueued | Event::Flush | Event::RequestSucceeded | Event::TimerFired => {
                drain(driver.as_ref()).await;
            }
            Event::RequestFailed => {
                debug!("request failed, retrying in {:?}", retry_delay);
                let tx = timer_tx.clone();
                timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(retry_delay).await;
                    let _ = tx.send(Event::TimerFired);
                }));
            }
        }
    }
    if let Some(timer) = timer.take() {
        timer.abort();
    }
}

async fn drain(driver: &dyn ProcessDriver) {
    loop {
        match driver.process_next().await {
            ProcessingResult::ProcessedConcurrent => continue,
            ProcessingResult::ProcessedBarrier | ProcessingResult::DidNotProcess => break,
        }
    }
}
