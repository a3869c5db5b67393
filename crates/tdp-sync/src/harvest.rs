//! Bounded worker pool over a list of source items.
//!
//! Items go through a bounded queue to a fixed set of workers. Each worker owns a
//! [`RateLimiter`] and retries retryable item errors with the configured backoff.
//! One item's failure never affects another. Cancellation stops the feed, interrupts
//! in-flight waits, and reports every unresolved item as abandoned.

use std::sync::Arc;
use std::time::Duration;

use tdp_adapters::{fetch, FetchConfig, FetchFailure, Fetched, SourceAdapter};
use tdp_core::{RawCapture, SourceItem};
use tdp_storage::{BackoffPolicy, HttpSource, RateLimiter};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub concurrency: usize,
    /// Minimum spacing between two requests from the same worker.
    pub min_interval: Duration,
    pub fetch: FetchConfig,
    pub backoff: BackoffPolicy,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            min_interval: Duration::from_secs(1),
            fetch: FetchConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Per-item outcomes in input order.
#[derive(Debug)]
pub struct HarvestReport<P> {
    pub fetched: Vec<Fetched<P>>,
    pub failed: Vec<FetchFailure>,
    /// Responses from attempts that were retried; still worth archiving.
    pub retried_captures: Vec<RawCapture>,
    /// Ids of items that never resolved because the run was cancelled.
    pub abandoned: Vec<String>,
    /// Set only when cancellation actually left items unresolved.
    pub cancelled: bool,
}

impl<P> HarvestReport<P> {
    pub fn resolved(&self) -> usize {
        self.fetched.len() + self.failed.len()
    }

    /// Every response received during the harvest, successful or not.
    pub fn captures(&self) -> impl Iterator<Item = &RawCapture> {
        self.fetched
            .iter()
            .map(|f| &f.capture)
            .chain(self.failed.iter().filter_map(|f| f.capture.as_ref()))
            .chain(self.retried_captures.iter())
    }
}

enum Event<P> {
    Done(usize, Result<Fetched<P>, FetchFailure>),
    Retried(RawCapture),
}

type WorkQueue = Arc<Mutex<mpsc::Receiver<(usize, SourceItem)>>>;

pub struct ParallelHarvester<A> {
    adapter: Arc<A>,
    http: Arc<dyn HttpSource>,
    config: HarvestConfig,
}

impl<A> ParallelHarvester<A>
where
    A: SourceAdapter + 'static,
{
    pub fn new(adapter: Arc<A>, http: Arc<dyn HttpSource>, config: HarvestConfig) -> Self {
        Self {
            adapter,
            http,
            config,
        }
    }

    pub async fn harvest(
        &self,
        items: Vec<SourceItem>,
        cancel: CancellationToken,
    ) -> HarvestReport<A::Parsed> {
        let ids: Vec<String> = items.iter().map(SourceItem::id).collect();
        let workers = self.config.concurrency.max(1).min(items.len().max(1));
        info!(
            source = self.adapter.source_id(),
            items = items.len(),
            workers,
            "harvest started"
        );

        let (work_tx, work_rx) = mpsc::channel::<(usize, SourceItem)>(workers);
        let queue: WorkQueue = Arc::new(Mutex::new(work_rx));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event<A::Parsed>>();

        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            for entry in items.into_iter().enumerate() {
                tokio::select! {
                    biased;
                    _ = feeder_cancel.cancelled() => break,
                    sent = work_tx.send(entry) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let span = info_span!("harvest_worker", worker);
            tasks.spawn(
                run_worker(
                    self.adapter.clone(),
                    self.http.clone(),
                    queue.clone(),
                    event_tx.clone(),
                    cancel.clone(),
                    self.config.clone(),
                )
                .instrument(span),
            );
        }
        drop(event_tx);

        let mut slots: Vec<Option<Result<Fetched<A::Parsed>, FetchFailure>>> =
            ids.iter().map(|_| None).collect();
        let mut retried_captures = Vec::new();
        while let Some(event) = event_rx.recv().await {
            match event {
                Event::Done(index, outcome) => slots[index] = Some(outcome),
                Event::Retried(capture) => retried_captures.push(capture),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "harvest worker ended abnormally");
            }
        }
        if let Err(err) = feeder.await {
            warn!(error = %err, "harvest feeder ended abnormally");
        }

        let mut fetched = Vec::new();
        let mut failed = Vec::new();
        let mut abandoned = Vec::new();
        for (slot, id) in slots.into_iter().zip(ids) {
            match slot {
                Some(Ok(item)) => fetched.push(item),
                Some(Err(failure)) => failed.push(failure),
                None => abandoned.push(id),
            }
        }

        let report = HarvestReport {
            fetched,
            failed,
            retried_captures,
            cancelled: !abandoned.is_empty(),
            abandoned,
        };
        info!(
            source = self.adapter.source_id(),
            fetched = report.fetched.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            cancelled = report.cancelled,
            "harvest finished"
        );
        report
    }
}

async fn next_item(queue: &WorkQueue, cancel: &CancellationToken) -> Option<(usize, SourceItem)> {
    let mut rx = queue.lock().await;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        next = rx.recv() => next,
    }
}

async fn run_worker<A>(
    adapter: Arc<A>,
    http: Arc<dyn HttpSource>,
    queue: WorkQueue,
    events: mpsc::UnboundedSender<Event<A::Parsed>>,
    cancel: CancellationToken,
    config: HarvestConfig,
) where
    A: SourceAdapter + 'static,
{
    let limiter = RateLimiter::new(config.min_interval);
    while let Some((index, item)) = next_item(&queue, &cancel).await {
        let mut retries = 0usize;
        loop {
            let attempt = retries as u32;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = limiter.acquire() => {}
            }
            let mut outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                outcome = fetch(adapter.as_ref(), http.as_ref(), &item, &config.fetch) => outcome,
            };
            match &mut outcome {
                Ok(fetched) => fetched.capture.attempt = attempt,
                Err(failure) => {
                    if let Some(capture) = failure.capture.as_mut() {
                        capture.attempt = attempt;
                    }
                }
            }

            match outcome {
                Err(failure)
                    if failure.error.is_retryable() && retries < config.backoff.max_retries =>
                {
                    let delay = config.backoff.delay_for_attempt(retries);
                    retries += 1;
                    warn!(
                        source_item_id = %item.id(),
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        reason = %failure.error,
                        "retrying item"
                    );
                    if let Some(capture) = failure.capture {
                        let _ = events.send(Event::Retried(capture));
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                outcome => {
                    match &outcome {
                        Ok(_) => debug!(source_item_id = %item.id(), "item fetched"),
                        Err(failure) => warn!(
                            source_item_id = %item.id(),
                            reason = %failure.error,
                            "item failed"
                        ),
                    }
                    if events.send(Event::Done(index, outcome)).is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}
