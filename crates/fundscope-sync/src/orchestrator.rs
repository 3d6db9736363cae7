//! Bounded-concurrency crawl queue. One orchestrator per crawl kind; results are grouped per
//! source identifier and handed to a callback once every target of that identifier is done.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use fundscope_adapters::{AdapterError, CrawlAdapter, FetchTarget};
use fundscope_storage::{DocumentFetcher, EntityStore, FetchError};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Error)]
enum TargetError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("crawl queue closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetFailure {
    pub target: FetchTarget,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub fetched: usize,
    pub failures: Vec<TargetFailure>,
    /// (source id, error) for every callback that returned an error.
    pub callback_errors: Vec<(String, String)>,
}

impl BatchOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.callback_errors.is_empty()
    }

    /// Collapses failures into one error so a job can surface them as retryable.
    pub fn into_result(self) -> Result<Self> {
        if self.is_clean() {
            return Ok(self);
        }
        let mut messages: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.target.source_id, f.error))
            .collect();
        messages.extend(
            self.callback_errors
                .iter()
                .map(|(id, err)| format!("{id}: {err}")),
        );
        anyhow::bail!("crawl batch had failures: {}", messages.join("; "))
    }
}

pub struct Orchestrator<A: CrawlAdapter> {
    adapter: Arc<A>,
    fetcher: Arc<dyn DocumentFetcher>,
    events: Arc<dyn EntityStore>,
    limit: Arc<Semaphore>,
}

impl<A: CrawlAdapter + 'static> Orchestrator<A> {
    pub fn new(
        adapter: A,
        fetcher: Arc<dyn DocumentFetcher>,
        events: Arc<dyn EntityStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            adapter: Arc::new(adapter),
            fetcher,
            events,
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn fetcher(&self) -> &Arc<dyn DocumentFetcher> {
        &self.fetcher
    }

    pub async fn submit<F, Fut>(
        &self,
        targets: Vec<FetchTarget>,
        cancel: &CancellationToken,
        mut on_complete: F,
    ) -> Result<BatchOutcome>
    where
        F: FnMut(String, Vec<(FetchTarget, A::Output)>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let kind = self.adapter.kind();
        let mut pending: HashMap<String, usize> = HashMap::new();
        for target in &targets {
            *pending.entry(target.source_id.clone()).or_default() += 1;
        }

        let mut tasks = JoinSet::new();
        for target in targets {
            let adapter = self.adapter.clone();
            let fetcher = self.fetcher.clone();
            let limit = self.limit.clone();
            tasks.spawn(async move {
                let result = fetch_one(adapter.as_ref(), fetcher.as_ref(), &limit, &target).await;
                (target, result)
            });
        }

        let mut collected: HashMap<String, Vec<(FetchTarget, A::Output)>> = HashMap::new();
        let mut outcome = BatchOutcome::default();
        loop {
            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    anyhow::bail!("crawl cancelled");
                }
            };
            let Some(joined) = joined else {
                break;
            };
            let (target, result) = joined.context("crawl task panicked")?;
            let source_id = target.source_id.clone();

            match result {
                Ok(output) => {
                    outcome.fetched += 1;
                    match self
                        .events
                        .resolve_crawler_events(kind, &source_id, target.period)
                        .await
                    {
                        Ok(0) => {}
                        Ok(resolved) => {
                            debug!(source_id = %source_id, resolved, "crawler events resolved")
                        }
                        Err(err) => {
                            warn!(
                                source_id = %source_id,
                                error = %err,
                                "resolving crawler events failed"
                            )
                        }
                    }
                    collected.entry(source_id.clone()).or_default().push((target, output));
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!(
                        kind = kind.as_str(),
                        source_id = %source_id,
                        period = ?target.period,
                        error = %message,
                        "crawl target failed"
                    );
                    if let Err(store_err) = self
                        .events
                        .record_crawler_event(kind, &source_id, target.period, &message)
                        .await
                    {
                        warn!(
                            source_id = %source_id,
                            error = %store_err,
                            "recording crawler event failed"
                        );
                    }
                    outcome.failures.push(TargetFailure {
                        target,
                        error: message,
                    });
                }
            }

            let left = pending.entry(source_id.clone()).or_insert(1);
            *left = left.saturating_sub(1);
            if *left > 0 {
                continue;
            }
            pending.remove(&source_id);
            if let Some(results) = collected.remove(&source_id) {
                if let Err(err) = on_complete(source_id.clone(), results).await {
                    let message = format!("{err:#}");
                    warn!(source_id = %source_id, error = %message, "crawl callback failed");
                    outcome.callback_errors.push((source_id, message));
                }
            }
        }
        Ok(outcome)
    }
}

async fn fetch_one<A: CrawlAdapter>(
    adapter: &A,
    fetcher: &dyn DocumentFetcher,
    limit: &Semaphore,
    target: &FetchTarget,
) -> Result<A::Output, TargetError> {
    let _permit = limit.acquire().await.map_err(|_| TargetError::Closed)?;
    let span = info_span!(
        "crawl_target",
        kind = adapter.kind().as_str(),
        source_id = %target.source_id,
        period = ?target.period
    );
    let request = adapter.request(target)?;
    let document = fetcher.fetch(&request).instrument(span.clone()).await?;
    let output = span.in_scope(|| adapter.extract(target, &document.body))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticFetcher;
    use fundscope_core::{CrawlKind, ReportPeriod};
    use fundscope_storage::{FetchRequest, MemoryEntityStore};
    use std::sync::Mutex;

    struct EchoAdapter;

    impl CrawlAdapter for EchoAdapter {
        type Output = String;

        fn kind(&self) -> CrawlKind {
            CrawlKind::PortfolioManager
        }

        fn request(&self, target: &FetchTarget) -> Result<FetchRequest, AdapterError> {
            let period = target.period.map(|p| p.to_string()).unwrap_or_default();
            Ok(FetchRequest::get(
                target.source_id.clone(),
                format!("https://pmf.example/{}/{period}", target.source_id),
            ))
        }

        fn extract(&self, _target: &FetchTarget, body: &str) -> Result<String, AdapterError> {
            Ok(body.trim().to_string())
        }
    }

    fn period(month: u32) -> ReportPeriod {
        ReportPeriod::new(2024, month).unwrap()
    }

    #[tokio::test]
    async fn callback_fires_once_per_identifier_with_all_results() {
        let fetcher = StaticFetcher::new()
            .page("https://pmf.example/A/2024-01", "a1")
            .page("https://pmf.example/A/2024-02", "a2")
            .page("https://pmf.example/B/2024-01", "b1");
        let events = Arc::new(MemoryEntityStore::new());
        let orchestrator = Orchestrator::new(EchoAdapter, Arc::new(fetcher), events, 2);

        let seen = Mutex::new(Vec::new());
        let outcome = orchestrator
            .submit(
                vec![
                    FetchTarget::report("A", period(1)),
                    FetchTarget::report("B", period(1)),
                    FetchTarget::report("A", period(2)),
                ],
                &CancellationToken::new(),
                |id, results| {
                    let mut bodies: Vec<String> =
                        results.into_iter().map(|(_, body)| body).collect();
                    bodies.sort();
                    seen.lock().unwrap().push((id, bodies));
                    async { Ok(()) }
                },
            )
            .await
            .unwrap();

        assert!(outcome.is_clean());
        assert_eq!(outcome.fetched, 3);
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("A".to_string(), vec!["a1".to_string(), "a2".to_string()]),
                ("B".to_string(), vec!["b1".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn failures_are_recorded_and_resolved_by_a_later_success() {
        let events = Arc::new(MemoryEntityStore::new());
        let failing = Orchestrator::new(
            EchoAdapter,
            Arc::new(StaticFetcher::new().page("https://pmf.example/A/2024-01", "a1")),
            events.clone(),
            4,
        );
        let outcome = failing
            .submit(
                vec![FetchTarget::report("A", period(1)), FetchTarget::report("C", period(1))],
                &CancellationToken::new(),
                |id, _| async move {
                    anyhow::ensure!(id != "A", "storage unavailable");
                    Ok(())
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].target.source_id, "C");
        assert_eq!(outcome.callback_errors.len(), 1);
        assert!(outcome.into_result().is_err());

        let recorded = events.crawler_events(Some(CrawlKind::PortfolioManager)).await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].source_id, "C");
        assert_eq!(recorded[0].period, Some(period(1)));

        let recovered = Orchestrator::new(
            EchoAdapter,
            Arc::new(StaticFetcher::new().page("https://pmf.example/C/2024-01", "c1")),
            events.clone(),
            4,
        );
        recovered
            .submit(
                vec![FetchTarget::report("C", period(1))],
                &CancellationToken::new(),
                |_, _| async { Ok(()) },
            )
            .await
            .unwrap();
        assert!(events.crawler_events(None).await.unwrap().is_empty());
    }
}
