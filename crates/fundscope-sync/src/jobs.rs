//! The five persisted job kinds and the helpers that enqueue them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use fundscope_adapters::{mapper, mf, pmf, FetchTarget, MfNavAdapter, PmfAdapter};
use fundscope_core::{
    CrawlKind, CrawlPmfFunds, JobCodecError, JobKey, JobOptions, JobSpec, MfNavSync,
    ReconcileFundHouse, ReportPeriod, ScheduledJob, Trigger,
};
use fundscope_storage::{DocumentFetcher, EntityStore, FetchRequest, FetchedDocument};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::orchestrator::Orchestrator;
use crate::reconcile::ReconciliationEngine;
use crate::scheduler::{Job, JobDetail, JobRegistry, RegistryError, ScheduleError, SchedulerHandle};
use crate::CrawlSources;

/// Delay before a reconciliation runs, so a burst of crawls for one manager collapses into one.
pub const RECONCILE_DELAY: Duration = Duration::from_secs(60);
pub const CATCH_UP_DELAY: Duration = Duration::from_secs(1);

/// Shared dependencies handed to every job instance.
pub struct JobContext {
    pub entities: Arc<dyn EntityStore>,
    pub scheduler: SchedulerHandle,
    pub pmf: Orchestrator<PmfAdapter>,
    pub nav: Orchestrator<MfNavAdapter>,
    pub sources: CrawlSources,
    pub crawl_options: JobOptions,
}

/// Month to crawl after `for_date` and how long to wait for it.
///
/// Months that are already published (older than the end of last month) are fetched right
/// away; otherwise the crawl waits for the next publication day at midnight UTC.
pub fn next_crawl_delay(
    for_date: NaiveDate,
    now: DateTime<Utc>,
    publication_day: u32,
) -> (NaiveDate, Duration) {
    let next = for_date + Months::new(1);
    let today = now.date_naive();
    let end_of_last_month = today - Days::new(u64::from(today.day()));
    if next < end_of_last_month {
        return (next, CATCH_UP_DELAY);
    }

    let following = ReportPeriod::from_date(today).next();
    let day = publication_day.clamp(1, 28);
    let run_on = NaiveDate::from_ymd_opt(following.year, following.month, day)
        .unwrap_or_else(|| following.first_day());
    let run_at = run_on.and_time(NaiveTime::default()).and_utc();
    let delay = (run_at - now).to_std().unwrap_or(CATCH_UP_DELAY);
    (next, delay)
}

/// Key for a chained crawl; the random suffix lets a month be re-crawled while an older
/// attempt is still queued.
pub fn continuation_key(uid: &str, for_date: NaiveDate) -> JobKey {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    JobKey::new(
        format!("{uid}-{}-{suffix}", for_date.format("%Y-%m-%d")),
        JobSpec::CRAWL_PMF_FUNDS,
    )
}

/// Key for operator-requested crawls, deduplicated per manager and month.
pub fn crawl_key(uid: &str, for_date: NaiveDate) -> JobKey {
    JobKey::new(
        format!("{uid}-{}", for_date.format("%Y-%m-%d")),
        JobSpec::CRAWL_PMF_FUNDS,
    )
}

async fn schedule_or_warn(
    handle: &SchedulerHandle,
    detail: JobDetail,
    trigger: Trigger,
) -> Result<Option<ScheduledJob>, ScheduleError> {
    let key = detail.key.clone();
    match handle.schedule_job(detail, trigger).await {
        Ok(job) => Ok(Some(job)),
        Err(err) if err.is_duplicate() => {
            warn!(key = %key, "job already pending; not scheduled again");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn crawl_detail(
    key: JobKey,
    uid: &str,
    for_date: NaiveDate,
    skip_next: bool,
    options: JobOptions,
) -> Result<JobDetail, JobCodecError> {
    let spec = JobSpec::CrawlPmfFunds(CrawlPmfFunds {
        uid: uid.to_string(),
        for_date,
        skip_next,
    });
    Ok(JobDetail::from_spec(key.name, key.group, &spec)?.with_options(options))
}

/// Enqueues a crawl under the deduplicated per-month key.
pub async fn schedule_crawl(
    ctx: &JobContext,
    uid: &str,
    for_date: NaiveDate,
    skip_next: bool,
    delay: Duration,
) -> Result<Option<ScheduledJob>, ScheduleError> {
    let key = crawl_key(uid, for_date);
    let detail = crawl_detail(key, uid, for_date, skip_next, ctx.crawl_options)?;
    schedule_or_warn(&ctx.scheduler, detail, Trigger::run_once(delay)).await
}

pub async fn schedule_reconciliation(
    handle: &SchedulerHandle,
    fund_manager_id: i64,
) -> Result<Option<ScheduledJob>, ScheduleError> {
    let spec = JobSpec::PmsDataConsistency(ReconcileFundHouse { fund_manager_id });
    let detail = JobDetail::from_spec(
        fund_manager_id.to_string(),
        JobSpec::PMS_DATA_CONSISTENCY,
        &spec,
    )?;
    schedule_or_warn(handle, detail, Trigger::run_once(RECONCILE_DELAY)).await
}

/// Re-enqueues one non-chaining crawl for every recorded PMF fetch failure.
pub async fn replay_failed_crawls(ctx: &JobContext) -> Result<usize> {
    let events = ctx
        .entities
        .crawler_events(Some(CrawlKind::PortfolioManager))
        .await?;
    let mut queued = 0;
    for event in events {
        let Some(period) = event.period else {
            warn!(source_id = %event.source_id, "crawler event without a period; skipped");
            continue;
        };
        if schedule_crawl(ctx, &event.source_id, period.first_day(), true, CATCH_UP_DELAY)
            .await?
            .is_some()
        {
            queued += 1;
        }
    }
    Ok(queued)
}

async fn fetch_page(
    fetcher: &dyn DocumentFetcher,
    request: &FetchRequest,
    cancel: &CancellationToken,
) -> Result<FetchedDocument> {
    tokio::select! {
        page = fetcher.fetch(request) => page.with_context(|| format!("fetching {}", request.url)),
        _ = cancel.cancelled() => anyhow::bail!("cancelled while fetching {}", request.url),
    }
}

/// Crawls one manager's disclosure for one month and chains the following month.
pub struct CrawlPmfFundsJob {
    ctx: Arc<JobContext>,
    params: CrawlPmfFunds,
}

#[async_trait]
impl Job for CrawlPmfFundsJob {
    fn job_type(&self) -> &'static str {
        JobSpec::CRAWL_PMF_FUNDS
    }

    fn description(&self) -> Result<String, JobCodecError> {
        JobSpec::CrawlPmfFunds(self.params.clone()).encode()
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<()> {
        let params = &self.params;
        let period = ReportPeriod::from_date(params.for_date);
        let entities = self.ctx.entities.clone();
        let handle = self.ctx.scheduler.clone();

        self.ctx
            .pmf
            .submit(
                vec![FetchTarget::report(params.uid.clone(), period)],
                &cancel,
                |uid, results| {
                    let entities = entities.clone();
                    let handle = handle.clone();
                    async move {
                        for (_, report) in results {
                            if report.general.is_empty() && report.services.is_empty() {
                                warn!(
                                    uid = %uid,
                                    period = %report.period,
                                    "empty disclosure; nothing ingested"
                                );
                                continue;
                            }
                            let summary = entities
                                .ingest_crawl_batch(mapper::report_to_batch(&report))
                                .await
                                .with_context(|| format!("ingesting {uid} {}", report.period))?;
                            info!(
                                uid = %uid,
                                period = %report.period,
                                fund_manager_id = summary.fund_manager_id,
                                manager_refreshed = summary.manager_refreshed,
                                funds_created = summary.funds_created,
                                reports_written = summary.reports_written,
                                "disclosure ingested"
                            );
                            schedule_reconciliation(&handle, summary.fund_manager_id).await?;
                        }
                        Ok(())
                    }
                },
            )
            .await?
            .into_result()?;

        if !params.skip_next {
            let (next, delay) =
                next_crawl_delay(params.for_date, Utc::now(), self.ctx.sources.pmf.publication_day);
            let detail = crawl_detail(
                continuation_key(&params.uid, next),
                &params.uid,
                next,
                false,
                self.ctx.crawl_options,
            )?;
            schedule_or_warn(&self.ctx.scheduler, detail, Trigger::run_once(delay)).await?;
        }
        Ok(())
    }
}

pub struct ReconcileJob {
    ctx: Arc<JobContext>,
    params: ReconcileFundHouse,
}

#[async_trait]
impl Job for ReconcileJob {
    fn job_type(&self) -> &'static str {
        JobSpec::PMS_DATA_CONSISTENCY
    }

    fn description(&self) -> Result<String, JobCodecError> {
        JobSpec::PmsDataConsistency(self.params).encode()
    }

    async fn execute(&self, _cancel: CancellationToken) -> Result<()> {
        let summary = ReconciliationEngine::new(self.ctx.entities.clone())
            .reconcile(self.params.fund_manager_id, Utc::now().date_naive())
            .await?;
        info!(
            fund_manager_id = self.params.fund_manager_id,
            funds = summary.funds,
            merged_reports = summary.merged_reports,
            hidden = summary.hidden,
            "fund house reconciled"
        );
        Ok(())
    }
}

/// Discovers every registered manager and starts its crawl chain at the initial period.
pub struct PmfInitJob {
    ctx: Arc<JobContext>,
}

#[async_trait]
impl Job for PmfInitJob {
    fn job_type(&self) -> &'static str {
        JobSpec::PMF_INIT
    }

    fn description(&self) -> Result<String, JobCodecError> {
        JobSpec::PmfInit.encode()
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<()> {
        let request = self.ctx.pmf.adapter().manager_list_request();
        let page = fetch_page(self.ctx.pmf.fetcher().as_ref(), &request, &cancel).await?;
        let uids = pmf::parse_manager_ids(&page.body)?;
        let start = self.ctx.sources.pmf.initial_period()?;

        let mut queued = 0;
        for uid in &uids {
            if schedule_crawl(&self.ctx, uid, start.first_day(), false, CATCH_UP_DELAY)
                .await?
                .is_some()
            {
                queued += 1;
            }
        }
        info!(managers = uids.len(), queued, from = %start, "manager discovery finished");
        Ok(())
    }
}

/// Refreshes the scheme list and staggers one NAV sync per scheme a minute apart.
pub struct MfSyncJob {
    ctx: Arc<JobContext>,
}

#[async_trait]
impl Job for MfSyncJob {
    fn job_type(&self) -> &'static str {
        JobSpec::MF_SYNC
    }

    fn description(&self) -> Result<String, JobCodecError> {
        JobSpec::MfSync.encode()
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<()> {
        let request = MfNavAdapter::latest_nav_request(&self.ctx.sources.mf.latest_nav_url);
        let page = fetch_page(self.ctx.nav.fetcher().as_ref(), &request, &cancel).await?;
        let schemes = mf::parse_latest_nav(&page.body)?;
        let stored = self.ctx.entities.upsert_schemes(&schemes).await?;
        let today = Utc::now().date_naive();

        let mut queued = 0;
        for (idx, scheme) in stored.iter().enumerate() {
            if scheme.nav_url.is_empty() {
                warn!(scheme = %scheme.name, "scheme without a nav link; skipped");
                continue;
            }
            let spec = JobSpec::MfNavSync(MfNavSync {
                scheme_id: scheme.id,
            });
            let detail = JobDetail::from_spec(
                format!("{}-{}", scheme.id, today.format("%Y-%m-%d")),
                JobSpec::MF_NAV_SYNC,
                &spec,
            )?
            .with_options(self.ctx.crawl_options);
            let delay = Duration::from_secs(60 * idx as u64);
            if schedule_or_warn(&self.ctx.scheduler, detail, Trigger::run_once(delay))
                .await?
                .is_some()
            {
                queued += 1;
            }
        }
        info!(schemes = stored.len(), queued, "scheme list refreshed");
        Ok(())
    }
}

pub struct MfNavSyncJob {
    ctx: Arc<JobContext>,
    params: MfNavSync,
}

#[async_trait]
impl Job for MfNavSyncJob {
    fn job_type(&self) -> &'static str {
        JobSpec::MF_NAV_SYNC
    }

    fn description(&self) -> Result<String, JobCodecError> {
        JobSpec::MfNavSync(self.params).encode()
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<()> {
        let scheme = self.ctx.entities.scheme(self.params.scheme_id).await?;
        let entities = self.ctx.entities.clone();
        self.ctx
            .nav
            .submit(
                vec![FetchTarget::located(scheme.id.to_string(), scheme.nav_url.clone())],
                &cancel,
                |source_id, results| {
                    let entities = entities.clone();
                    async move {
                        for (_, navs) in results {
                            if navs.is_empty() {
                                entities
                                    .record_crawler_event(
                                        CrawlKind::MutualFundNav,
                                        &source_id,
                                        None,
                                        "nav history page had no rows",
                                    )
                                    .await?;
                                warn!(scheme_id = %source_id, "empty nav history");
                                continue;
                            }
                            let written = entities.insert_navs(&navs).await?;
                            info!(
                                scheme_id = %source_id,
                                fetched = navs.len(),
                                written,
                                "navs stored"
                            );
                        }
                        Ok(())
                    }
                },
            )
            .await?
            .into_result()?;
        Ok(())
    }
}

fn unexpected(expected: &str, spec: &JobSpec) -> RegistryError {
    RegistryError::Codec(JobCodecError::KindMismatch {
        expected: expected.to_string(),
        found: spec.kind().to_string(),
    })
}

/// Registers a factory for every job kind against `ctx`.
pub fn register_jobs(
    registry: &mut JobRegistry,
    ctx: Arc<JobContext>,
) -> Result<(), RegistryError> {
    let c = ctx.clone();
    registry.register_job(JobSpec::CRAWL_PMF_FUNDS, move |description| {
        match JobSpec::decode_as(JobSpec::CRAWL_PMF_FUNDS, description)? {
            JobSpec::CrawlPmfFunds(params) => Ok(Box::new(CrawlPmfFundsJob {
                ctx: c.clone(),
                params,
            }) as Box<dyn Job>),
            other => Err(unexpected(JobSpec::CRAWL_PMF_FUNDS, &other)),
        }
    })?;

    let c = ctx.clone();
    registry.register_job(JobSpec::PMS_DATA_CONSISTENCY, move |description| {
        match JobSpec::decode_as(JobSpec::PMS_DATA_CONSISTENCY, description)? {
            JobSpec::PmsDataConsistency(params) => Ok(Box::new(ReconcileJob {
                ctx: c.clone(),
                params,
            }) as Box<dyn Job>),
            other => Err(unexpected(JobSpec::PMS_DATA_CONSISTENCY, &other)),
        }
    })?;

    let c = ctx.clone();
    registry.register_job(JobSpec::PMF_INIT, move |description| {
        JobSpec::decode_as(JobSpec::PMF_INIT, description)?;
        Ok(Box::new(PmfInitJob { ctx: c.clone() }) as Box<dyn Job>)
    })?;

    let c = ctx.clone();
    registry.register_job(JobSpec::MF_SYNC, move |description| {
        JobSpec::decode_as(JobSpec::MF_SYNC, description)?;
        Ok(Box::new(MfSyncJob { ctx: c.clone() }) as Box<dyn Job>)
    })?;

    registry.register_job(JobSpec::MF_NAV_SYNC, move |description| {
        match JobSpec::decode_as(JobSpec::MF_NAV_SYNC, description)? {
            JobSpec::MfNavSync(params) => Ok(Box::new(MfNavSyncJob {
                ctx: ctx.clone(),
                params,
            }) as Box<dyn Job>),
            other => Err(unexpected(JobSpec::MF_NAV_SYNC, &other)),
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, memory_pipeline, MemoryPipeline, StaticFetcher};
    use chrono::TimeZone;
    use fundscope_adapters::{MF_BASE_URL, MF_LATEST_NAV_URL, PMF_REPORT_URL};
    use fundscope_core::{JobStatus, MutualFundScheme};
    use fundscope_storage::{JobMatcher, JobStore};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn job_for(mem: &MemoryPipeline, spec: &JobSpec) -> Box<dyn Job> {
        let registry = {
            let mut registry = JobRegistry::new();
            register_jobs(&mut registry, mem.pipeline_context()).unwrap();
            registry
        };
        registry.get_job(spec.kind(), &spec.encode().unwrap()).unwrap()
    }

    impl MemoryPipeline {
        fn pipeline_context(&self) -> Arc<JobContext> {
            self.pipeline.context.clone()
        }
    }

    async fn jobs_in(mem: &MemoryPipeline, group: &str) -> Vec<ScheduledJob> {
        mem.jobs
            .scheduled_jobs(&[JobMatcher::Group(group.to_string())])
            .await
            .unwrap()
    }

    fn crawl(uid: &str, for_date: NaiveDate, skip_next: bool) -> JobSpec {
        JobSpec::CrawlPmfFunds(CrawlPmfFunds {
            uid: uid.to_string(),
            for_date,
            skip_next,
        })
    }

    #[test]
    fn published_months_are_fetched_immediately() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        assert_eq!(
            next_crawl_delay(date(2024, 2, 1), now, 21),
            (date(2024, 3, 1), CATCH_UP_DELAY)
        );
        assert_eq!(
            next_crawl_delay(date(2024, 3, 1), now, 21),
            (date(2024, 4, 1), CATCH_UP_DELAY)
        );
    }

    #[test]
    fn unpublished_month_waits_for_next_publication_day() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let (next, delay) = next_crawl_delay(date(2024, 4, 1), now, 21);
        assert_eq!(next, date(2024, 5, 1));
        let expected = Utc.with_ymd_and_hms(2024, 6, 21, 0, 0, 0).unwrap() - now;
        assert_eq!(delay, expected.to_std().unwrap());

        let december = Utc.with_ymd_and_hms(2024, 12, 30, 8, 0, 0).unwrap();
        let (next, delay) = next_crawl_delay(date(2024, 12, 1), december, 21);
        assert_eq!(next, date(2025, 1, 1));
        let expected = Utc.with_ymd_and_hms(2025, 1, 21, 0, 0, 0).unwrap() - december;
        assert_eq!(delay, expected.to_std().unwrap());
    }

    #[test]
    fn continuation_keys_are_unique_per_call() {
        let a = continuation_key("INP000000001", date(2024, 3, 1));
        let b = continuation_key("INP000000001", date(2024, 3, 1));
        assert_ne!(a, b);
        assert!(a.name.starts_with("INP000000001-2024-03-01-"));
        assert_eq!(a.name.len(), "INP000000001-2024-03-01-".len() + 6);
        assert_eq!(a.group, JobSpec::CRAWL_PMF_FUNDS);
    }

    #[test]
    fn every_job_kind_is_registered() {
        let mem = memory_pipeline(StaticFetcher::new());
        let mut registry = JobRegistry::new();
        register_jobs(&mut registry, mem.pipeline_context()).unwrap();
        let mut expected: Vec<String> = JobSpec::ALL_KINDS.iter().map(|k| k.to_string()).collect();
        expected.sort();
        assert_eq!(registry.registered_types(), expected);
        assert!(matches!(
            registry.get_job(JobSpec::MF_SYNC, &JobSpec::PmfInit.encode().unwrap()),
            Err(RegistryError::Codec(JobCodecError::KindMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn crawl_ingests_chains_next_month_and_queues_reconciliation() {
        let mem = memory_pipeline(StaticFetcher::new().page(
            format!("{PMF_REPORT_URL}#INP000000001"),
            fixture("pmf/report_two_tables.html"),
        ));
        job_for(&mem, &crawl("INP000000001", date(2024, 2, 1), false))
            .execute(CancellationToken::new())
            .await
            .unwrap();

        let manager = mem
            .entities
            .fund_manager_by_uid("INP000000001")
            .await
            .unwrap()
            .expect("manager stored");
        assert_eq!(mem.entities.funds_for_manager(manager.id).await.unwrap().len(), 3);

        let crawls = jobs_in(&mem, JobSpec::CRAWL_PMF_FUNDS).await;
        assert_eq!(crawls.len(), 1);
        assert!(crawls[0].key.name.starts_with("INP000000001-2024-03-01-"));
        assert_eq!(crawls[0].options.max_retries, 10);

        let reconciles = jobs_in(&mem, JobSpec::PMS_DATA_CONSISTENCY).await;
        assert_eq!(reconciles.len(), 1);
        assert_eq!(reconciles[0].key.name, manager.id.to_string());
    }

    #[tokio::test]
    async fn skip_next_crawl_does_not_chain() {
        let mem = memory_pipeline(StaticFetcher::new().page(
            format!("{PMF_REPORT_URL}#INP000000002"),
            fixture("pmf/report_single_table.html"),
        ));
        job_for(&mem, &crawl("INP000000002", date(2024, 2, 1), true))
            .execute(CancellationToken::new())
            .await
            .unwrap();
        assert!(jobs_in(&mem, JobSpec::CRAWL_PMF_FUNDS).await.is_empty());
        assert_eq!(jobs_in(&mem, JobSpec::PMS_DATA_CONSISTENCY).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_crawl_records_event_and_replay_requeues_it() {
        let mem = memory_pipeline(StaticFetcher::new());
        let err = job_for(&mem, &crawl("INP000000009", date(2024, 2, 1), false))
            .execute(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("404"));
        assert!(jobs_in(&mem, JobSpec::CRAWL_PMF_FUNDS).await.is_empty());

        let events = mem
            .entities
            .crawler_events(Some(CrawlKind::PortfolioManager))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].period, ReportPeriod::new(2024, 2));

        assert_eq!(mem.pipeline.replay_failed_crawls().await.unwrap(), 1);
        assert_eq!(mem.pipeline.replay_failed_crawls().await.unwrap(), 0);
        let replayed = jobs_in(&mem, JobSpec::CRAWL_PMF_FUNDS).await;
        assert_eq!(replayed[0].key.name, "INP000000009-2024-02-01");
        assert_eq!(
            JobSpec::decode(&replayed[0].description).unwrap(),
            crawl("INP000000009", date(2024, 2, 1), true)
        );
    }

    #[tokio::test]
    async fn reconciliation_is_scheduled_once_per_manager() {
        let mem = memory_pipeline(StaticFetcher::new());
        let handle = mem.pipeline.handle();
        assert!(schedule_reconciliation(&handle, 7).await.unwrap().is_some());
        assert!(schedule_reconciliation(&handle, 7).await.unwrap().is_none());
        let pending = jobs_in(&mem, JobSpec::PMS_DATA_CONSISTENCY).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, JobStatus::Scheduled);
        assert!(pending[0].next_run_time > Utc::now() + chrono::Duration::seconds(50));
    }

    #[tokio::test]
    async fn init_starts_a_chain_for_every_listed_manager() {
        let mem = memory_pipeline(
            StaticFetcher::new().page(PMF_REPORT_URL, fixture("pmf/manager_list.html")),
        );
        job_for(&mem, &JobSpec::PmfInit)
            .execute(CancellationToken::new())
            .await
            .unwrap();
        let crawls = jobs_in(&mem, JobSpec::CRAWL_PMF_FUNDS).await;
        let mut names: Vec<String> = crawls.into_iter().map(|j| j.key.name).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "INP000000001-2021-01-01",
                "INP000000002-2021-01-01",
                "INP000000003-2021-01-01",
            ]
        );
    }

    #[tokio::test]
    async fn mf_sync_staggers_one_nav_job_per_scheme() {
        let mem = memory_pipeline(
            StaticFetcher::new().page(MF_LATEST_NAV_URL, fixture("mf/latest_nav.html")),
        );
        job_for(&mem, &JobSpec::MfSync)
            .execute(CancellationToken::new())
            .await
            .unwrap();
        let navs = jobs_in(&mem, JobSpec::MF_NAV_SYNC).await;
        assert_eq!(navs.len(), 2);
        let gap = navs[1].next_run_time - navs[0].next_run_time;
        assert!(gap >= chrono::Duration::seconds(59) && gap <= chrono::Duration::seconds(61));
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        assert!(navs.iter().all(|j| j.key.name.ends_with(&today)));
    }

    #[tokio::test]
    async fn nav_sync_stores_history_and_flags_empty_pages() {
        let mem = memory_pipeline(
            StaticFetcher::new()
                .page(
                    format!("{MF_BASE_URL}/hist/alpha"),
                    fixture("mf/historical_nav.html"),
                )
                .page(
                    format!("{MF_BASE_URL}/hist/beta"),
                    fixture("mf/historical_nav_empty.html"),
                ),
        );
        let stored = mem
            .entities
            .upsert_schemes(&[
                MutualFundScheme {
                    id: 0,
                    name: "Alpha".into(),
                    nav_url: "/hist/alpha".into(),
                },
                MutualFundScheme {
                    id: 0,
                    name: "Beta".into(),
                    nav_url: "/hist/beta".into(),
                },
            ])
            .await
            .unwrap();

        let alpha = JobSpec::MfNavSync(MfNavSync {
            scheme_id: stored[0].id,
        });
        job_for(&mem, &alpha).execute(CancellationToken::new()).await.unwrap();
        let beta = JobSpec::MfNavSync(MfNavSync {
            scheme_id: stored[1].id,
        });
        job_for(&mem, &beta).execute(CancellationToken::new()).await.unwrap();

        let events = mem
            .entities
            .crawler_events(Some(CrawlKind::MutualFundNav))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source_id, stored[1].id.to_string());
        assert_eq!(events[0].period, None);

        let navs = fundscope_adapters::mf::parse_historical_nav(
            stored[0].id,
            &fixture("mf/historical_nav.html"),
        )
        .unwrap();
        assert_eq!(mem.entities.insert_navs(&navs).await.unwrap(), 0);
    }
}
