//! Fund, fund-manager, report, crawler-event and NAV persistence.
//!
//! Both implementations share one contract: a crawl batch is applied atomically, managers only
//! move forward in time, funds are created but never updated by ingest, and reports are unique
//! per (fund, month).

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use fundscope_core::{
    Attributes, Cagr, CrawlBatch, CrawlKind, CrawlerEvent, Fund, FundManager, FundReport, FundType,
    IngestSummary, MutualFundNav, MutualFundScheme, ReportPeriod, Returns, RiskMetrics,
    ATTR_MERGED_ID,
};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::Mutex;
use tracing::debug;

use crate::StoreError;

/// Filter for [`EntityStore::reports_for_fund`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportQuery {
    /// Only reports carrying a one-month return.
    pub require_month_1: bool,
    /// Only reports dated strictly after this day.
    pub after: Option<NaiveDate>,
    pub newest_first: bool,
    pub limit: Option<usize>,
}

impl ReportQuery {
    pub fn latest_with_month_1(limit: usize) -> Self {
        Self {
            require_month_1: true,
            after: None,
            newest_first: true,
            limit: Some(limit),
        }
    }

    fn accepts(&self, report: &FundReport) -> bool {
        (!self.require_month_1 || report.returns.month_1.is_some())
            && self.after.map_or(true, |after| report.report_date > after)
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Applies one crawl's manager, funds and reports in a single transaction.
    async fn ingest_crawl_batch(&self, batch: CrawlBatch) -> Result<IngestSummary, StoreError>;

    async fn fund_manager(&self, id: i64) -> Result<FundManager, StoreError>;
    async fn fund_manager_by_uid(&self, uid: &str) -> Result<Option<FundManager>, StoreError>;
    async fn fund_managers(&self) -> Result<Vec<FundManager>, StoreError>;

    async fn fund(&self, id: i64) -> Result<Fund, StoreError>;
    async fn funds(&self, fund_type: Option<FundType>) -> Result<Vec<Fund>, StoreError>;
    async fn funds_for_manager(&self, fund_manager_id: i64) -> Result<Vec<Fund>, StoreError>;
    async fn manager_ids_for_fund(&self, fund_id: i64) -> Result<Vec<i64>, StoreError>;

    /// Bulk update of derived fields, flags and attributes.
    async fn save_funds(&self, funds: &[Fund]) -> Result<(), StoreError>;

    async fn reports_for_fund(
        &self,
        fund_id: i64,
        query: &ReportQuery,
    ) -> Result<Vec<FundReport>, StoreError>;

    /// Inserts reports that do not collide with an existing (fund, month); returns rows written.
    async fn insert_reports_if_absent(&self, reports: &[FundReport]) -> Result<usize, StoreError>;

    /// Deletes report copies previously merged from `duplicate_fund_id`.
    async fn delete_merged_copies(&self, duplicate_fund_id: i64) -> Result<u64, StoreError>;

    async fn record_crawler_event(
        &self,
        kind: CrawlKind,
        source_id: &str,
        period: Option<ReportPeriod>,
        error: &str,
    ) -> Result<(), StoreError>;
    async fn crawler_events(
        &self,
        kind: Option<CrawlKind>,
    ) -> Result<Vec<CrawlerEvent>, StoreError>;
    async fn resolve_crawler_events(
        &self,
        kind: CrawlKind,
        source_id: &str,
        period: Option<ReportPeriod>,
    ) -> Result<u64, StoreError>;

    /// Upserts schemes by name and returns them with their ids, in input order.
    async fn upsert_schemes(
        &self,
        schemes: &[MutualFundScheme],
    ) -> Result<Vec<MutualFundScheme>, StoreError>;
    async fn scheme(&self, id: i64) -> Result<MutualFundScheme, StoreError>;
    async fn insert_navs(&self, navs: &[MutualFundNav]) -> Result<usize, StoreError>;
}

fn overwrite_if_present(dst: &mut String, src: &str) {
    if !src.is_empty() {
        *dst = src.to_string();
    }
}

/// Field-level merge applied when a crawl is allowed to refresh a stored manager.
fn refresh_manager(stored: &mut FundManager, incoming: &FundManager, target_month: NaiveDate) {
    overwrite_if_present(&mut stored.name, &incoming.name);
    overwrite_if_present(&mut stored.email, &incoming.email);
    overwrite_if_present(&mut stored.contact, &incoming.contact);
    overwrite_if_present(&mut stored.register_number, &incoming.register_number);
    overwrite_if_present(&mut stored.address, &incoming.address);
    stored.registered_date = incoming.registered_date.or(stored.registered_date);
    stored.total_no_of_client = incoming.total_no_of_client.or(stored.total_no_of_client);
    stored.total_aum = incoming.total_aum.or(stored.total_aum);
    stored
        .other_data
        .extend(incoming.other_data.iter().map(|(k, v)| (k.clone(), v.clone())));
    stored.refreshed_date = Some(target_month);
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_id: i64,
    managers: BTreeMap<i64, FundManager>,
    funds: BTreeMap<i64, Fund>,
    links: BTreeSet<(i64, i64)>,
    reports: BTreeMap<(i64, NaiveDate), FundReport>,
    events: Vec<CrawlerEvent>,
    schemes: BTreeMap<i64, MutualFundScheme>,
    navs: BTreeMap<(i64, NaiveDate), MutualFundNav>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn ingest(&mut self, batch: CrawlBatch) -> IngestSummary {
        let CrawlBatch {
            manager,
            target_month,
            funds,
        } = batch;

        let existing = self
            .managers
            .values()
            .find(|m| m.uid == manager.uid)
            .map(|m| m.id);
        let (manager_id, manager_refreshed) = match existing {
            Some(id) => {
                let stored = self.managers.get_mut(&id).map(|stored| {
                    let accepted = stored.accepts_refresh_for(target_month);
                    if accepted {
                        refresh_manager(stored, &manager, target_month);
                    }
                    accepted
                });
                (id, stored.unwrap_or(false))
            }
            None => {
                let id = self.allocate_id();
                let mut created = FundManager::new(manager.uid.clone());
                created.id = id;
                refresh_manager(&mut created, &manager, target_month);
                self.managers.insert(id, created);
                (id, true)
            }
        };

        let mut summary = IngestSummary {
            fund_manager_id: manager_id,
            manager_refreshed,
            ..IngestSummary::default()
        };

        for draft in funds {
            let found = self
                .links
                .iter()
                .filter(|(_, m)| *m == manager_id)
                .filter_map(|(f, _)| self.funds.get(f))
                .find(|f| f.name == draft.name && f.fund_type == draft.fund_type)
                .map(|f| f.id);
            let fund_id = match found {
                Some(id) => id,
                None => {
                    let id = self.allocate_id();
                    let mut fund = Fund::new(draft.name.clone(), draft.fund_type);
                    fund.id = id;
                    self.funds.insert(id, fund);
                    self.links.insert((id, manager_id));
                    summary.funds_created += 1;
                    id
                }
            };

            for mut report in draft.reports {
                report.fund_id = fund_id;
                let key = (fund_id, report.report_date);
                report.id = match self.reports.get(&key) {
                    Some(existing) => existing.id,
                    None => self.allocate_id(),
                };
                self.reports.insert(key, report);
                summary.reports_written += 1;
            }
        }
        summary
    }
}

/// In-process store with the same semantics as [`PgEntityStore`]; batches apply to a copy of
/// the state which replaces the original only when the whole batch succeeded.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    state: Mutex<MemoryState>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn ingest_crawl_batch(&self, batch: CrawlBatch) -> Result<IngestSummary, StoreError> {
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let summary = staged.ingest(batch);
        *state = staged;
        Ok(summary)
    }

    async fn fund_manager(&self, id: i64) -> Result<FundManager, StoreError> {
        let state = self.state.lock().await;
        state
            .managers
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("fund manager", id))
    }

    async fn fund_manager_by_uid(&self, uid: &str) -> Result<Option<FundManager>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.managers.values().find(|m| m.uid == uid).cloned())
    }

    async fn fund_managers(&self) -> Result<Vec<FundManager>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.managers.values().cloned().collect())
    }

    async fn fund(&self, id: i64) -> Result<Fund, StoreError> {
        let state = self.state.lock().await;
        state
            .funds
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("fund", id))
    }

    async fn funds(&self, fund_type: Option<FundType>) -> Result<Vec<Fund>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .funds
            .values()
            .filter(|f| fund_type.map_or(true, |t| f.fund_type == t))
            .cloned()
            .collect())
    }

    async fn funds_for_manager(&self, fund_manager_id: i64) -> Result<Vec<Fund>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .iter()
            .filter(|(_, m)| *m == fund_manager_id)
            .filter_map(|(f, _)| state.funds.get(f).cloned())
            .collect())
    }

    async fn manager_ids_for_fund(&self, fund_id: i64) -> Result<Vec<i64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .iter()
            .filter(|(f, _)| *f == fund_id)
            .map(|(_, m)| *m)
            .collect())
    }

    async fn save_funds(&self, funds: &[Fund]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(missing) = funds.iter().find(|f| !state.funds.contains_key(&f.id)) {
            return Err(StoreError::not_found("fund", missing.id));
        }
        for fund in funds {
            if let Some(stored) = state.funds.get_mut(&fund.id) {
                stored.aum = fund.aum;
                stored.is_hidden = fund.is_hidden;
                stored.returns = fund.returns;
                stored.cagr = fund.cagr;
                stored.risk = fund.risk;
                stored.other_data = fund.other_data.clone();
            }
        }
        Ok(())
    }

    async fn reports_for_fund(
        &self,
        fund_id: i64,
        query: &ReportQuery,
    ) -> Result<Vec<FundReport>, StoreError> {
        let state = self.state.lock().await;
        let mut reports: Vec<FundReport> = state
            .reports
            .range((fund_id, NaiveDate::MIN)..=(fund_id, NaiveDate::MAX))
            .map(|(_, r)| r)
            .filter(|r| query.accepts(r))
            .cloned()
            .collect();
        if query.newest_first {
            reports.reverse();
        }
        if let Some(limit) = query.limit {
            reports.truncate(limit);
        }
        Ok(reports)
    }

    async fn insert_reports_if_absent(&self, reports: &[FundReport]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut written = 0;
        for report in reports {
            let key = (report.fund_id, report.report_date);
            if state.reports.contains_key(&key) {
                continue;
            }
            let mut report = report.clone();
            report.id = state.allocate_id();
            state.reports.insert(key, report);
            written += 1;
        }
        Ok(written)
    }

    async fn delete_merged_copies(&self, duplicate_fund_id: i64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let marker = duplicate_fund_id.to_string();
        let before = state.reports.len();
        state
            .reports
            .retain(|_, r| r.other_data.get(ATTR_MERGED_ID) != Some(&marker));
        Ok((before - state.reports.len()) as u64)
    }

    async fn record_crawler_event(
        &self,
        kind: CrawlKind,
        source_id: &str,
        period: Option<ReportPeriod>,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let existing = state
            .events
            .iter()
            .position(|e| e.crawl_kind == kind && e.source_id == source_id && e.period == period);
        match existing {
            Some(idx) => {
                let event = &mut state.events[idx];
                event.error = error.to_string();
                event.recorded_at = Utc::now();
            }
            None => {
                let id = state.allocate_id();
                state.events.push(CrawlerEvent {
                    id,
                    crawl_kind: kind,
                    source_id: source_id.to_string(),
                    period,
                    error: error.to_string(),
                    recorded_at: Utc::now(),
                });
            }
        }
        Ok(())
    }

    async fn crawler_events(
        &self,
        kind: Option<CrawlKind>,
    ) -> Result<Vec<CrawlerEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| kind.map_or(true, |k| e.crawl_kind == k))
            .cloned()
            .collect())
    }

    async fn resolve_crawler_events(
        &self,
        kind: CrawlKind,
        source_id: &str,
        period: Option<ReportPeriod>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.events.len();
        state
            .events
            .retain(|e| !(e.crawl_kind == kind && e.source_id == source_id && e.period == period));
        Ok((before - state.events.len()) as u64)
    }

    async fn upsert_schemes(
        &self,
        schemes: &[MutualFundScheme],
    ) -> Result<Vec<MutualFundScheme>, StoreError> {
        let mut state = self.state.lock().await;
        let mut out = Vec::with_capacity(schemes.len());
        for scheme in schemes {
            let existing = state
                .schemes
                .values()
                .find(|s| s.name == scheme.name)
                .map(|s| s.id);
            let id = match existing {
                Some(id) => id,
                None => state.allocate_id(),
            };
            let stored = MutualFundScheme {
                id,
                name: scheme.name.clone(),
                nav_url: scheme.nav_url.clone(),
            };
            state.schemes.insert(id, stored.clone());
            out.push(stored);
        }
        Ok(out)
    }

    async fn scheme(&self, id: i64) -> Result<MutualFundScheme, StoreError> {
        let state = self.state.lock().await;
        state
            .schemes
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("mutual fund scheme", id))
    }

    async fn insert_navs(&self, navs: &[MutualFundNav]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut written = 0;
        for nav in navs {
            let key = (nav.scheme_id, nav.nav_date);
            if !state.navs.contains_key(&key) {
                state.navs.insert(key, nav.clone());
                written += 1;
            }
        }
        Ok(written)
    }
}

const MANAGER_COLUMNS: &str = "id, uid, name, email, contact, register_number, registered_date, \
                               address, total_no_of_client, total_aum, refreshed_date, other_data";
const FUND_COLUMNS: &str = "f.id, f.name, f.fund_type, f.aum, f.is_hidden, f.returns, f.cagr, \
                            f.risk, f.other_data";
const REPORT_COLUMNS: &str = "id, fund_id, report_date, returns, other_data";

#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Staleness-guarded manager upsert. When the guard rejects the update the row is still
    /// locked so concurrent ingests for one manager serialize.
    async fn upsert_manager(
        tx: &mut Transaction<'_, Postgres>,
        manager: &FundManager,
        target_month: NaiveDate,
    ) -> Result<(i64, bool), StoreError> {
        let updated = sqlx::query(
            r#"
            INSERT INTO fund_managers
                (uid, name, email, contact, register_number, registered_date, address,
                 total_no_of_client, total_aum, refreshed_date, other_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (uid) DO UPDATE
               SET name = COALESCE(NULLIF(EXCLUDED.name, ''), fund_managers.name),
                   email = COALESCE(NULLIF(EXCLUDED.email, ''), fund_managers.email),
                   contact = COALESCE(NULLIF(EXCLUDED.contact, ''), fund_managers.contact),
                   register_number =
                       COALESCE(NULLIF(EXCLUDED.register_number, ''),
                                fund_managers.register_number),
                   address = COALESCE(NULLIF(EXCLUDED.address, ''), fund_managers.address),
                   registered_date =
                       COALESCE(EXCLUDED.registered_date, fund_managers.registered_date),
                   total_no_of_client =
                       COALESCE(EXCLUDED.total_no_of_client, fund_managers.total_no_of_client),
                   total_aum = COALESCE(EXCLUDED.total_aum, fund_managers.total_aum),
                   refreshed_date = EXCLUDED.refreshed_date,
                   other_data = fund_managers.other_data || EXCLUDED.other_data,
                   updated_at = NOW()
             WHERE fund_managers.refreshed_date IS NULL
                OR fund_managers.refreshed_date < EXCLUDED.refreshed_date
            RETURNING id
            "#,
        )
        .bind(&manager.uid)
        .bind(&manager.name)
        .bind(&manager.email)
        .bind(&manager.contact)
        .bind(&manager.register_number)
        .bind(manager.registered_date)
        .bind(&manager.address)
        .bind(manager.total_no_of_client)
        .bind(manager.total_aum)
        .bind(target_month)
        .bind(Json(&manager.other_data))
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = updated {
            return Ok((row.try_get("id")?, true));
        }

        let row = sqlx::query("SELECT id FROM fund_managers WHERE uid = $1 FOR UPDATE")
            .bind(&manager.uid)
            .fetch_one(&mut **tx)
            .await?;
        Ok((row.try_get("id")?, false))
    }

    async fn find_or_create_fund(
        tx: &mut Transaction<'_, Postgres>,
        fund_manager_id: i64,
        name: &str,
        fund_type: FundType,
    ) -> Result<(i64, bool), StoreError> {
        let existing = sqlx::query(
            r#"
            SELECT f.id
              FROM funds f
              JOIN fund_x_fund_managers x ON x.fund_id = f.id
             WHERE x.fund_manager_id = $1
               AND f.name = $2
               AND f.fund_type = $3
             ORDER BY f.id
             LIMIT 1
            "#,
        )
        .bind(fund_manager_id)
        .bind(name)
        .bind(fund_type.as_str())
        .fetch_optional(&mut **tx)
        .await?;
        if let Some(row) = existing {
            return Ok((row.try_get("id")?, false));
        }

        let row = sqlx::query("INSERT INTO funds (name, fund_type) VALUES ($1, $2) RETURNING id")
            .bind(name)
            .bind(fund_type.as_str())
            .fetch_one(&mut **tx)
            .await?;
        let fund_id: i64 = row.try_get("id")?;
        sqlx::query(
            r#"
            INSERT INTO fund_x_fund_managers (fund_id, fund_manager_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(fund_id)
        .bind(fund_manager_id)
        .execute(&mut **tx)
        .await?;
        Ok((fund_id, true))
    }
}

fn manager_from_row(row: &PgRow) -> Result<FundManager, StoreError> {
    let other_data: Json<Attributes> = row.try_get("other_data")?;
    Ok(FundManager {
        id: row.try_get("id")?,
        uid: row.try_get("uid")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        contact: row.try_get("contact")?,
        register_number: row.try_get("register_number")?,
        registered_date: row.try_get("registered_date")?,
        address: row.try_get("address")?,
        total_no_of_client: row.try_get("total_no_of_client")?,
        total_aum: row.try_get("total_aum")?,
        refreshed_date: row.try_get("refreshed_date")?,
        other_data: other_data.0,
    })
}

fn fund_from_row(row: &PgRow) -> Result<Fund, StoreError> {
    let fund_type: String = row.try_get("fund_type")?;
    let fund_type = FundType::parse(&fund_type)
        .ok_or_else(|| StoreError::InvalidRow(format!("unknown fund type `{fund_type}`")))?;
    let returns: Json<Returns> = row.try_get("returns")?;
    let cagr: Json<Cagr> = row.try_get("cagr")?;
    let risk: Json<RiskMetrics> = row.try_get("risk")?;
    let other_data: Json<Attributes> = row.try_get("other_data")?;
    Ok(Fund {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        fund_type,
        aum: row.try_get("aum")?,
        is_hidden: row.try_get("is_hidden")?,
        returns: returns.0,
        cagr: cagr.0,
        risk: risk.0,
        other_data: other_data.0,
    })
}

fn report_from_row(row: &PgRow) -> Result<FundReport, StoreError> {
    let returns: Json<Returns> = row.try_get("returns")?;
    let other_data: Json<Attributes> = row.try_get("other_data")?;
    Ok(FundReport {
        id: row.try_get("id")?,
        fund_id: row.try_get("fund_id")?,
        report_date: row.try_get("report_date")?,
        returns: returns.0,
        other_data: other_data.0,
    })
}

fn event_from_row(row: &PgRow) -> Result<CrawlerEvent, StoreError> {
    let kind: String = row.try_get("crawl_kind")?;
    let crawl_kind = CrawlKind::parse(&kind)
        .ok_or_else(|| StoreError::InvalidRow(format!("unknown crawl kind `{kind}`")))?;
    let period: Option<NaiveDate> = row.try_get("period")?;
    Ok(CrawlerEvent {
        id: row.try_get("id")?,
        crawl_kind,
        source_id: row.try_get("source_id")?,
        period: period.map(ReportPeriod::from_date),
        error: row.try_get("error")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn scheme_from_row(row: &PgRow) -> Result<MutualFundScheme, StoreError> {
    Ok(MutualFundScheme {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        nav_url: row.try_get("nav_url")?,
    })
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn ingest_crawl_batch(&self, batch: CrawlBatch) -> Result<IngestSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        let (fund_manager_id, manager_refreshed) =
            Self::upsert_manager(&mut tx, &batch.manager, batch.target_month).await?;

        let mut summary = IngestSummary {
            fund_manager_id,
            manager_refreshed,
            ..IngestSummary::default()
        };

        for draft in &batch.funds {
            let (fund_id, created) =
                Self::find_or_create_fund(&mut tx, fund_manager_id, &draft.name, draft.fund_type)
                    .await?;
            if created {
                summary.funds_created += 1;
            }
            for report in &draft.reports {
                sqlx::query(
                    r#"
                    INSERT INTO fund_reports (fund_id, report_date, returns, other_data)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (fund_id, report_date) DO UPDATE
                       SET returns = EXCLUDED.returns,
                           other_data = EXCLUDED.other_data,
                           updated_at = NOW()
                    "#,
                )
                .bind(fund_id)
                .bind(report.report_date)
                .bind(Json(report.returns))
                .bind(Json(&report.other_data))
                .execute(&mut *tx)
                .await?;
                summary.reports_written += 1;
            }
        }

        tx.commit().await?;
        debug!(
            uid = %batch.manager.uid,
            fund_manager_id,
            manager_refreshed,
            funds_created = summary.funds_created,
            reports_written = summary.reports_written,
            "crawl batch committed"
        );
        Ok(summary)
    }

    async fn fund_manager(&self, id: i64) -> Result<FundManager, StoreError> {
        let sql = format!("SELECT {MANAGER_COLUMNS} FROM fund_managers WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("fund manager", id))?;
        manager_from_row(&row)
    }

    async fn fund_manager_by_uid(&self, uid: &str) -> Result<Option<FundManager>, StoreError> {
        let sql = format!("SELECT {MANAGER_COLUMNS} FROM fund_managers WHERE uid = $1");
        let row = sqlx::query(&sql).bind(uid).fetch_optional(&self.pool).await?;
        row.as_ref().map(manager_from_row).transpose()
    }

    async fn fund_managers(&self) -> Result<Vec<FundManager>, StoreError> {
        let sql = format!("SELECT {MANAGER_COLUMNS} FROM fund_managers ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(manager_from_row).collect()
    }

    async fn fund(&self, id: i64) -> Result<Fund, StoreError> {
        let sql = format!("SELECT {FUND_COLUMNS} FROM funds f WHERE f.id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("fund", id))?;
        fund_from_row(&row)
    }

    async fn funds(&self, fund_type: Option<FundType>) -> Result<Vec<Fund>, StoreError> {
        let sql = format!(
            "SELECT {FUND_COLUMNS} FROM funds f \
             WHERE ($1::TEXT IS NULL OR f.fund_type = $1) ORDER BY f.id"
        );
        let rows = sqlx::query(&sql)
            .bind(fund_type.map(|t| t.as_str()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(fund_from_row).collect()
    }

    async fn funds_for_manager(&self, fund_manager_id: i64) -> Result<Vec<Fund>, StoreError> {
        let sql = format!(
            "SELECT {FUND_COLUMNS} FROM funds f \
             JOIN fund_x_fund_managers x ON x.fund_id = f.id \
             WHERE x.fund_manager_id = $1 ORDER BY f.id"
        );
        let rows = sqlx::query(&sql)
            .bind(fund_manager_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(fund_from_row).collect()
    }

    async fn manager_ids_for_fund(&self, fund_id: i64) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT fund_manager_id FROM fund_x_fund_managers \
             WHERE fund_id = $1 ORDER BY fund_manager_id",
        )
        .bind(fund_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("fund_manager_id").map_err(StoreError::from))
            .collect()
    }

    async fn save_funds(&self, funds: &[Fund]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for fund in funds {
            let result = sqlx::query(
                r#"
                UPDATE funds
                   SET aum = $2,
                       is_hidden = $3,
                       returns = $4,
                       cagr = $5,
                       risk = $6,
                       other_data = $7,
                       updated_at = NOW()
                 WHERE id = $1
                "#,
            )
            .bind(fund.id)
            .bind(fund.aum)
            .bind(fund.is_hidden)
            .bind(Json(fund.returns))
            .bind(Json(fund.cagr))
            .bind(Json(fund.risk))
            .bind(Json(&fund.other_data))
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::not_found("fund", fund.id));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn reports_for_fund(
        &self,
        fund_id: i64,
        query: &ReportQuery,
    ) -> Result<Vec<FundReport>, StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {REPORT_COLUMNS} FROM fund_reports WHERE fund_id = "
        ));
        qb.push_bind(fund_id);
        if query.require_month_1 {
            qb.push(" AND returns ->> 'month_1' IS NOT NULL");
        }
        if let Some(after) = query.after {
            qb.push(" AND report_date > ").push_bind(after);
        }
        qb.push(if query.newest_first {
            " ORDER BY report_date DESC"
        } else {
            " ORDER BY report_date ASC"
        });
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(report_from_row).collect()
    }

    async fn insert_reports_if_absent(&self, reports: &[FundReport]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for report in reports {
            let result = sqlx::query(
                r#"
                INSERT INTO fund_reports (fund_id, report_date, returns, other_data)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (fund_id, report_date) DO NOTHING
                "#,
            )
            .bind(report.fund_id)
            .bind(report.report_date)
            .bind(Json(report.returns))
            .bind(Json(&report.other_data))
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written as usize)
    }

    async fn delete_merged_copies(&self, duplicate_fund_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM fund_reports WHERE other_data ->> 'merged_id' = $1")
            .bind(duplicate_fund_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_crawler_event(
        &self,
        kind: CrawlKind,
        source_id: &str,
        period: Option<ReportPeriod>,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO crawler_events (crawl_kind, source_id, period, error, recorded_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (crawl_kind, source_id, (COALESCE(period, DATE '1970-01-01'))) DO UPDATE
               SET error = EXCLUDED.error,
                   recorded_at = NOW()
            "#,
        )
        .bind(kind.as_str())
        .bind(source_id)
        .bind(period.map(|p| p.first_day()))
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn crawler_events(
        &self,
        kind: Option<CrawlKind>,
    ) -> Result<Vec<CrawlerEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, crawl_kind, source_id, period, error, recorded_at
              FROM crawler_events
             WHERE ($1::TEXT IS NULL OR crawl_kind = $1)
             ORDER BY recorded_at, id
            "#,
        )
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn resolve_crawler_events(
        &self,
        kind: CrawlKind,
        source_id: &str,
        period: Option<ReportPeriod>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM crawler_events
             WHERE crawl_kind = $1
               AND source_id = $2
               AND period IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(kind.as_str())
        .bind(source_id)
        .bind(period.map(|p| p.first_day()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_schemes(
        &self,
        schemes: &[MutualFundScheme],
    ) -> Result<Vec<MutualFundScheme>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(schemes.len());
        for scheme in schemes {
            let row = sqlx::query(
                r#"
                INSERT INTO mutual_fund_schemes (name, nav_url)
                VALUES ($1, $2)
                ON CONFLICT (name) DO UPDATE
                   SET nav_url = EXCLUDED.nav_url,
                       updated_at = NOW()
                RETURNING id, name, nav_url
                "#,
            )
            .bind(&scheme.name)
            .bind(&scheme.nav_url)
            .fetch_one(&mut *tx)
            .await?;
            out.push(scheme_from_row(&row)?);
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn scheme(&self, id: i64) -> Result<MutualFundScheme, StoreError> {
        let row = sqlx::query("SELECT id, name, nav_url FROM mutual_fund_schemes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("mutual fund scheme", id))?;
        scheme_from_row(&row)
    }

    async fn insert_navs(&self, navs: &[MutualFundNav]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for nav in navs {
            let result = sqlx::query(
                r#"
                INSERT INTO mutual_fund_navs (scheme_id, nav_date, nav)
                VALUES ($1, $2, $3)
                ON CONFLICT (scheme_id, nav_date) DO NOTHING
                "#,
            )
            .bind(nav.scheme_id)
            .bind(nav.nav_date)
            .bind(nav.nav)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundscope_core::{FundDraft, ATTR_AUM, ATTR_PRIORITY};

    fn month(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn report(date: NaiveDate, month_1: f64) -> FundReport {
        FundReport {
            id: 0,
            fund_id: 0,
            report_date: date,
            returns: Returns {
                month_1: Some(month_1),
                ..Returns::default()
            },
            other_data: Attributes::from([(ATTR_AUM.to_string(), "120.5".to_string())]),
        }
    }

    fn batch(uid: &str, target: NaiveDate, name: &str, month_1: f64) -> CrawlBatch {
        let mut manager = FundManager::new(uid);
        manager.name = format!("{uid} Capital");
        CrawlBatch {
            manager,
            target_month: target,
            funds: vec![FundDraft {
                name: name.to_string(),
                fund_type: FundType::PortfolioManagement,
                reports: vec![report(target, month_1)],
            }],
        }
    }

    #[tokio::test]
    async fn recrawling_a_month_keeps_one_report_per_fund() {
        let store = MemoryEntityStore::new();
        let target = month(2024, 3);
        let first = store
            .ingest_crawl_batch(batch("PM1", target, "Alpha", 1.5))
            .await
            .unwrap();
        assert_eq!(first.funds_created, 1);

        let second = store
            .ingest_crawl_batch(batch("PM1", target, "Alpha", 2.5))
            .await
            .unwrap();
        assert!(!second.manager_refreshed);
        assert_eq!(second.funds_created, 0);

        let funds = store.funds_for_manager(first.fund_manager_id).await.unwrap();
        assert_eq!(funds.len(), 1);
        let reports = store
            .reports_for_fund(funds[0].id, &ReportQuery::default())
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].returns.month_1, Some(2.5));
    }

    #[tokio::test]
    async fn newer_manager_refresh_is_not_overwritten_by_older_crawl() {
        let store = MemoryEntityStore::new();
        let mut newer = batch("PM1", month(2024, 5), "Alpha", 1.0);
        newer.manager.email = "new@example.test".into();
        let summary = store.ingest_crawl_batch(newer).await.unwrap();
        assert!(summary.manager_refreshed);

        let mut older = batch("PM1", month(2024, 2), "Alpha", 3.0);
        older.manager.email = "old@example.test".into();
        let summary = store.ingest_crawl_batch(older).await.unwrap();
        assert!(!summary.manager_refreshed);
        assert_eq!(summary.reports_written, 1);

        let manager = store.fund_manager_by_uid("PM1").await.unwrap().unwrap();
        assert_eq!(manager.email, "new@example.test");
        assert_eq!(manager.refreshed_date, Some(month(2024, 5)));

        let fund = &store.funds_for_manager(manager.id).await.unwrap()[0];
        let reports = store
            .reports_for_fund(fund.id, &ReportQuery::default())
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
    }

    #[tokio::test]
    async fn empty_incoming_fields_do_not_blank_stored_ones() {
        let store = MemoryEntityStore::new();
        let mut first = batch("PM1", month(2024, 1), "Alpha", 1.0);
        first.manager.address = "Mumbai".into();
        first.manager.total_aum = Some(10.0);
        store.ingest_crawl_batch(first).await.unwrap();

        store
            .ingest_crawl_batch(batch("PM1", month(2024, 2), "Alpha", 1.0))
            .await
            .unwrap();
        let manager = store.fund_manager_by_uid("PM1").await.unwrap().unwrap();
        assert_eq!(manager.address, "Mumbai");
        assert_eq!(manager.total_aum, Some(10.0));
        assert_eq!(manager.refreshed_date, Some(month(2024, 2)));
    }

    #[tokio::test]
    async fn insert_if_absent_never_overwrites() {
        let store = MemoryEntityStore::new();
        let summary = store
            .ingest_crawl_batch(batch("PM1", month(2024, 1), "Alpha", 1.0))
            .await
            .unwrap();
        let fund_id = store.funds_for_manager(summary.fund_manager_id).await.unwrap()[0].id;

        let mut copy = report(month(2024, 1), 9.0);
        copy.fund_id = fund_id;
        copy.other_data.insert(ATTR_MERGED_ID.into(), "99".into());
        copy.other_data.insert(ATTR_PRIORITY.into(), "low".into());
        let mut fresh = report(month(2023, 12), 4.0);
        fresh.fund_id = fund_id;
        fresh.other_data.insert(ATTR_MERGED_ID.into(), "99".into());

        let written = store.insert_reports_if_absent(&[copy, fresh]).await.unwrap();
        assert_eq!(written, 1);
        let reports = store
            .reports_for_fund(fund_id, &ReportQuery::latest_with_month_1(10))
            .await
            .unwrap();
        assert_eq!(reports[0].returns.month_1, Some(1.0));
        assert_eq!(reports[1].returns.month_1, Some(4.0));

        assert_eq!(store.delete_merged_copies(99).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn crawler_events_dedupe_per_target_and_resolve() {
        let store = MemoryEntityStore::new();
        let period = ReportPeriod::new(2024, 1);
        store
            .record_crawler_event(CrawlKind::PortfolioManager, "PM1", period, "timeout")
            .await
            .unwrap();
        store
            .record_crawler_event(CrawlKind::PortfolioManager, "PM1", period, "status 502")
            .await
            .unwrap();
        let events = store.crawler_events(Some(CrawlKind::PortfolioManager)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error, "status 502");

        assert_eq!(
            store
                .resolve_crawler_events(CrawlKind::PortfolioManager, "PM1", period)
                .await
                .unwrap(),
            1
        );
        assert!(store.crawler_events(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schemes_upsert_by_name_and_navs_are_unique_per_day() {
        let store = MemoryEntityStore::new();
        let scheme = MutualFundScheme {
            id: 0,
            name: "Growth Fund".into(),
            nav_url: "/nav/a".into(),
        };
        let first = store.upsert_schemes(&[scheme.clone()]).await.unwrap();
        let mut moved = scheme;
        moved.nav_url = "/nav/b".into();
        let second = store.upsert_schemes(&[moved]).await.unwrap();
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(store.scheme(first[0].id).await.unwrap().nav_url, "/nav/b");

        let nav = MutualFundNav {
            scheme_id: first[0].id,
            nav_date: month(2024, 1),
            nav: 10.5,
        };
        assert_eq!(store.insert_navs(&[nav.clone(), nav]).await.unwrap(), 1);
    }
}
