//! Derived-data maintenance for a fund house: merge resync, drawdown, volatility and visibility.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Months, NaiveDate};
use fundscope_core::metrics::{max_drawdown_from_returns, population_std_dev, trailing_returns};
use fundscope_core::{Fund, FundReport, FundType, ATTR_MERGED_ID, ATTR_ORIGINAL_ID, ATTR_PRIORITY};
use fundscope_storage::{EntityStore, ReportQuery};
use tracing::{debug, info_span, warn, Instrument};

const RISK_WINDOWS_YEARS: [u32; 2] = [3, 5];
const VISIBILITY_WINDOW_MONTHS: u32 = 5;
const MIN_RECENT_REPORTS: usize = 3;
const TRAILING_MONTHS: usize = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub funds: usize,
    pub merged_reports: usize,
    pub drawdowns: usize,
    pub hidden: usize,
}

pub struct ReconciliationEngine {
    entities: Arc<dyn EntityStore>,
}

impl ReconciliationEngine {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }

    /// Runs every step over the manager's funds, persisting after each one. The first failing
    /// step aborts the rest.
    pub async fn reconcile(
        &self,
        fund_manager_id: i64,
        today: NaiveDate,
    ) -> Result<ReconcileSummary> {
        let span = info_span!("reconcile", fund_manager_id);
        async move {
            self.entities
                .fund_manager(fund_manager_id)
                .await
                .with_context(|| format!("loading fund manager {fund_manager_id}"))?;
            let mut funds = self.entities.funds_for_manager(fund_manager_id).await?;
            let mut summary = ReconcileSummary {
                funds: funds.len(),
                ..Default::default()
            };

            summary.merged_reports = self.resync_merged(&funds).await.context("merge resync")?;
            self.entities.save_funds(&funds).await?;

            summary.drawdowns = self.update_risk(&mut funds).await.context("risk metrics")?;
            self.entities.save_funds(&funds).await?;

            summary.hidden = self
                .update_visibility(&mut funds, today)
                .await
                .context("visibility")?;
            self.entities.save_funds(&funds).await?;

            debug!(?summary, "reconciled");
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn resync_merged(&self, funds: &[Fund]) -> Result<usize> {
        let mut copied = 0;
        for fund in funds {
            let canonical = match fund.canonical_fund_id() {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        fund_id = fund.id,
                        original_id = ?fund.other_data.get(ATTR_ORIGINAL_ID),
                        error = %err,
                        "original_id is not numeric; merge skipped"
                    );
                    continue;
                }
            };

            let copies: Vec<FundReport> = self
                .entities
                .reports_for_fund(fund.id, &ReportQuery::default())
                .await?
                .into_iter()
                .map(|mut report| {
                    report.id = 0;
                    report.fund_id = canonical;
                    report
                        .other_data
                        .insert(ATTR_MERGED_ID.to_string(), fund.id.to_string());
                    report
                        .other_data
                        .insert(ATTR_PRIORITY.to_string(), "low".to_string());
                    report
                })
                .collect();
            copied += self.entities.insert_reports_if_absent(&copies).await?;
        }
        Ok(copied)
    }

    async fn update_risk(&self, funds: &mut [Fund]) -> Result<usize> {
        let mut updated = 0;
        for years in RISK_WINDOWS_YEARS {
            let window = years as usize * 12;
            for fund in funds.iter_mut() {
                let reports = self
                    .entities
                    .reports_for_fund(fund.id, &ReportQuery::latest_with_month_1(window))
                    .await?;
                if reports.len() < window {
                    debug!(
                        fund_id = fund.id,
                        years,
                        have = reports.len(),
                        "insufficient history for drawdown"
                    );
                    continue;
                }
                let chronological: Vec<f64> = reports
                    .iter()
                    .rev()
                    .filter_map(|r| r.returns.month_1)
                    .collect();
                fund.risk
                    .set_drawdown(years, max_drawdown_from_returns(&chronological));
                if let Some(volatility) = population_std_dev(&chronological) {
                    fund.risk.set_volatility(years, volatility);
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn update_visibility(&self, funds: &mut [Fund], today: NaiveDate) -> Result<usize> {
        let cutoff = today - Months::new(VISIBILITY_WINDOW_MONTHS);
        let recent = ReportQuery {
            after: Some(cutoff),
            ..Default::default()
        };
        let mut hidden = 0;
        for fund in funds.iter_mut() {
            fund.is_hidden = if fund.is_merge_duplicate() {
                true
            } else if let Some(pinned) = fund.visibility_override() {
                pinned
            } else {
                let reports = self.entities.reports_for_fund(fund.id, &recent).await?;
                reports.len() < MIN_RECENT_REPORTS
            };
            if fund.is_hidden {
                hidden += 1;
            }
        }
        Ok(hidden)
    }
}

/// Recomputes fund-level returns, CAGR and AUM from stored monthly reports.
/// Returns the number of funds updated.
pub async fn compute_returns(
    entities: &dyn EntityStore,
    fund_type: Option<FundType>,
) -> Result<usize> {
    let mut funds = entities.funds(fund_type).await?;
    let newest_first = ReportQuery {
        newest_first: true,
        ..Default::default()
    };

    let mut updated = Vec::with_capacity(funds.len());
    for mut fund in funds.drain(..) {
        let reports = entities.reports_for_fund(fund.id, &newest_first).await?;
        let Some(latest) = reports.first() else {
            continue;
        };
        let monthly: Vec<f64> = reports
            .iter()
            .filter_map(|r| r.returns.month_1)
            .take(TRAILING_MONTHS)
            .collect();
        let (mut returns, cagr) = trailing_returns(&monthly);
        returns.month_1 = latest.returns.month_1;
        returns.since_inception = latest.returns.since_inception;
        fund.returns = returns;
        fund.cagr = cagr;
        fund.aum = latest.aum();
        updated.push(fund);
    }

    entities.save_funds(&updated).await?;
    Ok(updated.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundscope_core::{
        Attributes, CrawlBatch, FundDraft, FundManager, Returns, ATTR_AUM,
    };
    use fundscope_storage::MemoryEntityStore;

    fn date(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn report(month: NaiveDate, month_1: Option<f64>) -> FundReport {
        FundReport {
            id: 0,
            fund_id: 0,
            report_date: month,
            returns: Returns {
                month_1,
                ..Default::default()
            },
            other_data: Attributes::new(),
        }
    }

    /// `values.len()` consecutive monthly reports ending at `last`.
    fn series(last: NaiveDate, values: &[f64]) -> Vec<FundReport> {
        let n = values.len() as u32;
        values
            .iter()
            .enumerate()
            .map(|(i, v)| report(last - Months::new(n - 1 - i as u32), Some(*v)))
            .collect()
    }

    async fn seed(
        store: &MemoryEntityStore,
        funds: Vec<(&str, Vec<FundReport>)>,
    ) -> (i64, Vec<Fund>) {
        let summary = store
            .ingest_crawl_batch(CrawlBatch {
                manager: FundManager::new("INP000000001"),
                target_month: date(2024, 5),
                funds: funds
                    .into_iter()
                    .map(|(name, reports)| FundDraft {
                        name: name.to_string(),
                        fund_type: FundType::PortfolioManagement,
                        reports,
                    })
                    .collect(),
            })
            .await
            .unwrap();
        let funds = store.funds_for_manager(summary.fund_manager_id).await.unwrap();
        (summary.fund_manager_id, funds)
    }

    fn by_name<'a>(funds: &'a [Fund], name: &str) -> &'a Fund {
        funds.iter().find(|f| f.name == name).unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    #[tokio::test]
    async fn drawdown_and_volatility_use_a_full_window_only() {
        let store = Arc::new(MemoryEntityStore::new());
        let mut steady = vec![1.0; 35];
        steady.push(-20.0);
        let (manager_id, _) = seed(
            &store,
            vec![
                ("Three Year", series(date(2024, 5), &steady)),
                ("Short", series(date(2024, 5), &[2.0; 10])),
            ],
        )
        .await;

        let summary = ReconciliationEngine::new(store.clone())
            .reconcile(manager_id, today())
            .await
            .unwrap();
        assert_eq!(summary.funds, 2);
        assert_eq!(summary.drawdowns, 1);

        let funds = store.funds_for_manager(manager_id).await.unwrap();
        let three = by_name(&funds, "Three Year");
        assert!((three.risk.max_drawdown_3yr.unwrap() - 0.20).abs() < 1e-9);
        assert_eq!(three.risk.max_drawdown_5yr, None);
        assert_eq!(three.risk.sharpe_ratio_3yr, population_std_dev(&steady));

        let short = by_name(&funds, "Short");
        assert_eq!(short.risk.max_drawdown_3yr, None);
        assert_eq!(short.risk.sharpe_ratio_3yr, None);
    }

    #[tokio::test]
    async fn funds_without_recent_reports_are_hidden() {
        let store = Arc::new(MemoryEntityStore::new());
        let (manager_id, _) = seed(
            &store,
            vec![
                ("Current", series(date(2024, 5), &[1.0, 1.0, 1.0])),
                ("Stale", series(date(2023, 10), &[1.0; 6])),
                ("Sparse", series(date(2024, 5), &[1.0, 1.0])),
            ],
        )
        .await;

        let summary = ReconciliationEngine::new(store.clone())
            .reconcile(manager_id, today())
            .await
            .unwrap();
        assert_eq!(summary.hidden, 2);
        let funds = store.funds_for_manager(manager_id).await.unwrap();
        assert!(!by_name(&funds, "Current").is_hidden);
        assert!(by_name(&funds, "Stale").is_hidden);
        assert!(by_name(&funds, "Sparse").is_hidden);
    }

    #[tokio::test]
    async fn pinned_visibility_beats_the_recency_rule() {
        let store = Arc::new(MemoryEntityStore::new());
        let (manager_id, _) = seed(
            &store,
            vec![
                ("Current", series(date(2024, 5), &[1.0, 1.0, 1.0])),
                ("Stale", series(date(2023, 10), &[1.0; 6])),
            ],
        )
        .await;
        let mut funds = store.funds_for_manager(manager_id).await.unwrap();
        for fund in funds.iter_mut() {
            fund.pin_visibility(fund.name == "Current");
        }
        store.save_funds(&funds).await.unwrap();

        ReconciliationEngine::new(store.clone())
            .reconcile(manager_id, today())
            .await
            .unwrap();
        let funds = store.funds_for_manager(manager_id).await.unwrap();
        assert!(by_name(&funds, "Current").is_hidden);
        assert!(!by_name(&funds, "Stale").is_hidden);
    }

    #[tokio::test]
    async fn merged_reports_are_copied_onto_the_canonical_fund() {
        let store = Arc::new(MemoryEntityStore::new());
        let (manager_id, funds) = seed(
            &store,
            vec![
                ("Canonical", series(date(2024, 5), &[1.0, 1.0, 1.0])),
                ("Copy", series(date(2024, 3), &[0.5, 0.5, 0.5, 0.5])),
            ],
        )
        .await;
        let canonical_id = by_name(&funds, "Canonical").id;
        let mut copy = by_name(&funds, "Copy").clone();
        copy.other_data
            .insert(ATTR_ORIGINAL_ID.to_string(), canonical_id.to_string());
        store.save_funds(&[copy.clone()]).await.unwrap();

        let engine = ReconciliationEngine::new(store.clone());
        let summary = engine.reconcile(manager_id, today()).await.unwrap();
        // Copy covers 2023-12..2024-03; the canonical already has 2024-03.
        assert_eq!(summary.merged_reports, 3);

        let reports = store
            .reports_for_fund(canonical_id, &ReportQuery::default())
            .await
            .unwrap();
        assert_eq!(reports.len(), 6);
        let merged: Vec<&FundReport> = reports
            .iter()
            .filter(|r| r.other_data.get(ATTR_MERGED_ID) == Some(&copy.id.to_string()))
            .collect();
        assert_eq!(merged.len(), 3);
        assert!(merged
            .iter()
            .all(|r| r.other_data.get(ATTR_PRIORITY).map(String::as_str) == Some("low")));

        let funds = store.funds_for_manager(manager_id).await.unwrap();
        assert!(by_name(&funds, "Copy").is_hidden);
        assert!(!by_name(&funds, "Canonical").is_hidden);

        assert_eq!(engine.reconcile(manager_id, today()).await.unwrap().merged_reports, 0);
    }

    #[tokio::test]
    async fn self_referencing_or_garbled_original_id_is_not_a_merge() {
        let store = Arc::new(MemoryEntityStore::new());
        let (manager_id, funds) = seed(
            &store,
            vec![
                ("Self", series(date(2024, 5), &[1.0, 1.0, 1.0])),
                ("Garbled", series(date(2024, 5), &[1.0, 1.0, 1.0])),
            ],
        )
        .await;
        let mut own = by_name(&funds, "Self").clone();
        own.other_data
            .insert(ATTR_ORIGINAL_ID.to_string(), own.id.to_string());
        let mut garbled = by_name(&funds, "Garbled").clone();
        garbled
            .other_data
            .insert(ATTR_ORIGINAL_ID.to_string(), "fund-7".to_string());
        store.save_funds(&[own, garbled]).await.unwrap();

        let summary = ReconciliationEngine::new(store.clone())
            .reconcile(manager_id, today())
            .await
            .unwrap();
        assert_eq!(summary.merged_reports, 0);
        assert_eq!(summary.hidden, 0);
    }

    #[tokio::test]
    async fn unknown_manager_fails_reconciliation() {
        let store = Arc::new(MemoryEntityStore::new());
        assert!(ReconciliationEngine::new(store)
            .reconcile(404, today())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn fund_returns_come_from_the_latest_report_and_trailing_months() {
        let store = MemoryEntityStore::new();
        let mut reports = series(date(2024, 5), &[1.0; 12]);
        let latest = reports.last_mut().unwrap();
        latest.returns.since_inception = Some(42.0);
        latest
            .other_data
            .insert(ATTR_AUM.to_string(), "250.5".to_string());
        seed(&store, vec![("Yearling", reports), ("Empty", Vec::new())]).await;

        assert_eq!(compute_returns(&store, None).await.unwrap(), 1);
        let funds = store.funds(Some(FundType::PortfolioManagement)).await.unwrap();
        let fund = by_name(&funds, "Yearling");
        assert_eq!(fund.returns.month_1, Some(1.0));
        assert_eq!(fund.returns.since_inception, Some(42.0));
        assert!((fund.returns.month_3.unwrap() - 3.0301).abs() < 1e-9);
        assert!(fund.returns.year_1.is_some());
        assert_eq!(fund.returns.year_2, None);
        assert_eq!(fund.cagr.year_2, None);
        assert_eq!(fund.aum, Some(250.5));
        assert_eq!(by_name(&funds, "Empty").returns, Returns::default());
    }
}
