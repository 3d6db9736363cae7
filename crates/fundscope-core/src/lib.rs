//! Core domain model for Fundscope: fund houses, funds, monthly reports and crawl bookkeeping.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod job;
pub mod metrics;

pub use job::{
    CrawlPmfFunds, JobCodecError, JobKey, JobOptions, JobSpec, JobStatus, MfNavSync,
    ReconcileFundHouse, ScheduledJob, Trigger, TriggerError,
};

pub const CRATE_NAME: &str = "fundscope-core";

/// Free-form extensible attributes stored alongside managers, funds and reports.
pub type Attributes = BTreeMap<String, String>;

pub const ATTR_UID: &str = "UID";
pub const ATTR_REGISTRATION_NAME: &str = "RegistrationName";
pub const ATTR_COMPLIANCE_OFFICER: &str = "ComplianceOfficer";
pub const ATTR_COMPLIANCE_OFFICER_EMAIL: &str = "ComplianceOfficerEmail";
pub const ATTR_STRATEGY: &str = "Strategy";
pub const ATTR_AUM: &str = "AUM";
pub const ATTR_LABEL: &str = "label";
pub const ATTR_ORIGINAL_ID: &str = "original_id";
pub const ATTR_MERGED_ID: &str = "merged_id";
pub const ATTR_PRIORITY: &str = "priority";
/// Operator visibility choice, `hidden` or `visible`; overrides the recency rule.
pub const ATTR_VISIBILITY: &str = "visibility";

pub const DEFAULT_STRATEGY: &str = "Equity";

/// Calendar month a regulator disclosure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReportPeriod {
    pub year: i32,
    pub month: u32,
}

impl ReportPeriod {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// First day of the month; every `FundReport.report_date` is normalized to this.
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn next(&self) -> Self {
        Self::from_date(self.first_day() + Months::new(1))
    }

    /// Inclusive month range, empty when `to` precedes `self`.
    pub fn range_to(&self, to: ReportPeriod) -> Vec<ReportPeriod> {
        let mut out = Vec::new();
        let mut cursor = *self;
        while cursor <= to {
            out.push(cursor);
            cursor = cursor.next();
        }
        out
    }

    /// Parses `YYYY-MM` or a full `YYYY-MM-DD` date.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
            return Some(Self::from_date(date));
        }
        let (year, month) = input.split_once('-')?;
        Self::new(year.parse().ok()?, month.parse().ok()?)
    }
}

impl fmt::Display for ReportPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FundType {
    #[serde(rename = "PMF")]
    PortfolioManagement,
    #[serde(rename = "MF")]
    MutualFund,
}

impl FundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundType::PortfolioManagement => "PMF",
            FundType::MutualFund => "MF",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "PMF" => Some(FundType::PortfolioManagement),
            "MF" => Some(FundType::MutualFund),
            _ => None,
        }
    }
}

/// Multi-horizon returns in percent, shared by funds and their monthly reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Returns {
    pub month_1: Option<f64>,
    pub month_3: Option<f64>,
    pub month_6: Option<f64>,
    pub year_1: Option<f64>,
    pub year_2: Option<f64>,
    pub year_3: Option<f64>,
    pub year_4: Option<f64>,
    pub year_5: Option<f64>,
    pub since_inception: Option<f64>,
}

impl Returns {
    /// Assigns a value by its normalized period label ("1 month", "3 year", "since inception").
    pub fn set_by_label(&mut self, label: &str, value: f64) -> bool {
        let slot = match label {
            "1 month" => &mut self.month_1,
            "3 month" => &mut self.month_3,
            "6 month" => &mut self.month_6,
            "1 year" => &mut self.year_1,
            "2 year" => &mut self.year_2,
            "3 year" => &mut self.year_3,
            "4 year" => &mut self.year_4,
            "5 year" => &mut self.year_5,
            "since inception" => &mut self.since_inception,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cagr {
    pub year_2: Option<f64>,
    pub year_3: Option<f64>,
    pub year_4: Option<f64>,
    pub year_5: Option<f64>,
}

/// Derived risk figures. `sharpe_ratio_*` hold the population standard deviation of
/// monthly returns; no risk-free rate is subtracted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub max_drawdown_3yr: Option<f64>,
    pub max_drawdown_5yr: Option<f64>,
    pub sharpe_ratio_3yr: Option<f64>,
    pub sharpe_ratio_5yr: Option<f64>,
}

impl RiskMetrics {
    pub fn set_drawdown(&mut self, years: u32, value: f64) {
        match years {
            3 => self.max_drawdown_3yr = Some(value),
            5 => self.max_drawdown_5yr = Some(value),
            _ => {}
        }
    }

    pub fn set_volatility(&mut self, years: u32, value: f64) {
        match years {
            3 => self.sharpe_ratio_3yr = Some(value),
            5 => self.sharpe_ratio_5yr = Some(value),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundManager {
    pub id: i64,
    pub uid: String,
    pub name: String,
    pub email: String,
    pub contact: String,
    pub register_number: String,
    pub registered_date: Option<NaiveDate>,
    pub address: String,
    pub total_no_of_client: Option<f64>,
    pub total_aum: Option<f64>,
    pub refreshed_date: Option<NaiveDate>,
    pub other_data: Attributes,
}

impl FundManager {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            id: 0,
            uid: uid.into(),
            name: String::new(),
            email: String::new(),
            contact: String::new(),
            register_number: String::new(),
            registered_date: None,
            address: String::new(),
            total_no_of_client: None,
            total_aum: None,
            refreshed_date: None,
            other_data: Attributes::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.other_data
            .get(ATTR_LABEL)
            .or_else(|| self.other_data.get(ATTR_REGISTRATION_NAME))
            .map(String::as_str)
            .unwrap_or(&self.name)
    }

    /// Staleness guard: a crawl for `target` may overwrite this manager only when the
    /// stored refresh date is strictly earlier (or was never set).
    pub fn accepts_refresh_for(&self, target: NaiveDate) -> bool {
        self.refreshed_date.map_or(true, |current| current < target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fund {
    pub id: i64,
    pub name: String,
    pub fund_type: FundType,
    pub aum: Option<f64>,
    pub is_hidden: bool,
    pub returns: Returns,
    pub cagr: Cagr,
    pub risk: RiskMetrics,
    pub other_data: Attributes,
}

impl Fund {
    pub fn new(name: impl Into<String>, fund_type: FundType) -> Self {
        Self {
            id: 0,
            name: name.into(),
            fund_type,
            aum: None,
            is_hidden: false,
            returns: Returns::default(),
            cagr: Cagr::default(),
            risk: RiskMetrics::default(),
            other_data: Attributes::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.other_data
            .get(ATTR_LABEL)
            .map(String::as_str)
            .unwrap_or(&self.name)
    }

    /// The canonical fund this one was merged into. Absent, empty and self-referencing
    /// markers all mean "not merged".
    pub fn canonical_fund_id(&self) -> Result<Option<i64>, std::num::ParseIntError> {
        let Some(raw) = self.other_data.get(ATTR_ORIGINAL_ID) else {
            return Ok(None);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let id: i64 = raw.parse()?;
        Ok((id != self.id).then_some(id))
    }

    pub fn is_merge_duplicate(&self) -> bool {
        matches!(self.canonical_fund_id(), Ok(Some(_)))
    }

    /// `Some(hidden)` when an operator pinned the fund's visibility.
    pub fn visibility_override(&self) -> Option<bool> {
        match self.other_data.get(ATTR_VISIBILITY).map(String::as_str) {
            Some("hidden") => Some(true),
            Some("visible") => Some(false),
            _ => None,
        }
    }

    pub fn pin_visibility(&mut self, hidden: bool) {
        let value = if hidden { "hidden" } else { "visible" };
        self.other_data
            .insert(ATTR_VISIBILITY.to_string(), value.to_string());
        self.is_hidden = hidden;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundReport {
    pub id: i64,
    pub fund_id: i64,
    pub report_date: NaiveDate,
    pub returns: Returns,
    pub other_data: Attributes,
}

impl FundReport {
    pub fn aum(&self) -> Option<f64> {
        self.other_data.get(ATTR_AUM).and_then(|v| v.parse().ok())
    }

    pub fn strategy(&self) -> &str {
        self.other_data
            .get(ATTR_STRATEGY)
            .map(String::as_str)
            .unwrap_or(DEFAULT_STRATEGY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrawlKind {
    #[serde(rename = "pmf")]
    PortfolioManager,
    #[serde(rename = "mf_nav")]
    MutualFundNav,
}

impl CrawlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlKind::PortfolioManager => "pmf",
            CrawlKind::MutualFundNav => "mf_nav",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "pmf" => Some(CrawlKind::PortfolioManager),
            "mf_nav" => Some(CrawlKind::MutualFundNav),
            _ => None,
        }
    }
}

/// Durable record of a failed fetch, kept until a later fetch of the same target succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlerEvent {
    pub id: i64,
    pub crawl_kind: CrawlKind,
    pub source_id: String,
    pub period: Option<ReportPeriod>,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralInfo {
    pub registration_name: Option<String>,
    pub register_number: Option<String>,
    pub registered_date: Option<NaiveDate>,
    pub address: Option<String>,
    pub principal_officer: Option<String>,
    pub principal_officer_email: Option<String>,
    pub principal_officer_contact: Option<String>,
    pub compliance_officer: Option<String>,
    pub compliance_officer_email: Option<String>,
    pub total_no_of_client: Option<f64>,
    pub total_aum: Option<f64>,
}

impl GeneralInfo {
    pub fn is_empty(&self) -> bool {
        *self == GeneralInfo::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscretionaryService {
    pub fund_name: String,
    pub strategy: String,
    pub aum: Option<f64>,
    pub returns: BTreeMap<String, f64>,
    pub turnover: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Complaints {
    pub pending_month_start: Option<f64>,
    pub received_during_month: Option<f64>,
    pub resolved_during_month: Option<f64>,
    pub pending_month_end: Option<f64>,
}

/// Transient aggregate built from one disclosure document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub uid: String,
    pub period: ReportPeriod,
    pub general: GeneralInfo,
    pub services: Vec<DiscretionaryService>,
    pub complaints: Complaints,
}

impl Report {
    pub fn new(uid: impl Into<String>, period: ReportPeriod) -> Self {
        Self {
            uid: uid.into(),
            period,
            general: GeneralInfo::default(),
            services: Vec::new(),
            complaints: Complaints::default(),
        }
    }

    pub fn service(&self, fund_name: &str) -> Option<&DiscretionaryService> {
        self.services.iter().find(|s| s.fund_name == fund_name)
    }

    pub fn service_mut(&mut self, fund_name: &str) -> Option<&mut DiscretionaryService> {
        self.services.iter_mut().find(|s| s.fund_name == fund_name)
    }

    /// Finds the service row for `fund_name`, appending an empty one when absent.
    pub fn service_entry(&mut self, fund_name: &str) -> &mut DiscretionaryService {
        let idx = match self.services.iter().position(|s| s.fund_name == fund_name) {
            Some(idx) => idx,
            None => {
                self.services.push(DiscretionaryService {
                    fund_name: fund_name.to_string(),
                    ..Default::default()
                });
                self.services.len() - 1
            }
        };
        &mut self.services[idx]
    }
}

/// One fund's worth of mapped rows, ready for the upsert layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundDraft {
    pub name: String,
    pub fund_type: FundType,
    pub reports: Vec<FundReport>,
}

/// Everything a single successful crawl writes, applied in one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlBatch {
    pub manager: FundManager,
    pub target_month: NaiveDate,
    pub funds: Vec<FundDraft>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub fund_manager_id: i64,
    pub manager_refreshed: bool,
    pub funds_created: usize,
    pub reports_written: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutualFundScheme {
    pub id: i64,
    pub name: String,
    pub nav_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutualFundNav {
    pub scheme_id: i64,
    pub nav_date: NaiveDate,
    pub nav: f64,
}
