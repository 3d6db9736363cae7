//! Crawl adapters: request builders and tolerant HTML extractors for regulator disclosures
//! and mutual-fund NAV pages.

use chrono::{Duration, NaiveDate, Utc};
use fundscope_core::{CrawlKind, MutualFundNav, Report, ReportPeriod};
use fundscope_storage::FetchRequest;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mapper;
pub mod mf;
pub mod pmf;

pub const CRATE_NAME: &str = "fundscope-adapters";

pub const PMF_REPORT_URL: &str = "https://www.sebi.gov.in/sebiweb/other/OtherAction.do?doPmr=yes";
pub const PMF_ORIGIN: &str = "https://www.sebi.gov.in";
pub const MF_BASE_URL: &str = "https://www.advisorkhoj.com";
pub const MF_LATEST_NAV_URL: &str =
    "https://www.advisorkhoj.com/mutual-funds-research/mutual-fund-latest-nav";

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid fetch target {source_id}: {message}")]
    InvalidTarget { source_id: String, message: String },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    fn invalid_target(target: &FetchTarget, message: impl Into<String>) -> Self {
        AdapterError::InvalidTarget {
            source_id: target.source_id.clone(),
            message: message.into(),
        }
    }
}

/// One unit of crawl work: a source identifier, an optional reporting month and an optional
/// page locator relative to the adapter's base URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchTarget {
    pub source_id: String,
    pub period: Option<ReportPeriod>,
    pub locator: Option<String>,
}

impl FetchTarget {
    pub fn report(source_id: impl Into<String>, period: ReportPeriod) -> Self {
        Self {
            source_id: source_id.into(),
            period: Some(period),
            locator: None,
        }
    }

    pub fn located(source_id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            period: None,
            locator: Some(locator.into()),
        }
    }
}

/// Turns targets into requests and fetched bodies into typed results. Fetching itself lives
/// behind [`fundscope_storage::DocumentFetcher`].
pub trait CrawlAdapter: Send + Sync {
    type Output: Send + 'static;

    fn kind(&self) -> CrawlKind;

    fn request(&self, target: &FetchTarget) -> Result<FetchRequest, AdapterError>;

    fn extract(&self, target: &FetchTarget, body: &str) -> Result<Self::Output, AdapterError>;
}

/// Monthly portfolio-manager disclosure, fetched with the regulator's form POST.
#[derive(Debug, Clone)]
pub struct PmfAdapter {
    endpoint: String,
}

impl Default for PmfAdapter {
    fn default() -> Self {
        Self::new(PMF_REPORT_URL)
    }
}

impl PmfAdapter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// GET of the landing page that lists every registered manager.
    pub fn manager_list_request(&self) -> FetchRequest {
        FetchRequest::get("pmf-managers", self.endpoint.clone()).with_header("Accept", ACCEPT_HTML)
    }
}

impl CrawlAdapter for PmfAdapter {
    type Output = Report;

    fn kind(&self) -> CrawlKind {
        CrawlKind::PortfolioManager
    }

    fn request(&self, target: &FetchTarget) -> Result<FetchRequest, AdapterError> {
        let period = target
            .period
            .ok_or_else(|| AdapterError::invalid_target(target, "report period is required"))?;
        Ok(FetchRequest::post_form(
            target.source_id.clone(),
            self.endpoint.clone(),
            pmf::report_form(&target.source_id, period),
        )
        .with_header("Accept", ACCEPT_HTML)
        .with_header("Accept-Language", "en-US,en;q=0.5")
        .with_header("Referer", &self.endpoint)
        .with_header("Origin", PMF_ORIGIN))
    }

    fn extract(&self, target: &FetchTarget, body: &str) -> Result<Report, AdapterError> {
        let period = target
            .period
            .ok_or_else(|| AdapterError::invalid_target(target, "report period is required"))?;
        pmf::parse_report(&target.source_id, period, body)
    }
}

/// Historical NAV page of one mutual-fund scheme; `source_id` is the scheme id and the
/// locator is the scheme's NAV path.
#[derive(Debug, Clone)]
pub struct MfNavAdapter {
    base_url: String,
    history_days: i64,
}

impl Default for MfNavAdapter {
    fn default() -> Self {
        Self::new(MF_BASE_URL, 365)
    }
}

impl MfNavAdapter {
    pub fn new(base_url: impl Into<String>, history_days: i64) -> Self {
        Self {
            base_url: base_url.into(),
            history_days: history_days.max(1),
        }
    }

    pub fn history_url(&self, nav_path: &str, today: NaiveDate) -> String {
        mf::nav_history_url(
            &self.base_url,
            nav_path,
            today - Duration::days(self.history_days),
            today,
        )
    }

    pub fn latest_nav_request(url: &str) -> FetchRequest {
        FetchRequest::get("mf-latest-nav", url).with_header("Accept", ACCEPT_HTML)
    }
}

impl CrawlAdapter for MfNavAdapter {
    type Output = Vec<MutualFundNav>;

    fn kind(&self) -> CrawlKind {
        CrawlKind::MutualFundNav
    }

    fn request(&self, target: &FetchTarget) -> Result<FetchRequest, AdapterError> {
        let locator = target
            .locator
            .as_deref()
            .ok_or_else(|| AdapterError::invalid_target(target, "nav locator is required"))?;
        let url = self.history_url(locator, Utc::now().date_naive());
        Ok(FetchRequest::get(target.source_id.clone(), url).with_header("Accept", ACCEPT_HTML))
    }

    fn extract(
        &self,
        target: &FetchTarget,
        body: &str,
    ) -> Result<Vec<MutualFundNav>, AdapterError> {
        let scheme_id: i64 = target
            .source_id
            .parse()
            .map_err(|_| AdapterError::invalid_target(target, "scheme id is not numeric"))?;
        mf::parse_historical_nav(scheme_id, body)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parent_element(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.parent().and_then(ElementRef::wrap)
}

fn next_element(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.next_siblings().find_map(ElementRef::wrap)
}

fn child_elements<'a>(el: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    el.children().filter_map(ElementRef::wrap)
}

/// First `<strong>` whose text contains `needle`.
fn find_heading<'a>(
    document: &'a Html,
    needle: &str,
) -> Result<Option<ElementRef<'a>>, AdapterError> {
    let strong = selector("strong")?;
    Ok(document
        .select(&strong)
        .find(|s| s.text().collect::<String>().contains(needle)))
}

/// Regulator numbers: surrounding whitespace and thousands separators are ignored.
fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundscope_storage::FetchMethod;

    #[test]
    fn numbers_tolerate_separators_and_whitespace() {
        assert_eq!(parse_number(" 1,045.75 "), Some(1045.75));
        assert_eq!(parse_number("-0.5"), Some(-0.5));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number("NaN"), None);
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("-Infinity"), None);
    }

    #[test]
    fn pmf_request_is_a_form_post_for_the_period() {
        let adapter = PmfAdapter::default();
        let target = FetchTarget::report("INP000000001", ReportPeriod::new(2024, 3).unwrap());
        let request = adapter.request(&target).unwrap();
        assert_eq!(request.url, PMF_REPORT_URL);
        assert_eq!(request.source_id, "INP000000001");
        let FetchMethod::PostForm(form) = &request.method else {
            panic!("expected form post");
        };
        let field = |name: &str| form.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
        assert_eq!(field("pmrId"), Some("INP000000001"));
        assert_eq!(field("year"), Some("2024"));
        assert_eq!(field("month"), Some("3"));
        assert_eq!(field("moduleNo"), Some("-1"));
        assert!(request.headers.iter().any(|(k, v)| k == "Origin" && v == PMF_ORIGIN));
    }

    #[test]
    fn pmf_request_without_period_is_rejected() {
        let adapter = PmfAdapter::default();
        let target = FetchTarget::located("INP1", "/x");
        assert!(matches!(
            adapter.request(&target),
            Err(AdapterError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn nav_history_window_ends_today() {
        let adapter = MfNavAdapter::new(MF_BASE_URL, 365);
        let today = NaiveDate::from_ymd_opt(2025, 3, 13).unwrap();
        assert_eq!(
            adapter.history_url("mutual-funds-research/historical-NAV/Alpha Gr", today),
            format!(
                "{MF_BASE_URL}/mutual-funds-research/historical-NAV/Alpha Gr\
                 ?end_date=13-03-2025&start_date=13-03-2024"
            )
        );
    }
}
