//! Mutual-fund scheme list and NAV history pages.

use chrono::NaiveDate;
use fundscope_core::{MutualFundNav, MutualFundScheme};
use scraper::Html;
use tracing::warn;

use crate::{element_text, parse_number, selector, text_or_none, AdapterError};

const NAV_DATE_FORMAT: &str = "%d-%m-%Y";

pub fn nav_history_url(base_url: &str, nav_path: &str, start: NaiveDate, end: NaiveDate) -> String {
    let base = base_url.trim_end_matches('/');
    let path = nav_path.trim();
    let separator = if path.starts_with('/') { "" } else { "/" };
    format!(
        "{base}{separator}{path}?end_date={}&start_date={}",
        end.format(NAV_DATE_FORMAT),
        start.format(NAV_DATE_FORMAT)
    )
}

/// Schemes listed in `table#latest_nav`: name from the first cell's link, NAV history path from
/// the last cell's link. Later duplicates of a name win.
pub fn parse_latest_nav(html: &str) -> Result<Vec<MutualFundScheme>, AdapterError> {
    let document = Html::parse_document(html);
    let rows = selector("table#latest_nav tbody tr")?;
    let td = selector("td")?;
    let link = selector("a")?;

    let mut schemes: Vec<MutualFundScheme> = Vec::new();
    for row in document.select(&rows) {
        let cells: Vec<_> = row.select(&td).collect();
        let (Some(first), Some(last)) = (cells.first(), cells.last()) else {
            continue;
        };
        let Some(name) = first
            .select(&link)
            .next()
            .and_then(|a| text_or_none(element_text(a)))
        else {
            continue;
        };
        let nav_url = last
            .select(&link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .unwrap_or_default()
            .trim()
            .to_string();

        match schemes.iter_mut().find(|s| s.name == name) {
            Some(existing) => existing.nav_url = nav_url,
            None => schemes.push(MutualFundScheme {
                id: 0,
                name,
                nav_url,
            }),
        }
    }
    Ok(schemes)
}

/// Rows of `table#historical_nav`: first cell is the date, last cell the NAV. Rows with an
/// unreadable date or value are skipped.
pub fn parse_historical_nav(
    scheme_id: i64,
    html: &str,
) -> Result<Vec<MutualFundNav>, AdapterError> {
    let document = Html::parse_document(html);
    let rows = selector("table#historical_nav tbody tr")?;
    let td = selector("td")?;

    let mut navs = Vec::new();
    for row in document.select(&rows) {
        let cells: Vec<String> = row.select(&td).map(element_text).collect();
        let (Some(date_raw), Some(nav_raw)) = (cells.first(), cells.last()) else {
            continue;
        };
        let date = match NaiveDate::parse_from_str(date_raw, NAV_DATE_FORMAT) {
            Ok(date) => date,
            Err(err) => {
                warn!(scheme_id, raw = %date_raw, error = %err, "unparseable nav date");
                continue;
            }
        };
        let Some(nav) = parse_number(nav_raw) else {
            warn!(scheme_id, raw = %nav_raw, "unparseable nav value");
            continue;
        };
        navs.push(MutualFundNav {
            scheme_id,
            nav_date: date,
            nav,
        });
    }
    Ok(navs)
}
