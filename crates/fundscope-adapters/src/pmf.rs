//! Portfolio-manager monthly disclosure parser.
//!
//! The regulator publishes one page per manager and month with three sections located by
//! their `<strong>` headings: general information, performance data and complaints. The
//! performance section comes in two layouts:
//!
//! * two tables: returns grouped under strategy rows (`rowspan`), followed by a separate
//!   turnover table joined back by fund name;
//! * a single table carrying returns and turnover side by side.
//!
//! Malformed cells are logged and left unset; they never abort the report.

use chrono::NaiveDate;
use fundscope_core::{Report, ReportPeriod};
use scraper::{ElementRef, Html};
use tracing::{debug, warn};

use crate::{
    child_elements, element_text, find_heading, next_element, parent_element, parse_number,
    selector, text_or_none, AdapterError,
};

const GENERAL_INFORMATION: &str = "General Information";
const PERFORMANCE_DATA: &str = "E. Performance Data";
const DATA_ON_COMPLAINTS: &str = "Data on Complaints";
const MANAGER_PLACEHOLDER: &str = "Select the Portfolio Manager Name";

const INDEX_MARKERS: [&str; 17] = [
    "NIFTY", "Nifty", "NA", "MIDCAP", "CNXMIDCAP", "GSEC", "SI-BEX", "BSE", "Index", "INDEX",
    "Benchmark", "Total", "CRISIL", "CLFI", "SENSEX", "MSCIACWI", "CNX100",
];

/// Form body of the regulator's report lookup.
pub fn report_form(uid: &str, period: ReportPeriod) -> Vec<(String, String)> {
    [
        ("currdate", String::new()),
        ("loginflag", "0".to_string()),
        ("searchValue", String::new()),
        ("pmrId", uid.to_string()),
        ("year", period.year.to_string()),
        ("month", period.month.to_string()),
        ("org.apache.struts.taglib.html.TOKEN", "...".to_string()),
        ("loginEmail", String::new()),
        ("cap_login", String::new()),
        ("moduleNo", "-1".to_string()),
        ("moduleId", String::new()),
        ("link", String::new()),
        ("yourName", String::new()),
        ("friendName", String::new()),
        ("friendEmail", String::new()),
        ("mailmessage", String::new()),
        ("cap_email", String::new()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Benchmark and aggregate rows mixed into the performance tables.
pub fn is_index_name(name: &str) -> bool {
    name == "0" || INDEX_MARKERS.iter().any(|marker| name.contains(marker))
}

/// Lower-cased, trimmed period label with plural units folded ("3 Years" -> "3 year").
pub fn json_key(label: &str) -> String {
    label
        .trim()
        .to_lowercase()
        .replace("years", "year")
        .replace("months", "month")
}

/// Manager UIDs from the landing page's selection list.
pub fn parse_manager_ids(html: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let options = selector("div.committee-search > div > select > option")?;
    Ok(document
        .select(&options)
        .filter(|opt| !opt.text().collect::<String>().contains(MANAGER_PLACEHOLDER))
        .filter_map(|opt| opt.value().attr("value"))
        .filter_map(|value| text_or_none(value.to_string()))
        .collect())
}

pub fn parse_report(uid: &str, period: ReportPeriod, html: &str) -> Result<Report, AdapterError> {
    let document = Html::parse_document(html);
    let mut report = Report::new(uid, period);
    parse_general_information(&document, &mut report)?;
    parse_performance(&document, &mut report)?;
    parse_complaints(&document, &mut report)?;
    debug!(
        uid,
        period = %period,
        services = report.services.len(),
        "parsed disclosure"
    );
    Ok(report)
}

fn number_or_warn(raw: &str, field: &str, report: &Report) -> Option<f64> {
    let value = parse_number(raw);
    if value.is_none() && !raw.trim().is_empty() {
        warn!(uid = %report.uid, period = %report.period, field, raw, "unparseable number");
    }
    value
}

fn parse_general_information(document: &Html, report: &mut Report) -> Result<(), AdapterError> {
    let Some(heading) = find_heading(document, GENERAL_INFORMATION)? else {
        debug!(uid = %report.uid, "no general information section");
        return Ok(());
    };
    let Some(section) = parent_element(heading)
        .and_then(parent_element)
        .and_then(parent_element)
    else {
        return Ok(());
    };

    let rows = selector("table tr")?;
    let th = selector("th")?;
    let td = selector("td")?;
    for row in section.select(&rows) {
        let Some(label) = row.select(&th).next().map(element_text) else {
            continue;
        };
        let Some(value) = row.select(&td).next().and_then(|c| text_or_none(element_text(c))) else {
            continue;
        };
        match label.as_str() {
            "Name of the Portfolio Manager" => report.general.registration_name = Some(value),
            "Registration Number" => report.general.register_number = Some(value),
            "Date of Registration" => match NaiveDate::parse_from_str(&value, "%Y-%m-%d") {
                Ok(date) => report.general.registered_date = Some(date),
                Err(err) => {
                    warn!(
                        uid = %report.uid,
                        raw = %value,
                        error = %err,
                        "unparseable registration date"
                    )
                }
            },
            "Registered Address of the Portfolio Manager" => report.general.address = Some(value),
            "Name of Principal Officer" => report.general.principal_officer = Some(value),
            "Email ID of the Principal Officer" => {
                report.general.principal_officer_email = Some(value)
            }
            "Contact Number (Direct) of the Principal Officer" => {
                report.general.principal_officer_contact = Some(value)
            }
            "Name of Compliance Officer" => report.general.compliance_officer = Some(value),
            "Email ID of the Compliance Officer" => {
                report.general.compliance_officer_email = Some(value)
            }
            "No. of clients as on last day of the month" => {
                let clients = number_or_warn(&value, "total_no_of_client", report);
                report.general.total_no_of_client = clients;
            }
            "Total Assets under Management (AUM) as on last day of the month (Amount in INR crores)" => {
                let aum = number_or_warn(&value, "total_aum", report);
                report.general.total_aum = aum;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Column labels read from a two-row performance header.
#[derive(Debug, Default, PartialEq)]
struct PerformanceHeader {
    single_table: bool,
    return_keys: Vec<String>,
    turnover_keys: Vec<String>,
}

fn colspan(cell: ElementRef<'_>) -> usize {
    cell.value()
        .attr("colspan")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn parse_header(table: ElementRef<'_>) -> Result<Option<PerformanceHeader>, AdapterError> {
    let thead = selector("thead")?;
    let Some(head) = table.select(&thead).next() else {
        return Ok(None);
    };
    let rows: Vec<ElementRef<'_>> = child_elements(head)
        .filter(|el| el.value().name() == "tr")
        .collect();
    let [first, last] = rows.as_slice() else {
        return Ok(None);
    };

    let groups: Vec<ElementRef<'_>> = child_elements(*first).collect();
    let single_table = groups.len() != 2;
    let mut skip = 0usize;
    let mut returns_left = 0usize;
    let mut turnover_left = 0usize;
    for cell in &groups {
        let text = element_text(*cell);
        if single_table {
            match text.as_str() {
                "Returns(%)" => returns_left = colspan(*cell),
                "Portfolio Turnover Ratio" => turnover_left = colspan(*cell),
                _ => {}
            }
        } else if text == "TWRR Returns (%)" {
            returns_left = colspan(*cell);
        } else {
            skip = colspan(*cell);
        }
    }

    let mut header = PerformanceHeader {
        single_table,
        ..PerformanceHeader::default()
    };
    for cell in child_elements(*last) {
        if skip > 0 {
            skip -= 1;
        } else if returns_left > 0 {
            header.return_keys.push(json_key(&element_text(cell)));
            returns_left -= 1;
        } else if turnover_left > 0 {
            header.turnover_keys.push(element_text(cell));
            turnover_left -= 1;
        }
    }
    Ok(Some(header))
}

fn body_rows<'a>(table: ElementRef<'a>) -> Result<Vec<ElementRef<'a>>, AdapterError> {
    let rows = selector("tbody tr")?;
    Ok(table.select(&rows).collect())
}

/// Reads name, AUM and the return columns starting at `name_cell`. Returns the fund name and
/// the last cell consumed so callers can continue reading turnover columns.
fn parse_service_row<'a>(
    report: &mut Report,
    name_cell: ElementRef<'a>,
    strategy: &str,
    return_keys: &[String],
) -> Option<(String, ElementRef<'a>)> {
    let name = element_text(name_cell);
    if is_index_name(&name) {
        return None;
    }
    let aum_cell = next_element(name_cell)?;
    let aum_raw = element_text(aum_cell);
    if aum_raw.is_empty() {
        return None;
    }

    let aum = number_or_warn(&aum_raw, "aum", report);
    let mut returns = Vec::with_capacity(return_keys.len());
    let mut cursor = aum_cell;
    for key in return_keys {
        let Some(cell) = next_element(cursor) else {
            warn!(uid = %report.uid, fund = %name, key = %key, "row ends before return column");
            break;
        };
        cursor = cell;
        if let Some(value) = number_or_warn(&element_text(cell), key, report) {
            returns.push((key.clone(), value));
        }
    }

    let service = report.service_entry(&name);
    service.strategy = strategy.to_string();
    service.aum = aum;
    service.returns.extend(returns);
    Some((name, cursor))
}

fn read_turnover(report: &mut Report, fund: &str, mut cursor: ElementRef<'_>, keys: &[String]) {
    let mut values = Vec::with_capacity(keys.len());
    for key in keys {
        let Some(cell) = next_element(cursor) else {
            break;
        };
        cursor = cell;
        if let Some(value) = number_or_warn(&element_text(cell), key, report) {
            values.push((key.clone(), value));
        }
    }
    if let Some(service) = report.service_mut(fund) {
        service.turnover.extend(values);
    }
}

fn parse_performance(document: &Html, report: &mut Report) -> Result<(), AdapterError> {
    let Some(heading) = find_heading(document, PERFORMANCE_DATA)? else {
        debug!(uid = %report.uid, "no performance section");
        return Ok(());
    };
    let Some(table) = parent_element(heading)
        .and_then(parent_element)
        .and_then(next_element)
    else {
        return Ok(());
    };
    let Some(header) = parse_header(table)? else {
        warn!(uid = %report.uid, period = %report.period, "unrecognized performance header");
        return Ok(());
    };

    if header.single_table {
        for row in body_rows(table)? {
            let Some(first) = child_elements(row).next() else {
                continue;
            };
            let parsed = parse_service_row(report, first, "", &header.return_keys);
            if let Some((fund, cursor)) = parsed {
                read_turnover(report, &fund, cursor, &header.turnover_keys);
            }
        }
        return Ok(());
    }

    let mut group_left = 0usize;
    let mut strategy = String::new();
    for row in body_rows(table)? {
        let Some(first) = child_elements(row).next() else {
            continue;
        };
        if group_left == 0 {
            let rowspan = first
                .value()
                .attr("rowspan")
                .and_then(|v| v.trim().parse::<usize>().ok());
            if let Some(span) = rowspan {
                strategy = element_text(first);
                group_left = span.saturating_sub(1);
                continue;
            }
            strategy.clear();
            parse_service_row(report, first, &strategy, &header.return_keys);
            continue;
        }
        parse_service_row(report, first, &strategy, &header.return_keys);
        group_left -= 1;
    }

    if let Some(turnover_table) = next_element(table) {
        parse_turnover_table(turnover_table, report)?;
    }
    Ok(())
}

fn parse_turnover_table(table: ElementRef<'_>, report: &mut Report) -> Result<(), AdapterError> {
    let head_rows = selector("thead tr")?;
    let Some(last) = table.select(&head_rows).last() else {
        return Ok(());
    };
    let keys: Vec<String> = child_elements(last)
        .map(element_text)
        .filter(|label| label != "Investment Approach")
        .collect();
    if keys.is_empty() {
        return Ok(());
    }

    let td = selector("td")?;
    for row in body_rows(table)? {
        let Some(first) = row.select(&td).next() else {
            continue;
        };
        let fund = element_text(first);
        if report.service(&fund).is_none() {
            debug!(uid = %report.uid, fund = %fund, "turnover row without matching service");
            continue;
        }
        read_turnover(report, &fund, first, &keys);
    }
    Ok(())
}

fn parse_complaints(document: &Html, report: &mut Report) -> Result<(), AdapterError> {
    let Some(heading) = find_heading(document, DATA_ON_COMPLAINTS)? else {
        return Ok(());
    };
    let Some(table) = parent_element(heading)
        .and_then(parent_element)
        .and_then(next_element)
    else {
        return Ok(());
    };
    let Some(last) = body_rows(table)?.pop() else {
        return Ok(());
    };
    let td = selector("td")?;
    let cells: Vec<String> = last.select(&td).map(element_text).collect();
    let cell = |idx: usize| cells.get(idx).and_then(|raw| parse_number(raw));
    report.complaints.pending_month_start = cell(1);
    report.complaints.received_during_month = cell(2);
    report.complaints.resolved_during_month = cell(3);
    report.complaints.pending_month_end = cell(4);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_rows_are_recognized() {
        assert!(is_index_name("NIFTY 50 TRI"));
        assert!(is_index_name("S&P BSE 500"));
        assert!(is_index_name("0"));
        assert!(!is_index_name("Alpha Growth"));
    }

    #[test]
    fn labels_fold_plural_units() {
        assert_eq!(json_key(" 3 Years "), "3 year");
        assert_eq!(json_key("6 Months"), "6 month");
        assert_eq!(json_key("Since Inception"), "since inception");
    }

    #[test]
    fn report_form_carries_manager_and_period() {
        let form = report_form("INP1", ReportPeriod::new(2021, 1).unwrap());
        assert_eq!(form.len(), 17);
        assert!(form.contains(&("pmrId".to_string(), "INP1".to_string())));
        assert!(form.contains(&("month".to_string(), "1".to_string())));
    }

    #[test]
    fn header_with_unexpected_shape_is_ignored() {
        let html = r#"<div><p><strong>E. Performance Data</strong></p></div>
            <table><thead><tr><th>only one row</th></tr></thead>
            <tbody><tr><td>Alpha</td><td>10</td></tr></tbody></table>"#;
        let report = parse_report("PM1", ReportPeriod::new(2024, 1).unwrap(), html).unwrap();
        assert!(report.services.is_empty());
    }

    #[test]
    fn missing_sections_yield_an_empty_report() {
        let period = ReportPeriod::new(2024, 1).unwrap();
        let report = parse_report("PM1", period, "<html></html>").unwrap();
        assert!(report.general.is_empty());
        assert!(report.services.is_empty());
        assert_eq!(report.complaints.pending_month_end, None);
    }
}
