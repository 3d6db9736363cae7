use std::path::{Path, PathBuf};

use fundscope_adapters::{mapper, pmf, CrawlAdapter, FetchTarget, PmfAdapter};
use fundscope_core::{FundType, ReportPeriod};

fn fixture(name: &str) -> String {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/pmf")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn period() -> ReportPeriod {
    ReportPeriod::new(2024, 2).unwrap()
}

#[test]
fn two_table_layout_groups_funds_by_strategy() {
    let html = fixture("report_two_tables.html");
    let report = pmf::parse_report("INP000000001", period(), &html).unwrap();

    let names: Vec<&str> = report.services.iter().map(|s| s.fund_name.as_str()).collect();
    assert_eq!(names, ["Alpha Growth", "Alpha Focused", "Alpha Income"]);

    let growth = report.service("Alpha Growth").unwrap();
    assert_eq!(growth.strategy, "Equity");
    assert_eq!(growth.aum, Some(512.40));
    assert_eq!(growth.returns.get("1 month"), Some(&1.25));
    assert_eq!(growth.returns.get("3 year"), Some(&14.10));
    assert_eq!(growth.returns.get("since inception"), Some(&16.75));
    assert_eq!(growth.turnover.get("Current Month"), Some(&0.12));
    assert_eq!(growth.turnover.get("Last 12 Months"), Some(&1.40));

    let focused = report.service("Alpha Focused").unwrap();
    assert_eq!(focused.aum, Some(1045.75));
    assert!(!focused.returns.contains_key("1 month"));
    assert_eq!(focused.returns.get("1 year"), Some(&21.00));
    assert!(focused.turnover.is_empty());

    assert_eq!(report.service("Alpha Income").unwrap().strategy, "Debt");
    assert!(report.service("Legacy Value").is_none());
}

#[test]
fn general_information_and_complaints_are_read() {
    let html = fixture("report_two_tables.html");
    let report = pmf::parse_report("INP000000001", period(), &html).unwrap();

    let general = &report.general;
    assert_eq!(general.registration_name.as_deref(), Some("Alpha Capital Advisors Pvt Ltd"));
    assert_eq!(general.register_number.as_deref(), Some("INP000000001"));
    assert_eq!(general.registered_date.map(|d| d.to_string()).as_deref(), Some("2012-06-18"));
    assert_eq!(general.principal_officer.as_deref(), Some("Asha Sharma"));
    assert_eq!(general.compliance_officer_email.as_deref(), Some("compliance@alphacap.example"));
    assert_eq!(general.total_no_of_client, Some(1234.0));
    assert_eq!(general.total_aum, Some(2045.50));

    assert_eq!(report.complaints.pending_month_start, Some(2.0));
    assert_eq!(report.complaints.received_during_month, Some(5.0));
    assert_eq!(report.complaints.resolved_during_month, Some(6.0));
    assert_eq!(report.complaints.pending_month_end, Some(1.0));
}

#[test]
fn single_table_layout_reads_returns_and_turnover_side_by_side() {
    let adapter = PmfAdapter::default();
    let target = FetchTarget::report("INP000000002", period());
    let report = adapter
        .extract(&target, &fixture("report_single_table.html"))
        .unwrap();

    assert_eq!(report.services.len(), 2);
    let multicap = report.service("Beta Multicap").unwrap();
    assert_eq!(multicap.strategy, "");
    assert_eq!(multicap.returns.len(), 3);
    assert_eq!(multicap.returns.get("1 month"), Some(&-0.80));
    assert_eq!(multicap.returns.get("since inception"), Some(&11.10));
    assert_eq!(multicap.turnover.len(), 2);
    assert_eq!(multicap.turnover.get("Last 12 Months"), Some(&1.90));

    assert_eq!(report.general.registered_date, None);
    assert_eq!(report.general.total_no_of_client, None);
    assert_eq!(report.general.total_aum, Some(310.0));
}

#[test]
fn parsed_report_maps_to_one_batch() {
    let html = fixture("report_single_table.html");
    let report = pmf::parse_report("INP000000002", period(), &html).unwrap();
    let batch = mapper::report_to_batch(&report);

    assert_eq!(batch.manager.uid, "INP000000002");
    assert_eq!(batch.manager.name, "Meera Kapoor");
    assert_eq!(batch.manager.display_name(), "Beta Wealth LLP");
    assert_eq!(batch.funds.len(), 2);
    for fund in &batch.funds {
        assert_eq!(fund.fund_type, FundType::PortfolioManagement);
        assert_eq!(fund.reports.len(), 1);
        assert_eq!(fund.reports[0].report_date, period().first_day());
        assert_eq!(fund.reports[0].strategy(), "Equity");
    }
    let dividend = batch.funds.iter().find(|f| f.name == "Beta Dividend Yield").unwrap();
    assert_eq!(dividend.reports[0].returns.year_1, Some(9.75));
    assert_eq!(dividend.reports[0].aum(), Some(100.0));
}

#[test]
fn manager_list_skips_placeholder_and_blank_options() {
    let ids = pmf::parse_manager_ids(&fixture("manager_list.html")).unwrap();
    assert_eq!(ids, ["INP000000001", "INP000000002", "INP000000003"]);
}
