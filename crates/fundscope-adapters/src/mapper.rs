//! Maps a parsed [`Report`] onto the rows the upsert layer writes.

use fundscope_core::{
    Attributes, CrawlBatch, DiscretionaryService, FundDraft, FundManager, FundReport, FundType,
    Report, ReportPeriod, Returns, ATTR_AUM, ATTR_COMPLIANCE_OFFICER, ATTR_COMPLIANCE_OFFICER_EMAIL,
    ATTR_REGISTRATION_NAME, ATTR_STRATEGY, ATTR_UID, DEFAULT_STRATEGY,
};
use tracing::debug;

pub fn manager_from_report(report: &Report) -> FundManager {
    let general = &report.general;
    let mut manager = FundManager::new(report.uid.clone());
    manager.name = general.principal_officer.clone().unwrap_or_default();
    manager.email = general.principal_officer_email.clone().unwrap_or_default();
    manager.contact = general.principal_officer_contact.clone().unwrap_or_default();
    manager.register_number = general.register_number.clone().unwrap_or_default();
    manager.registered_date = general.registered_date;
    manager.address = general.address.clone().unwrap_or_default();
    manager.total_no_of_client = general.total_no_of_client;
    manager.total_aum = general.total_aum;
    manager.refreshed_date = Some(report.period.first_day());

    manager.other_data.insert(ATTR_UID.to_string(), report.uid.clone());
    for (key, value) in [
        (ATTR_REGISTRATION_NAME, &general.registration_name),
        (ATTR_COMPLIANCE_OFFICER, &general.compliance_officer),
        (ATTR_COMPLIANCE_OFFICER_EMAIL, &general.compliance_officer_email),
    ] {
        if let Some(value) = value {
            manager.other_data.insert(key.to_string(), value.clone());
        }
    }
    manager
}

pub fn fund_report_from_service(
    period: ReportPeriod,
    service: &DiscretionaryService,
) -> FundReport {
    let mut returns = Returns::default();
    for (label, value) in &service.returns {
        if !returns.set_by_label(label, *value) {
            debug!(fund = %service.fund_name, label = %label, "return label without a column");
        }
    }

    let strategy = if service.strategy.trim().is_empty() {
        DEFAULT_STRATEGY.to_string()
    } else {
        service.strategy.trim().to_string()
    };
    let mut other_data = Attributes::new();
    other_data.insert(ATTR_STRATEGY.to_string(), strategy);
    if let Some(aum) = service.aum {
        other_data.insert(ATTR_AUM.to_string(), aum.to_string());
    }

    FundReport {
        id: 0,
        fund_id: 0,
        report_date: period.first_day(),
        returns,
        other_data,
    }
}

/// One PMF fund per service, each carrying that month's report.
pub fn report_to_batch(report: &Report) -> CrawlBatch {
    let funds = report
        .services
        .iter()
        .map(|service| FundDraft {
            name: service.fund_name.clone(),
            fund_type: FundType::PortfolioManagement,
            reports: vec![fund_report_from_service(report.period, service)],
        })
        .collect();
    CrawlBatch {
        manager: manager_from_report(report),
        target_month: report.period.first_day(),
        funds,
    }
}
