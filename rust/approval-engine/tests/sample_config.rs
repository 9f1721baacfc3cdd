//! The shipped sample configuration and catalog stay loadable.

use std::path::PathBuf;

use approval_engine::EngineConfig;
use approval_engine::config::{ConfigValidator, StoreBackend};
use approval_engine::domain::{DefinitionCatalog, RejectionPolicy};

fn repo_file(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..").join(relative)
}

#[test]
fn test_sample_catalog_loads() {
    let catalog = DefinitionCatalog::load(repo_file("config/workflows.yaml")).unwrap();
    assert_eq!(catalog.len(), 3);

    let po = catalog.get("purchase_order").unwrap();
    assert_eq!(po.steps.len(), 2);
    assert_eq!(po.steps[1].required_approvals, 2);
    assert!(po.steps[1].requires_mfa);

    let expense = catalog.get("expense_report").unwrap();
    assert_eq!(expense.rejection_policy, RejectionPolicy::RecordOnly);

    let access = catalog.get("access_request").unwrap();
    assert_eq!(access.approved_state, "granted");
}

#[test]
#[serial_test::serial]
fn test_sample_config_validates() {
    let path = repo_file("config/approval-engine");
    let config = EngineConfig::load_from(path.to_str()).unwrap();
    assert_eq!(config.store.backend, StoreBackend::Sqlite);
    assert_eq!(config.rate_limit.burst.max_requests, 5);
    assert_eq!(config.transaction.bulk_chunk_size, 50);
    ConfigValidator::validate(&config).unwrap();
}
