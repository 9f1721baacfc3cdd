//! Shared fixtures for integration tests.

#![allow(dead_code, reason = "each test binary uses a subset of the fixtures")]

use approval_engine::EngineConfig;
use approval_engine::domain::{DefinitionCatalog, StepConfig, WorkflowDefinition};

pub const CATALOG_YAML: &str = r"
workflows:
  - name: purchase_order
    steps:
      - name: manager_review
        required_role: manager
      - name: finance_review
        required_role: finance
        required_approvals: 2
  - name: single_review
    steps:
      - name: review
        required_role: reviewer
";

pub fn catalog() -> DefinitionCatalog {
    DefinitionCatalog::from_yaml_str(CATALOG_YAML).expect("fixture catalog is valid")
}

pub fn single_step_catalog() -> DefinitionCatalog {
    DefinitionCatalog::from_definitions([WorkflowDefinition::new(
        "single_review",
        vec![StepConfig::new("review", "reviewer")],
    )])
    .expect("fixture definition is valid")
}

/// Configuration with fast retries and rate limits out of the way.
pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.transaction.base_delay_ms = 1;
    config.transaction.max_delay_ms = 5;
    config.rate_limit.burst.max_requests = 10_000;
    config.rate_limit.standard.max_requests = 10_000;
    config.rate_limit.client.max_requests = 10_000;
    config.security.integrity_secret = Some("integration-secret".to_string());
    config
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
