//! Static workflow definitions and the catalog they load into.
//!
//! Definitions are validated once, when they enter the catalog. The engine
//! relies on that: step indices are bounds-checked against a definition that
//! is known to have at least one step, every step needs at least one approval,
//! and terminal states are distinct from each other and from the step labels.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating workflow definitions.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// The definition has no name.
    #[error("workflow definition has an empty name")]
    EmptyName,

    /// The definition has no steps.
    #[error("workflow '{workflow}' defines no steps")]
    NoSteps {
        /// Definition name.
        workflow: String,
    },

    /// A step field is missing or out of range.
    #[error("workflow '{workflow}' step {step}: {problem}")]
    InvalidStep {
        /// Definition name.
        workflow: String,
        /// Step index.
        step: usize,
        /// What is wrong.
        problem: String,
    },

    /// Two steps share a name.
    #[error("workflow '{workflow}' has duplicate step name '{step_name}'")]
    DuplicateStep {
        /// Definition name.
        workflow: String,
        /// Repeated name.
        step_name: String,
    },

    /// State labels collide.
    #[error("workflow '{workflow}': {problem}")]
    StateClash {
        /// Definition name.
        workflow: String,
        /// Which states collide.
        problem: String,
    },

    /// The catalog already holds a definition with this name.
    #[error("workflow '{0}' is already registered")]
    AlreadyRegistered(String),

    /// The file could not be read.
    #[error("failed to read workflow definitions from {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The document could not be parsed.
    #[error("failed to parse workflow definitions: {0}")]
    Parse(String),
}

/// What a single rejection does to the instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// One rejection moves the instance to `rejected_state`.
    #[default]
    ShortCircuit,
    /// Rejections are recorded but never count toward approval.
    RecordOnly,
}

/// One ordered stage of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Human readable step name, unique within the definition.
    pub name: String,
    /// Role an actor must hold to vote on this step.
    pub required_role: String,
    /// Approved votes needed to complete the step.
    #[serde(default = "default_required_approvals")]
    pub required_approvals: u32,
    /// Seconds the step may stay current before it times out.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Voters must present a multi-factor-verified session.
    #[serde(default)]
    pub requires_mfa: bool,
    /// Allow the same actor to approve the step more than once.
    #[serde(default)]
    pub allow_repeat_approvals: bool,
    /// Role that may vote while the step is escalated.
    #[serde(default)]
    pub escalation_role: Option<String>,
}

fn default_required_approvals() -> u32 {
    1
}

impl StepConfig {
    /// Create a step needing one approval from `required_role`.
    pub fn new(name: impl Into<String>, required_role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_role: required_role.into(),
            required_approvals: 1,
            timeout_secs: None,
            requires_mfa: false,
            allow_repeat_approvals: false,
            escalation_role: None,
        }
    }

    /// Set the number of approvals needed.
    #[must_use]
    pub fn with_required_approvals(mut self, count: u32) -> Self {
        self.required_approvals = count;
        self
    }

    /// Set the step timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Require MFA for voters.
    #[must_use]
    pub fn with_mfa(mut self) -> Self {
        self.requires_mfa = true;
        self
    }

    /// Set the escalation role.
    #[must_use]
    pub fn with_escalation_role(mut self, role: impl Into<String>) -> Self {
        self.escalation_role = Some(role.into());
        self
    }

    /// Step timeout, if configured.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Static description of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Catalog key.
    pub name: String,
    /// Ordered steps.
    pub steps: Vec<StepConfig>,
    /// State of a freshly created instance.
    #[serde(default = "default_initial_state")]
    pub initial_state: String,
    /// Terminal state after the last step completes.
    #[serde(default = "default_approved_state")]
    pub approved_state: String,
    /// Terminal state after a short-circuiting rejection.
    #[serde(default = "default_rejected_state")]
    pub rejected_state: String,
    /// Terminal state after a step timeout.
    #[serde(default = "default_timeout_state")]
    pub timeout_state: String,
    /// Effect of a single rejection.
    #[serde(default)]
    pub rejection_policy: RejectionPolicy,
}

fn default_initial_state() -> String {
    "pending".to_string()
}

fn default_approved_state() -> String {
    "approved".to_string()
}

fn default_rejected_state() -> String {
    "rejected".to_string()
}

fn default_timeout_state() -> String {
    "timed_out".to_string()
}

impl WorkflowDefinition {
    /// Create a definition with default state labels.
    pub fn new(name: impl Into<String>, steps: Vec<StepConfig>) -> Self {
        Self {
            name: name.into(),
            steps,
            initial_state: default_initial_state(),
            approved_state: default_approved_state(),
            rejected_state: default_rejected_state(),
            timeout_state: default_timeout_state(),
            rejection_policy: RejectionPolicy::default(),
        }
    }

    /// Set the rejection policy.
    #[must_use]
    pub fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection_policy = policy;
        self
    }

    /// Label of the state reached when `step` completes (not the last step).
    #[must_use]
    pub fn step_label(step: usize) -> String {
        format!("step_{step}_approved")
    }

    /// State an instance must be in for `step` to accept votes.
    #[must_use]
    pub fn expected_state_for(&self, step: usize) -> String {
        if step == 0 {
            self.initial_state.clone()
        } else {
            Self::step_label(step - 1)
        }
    }

    /// State the instance moves to once `step` completes.
    #[must_use]
    pub fn state_after(&self, step: usize) -> String {
        if step + 1 >= self.steps.len() {
            self.approved_state.clone()
        } else {
            Self::step_label(step)
        }
    }

    /// Index of the step currently accepting votes, or `None` for terminal
    /// and unknown states.
    #[must_use]
    pub fn current_step_index(&self, state: &str) -> Option<usize> {
        if state == self.initial_state {
            return Some(0);
        }
        let completed: usize = state
            .strip_prefix("step_")?
            .strip_suffix("_approved")?
            .parse()
            .ok()?;
        let next = completed + 1;
        (next < self.steps.len()).then_some(next)
    }

    /// Whether `state` is one of the terminal states.
    #[must_use]
    pub fn is_terminal(&self, state: &str) -> bool {
        state == self.approved_state || state == self.rejected_state || state == self.timeout_state
    }

    /// Check the definition for structural problems.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps {
                workflow: self.name.clone(),
            });
        }

        let mut names = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            let invalid = |problem: &str| DefinitionError::InvalidStep {
                workflow: self.name.clone(),
                step: index,
                problem: problem.to_string(),
            };
            if step.name.trim().is_empty() {
                return Err(invalid("name is empty"));
            }
            if step.required_role.trim().is_empty() {
                return Err(invalid("required_role is empty"));
            }
            if step.required_approvals == 0 {
                return Err(invalid("required_approvals must be at least 1"));
            }
            if step.timeout_secs == Some(0) {
                return Err(invalid("timeout_secs must be positive when set"));
            }
            if !names.insert(step.name.as_str()) {
                return Err(DefinitionError::DuplicateStep {
                    workflow: self.name.clone(),
                    step_name: step.name.clone(),
                });
            }
        }

        let labels = [
            ("initial_state", &self.initial_state),
            ("approved_state", &self.approved_state),
            ("rejected_state", &self.rejected_state),
            ("timeout_state", &self.timeout_state),
        ];
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (field, label) in labels {
            if label.trim().is_empty() {
                return Err(self.clash(format!("{field} is empty")));
            }
            if let Some(other) = seen.insert(label.as_str(), field) {
                return Err(self.clash(format!("{field} and {other} are both '{label}'")));
            }
            if label.starts_with("step_") && label.ends_with("_approved") {
                return Err(self.clash(format!(
                    "{field} '{label}' collides with generated step labels"
                )));
            }
        }

        Ok(())
    }

    fn clash(&self, problem: String) -> DefinitionError {
        DefinitionError::StateClash {
            workflow: self.name.clone(),
            problem,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionDocument {
    Many { workflows: Vec<WorkflowDefinition> },
    One(WorkflowDefinition),
}

impl DefinitionDocument {
    fn into_vec(self) -> Vec<WorkflowDefinition> {
        match self {
            Self::Many { workflows } => workflows,
            Self::One(definition) => vec![definition],
        }
    }
}

/// Validated workflow definitions keyed by name.
#[derive(Debug, Clone, Default)]
pub struct DefinitionCatalog {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl DefinitionCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a YAML or JSON file (chosen by extension, YAML otherwise).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let catalog = if is_json {
            Self::from_json_str(&raw)?
        } else {
            Self::from_yaml_str(&raw)?
        };

        tracing::info!(
            path = %path.display(),
            workflows = catalog.len(),
            "Loaded workflow definitions"
        );
        Ok(catalog)
    }

    /// Parse a YAML document holding one definition or a `workflows` list.
    pub fn from_yaml_str(raw: &str) -> Result<Self, DefinitionError> {
        let document: DefinitionDocument =
            serde_yaml::from_str(raw).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        Self::from_definitions(document.into_vec())
    }

    /// Parse a JSON document holding one definition or a `workflows` list.
    pub fn from_json_str(raw: &str) -> Result<Self, DefinitionError> {
        let document: DefinitionDocument =
            serde_json::from_str(raw).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        Self::from_definitions(document.into_vec())
    }

    /// Build a catalog from definitions, validating each.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = WorkflowDefinition>,
    ) -> Result<Self, DefinitionError> {
        let mut catalog = Self::new();
        for definition in definitions {
            catalog.insert(definition)?;
        }
        Ok(catalog)
    }

    /// Validate and register a definition.
    pub fn insert(&mut self, definition: WorkflowDefinition) -> Result<(), DefinitionError> {
        definition.validate()?;
        if self.definitions.contains_key(&definition.name) {
            return Err(DefinitionError::AlreadyRegistered(definition.name));
        }
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Look up a definition.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "expense",
            vec![
                StepConfig::new("manager", "manager"),
                StepConfig::new("finance", "finance").with_required_approvals(2),
            ],
        )
    }

    #[test]
    fn test_state_path() {
        let def = two_step();
        assert_eq!(def.expected_state_for(0), "pending");
        assert_eq!(def.state_after(0), "step_0_approved");
        assert_eq!(def.expected_state_for(1), "step_0_approved");
        assert_eq!(def.state_after(1), "approved");
    }

    #[test]
    fn test_current_step_index() {
        let def = two_step();
        assert_eq!(def.current_step_index("pending"), Some(0));
        assert_eq!(def.current_step_index("step_0_approved"), Some(1));
        assert_eq!(def.current_step_index("step_1_approved"), None);
        assert_eq!(def.current_step_index("approved"), None);
        assert_eq!(def.current_step_index("garbage"), None);
    }

    #[test]
    fn test_single_step_goes_straight_to_approved() {
        let def = WorkflowDefinition::new("single", vec![StepConfig::new("only", "admin")]);
        assert_eq!(def.state_after(0), "approved");
    }

    #[test]
    fn test_validate_rejects_bad_definitions() {
        let empty = WorkflowDefinition::new("empty", vec![]);
        assert!(matches!(empty.validate(), Err(DefinitionError::NoSteps { .. })));

        let zero = WorkflowDefinition::new(
            "zero",
            vec![StepConfig::new("a", "r").with_required_approvals(0)],
        );
        assert!(matches!(zero.validate(), Err(DefinitionError::InvalidStep { .. })));

        let dup = WorkflowDefinition::new(
            "dup",
            vec![StepConfig::new("a", "r"), StepConfig::new("a", "r")],
        );
        assert!(matches!(dup.validate(), Err(DefinitionError::DuplicateStep { .. })));

        let mut clash = two_step();
        clash.rejected_state = "approved".to_string();
        assert!(matches!(clash.validate(), Err(DefinitionError::StateClash { .. })));

        let mut generated = two_step();
        generated.timeout_state = "step_3_approved".to_string();
        assert!(matches!(generated.validate(), Err(DefinitionError::StateClash { .. })));
    }

    #[test]
    fn test_catalog_from_yaml_list() {
        let yaml = r"
workflows:
  - name: purchase
    steps:
      - name: manager
        required_role: manager
      - name: cfo
        required_role: cfo
        requires_mfa: true
        timeout_secs: 86400
    rejection_policy: record_only
  - name: leave
    steps:
      - name: lead
        required_role: lead
";
        let catalog = DefinitionCatalog::from_yaml_str(yaml).unwrap();
        assert_eq!(catalog.names(), vec!["leave", "purchase"]);

        let purchase = catalog.get("purchase").unwrap();
        assert_eq!(purchase.rejection_policy, RejectionPolicy::RecordOnly);
        assert!(purchase.steps[1].requires_mfa);
        assert_eq!(purchase.steps[1].timeout(), Some(Duration::from_secs(86_400)));
        assert_eq!(purchase.steps[0].required_approvals, 1);
        assert_eq!(purchase.initial_state, "pending");
    }

    #[test]
    fn test_catalog_from_single_json() {
        let json = r#"{"name":"solo","steps":[{"name":"s","required_role":"r"}]}"#;
        let catalog = DefinitionCatalog::from_json_str(json).unwrap();
        assert!(catalog.get("solo").is_some());
    }

    #[test]
    fn test_catalog_validates_at_load() {
        let yaml = "name: broken\nsteps: []\n";
        assert!(DefinitionCatalog::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let mut catalog = DefinitionCatalog::new();
        catalog.insert(two_step()).unwrap();
        assert!(matches!(
            catalog.insert(two_step()),
            Err(DefinitionError::AlreadyRegistered(_))
        ));
    }
}
