//! Supporting types shared by the Nimbus CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Condition types reported on a VirtualMachineDefinition
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DefinitionConditionType {
    /// The definition wants its instance running and the last
    /// reconciliation succeeded
    Running,
    /// The last create or delete of the child instance failed
    Failure,
}

/// Status condition on a VirtualMachineDefinition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: DefinitionConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl DefinitionCondition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: DefinitionConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Condition types reported on a VirtualMachineInstance
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstanceConditionType {
    /// The instance is up and passing its readiness checks
    Ready,
    /// The handler on the node has taken over the instance
    Synchronized,
    /// The instance has been paused by an operator
    Paused,
}

/// Status condition on a VirtualMachineInstance
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: InstanceConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition transitioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Lifecycle phase of a VirtualMachineInstance
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstancePhase {
    /// Phase not yet reported
    #[default]
    Unknown,
    /// Accepted but not yet scheduled
    Pending,
    /// A launcher is being scheduled for the instance
    Scheduling,
    /// The launcher has been scheduled to a node
    Scheduled,
    /// The virtual machine is running
    Running,
    /// The virtual machine shut down cleanly; terminal
    Succeeded,
    /// The virtual machine crashed or could not be started; terminal
    Failed,
}

impl InstancePhase {
    /// Terminal phases cannot transition back to running.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Pending => write!(f, "Pending"),
            Self::Scheduling => write!(f, "Scheduling"),
            Self::Scheduled => write!(f, "Scheduled"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Operator for label selector requirements
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    /// Label value must be in the specified set
    In,
    /// Label value must not be in the specified set
    NotIn,
    /// Label must exist (value ignored)
    Exists,
    /// Label must not exist (value ignored)
    DoesNotExist,
}

impl LabelSelectorOperator {
    /// Check if a label value matches this requirement
    ///
    /// - `label_value`: The actual label value (None if label doesn't exist)
    /// - `values`: The values specified in the requirement
    pub fn matches(&self, label_value: Option<&str>, values: &[String]) -> bool {
        match self {
            Self::In => label_value.is_some_and(|v| values.iter().any(|req| req == v)),
            Self::NotIn => {
                label_value.is_none() || !values.iter().any(|req| Some(req.as_str()) == label_value)
            }
            Self::Exists => label_value.is_some(),
            Self::DoesNotExist => label_value.is_none(),
        }
    }
}

/// A label selector requirement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// The label key that the selector applies to
    pub key: String,

    /// Operator representing the relationship between label and values
    pub operator: LabelSelectorOperator,

    /// Array of string values
    ///
    /// - For `In` and `NotIn` operators: must be non-empty
    /// - For `Exists` and `DoesNotExist`: must be empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    /// Check if a label set matches this requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key).map(|s| s.as_str());
        self.operator.matches(value, &self.values)
    }
}

/// Label selector defining a definition's claim on instances.
///
/// An empty selector matches everything; both clauses must hold for an
/// instance to match.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Map of label key-value pairs for exact matching
    ///
    /// All labels must match for the instance to be selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    /// List of label selector requirements
    ///
    /// All requirements must be satisfied for the instance to be selected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// Validate the selector requirements.
    ///
    /// An unparseable selector is a permanent user error: the operator
    /// set of each requirement constrains which value lists are legal.
    pub fn validate(&self) -> Result<(), Error> {
        for req in &self.match_expressions {
            if req.key.is_empty() {
                return Err(Error::validation_for_field(
                    crate::error::UNKNOWN_CONTEXT,
                    "matchExpressions",
                    "requirement key must not be empty",
                ));
            }
            match req.operator {
                LabelSelectorOperator::In | LabelSelectorOperator::NotIn
                    if req.values.is_empty() =>
                {
                    return Err(Error::validation_for_field(
                        crate::error::UNKNOWN_CONTEXT,
                        "matchExpressions",
                        format!("values must be specified for In/NotIn on key {}", req.key),
                    ));
                }
                LabelSelectorOperator::Exists | LabelSelectorOperator::DoesNotExist
                    if !req.values.is_empty() =>
                {
                    return Err(Error::validation_for_field(
                        crate::error::UNKNOWN_CONTEXT,
                        "matchExpressions",
                        format!(
                            "values may not be specified for Exists/DoesNotExist on key {}",
                            req.key
                        ),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Check if a label set matches this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        if let Some(match_labels) = &self.match_labels {
            for (key, value) in match_labels {
                if labels.get(key) != Some(value) {
                    return false;
                }
            }
        }

        for req in &self.match_expressions {
            if !req.matches(labels) {
                return false;
            }
        }

        true
    }
}

/// Metadata carried by the instance template of a definition.
///
/// A reduced object meta: only the fields the controller propagates to
/// created instances.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Explicit name for the created instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Name prefix for the created instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,

    /// Labels stamped onto the created instance; must match the
    /// definition's selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations copied onto the created instance
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}
