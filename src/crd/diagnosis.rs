use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{KubeDiagError, Result};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubediag.io",
    version = "v1alpha1",
    kind = "Diagnosis",
    plural = "diagnoses",
    shortname = "diag",
    namespaced,
    status = "DiagnosisStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.source"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisSpec {
    pub source: DiagnosisSource,

    #[serde(default)]
    pub node_name: String,

    #[serde(default)]
    pub assigned_information_collectors: Vec<ProcessorRef>,
    #[serde(default)]
    pub assigned_diagnosers: Vec<ProcessorRef>,
    #[serde(default)]
    pub assigned_recoverers: Vec<ProcessorRef>,

    /// Short-circuits the information/diagnosis/recovery stage even when its
    /// assigned list is non-empty, distinct from "empty assignment = skip"
    /// (spec.md §3 supplemental fields).
    #[serde(default)]
    pub skip_information_collection: bool,
    #[serde(default)]
    pub skip_diagnosis: bool,
    #[serde(default)]
    pub skip_recovery: bool,

    #[serde(default)]
    pub pod_reference: Option<PodReference>,
    #[serde(default)]
    pub command_executors: Vec<CommandExecutorSpec>,
    #[serde(default)]
    pub profilers: Vec<ProfilerSpec>,

    /// Raw payload embedded by the originating alert/event source.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosisSource {
    Custom,
    KubernetesEvent,
    PrometheusAlert,
    Kafka,
    PagerDuty,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ProcessorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodReference {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandExecutorSpec {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default = "default_executor_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfilerSpec {
    pub name: String,
    pub kind: ProfilerKind,
    #[serde(default = "default_executor_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProfilerKind {
    Java,
    Go,
}

fn default_executor_timeout() -> u64 {
    30
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisStatus {
    #[serde(default)]
    pub phase: DiagnosisPhase,

    #[serde(default)]
    pub conditions: Vec<DiagnosisCondition>,

    /// Opaque side-channel between processors; well-known keys are
    /// enumerated in `crate::context`, unknown keys are preserved verbatim.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub checkpoint: Option<serde_json::Value>,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub diagnoser: Option<ProcessorRef>,
    #[serde(default)]
    pub recoverer: Option<ProcessorRef>,

    #[serde(default)]
    pub command_executors: Vec<CommandExecutorStatus>,
    #[serde(default)]
    pub profilers: Vec<ProfilerStatus>,

    #[serde(default)]
    pub identifiable: bool,
    #[serde(default)]
    pub recoverable: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum DiagnosisPhase {
    #[default]
    Pending,
    InformationCollecting,
    DiagnosisDiagnosing,
    DiagnosisRecovering,
    Succeeded,
    Failed,
    Unknown,
}

impl std::fmt::Display for DiagnosisPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiagnosisPhase::Pending => "Pending",
            DiagnosisPhase::InformationCollecting => "InformationCollecting",
            DiagnosisPhase::DiagnosisDiagnosing => "DiagnosisDiagnosing",
            DiagnosisPhase::DiagnosisRecovering => "DiagnosisRecovering",
            DiagnosisPhase::Succeeded => "Succeeded",
            DiagnosisPhase::Failed => "Failed",
            DiagnosisPhase::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

impl DiagnosisPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DiagnosisPhase::Succeeded | DiagnosisPhase::Failed)
    }

    /// Validates the partial order of spec.md §3 invariant (1): created →
    /// InformationCollecting → DiagnosisDiagnosing → DiagnosisRecovering →
    /// Succeeded, any stage may jump to Failed, no backward transitions.
    pub fn can_transition_to(&self, target: &DiagnosisPhase) -> bool {
        use DiagnosisPhase::*;

        if matches!(target, Failed) {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            (Pending, InformationCollecting)
                | (InformationCollecting, DiagnosisDiagnosing)
                | (DiagnosisDiagnosing, DiagnosisRecovering)
                | (DiagnosisRecovering, Succeeded)
        )
    }

    pub fn transition_to(&mut self, target: DiagnosisPhase) -> Result<()> {
        if !self.can_transition_to(&target) {
            return Err(KubeDiagError::InvalidPhaseTransition {
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        *self = target;
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisCondition {
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConditionType {
    InformationCollected,
    Identified,
    Recovered,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Inserts or updates a condition, keyed by `condition_type` (spec.md §3
/// invariant 2). `last_transition_time` only advances when the boolean
/// status actually changes, matching the upstream semantics.
pub fn set_condition(
    status: &mut DiagnosisStatus,
    condition_type: ConditionType,
    new_status: ConditionStatus,
    reason: impl Into<String>,
    message: impl Into<String>,
) {
    let now = Utc::now();
    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        if existing.status != new_status {
            existing.last_transition_time = now;
        }
        existing.status = new_status;
        existing.reason = Some(reason.into());
        existing.message = Some(message.into());
        return;
    }

    status.conditions.push(DiagnosisCondition {
        condition_type,
        status: new_status,
        reason: Some(reason.into()),
        message: Some(message.into()),
        last_transition_time: now,
    });
}

pub fn has_condition(status: &DiagnosisStatus, condition_type: ConditionType) -> bool {
    status
        .conditions
        .iter()
        .any(|c| c.condition_type == condition_type)
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandExecutorStatus {
    pub name: String,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfilerStatus {
    pub name: String,
    pub kind: ProfilerKind,
    pub path: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// Table-driven coverage of spec.md §3 invariant (1): every edge in the
    /// partial order is legal, every edge outside it is rejected.
    #[rstest]
    #[case(DiagnosisPhase::Pending, DiagnosisPhase::InformationCollecting, true)]
    #[case(DiagnosisPhase::InformationCollecting, DiagnosisPhase::DiagnosisDiagnosing, true)]
    #[case(DiagnosisPhase::DiagnosisDiagnosing, DiagnosisPhase::DiagnosisRecovering, true)]
    #[case(DiagnosisPhase::DiagnosisRecovering, DiagnosisPhase::Succeeded, true)]
    #[case(DiagnosisPhase::Pending, DiagnosisPhase::Failed, true)]
    #[case(DiagnosisPhase::InformationCollecting, DiagnosisPhase::Failed, true)]
    #[case(DiagnosisPhase::DiagnosisDiagnosing, DiagnosisPhase::Failed, true)]
    #[case(DiagnosisPhase::DiagnosisRecovering, DiagnosisPhase::Failed, true)]
    #[case(DiagnosisPhase::Pending, DiagnosisPhase::DiagnosisDiagnosing, false)]
    #[case(DiagnosisPhase::Pending, DiagnosisPhase::DiagnosisRecovering, false)]
    #[case(DiagnosisPhase::Pending, DiagnosisPhase::Succeeded, false)]
    #[case(DiagnosisPhase::InformationCollecting, DiagnosisPhase::Pending, false)]
    #[case(DiagnosisPhase::InformationCollecting, DiagnosisPhase::DiagnosisRecovering, false)]
    #[case(DiagnosisPhase::DiagnosisDiagnosing, DiagnosisPhase::InformationCollecting, false)]
    #[case(DiagnosisPhase::Succeeded, DiagnosisPhase::Failed, false)]
    #[case(DiagnosisPhase::Succeeded, DiagnosisPhase::InformationCollecting, false)]
    #[case(DiagnosisPhase::Failed, DiagnosisPhase::Succeeded, false)]
    fn transition_follows_partial_order(
        #[case] from: DiagnosisPhase,
        #[case] to: DiagnosisPhase,
        #[case] expected_ok: bool,
    ) {
        let mut phase = from;
        assert_eq!(phase.transition_to(to).is_ok(), expected_ok);
    }

    #[test]
    fn forward_transitions_allowed() {
        let mut phase = DiagnosisPhase::Pending;
        assert!(phase.transition_to(DiagnosisPhase::InformationCollecting).is_ok());
        assert!(phase.transition_to(DiagnosisPhase::DiagnosisDiagnosing).is_ok());
        assert!(phase.transition_to(DiagnosisPhase::DiagnosisRecovering).is_ok());
        assert!(phase.transition_to(DiagnosisPhase::Succeeded).is_ok());
    }

    #[test]
    fn backward_transition_rejected() {
        let mut phase = DiagnosisPhase::DiagnosisDiagnosing;
        assert!(phase
            .transition_to(DiagnosisPhase::InformationCollecting)
            .is_err());
    }

    #[test]
    fn skip_ahead_rejected() {
        let mut phase = DiagnosisPhase::Pending;
        assert!(phase.transition_to(DiagnosisPhase::DiagnosisDiagnosing).is_err());
    }

    #[test]
    fn any_stage_can_fail_except_terminal() {
        for phase in [
            DiagnosisPhase::Pending,
            DiagnosisPhase::InformationCollecting,
            DiagnosisPhase::DiagnosisDiagnosing,
            DiagnosisPhase::DiagnosisRecovering,
        ] {
            let mut p = phase;
            assert!(p.transition_to(DiagnosisPhase::Failed).is_ok());
        }
    }

    #[test]
    fn terminal_states_never_advance() {
        let mut succeeded = DiagnosisPhase::Succeeded;
        assert!(succeeded
            .transition_to(DiagnosisPhase::InformationCollecting)
            .is_err());
        assert!(succeeded.transition_to(DiagnosisPhase::Failed).is_err());

        let mut failed = DiagnosisPhase::Failed;
        assert!(failed.transition_to(DiagnosisPhase::Succeeded).is_err());
    }

    #[test]
    fn condition_set_is_keyed_by_type() {
        let mut status = DiagnosisStatus::default();
        set_condition(
            &mut status,
            ConditionType::Identified,
            ConditionStatus::True,
            "Matched",
            "diagnoser matched",
        );
        set_condition(
            &mut status,
            ConditionType::Identified,
            ConditionStatus::True,
            "Matched",
            "diagnoser matched again",
        );
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn condition_transition_time_only_advances_on_status_change() {
        let mut status = DiagnosisStatus::default();
        set_condition(
            &mut status,
            ConditionType::Identified,
            ConditionStatus::False,
            "NoMatch",
            "no diagnoser matched yet",
        );
        let first = status.conditions[0].last_transition_time;

        set_condition(
            &mut status,
            ConditionType::Identified,
            ConditionStatus::False,
            "NoMatch",
            "still no match",
        );
        assert_eq!(status.conditions[0].last_transition_time, first);

        set_condition(
            &mut status,
            ConditionType::Identified,
            ConditionStatus::True,
            "Matched",
            "now matched",
        );
        assert!(status.conditions[0].last_transition_time >= first);
    }
}
