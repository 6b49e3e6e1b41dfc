use async_trait::async_trait;

use crate::controller::stages::traits::{lookup_information_collector, stamp_start_time_if_absent, StageContext, StageWorker};
use crate::crd::{ConditionStatus, ConditionType, Diagnosis, DiagnosisPhase, DiagnosisSpec, DiagnosisStatus, ProcessorRef, ProcessorSpec};
use crate::error::Result;
use crate::executor;
use crate::queue::Stage;

pub struct InformationStage;

#[async_trait]
impl StageWorker for InformationStage {
    fn stage(&self) -> Stage {
        Stage::Information
    }

    fn stage_label(&self) -> &'static str {
        "information"
    }

    fn next_phase(&self) -> DiagnosisPhase {
        DiagnosisPhase::DiagnosisDiagnosing
    }

    fn assigned(&self, spec: &DiagnosisSpec) -> &[ProcessorRef] {
        &spec.assigned_information_collectors
    }

    fn skip_requested(&self, spec: &DiagnosisSpec) -> bool {
        spec.skip_information_collection
    }

    fn completion_condition(&self, status: &DiagnosisStatus) -> bool {
        crate::crd::has_condition(status, ConditionType::InformationCollected)
    }

    /// Information collection dispatches to every assigned collector and
    /// merges each response rather than stopping at the first (spec.md
    /// §4.2): a terminating-pod diagnosis needs both its pod and process
    /// collectors to have run before a diagnoser can use either.
    fn exhaustive(&self) -> bool {
        true
    }

    fn on_candidate_received(&self, status: &mut DiagnosisStatus) {
        stamp_start_time_if_absent(status);
        crate::crd::set_condition(
            status,
            ConditionType::InformationCollected,
            ConditionStatus::True,
            "Collected",
            "information collector returned a well-formed response",
        );
    }

    async fn resolve_processor(&self, ctx: &StageContext, reference: &ProcessorRef) -> Result<ProcessorSpec> {
        lookup_information_collector(&ctx.client, reference).await
    }

    /// Runs any inline command executors/profilers carried on the spec
    /// before remote collectors are dispatched (spec.md §4.2). Idempotent
    /// by name against `status.commandExecutors`/`status.profilers` so a
    /// re-enqueued diagnosis never re-runs work it already recorded.
    async fn run_inline_executors(&self, ctx: &StageContext, diagnosis: &mut Diagnosis) {
        if diagnosis.spec.command_executors.is_empty() && diagnosis.spec.profilers.is_empty() {
            return;
        }

        let mut status = diagnosis.status.clone().unwrap_or_default();
        let diagnosis_id = diagnosis.metadata.name.clone().unwrap_or_default();

        let new_commands =
            executor::run_command_executors(&diagnosis.spec.command_executors, &status.command_executors).await;
        status.command_executors.extend(new_commands);

        let new_profilers =
            executor::run_profilers(&ctx.data_root, &diagnosis_id, &diagnosis.spec.profilers, &status.profilers).await;
        status.profilers.extend(new_profilers);

        diagnosis.status = Some(status);
    }
}
