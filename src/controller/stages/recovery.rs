use async_trait::async_trait;

use crate::controller::stages::traits::{lookup_recoverer, StageContext, StageWorker};
use crate::crd::{ConditionStatus, ConditionType, DiagnosisPhase, DiagnosisSpec, DiagnosisStatus, ProcessorRef, ProcessorSpec};
use crate::error::Result;
use crate::queue::Stage;

pub struct RecoveryStage;

#[async_trait]
impl StageWorker for RecoveryStage {
    fn stage(&self) -> Stage {
        Stage::Recovery
    }

    fn stage_label(&self) -> &'static str {
        "recovery"
    }

    fn next_phase(&self) -> DiagnosisPhase {
        DiagnosisPhase::Succeeded
    }

    fn assigned(&self, spec: &DiagnosisSpec) -> &[ProcessorRef] {
        &spec.assigned_recoverers
    }

    fn skip_requested(&self, spec: &DiagnosisSpec) -> bool {
        spec.skip_recovery
    }

    /// A recoverer signals success through `status.recoverable` (spec.md
    /// §3), mirroring the diagnosis stage's `identifiable` channel; the
    /// worker itself owns `conditions`.
    fn completion_condition(&self, status: &DiagnosisStatus) -> bool {
        status.recoverable
    }

    fn on_candidate_received(&self, status: &mut DiagnosisStatus) {
        if status.recoverable {
            crate::crd::set_condition(
                status,
                ConditionType::Recovered,
                ConditionStatus::True,
                "Recovered",
                "recoverer reported status.recoverable = true",
            );
        }
    }

    /// Records the winning recoverer reference in `status.recoverer`
    /// (spec.md §3/§4.2).
    fn record_winner(&self, status: &mut DiagnosisStatus, reference: &ProcessorRef) {
        status.recoverer = Some(reference.clone());
    }

    async fn resolve_processor(&self, ctx: &StageContext, reference: &ProcessorRef) -> Result<ProcessorSpec> {
        lookup_recoverer(&ctx.client, reference).await
    }
}
