use async_trait::async_trait;

use crate::controller::stages::traits::{lookup_diagnoser, StageContext, StageWorker};
use crate::crd::{ConditionStatus, ConditionType, DiagnosisPhase, DiagnosisSpec, DiagnosisStatus, ProcessorRef, ProcessorSpec};
use crate::error::Result;
use crate::queue::Stage;

pub struct DiagnosisStage;

#[async_trait]
impl StageWorker for DiagnosisStage {
    fn stage(&self) -> Stage {
        Stage::Diagnosis
    }

    fn stage_label(&self) -> &'static str {
        "diagnosis"
    }

    fn next_phase(&self) -> DiagnosisPhase {
        DiagnosisPhase::DiagnosisRecovering
    }

    fn assigned(&self, spec: &DiagnosisSpec) -> &[ProcessorRef] {
        &spec.assigned_diagnosers
    }

    fn skip_requested(&self, spec: &DiagnosisSpec) -> bool {
        spec.skip_diagnosis
    }

    /// A diagnoser signals a match through `status.identifiable` (spec.md
    /// §3), not through `conditions` — `conditions` is the worker's own
    /// prerogative and the dispatcher rejects any response that touches it
    /// (spec.md §4.3 step 5). `false` or absent means this diagnoser didn't
    /// recognize the fault and the loop moves on to the next candidate.
    fn completion_condition(&self, status: &DiagnosisStatus) -> bool {
        status.identifiable
    }

    /// Once a diagnoser reports a match, the worker itself — not the
    /// diagnoser — stamps the Identified condition (spec.md §4.2).
    fn on_candidate_received(&self, status: &mut DiagnosisStatus) {
        if status.identifiable {
            crate::crd::set_condition(
                status,
                ConditionType::Identified,
                ConditionStatus::True,
                "Matched",
                "diagnoser reported status.identifiable = true",
            );
        }
    }

    /// Records the winning diagnoser reference in `status.diagnoser`
    /// (spec.md §3/§4.2).
    fn record_winner(&self, status: &mut DiagnosisStatus, reference: &ProcessorRef) {
        status.diagnoser = Some(reference.clone());
    }

    async fn resolve_processor(&self, ctx: &StageContext, reference: &ProcessorRef) -> Result<ProcessorSpec> {
        lookup_diagnoser(&ctx.client, reference).await
    }
}
