use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use reqwest::Client as HttpClient;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{
    ConditionStatus, ConditionType, Diagnoser, Diagnosis, DiagnosisPhase, DiagnosisSpec,
    DiagnosisStatus, InformationCollector, ProcessorRef, ProcessorSpec, Recoverer,
};
use crate::dispatcher;
use crate::error::Result;
use crate::metrics::{Metrics, StageLabels};
use crate::queue::{DiagnosisRef, Stage, StageSenders};

pub struct StageContext {
    pub client: Client,
    pub http: HttpClient,
    pub metrics: Arc<Metrics>,
    pub senders: StageSenders,
    /// This agent's Kubernetes node identifier (`--node-name`), checked
    /// against `spec.nodeName` on every re-fetched diagnosis (spec.md §4.2
    /// step 4).
    pub node_name: String,
    /// This agent's own serving address, used to resolve a processor's
    /// endpoint when its registration leaves `ip`/`port` unset (spec.md §3:
    /// "defaults to node-local bind address/serving port").
    pub node_bind_address: String,
    pub node_bind_port: u16,
    /// Identifies this agent as the author of every observable event it
    /// publishes on a Diagnosis (spec.md §7: "every state transition emits
    /// an observable event on the object").
    pub reporter: Reporter,
    /// Root of this node's on-disk artifact tree, used by the information
    /// stage to place inline profiler output (spec.md §6.4).
    pub data_root: String,
}

/// Factors the generic dequeue/re-fetch/dispatch-to-each-candidate/validate/
/// transition loop shared by the information, diagnosis, and recovery
/// stages (spec.md §4.2) into one default implementation, specialized per
/// stage by the hooks below.
#[async_trait]
pub trait StageWorker: Send + Sync {
    fn stage(&self) -> Stage;
    fn stage_label(&self) -> &'static str;
    fn next_phase(&self) -> DiagnosisPhase;

    /// The processor references this stage iterates, in the order the
    /// reconciler assigned them. An empty set means "skip this stage"
    /// (spec.md §8 boundary behavior).
    fn assigned(&self, spec: &DiagnosisSpec) -> &[ProcessorRef];

    /// True when this stage's own skip flag is set on the spec, bypassing
    /// its assignment list entirely (spec.md §3 supplemental fields: a skip
    /// flag short-circuits even a non-empty assignment). Defaults to
    /// `false`; each stage overrides with its own flag.
    fn skip_requested(&self, _spec: &DiagnosisSpec) -> bool {
        false
    }

    /// The condition type this stage owns; used both to report exhaustion
    /// (`False`) and to stamp success when the stage is skipped outright.
    fn condition_type(&self) -> ConditionType {
        match self.stage() {
            Stage::Information => ConditionType::InformationCollected,
            Stage::Diagnosis => ConditionType::Identified,
            Stage::Recovery => ConditionType::Recovered,
        }
    }

    /// The phase a diagnosis must be in for this stage to own it. Used to
    /// drop a stale queue item whose phase has already moved on by the time
    /// it's re-fetched (spec.md §4.2 step 5).
    fn current_phase(&self) -> DiagnosisPhase {
        match self.stage() {
            Stage::Information => DiagnosisPhase::InformationCollecting,
            Stage::Diagnosis => DiagnosisPhase::DiagnosisDiagnosing,
            Stage::Recovery => DiagnosisPhase::DiagnosisRecovering,
        }
    }

    /// True for a stage that must dispatch to every assigned candidate and
    /// merge each valid response rather than stopping at the first one
    /// (spec.md §4.2: the information stage dispatches to each assigned
    /// collector, success is "at least one valid"; diagnosis/recovery keep
    /// the default first-valid-wins behaviour).
    fn exhaustive(&self) -> bool {
        false
    }

    /// True once a processor response satisfies this stage's goal (e.g. a
    /// diagnoser set the Identified condition to True). Information
    /// collection is satisfied by any well-formed response per the relaxed
    /// acceptance rule; diagnosis/recovery require their condition.
    fn completion_condition(&self, status: &DiagnosisStatus) -> bool;

    async fn resolve_processor(&self, ctx: &StageContext, reference: &ProcessorRef) -> Result<ProcessorSpec>;

    /// Stage-specific bookkeeping applied to a candidate status before the
    /// completion condition is checked (e.g. the information stage stamps
    /// its own condition since it accepts any well-formed response).
    fn on_candidate_received(&self, _status: &mut DiagnosisStatus) {}

    /// Records the processor reference that satisfied this stage (spec.md
    /// §3's `status.diagnoser`/`status.recoverer`, §4.2's "records the
    /// winning ... reference"). The information stage has no equivalent
    /// field and keeps the default no-op.
    fn record_winner(&self, _status: &mut DiagnosisStatus, _reference: &ProcessorRef) {}

    /// Runs this stage's own local-process work ahead of remote dispatch
    /// (spec.md §4.2: the information stage executes inline command
    /// executors and profilers before it dispatches to any assigned
    /// collector). The diagnosis and recovery stages have no inline work
    /// and keep the default no-op.
    async fn run_inline_executors(&self, _ctx: &StageContext, _diagnosis: &mut Diagnosis) {}

    /// Stamps this stage's own condition `True` when it is skipped outright,
    /// either because its assigned set is empty (spec.md §8: "Empty
    /// assignedX set at stage X is skip stage") or because its skip flag was
    /// set. The default covers all three stages; override only if a stage
    /// needs extra bookkeeping on skip.
    fn mark_skipped(&self, status: &mut DiagnosisStatus, reason: &str) {
        crate::crd::set_condition(
            status,
            self.condition_type(),
            ConditionStatus::True,
            "Skipped",
            format!("{} stage skipped: {reason}", self.stage_label()),
        );
    }

    async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<DiagnosisRef>, ctx: Arc<StageContext>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(stage = self.stage_label(), "stage worker shutting down");
                    break;
                }
                received = receiver.recv() => {
                    match received {
                        None => break,
                        Some(diagnosis_ref) => {
                            if let Err(err) = self.process_one(&ctx, &diagnosis_ref).await {
                                warn!(stage = self.stage_label(), diagnosis = %diagnosis_ref, error = %err, "stage processing failed");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn process_one(&self, ctx: &StageContext, diagnosis_ref: &DiagnosisRef) -> Result<()> {
        let api: Api<Diagnosis> = Api::namespaced(ctx.client.clone(), &diagnosis_ref.namespace);
        let mut current = api.get(&diagnosis_ref.name).await?;

        // A stale queue item: the diagnosis moved to a different node or
        // phase since it was enqueued. Drop it rather than act on it; the
        // reconciler re-routes it to whichever stage actually owns it now
        // (spec.md §4.2 steps 4-5).
        if current.spec.node_name != ctx.node_name {
            debug!(
                stage = self.stage_label(),
                diagnosis = %diagnosis_ref,
                node = %current.spec.node_name,
                "diagnosis targets a different node, dropping"
            );
            return Ok(());
        }
        let phase = current.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default();
        if phase != self.current_phase() {
            debug!(stage = self.stage_label(), diagnosis = %diagnosis_ref, ?phase, "diagnosis phase no longer belongs to this stage, dropping");
            return Ok(());
        }

        // Re-running this idempotently-enqueued diagnosis after the stage
        // goal was already satisfied: just carry the phase forward.
        if let Some(status) = current.status.as_ref() {
            if self.completion_condition(status) {
                self.advance(ctx, &api, &mut current).await?;
                return Ok(());
            }
        }

        self.run_inline_executors(ctx, &mut current).await;

        if self.skip_requested(&current.spec) {
            let mut status = current.status.clone().unwrap_or_default();
            self.mark_skipped(&mut status, "skip flag set on spec");
            current.status = Some(status);
            self.advance(ctx, &api, &mut current).await?;
            return Ok(());
        }

        let candidates: Vec<ProcessorRef> = self.assigned(&current.spec).to_vec();
        if candidates.is_empty() {
            let mut status = current.status.clone().unwrap_or_default();
            self.mark_skipped(&mut status, "no processors assigned");
            current.status = Some(status);
            self.advance(ctx, &api, &mut current).await?;
            return Ok(());
        }

        let mut any_valid = false;
        for reference in &candidates {
            let processor = match self.resolve_processor(ctx, reference).await {
                Ok(p) => p,
                Err(err) => {
                    debug!(stage = self.stage_label(), processor = %reference, error = %err, "processor lookup failed, trying next");
                    continue;
                }
            };

            let dispatch_result = dispatcher::dispatch(
                &ctx.http,
                &processor,
                None,
                &current,
                &ctx.node_bind_address,
                ctx.node_bind_port,
            )
            .await;

            let candidate = match dispatch_result {
                Ok(candidate) => candidate,
                Err(err) => {
                    ctx.metrics
                        .dispatch_errors
                        .get_or_create(&StageLabels {
                            stage: self.stage_label().to_string(),
                            outcome: "transport".to_string(),
                        })
                        .inc();
                    debug!(stage = self.stage_label(), processor = %reference, error = %err, "dispatch failed, trying next candidate");
                    continue;
                }
            };

            if let Err(err) = dispatcher::validate_response(&current, &candidate) {
                ctx.metrics
                    .dispatch_errors
                    .get_or_create(&StageLabels {
                        stage: self.stage_label().to_string(),
                        outcome: "invalid_response".to_string(),
                    })
                    .inc();
                warn!(stage = self.stage_label(), processor = %reference, error = %err, "processor response rejected");
                continue;
            }

            any_valid = true;
            let mut candidate_status = candidate.status.clone().unwrap_or_default();
            self.on_candidate_received(&mut candidate_status);

            if !self.exhaustive() && self.completion_condition(&candidate_status) {
                self.record_winner(&mut candidate_status, reference);
                current.status = Some(candidate_status);
                self.advance(ctx, &api, &mut current).await?;
                return Ok(());
            }

            // Merge context even when the stage goal wasn't met yet (or, for
            // an exhaustive stage, after every valid response in turn) so
            // later candidates build on earlier partial progress.
            current.status = Some(candidate_status);
        }

        if self.exhaustive() && any_valid {
            self.advance(ctx, &api, &mut current).await?;
            return Ok(());
        }

        self.persist_status_only(&api, &current).await?;
        warn!(stage = self.stage_label(), diagnosis = %diagnosis_ref, "all assigned processors exhausted without satisfying stage");
        self.fail(ctx, &api, &mut current, "ProcessorsExhausted").await?;
        Ok(())
    }

    async fn advance(&self, ctx: &StageContext, api: &Api<Diagnosis>, diagnosis: &mut Diagnosis) -> Result<()> {
        let mut status = diagnosis.status.clone().unwrap_or_default();
        status.phase.transition_to(self.next_phase())?;
        diagnosis.status = Some(status);
        self.persist_status_only(api, diagnosis).await?;

        ctx.metrics
            .stage_transitions
            .get_or_create(&StageLabels {
                stage: self.stage_label().to_string(),
                outcome: "succeeded".to_string(),
            })
            .inc();

        let next_ref = DiagnosisRef {
            namespace: diagnosis.metadata.namespace.clone().unwrap_or_default(),
            name: diagnosis.metadata.name.clone().unwrap_or_default(),
        };
        match self.next_phase() {
            DiagnosisPhase::DiagnosisDiagnosing => {
                let _ = ctx.senders.try_enqueue(Stage::Diagnosis, next_ref);
            }
            DiagnosisPhase::DiagnosisRecovering => {
                let _ = ctx.senders.try_enqueue(Stage::Recovery, next_ref);
            }
            _ => {}
        }

        self.publish_event(
            ctx,
            diagnosis,
            EventType::Normal,
            format!("{}Completed", capitalize(self.stage_label())),
            format!("{} stage completed, phase advanced to {:?}", self.stage_label(), self.next_phase()),
        )
        .await;
        Ok(())
    }

    async fn fail(&self, ctx: &StageContext, api: &Api<Diagnosis>, diagnosis: &mut Diagnosis, reason: &str) -> Result<()> {
        let mut status = diagnosis.status.clone().unwrap_or_default();
        status.phase.transition_to(DiagnosisPhase::Failed)?;
        crate::crd::set_condition(
            &mut status,
            self.condition_type(),
            ConditionStatus::False,
            reason,
            format!("{} stage failed: {reason}", self.stage_label()),
        );
        diagnosis.status = Some(status);
        self.persist_status_only(api, diagnosis).await?;

        ctx.metrics
            .stage_transitions
            .get_or_create(&StageLabels {
                stage: self.stage_label().to_string(),
                outcome: "failed".to_string(),
            })
            .inc();

        self.publish_event(
            ctx,
            diagnosis,
            EventType::Warning,
            format!("{}Failed", capitalize(self.stage_label())),
            format!("{} stage failed: {reason}", self.stage_label()),
        )
        .await;
        Ok(())
    }

    /// Publishes a Kubernetes event on the diagnosis object (spec.md §7:
    /// "every state transition emits an observable event on the object").
    /// Best-effort: a failure to publish is logged, not propagated, since
    /// the phase/condition update has already been persisted and is the
    /// authoritative record either way.
    async fn publish_event(
        &self,
        ctx: &StageContext,
        diagnosis: &Diagnosis,
        type_: EventType,
        reason: String,
        note: String,
    ) {
        let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone(), diagnosis.object_ref(&()));
        if let Err(err) = recorder
            .publish(Event {
                type_,
                reason,
                note: Some(note),
                action: "Reconciling".to_string(),
                secondary: None,
            })
            .await
        {
            debug!(stage = self.stage_label(), error = %err, "failed to publish diagnosis event");
        }
    }

    async fn persist_status_only(&self, api: &Api<Diagnosis>, diagnosis: &Diagnosis) -> Result<()> {
        let name = diagnosis.metadata.name.clone().unwrap_or_default();
        let patch = serde_json::json!({ "status": diagnosis.status });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

pub fn stamp_start_time_if_absent(status: &mut DiagnosisStatus) {
    if status.start_time.is_none() {
        status.start_time = Some(Utc::now());
    }
}

pub async fn lookup_information_collector(client: &Client, reference: &ProcessorRef) -> Result<ProcessorSpec> {
    let api: Api<InformationCollector> = Api::namespaced(client.clone(), &reference.namespace);
    let resource = api.get(&reference.name).await?;
    Ok(resource.spec.processor)
}

pub async fn lookup_diagnoser(client: &Client, reference: &ProcessorRef) -> Result<ProcessorSpec> {
    let api: Api<Diagnoser> = Api::namespaced(client.clone(), &reference.namespace);
    let resource = api.get(&reference.name).await?;
    Ok(resource.spec.processor)
}

pub async fn lookup_recoverer(client: &Client, reference: &ProcessorRef) -> Result<ProcessorSpec> {
    let api: Api<Recoverer> = Api::namespaced(client.clone(), &reference.namespace);
    let resource = api.get(&reference.name).await?;
    Ok(resource.spec.processor)
}
