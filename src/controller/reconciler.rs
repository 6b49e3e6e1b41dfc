use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        watcher::Config as WatcherConfig,
    },
    Client, Resource, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, Mode};
use crate::controller::stages::source;
use crate::crd::{Diagnosis, DiagnosisPhase};
use crate::error::KubeDiagError;
use crate::metrics::Metrics;
use crate::queue::{DiagnosisRef, Stage, StageSenders};

pub struct ReconcilerContext {
    pub client: Client,
    pub config: Arc<AppConfig>,
    pub senders: StageSenders,
    pub metrics: Arc<Metrics>,
    pub reporter: Reporter,
}

impl ReconcilerContext {
    pub fn new(client: Client, config: Arc<AppConfig>, senders: StageSenders, metrics: Arc<Metrics>, reporter: Reporter) -> Self {
        Self {
            client,
            config,
            senders,
            metrics,
            reporter,
        }
    }

    /// An agent only reconciles diagnoses assigned to its own node; the
    /// master runs no reconciler at all (spec.md §4.1).
    fn in_scope(&self, diagnosis: &Diagnosis) -> bool {
        self.config.mode == Mode::Agent && diagnosis.spec.node_name == self.config.node_name
    }
}

/// Routes every observed, in-scope diagnosis into the stage queue matching
/// its current phase (spec.md §4.1's table). Re-observing the same object
/// at the same phase is expected and harmless: `try_enqueue` is idempotent
/// from the reconciler's point of view, and the stage worker re-fetches and
/// re-checks phase/conditions after dequeue before doing anything (spec.md
/// §4.2 steps 3-6). This is also how a stage worker's dropped enqueue (a
/// full queue) gets a second chance, since the next watch event reconciles
/// and enqueues again.
pub async fn reconcile(
    diagnosis: Arc<Diagnosis>,
    ctx: Arc<ReconcilerContext>,
) -> std::result::Result<Action, KubeDiagError> {
    let name = diagnosis.name_any();
    let namespace = diagnosis.namespace().unwrap_or_default();

    if !ctx.in_scope(&diagnosis) {
        return Ok(Action::await_change());
    }

    let phase = diagnosis
        .status
        .as_ref()
        .map(|s| s.phase.clone())
        .unwrap_or(DiagnosisPhase::Pending);

    debug!(%namespace, %name, ?phase, "reconciling diagnosis");

    if phase.is_terminal() || matches!(phase, DiagnosisPhase::Unknown) {
        return Ok(Action::await_change());
    }

    let diagnosis_ref = DiagnosisRef {
        namespace: namespace.clone(),
        name: name.clone(),
    };

    if phase == DiagnosisPhase::Pending {
        let api: Api<Diagnosis> = Api::namespaced(ctx.client.clone(), &namespace);
        let mut status = diagnosis.status.clone().unwrap_or_default();
        source::admit(&mut status);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone(), diagnosis.object_ref(&()));
        if let Err(err) = recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "Accepted".to_string(),
                note: Some("diagnosis admitted, starting information collection".to_string()),
                action: "Reconciling".to_string(),
                secondary: None,
            })
            .await
        {
            debug!(%namespace, %name, error = %err, "failed to publish accepted event");
        }
    }

    // A diagnosis admitted just above is now InformationCollecting in our
    // local copy even though the patch above is what persists it; route on
    // that local copy so admission and routing happen in the same pass
    // instead of waiting on a second watch event.
    let target = match phase {
        DiagnosisPhase::Pending | DiagnosisPhase::InformationCollecting => Stage::Information,
        DiagnosisPhase::DiagnosisDiagnosing => Stage::Diagnosis,
        DiagnosisPhase::DiagnosisRecovering => Stage::Recovery,
        DiagnosisPhase::Succeeded | DiagnosisPhase::Failed | DiagnosisPhase::Unknown => {
            return Ok(Action::await_change())
        }
    };

    if let Err(err) = ctx.senders.try_enqueue(target, diagnosis_ref) {
        warn!(%namespace, %name, error = %err, "stage queue enqueue failed, relying on next watch event");
    }

    Ok(Action::requeue(Duration::from_secs(30)))
}

pub fn error_policy(
    diagnosis: Arc<Diagnosis>,
    error: &KubeDiagError,
    _ctx: Arc<ReconcilerContext>,
) -> Action {
    let name = diagnosis.name_any();
    warn!(%name, %error, "reconcile failed, requeueing");
    Action::requeue(Duration::from_secs(15))
}

pub async fn run_controller(ctx: Arc<ReconcilerContext>, token: CancellationToken) {
    info!("starting diagnosis controller");
    let api: Api<Diagnosis> = Api::all(ctx.client.clone());

    Controller::new(api, WatcherConfig::default())
        .graceful_shutdown_on(token.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(reconciled) => debug!(?reconciled, "diagnosis reconciled"),
                Err(error) => error!(%error, "diagnosis reconciliation error"),
            }
        })
        .await;

    info!("diagnosis controller stopped");
}
