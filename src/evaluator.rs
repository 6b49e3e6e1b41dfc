//! Cluster-health evaluator (spec.md §4.6): master-only loop that watches
//! Pods cluster-wide and synthesizes a Diagnosis for any pod stuck
//! terminating past its grace period, pre-assigning the standard
//! terminating-pod processor set so the pipeline can run end to end without
//! an operator manually wiring assignments for this well-known case.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, PostParams};
use kube::core::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::crd::{Diagnosis, DiagnosisSource, DiagnosisSpec, DiagnosisStatus, PodReference, ProcessorRef};
use crate::error::Result;

/// Well-known processor registry names the evaluator assigns to a
/// terminating-pod diagnosis (spec.md §4.6). These names are the contract
/// between this evaluator and the cluster operator's processor
/// registrations: a deployment is expected to register an
/// InformationCollector/Diagnoser/Recoverer under each of these names.
const PROCESSOR_NAMESPACE: &str = "kubediag";
const POD_COLLECTOR: &str = "pod";
const PROCESS_COLLECTOR: &str = "process";
const TERMINATING_POD_DIAGNOSER: &str = "terminatingPod";
const SIGNAL_RECOVERER: &str = "signal";

/// The synthesized diagnosis's name prefix: `<prefix>.<podName>.<podUID>`
/// per spec.md §4.6, which also doubles as the idempotency key.
const NAME_PREFIX: &str = "terminating-pod";

/// Grace-period buffer spec.md §4.6 adds on top of the pod's own
/// `deletionGracePeriodSeconds` before considering it stuck:
/// `deletionTimestamp + gracePeriod + constant(30s)`.
const GRACE_PERIOD_BUFFER_SECONDS: i64 = 30;

fn processor_ref(name: &str) -> ProcessorRef {
    ProcessorRef {
        namespace: PROCESSOR_NAMESPACE.to_string(),
        name: name.to_string(),
    }
}

pub struct Evaluator {
    client: kube::Client,
    config: Arc<AppConfig>,
}

struct StuckPod {
    namespace: String,
    name: String,
    uid: String,
    node_name: String,
}

impl Evaluator {
    pub fn new(client: kube::Client, config: Arc<AppConfig>) -> Self {
        Self { client, config }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("cluster-health evaluator shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.evaluate().await {
                        warn!(error = %err, "cluster-health evaluation failed");
                    }
                }
            }
        }
    }

    pub async fn evaluate(&self) -> Result<()> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods.list(&ListParams::default()).await?;

        for pod in &list.items {
            if let Some(stuck) = terminating_past_grace_period(pod) {
                self.raise(stuck).await?;
            }
        }
        Ok(())
    }

    /// Creates the synthetic diagnosis, skipping if one with this pod's
    /// derived name already exists (spec.md §4.6 "Idempotent: if a
    /// diagnosis with that name already exists, skip").
    async fn raise(&self, stuck: StuckPod) -> Result<()> {
        let api: Api<Diagnosis> = Api::namespaced(self.client.clone(), &stuck.namespace);
        let name = format!("{NAME_PREFIX}.{}.{}", stuck.name, stuck.uid);

        if api.get(&name).await.is_ok() {
            debug!(%name, "terminating-pod diagnosis already raised, skipping");
            return Ok(());
        }

        let diagnosis = Diagnosis {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(stuck.namespace.clone()),
                ..Default::default()
            },
            spec: DiagnosisSpec {
                source: DiagnosisSource::KubernetesEvent,
                node_name: stuck.node_name,
                assigned_information_collectors: vec![processor_ref(POD_COLLECTOR), processor_ref(PROCESS_COLLECTOR)],
                assigned_diagnosers: vec![processor_ref(TERMINATING_POD_DIAGNOSER)],
                assigned_recoverers: vec![processor_ref(SIGNAL_RECOVERER)],
                skip_information_collection: false,
                skip_diagnosis: false,
                skip_recovery: false,
                pod_reference: Some(PodReference {
                    namespace: stuck.namespace.clone(),
                    name: stuck.name,
                    uid: Some(stuck.uid),
                }),
                command_executors: vec![],
                profilers: vec![],
                payload: None,
            },
            status: Some(DiagnosisStatus::default()),
        };

        match api.create(&PostParams::default(), &diagnosis).await {
            Ok(_) => {
                info!(namespace = %stuck.namespace, %name, "raised diagnosis for terminating pod past grace period");
                Ok(())
            }
            // Another evaluator tick (or a concurrent master, if ever run
            // with more than one replica) won the race to create it first.
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// A pod is considered stuck if `deletionTimestamp` is set, its status
/// phase is not `Unknown`, and the elapsed time since `deletionTimestamp`
/// exceeds `deletionGracePeriodSeconds + 30s` (spec.md §4.6).
fn terminating_past_grace_period(pod: &Pod) -> Option<StuckPod> {
    let deletion_timestamp = pod.metadata.deletion_timestamp.as_ref()?;

    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase == Some("Unknown") {
        return None;
    }

    let grace_period = pod.metadata.deletion_grace_period_seconds.unwrap_or(30) as i64;
    let threshold = chrono::Duration::seconds(grace_period + GRACE_PERIOD_BUFFER_SECONDS);

    let elapsed = Utc::now() - deletion_timestamp.0;
    if elapsed <= threshold {
        return None;
    }

    Some(StuckPod {
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ObjectMeta;

    fn pod_deleted(seconds_ago: i64, grace_period: i64, phase: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("stuck-pod".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("pod-uid-1".to_string()),
                deletion_timestamp: Some(Time(Utc::now() - chrono::Duration::seconds(seconds_ago))),
                deletion_grace_period_seconds: Some(grace_period),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::PodSpec {
                node_name: Some("node-1".to_string()),
                ..Default::default()
            }),
            status: phase.map(|p| PodStatus {
                phase: Some(p.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn flags_pod_past_grace_period_plus_buffer() {
        // gracePeriod=30s + 30s buffer = 60s; at 61s it should fire.
        let pod = pod_deleted(61, 30, Some("Running"));
        let finding = terminating_past_grace_period(&pod);
        assert!(finding.is_some());
        let finding = finding.unwrap();
        assert_eq!(finding.node_name, "node-1");
        assert_eq!(finding.uid, "pod-uid-1");
    }

    #[test]
    fn does_not_fire_before_buffer_elapses() {
        // At 31s, only the bare gracePeriod has elapsed, not gracePeriod+30s.
        let pod = pod_deleted(31, 30, Some("Running"));
        assert!(terminating_past_grace_period(&pod).is_none());
    }

    #[test]
    fn ignores_pod_within_grace_period() {
        let pod = pod_deleted(5, 30, Some("Running"));
        assert!(terminating_past_grace_period(&pod).is_none());
    }

    #[test]
    fn ignores_pod_without_deletion_timestamp() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("healthy-pod".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(terminating_past_grace_period(&pod).is_none());
    }

    #[test]
    fn ignores_pod_with_unknown_phase() {
        let pod = pod_deleted(120, 30, Some("Unknown"));
        assert!(terminating_past_grace_period(&pod).is_none());
    }
}
