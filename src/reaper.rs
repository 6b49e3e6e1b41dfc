//! Node-scoped garbage collection (spec.md §4.5). Each agent only reaps
//! Diagnosis objects assigned to its own node, and only ever deletes —
//! never mutates spec or status — so the reaper can run independently of
//! the reconciler and stage workers without racing them.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use kube::api::{Api, DeleteParams, ListParams};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::crd::{Diagnosis, DiagnosisPhase};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::queue::DiagnosisRef;

pub struct Reaper {
    client: kube::Client,
    config: Arc<AppConfig>,
    metrics: Arc<Metrics>,
}

impl Reaper {
    pub fn new(client: kube::Client, config: Arc<AppConfig>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            config,
            metrics,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reaper_interval());
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("reaper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let outcome = match self.sweep().await {
                        Ok(()) => "success",
                        Err(err) => {
                            warn!(error = %err, "reap sweep failed");
                            "error"
                        }
                    };
                    self.metrics
                        .reaper_cycles
                        .get_or_create(&crate::metrics::CycleLabels { outcome: outcome.to_string() })
                        .inc();
                }
            }
        }
    }

    pub async fn sweep(&self) -> Result<()> {
        let list_api: Api<Diagnosis> = Api::all(self.client.clone());
        let list_params = ListParams::default();
        let diagnoses = list_api.list(&list_params).await?;

        let mut mine: Vec<Diagnosis> = diagnoses
            .items
            .into_iter()
            .filter(|d| d.spec.node_name == self.config.node_name)
            .collect();

        let reap_set = compute_reap_set(
            &mine,
            self.config.abnormal_ttl(),
            self.config.minimum_abnormal_ttl(),
            self.config.maximum_abnormals_per_node,
        );

        let mut deleted = HashSet::new();
        for reference in &reap_set {
            // Diagnosis is namespaced; deleting through the all-namespaces
            // list handle would target a cluster-scoped path that doesn't
            // exist for this CRD and fail every time.
            let delete_api: Api<Diagnosis> = Api::namespaced(self.client.clone(), &reference.namespace);
            if let Err(err) = delete_api.delete(&reference.name, &DeleteParams::default()).await {
                warn!(diagnosis = %reference, error = %err, "failed to delete reaped diagnosis");
                continue;
            }
            self.metrics.reaped_total.inc();
            deleted.insert(reference.clone());
        }

        mine.retain(|d| {
            !deleted.contains(&DiagnosisRef {
                namespace: d.metadata.namespace.clone().unwrap_or_default(),
                name: d.metadata.name.clone().unwrap_or_default(),
            })
        });
        self.metrics
            .diagnoses_per_node
            .get_or_create(&crate::metrics::NodeLabels {
                node: self.config.node_name.clone(),
            })
            .set(mine.len() as i64);

        self.sweep_artifacts().await;

        Ok(())
    }

    /// Walks the on-disk artifact trees (spec.md §6.4: `profilers/java/memory`,
    /// `profilers/go/pprof`, `tasks`, each one directory per diagnosis) and
    /// removes any direct child whose mtime is older than the absolute TTL.
    /// Only the top-level child of each subtree is examined, per spec.md
    /// §4.5 step 5; a missing subtree is a no-op rather than an error.
    async fn sweep_artifacts(&self) {
        let root = Path::new(&self.config.data_root);
        let ttl = self.config.abnormal_ttl().to_std().unwrap_or(std::time::Duration::MAX);

        for subtree in [
            root.join("profilers").join("java").join("memory"),
            root.join("profilers").join("go").join("pprof"),
            root.join("tasks"),
        ] {
            if let Err(err) = sweep_artifact_subtree(&subtree, ttl).await {
                warn!(path = %subtree.display(), error = %err, "failed to sweep artifact subtree");
            }
        }
    }
}

/// Removes direct children of `root` whose mtime is older than `ttl`.
/// A missing `root` is treated as already-clean, not an error.
async fn sweep_artifact_subtree(root: &Path, ttl: std::time::Duration) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    let now = std::time::SystemTime::now();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        let modified = metadata.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age > ttl {
            let path = entry.path();
            if metadata.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
    }
    Ok(())
}

/// Computes which diagnosis names to delete: unconditionally reap anything
/// older than the absolute TTL, reap terminal diagnoses older than the
/// minimum TTL, and beyond that trim the oldest surplus above
/// `maximum_abnormals_per_node`.
fn compute_reap_set(
    diagnoses: &[Diagnosis],
    abnormal_ttl: chrono::Duration,
    minimum_abnormal_ttl: chrono::Duration,
    maximum_abnormals_per_node: usize,
) -> HashSet<DiagnosisRef> {
    let now = Utc::now();
    let mut reap = HashSet::new();
    let mut survivors: Vec<&Diagnosis> = Vec::new();

    let diagnosis_ref = |d: &Diagnosis| DiagnosisRef {
        namespace: d.metadata.namespace.clone().unwrap_or_default(),
        name: d.metadata.name.clone().unwrap_or_default(),
    };

    for diagnosis in diagnoses {
        let start_time = diagnosis_start_time(diagnosis, now);
        let age = now - start_time;

        if age > abnormal_ttl {
            reap.insert(diagnosis_ref(diagnosis));
            continue;
        }

        let phase = diagnosis
            .status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or(DiagnosisPhase::Pending);

        if phase.is_terminal() && age > minimum_abnormal_ttl {
            reap.insert(diagnosis_ref(diagnosis));
            continue;
        }

        survivors.push(diagnosis);
    }

    survivors.sort_by_key(|d| diagnosis_start_time(d, now));

    if survivors.len() > maximum_abnormals_per_node {
        for diagnosis in &survivors[..survivors.len() - maximum_abnormals_per_node] {
            reap.insert(diagnosis_ref(diagnosis));
        }
    }

    reap
}

/// The reaper's age basis is `status.startTime` (spec.md §4.5/§8 invariant
/// 4), not creation time: a diagnosis created but not yet admitted by the
/// source stage has no startTime and is treated as freshly created rather
/// than timed out.
fn diagnosis_start_time(diagnosis: &Diagnosis, now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
    diagnosis
        .status
        .as_ref()
        .and_then(|s| s.start_time)
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DiagnosisSource, DiagnosisSpec, DiagnosisStatus};
    use kube::core::{ObjectMeta, Time};

    fn diagnosis_at_age(name: &str, age_seconds: i64, phase: DiagnosisPhase) -> Diagnosis {
        Diagnosis {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                creation_timestamp: Some(Time(Utc::now() - chrono::Duration::seconds(age_seconds))),
                ..Default::default()
            },
            spec: DiagnosisSpec {
                source: DiagnosisSource::Custom,
                node_name: "node-1".to_string(),
                assigned_information_collectors: vec![],
                assigned_diagnosers: vec![],
                assigned_recoverers: vec![],
                skip_information_collection: false,
                skip_diagnosis: false,
                skip_recovery: false,
                pod_reference: None,
                command_executors: vec![],
                profilers: vec![],
                payload: None,
            },
            status: Some(DiagnosisStatus {
                phase,
                start_time: Some(Utc::now() - chrono::Duration::seconds(age_seconds)),
                ..Default::default()
            }),
        }
    }

    const TTL: i64 = 1000;
    const MIN_TTL: i64 = 100;
    const MAX_PER_NODE: usize = 2;

    fn reap(diagnoses: &[Diagnosis]) -> HashSet<DiagnosisRef> {
        compute_reap_set(
            diagnoses,
            chrono::Duration::seconds(TTL),
            chrono::Duration::seconds(MIN_TTL),
            MAX_PER_NODE,
        )
    }

    fn reap_ref(name: &str) -> DiagnosisRef {
        DiagnosisRef {
            namespace: "default".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn reaps_objects_past_absolute_ttl() {
        let diagnoses = vec![diagnosis_at_age("old", 2000, DiagnosisPhase::Pending)];
        let reap_set = reap(&diagnoses);
        assert!(reap_set.contains(&reap_ref("old")));
    }

    #[test]
    fn reaps_terminal_objects_past_minimum_ttl() {
        let diagnoses = vec![diagnosis_at_age("done", 200, DiagnosisPhase::Succeeded)];
        let reap_set = reap(&diagnoses);
        assert!(reap_set.contains(&reap_ref("done")));
    }

    #[test]
    fn keeps_recent_non_terminal_objects() {
        let diagnoses = vec![diagnosis_at_age("fresh", 10, DiagnosisPhase::InformationCollecting)];
        let reap_set = reap(&diagnoses);
        assert!(reap_set.is_empty());
    }

    #[test]
    fn enforces_max_per_node_by_trimming_oldest() {
        let diagnoses = vec![
            diagnosis_at_age("a", 30, DiagnosisPhase::Pending),
            diagnosis_at_age("b", 20, DiagnosisPhase::Pending),
            diagnosis_at_age("c", 10, DiagnosisPhase::Pending),
        ];
        let reap_set = reap(&diagnoses);
        assert_eq!(reap_set.len(), 1);
        assert!(reap_set.contains(&reap_ref("a")));
    }

    #[tokio::test]
    async fn sweep_artifact_subtree_removes_only_expired_children() {
        let dir = tempfile::tempdir().unwrap();
        let old_child = dir.path().join("old-diagnosis");
        let fresh_child = dir.path().join("fresh-diagnosis");
        tokio::fs::create_dir_all(&old_child).await.unwrap();
        tokio::fs::create_dir_all(&fresh_child).await.unwrap();

        let old_time = std::time::SystemTime::now() - std::time::Duration::from_secs(7200);
        std::fs::File::open(&old_child).unwrap().set_modified(old_time).unwrap();

        sweep_artifact_subtree(dir.path(), std::time::Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(!old_child.exists());
        assert!(fresh_child.exists());
    }

    #[tokio::test]
    async fn sweep_artifact_subtree_missing_root_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let result = sweep_artifact_subtree(&missing, std::time::Duration::from_secs(60)).await;
        assert!(result.is_ok());
    }
}
