//! Local-process work that runs ahead of remote dispatch during the
//! information stage (spec.md §4.2: inline `commandExecutors`/`profilers`).
//! Each item is bounded by its own timeout and recorded regardless of
//! whether the process succeeded, so one slow or failing local command
//! never blocks the remote collectors that follow it.

use std::path::Path;
use std::process::Stdio;

use chrono::Utc;
use tokio::process::Command;
use tracing::warn;

use crate::crd::{CommandExecutorSpec, CommandExecutorStatus, ProfilerKind, ProfilerSpec, ProfilerStatus};

/// Runs every `specs` entry not already present by name in `existing`,
/// returning only the newly completed statuses (callers append these to
/// `status.commandExecutors`).
pub async fn run_command_executors(
    specs: &[CommandExecutorSpec],
    existing: &[CommandExecutorStatus],
) -> Vec<CommandExecutorStatus> {
    let mut results = Vec::with_capacity(specs.len());
    for spec in specs {
        if existing.iter().any(|status| status.name == spec.name) {
            continue;
        }
        results.push(run_one_command(spec).await);
    }
    results
}

async fn run_one_command(spec: &CommandExecutorSpec) -> CommandExecutorStatus {
    let Some((program, args)) = spec.command.split_first() else {
        return CommandExecutorStatus {
            name: spec.name.clone(),
            exit_code: None,
            stdout: None,
            stderr: Some("empty command".to_string()),
            completed_at: Some(Utc::now()),
        };
    };

    let run = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    match tokio::time::timeout(std::time::Duration::from_secs(spec.timeout_seconds), run).await {
        Ok(Ok(output)) => CommandExecutorStatus {
            name: spec.name.clone(),
            exit_code: output.status.code(),
            stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
            completed_at: Some(Utc::now()),
        },
        Ok(Err(err)) => {
            warn!(executor = %spec.name, error = %err, "command executor failed to spawn");
            CommandExecutorStatus {
                name: spec.name.clone(),
                exit_code: None,
                stdout: None,
                stderr: Some(err.to_string()),
                completed_at: Some(Utc::now()),
            }
        }
        Err(_) => {
            warn!(executor = %spec.name, timeout_seconds = spec.timeout_seconds, "command executor timed out");
            CommandExecutorStatus {
                name: spec.name.clone(),
                exit_code: None,
                stdout: None,
                stderr: Some("timed out".to_string()),
                completed_at: Some(Utc::now()),
            }
        }
    }
}

/// Ensures each profiler's artifact directory exists under `dataRoot` and
/// records it in status. Capturing the actual profile (heap dump, pprof
/// sample) is the concrete profiler's own logic, out of scope here
/// (spec.md §1) — this only establishes the on-disk location the reaper
/// later sweeps (spec.md §6.4).
pub async fn run_profilers(
    data_root: &str,
    diagnosis_id: &str,
    specs: &[ProfilerSpec],
    existing: &[ProfilerStatus],
) -> Vec<ProfilerStatus> {
    let mut results = Vec::with_capacity(specs.len());
    for spec in specs {
        if existing.iter().any(|status| status.name == spec.name) {
            continue;
        }
        results.push(run_one_profiler(data_root, diagnosis_id, spec).await);
    }
    results
}

async fn run_one_profiler(data_root: &str, diagnosis_id: &str, spec: &ProfilerSpec) -> ProfilerStatus {
    let subkind = match spec.kind {
        ProfilerKind::Java => ["java", "memory"],
        ProfilerKind::Go => ["go", "pprof"],
    };
    let dir = Path::new(data_root)
        .join("profilers")
        .join(subkind[0])
        .join(subkind[1])
        .join(diagnosis_id);

    match tokio::fs::create_dir_all(&dir).await {
        Ok(()) => ProfilerStatus {
            name: spec.name.clone(),
            kind: spec.kind.clone(),
            path: Some(dir.display().to_string()),
            completed_at: Some(Utc::now()),
        },
        Err(err) => {
            warn!(profiler = %spec.name, error = %err, "failed to create profiler artifact directory");
            ProfilerStatus {
                name: spec.name.clone(),
                kind: spec.kind.clone(),
                path: None,
                completed_at: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_command_executors_skips_already_recorded() {
        let specs = vec![CommandExecutorSpec {
            name: "uptime".to_string(),
            command: vec!["true".to_string()],
            timeout_seconds: 5,
        }];
        let existing = vec![CommandExecutorStatus {
            name: "uptime".to_string(),
            exit_code: Some(0),
            stdout: None,
            stderr: None,
            completed_at: Some(Utc::now()),
        }];
        let results = run_command_executors(&specs, &existing).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn run_command_executors_captures_exit_code_and_stdout() {
        let specs = vec![CommandExecutorSpec {
            name: "echo".to_string(),
            command: vec!["echo".to_string(), "hi".to_string()],
            timeout_seconds: 5,
        }];
        let results = run_command_executors(&specs, &[]).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].exit_code, Some(0));
        assert_eq!(results[0].stdout.as_deref(), Some("hi\n"));
    }

    #[tokio::test]
    async fn run_command_executors_times_out_long_running_command() {
        let specs = vec![CommandExecutorSpec {
            name: "sleepy".to_string(),
            command: vec!["sleep".to_string(), "5".to_string()],
            timeout_seconds: 1,
        }];
        let results = run_command_executors(&specs, &[]).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].exit_code.is_none());
        assert_eq!(results[0].stderr.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn run_command_executors_reports_empty_command_without_spawning() {
        let specs = vec![CommandExecutorSpec {
            name: "nothing".to_string(),
            command: vec![],
            timeout_seconds: 5,
        }];
        let results = run_command_executors(&specs, &[]).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].exit_code.is_none());
        assert_eq!(results[0].stderr.as_deref(), Some("empty command"));
    }

    #[tokio::test]
    async fn run_profilers_creates_artifact_directory() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![ProfilerSpec {
            name: "heap".to_string(),
            kind: ProfilerKind::Java,
            timeout_seconds: 5,
        }];
        let results = run_profilers(dir.path().to_str().unwrap(), "diag-1", &specs, &[]).await;
        assert_eq!(results.len(), 1);
        let path = results[0].path.clone().unwrap();
        assert!(Path::new(&path).is_dir());
        assert!(path.ends_with(Path::new("java").join("memory").join("diag-1").to_str().unwrap()));
    }

    #[tokio::test]
    async fn run_profilers_skips_already_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![ProfilerSpec {
            name: "heap".to_string(),
            kind: ProfilerKind::Java,
            timeout_seconds: 5,
        }];
        let existing = vec![ProfilerStatus {
            name: "heap".to_string(),
            kind: ProfilerKind::Java,
            path: Some("already/there".to_string()),
            completed_at: Some(Utc::now()),
        }];
        let results = run_profilers(dir.path().to_str().unwrap(), "diag-1", &specs, &existing).await;
        assert!(results.is_empty());
    }
}
