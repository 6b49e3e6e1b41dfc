//! Typed accessors over `DiagnosisStatus::context`.
//!
//! The wire shape is a duck-typed JSON object: processors read and write
//! whichever keys they understand and must leave the rest untouched. This
//! module gives the well-known keys a typed face without discarding unknown
//! ones when round-tripping through `DiagnosisStatus`.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::error::{KubeDiagError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextKey {
    PodInformation,
    ContainerInformation,
    ProcessInformation,
    FilePathInformation,
    FileStatusInformation,
    SystemdUnitNameInformation,
    SystemdUnitPropertyInformation,
    PodDiskUsageDiagnosis,
    TerminatingPodDiagnosis,
    SignalRecovery,
}

impl ContextKey {
    /// Matches the well-known key spelling of spec.md §6.1 exactly, since
    /// out-of-tree processors read and write these keys by literal string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKey::PodInformation => "podInformation",
            ContextKey::ContainerInformation => "containerInformation",
            ContextKey::ProcessInformation => "processInformation",
            ContextKey::FilePathInformation => "filePathInformation",
            ContextKey::FileStatusInformation => "fileStatusInformation",
            ContextKey::SystemdUnitNameInformation => "systemdUnitNameInformation",
            ContextKey::SystemdUnitPropertyInformation => "systemdUnitPropertyInformation",
            ContextKey::PodDiskUsageDiagnosis => "podDiskUsageDiagnosis",
            ContextKey::TerminatingPodDiagnosis => "terminatingPodDiagnosis",
            ContextKey::SignalRecovery => "signalRecovery",
        }
    }
}

/// Reads and deserializes a well-known key. Absence is not an error; callers
/// decide whether a missing key means "not yet collected" or "not
/// applicable."
pub fn get<T: DeserializeOwned>(context: &Map<String, Value>, key: ContextKey) -> Result<Option<T>> {
    match context.get(key.as_str()) {
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        None => Ok(None),
    }
}

/// Writes a well-known key, overwriting any previous value under that key
/// while leaving every other key in the map untouched.
pub fn set<T: Serialize>(context: &mut Map<String, Value>, key: ContextKey, value: &T) -> Result<()> {
    let serialized = serde_json::to_value(value)?;
    context.insert(key.as_str().to_string(), serialized);
    Ok(())
}

pub fn require<T: DeserializeOwned>(context: &Map<String, Value>, key: ContextKey) -> Result<T> {
    get(context, key)?.ok_or_else(|| {
        KubeDiagError::ProcessorResponseInvalid(format!("missing required context key {}", key.as_str()))
    })
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodInformation {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub node_name: String,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInformation {
    pub pod_namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub container_id: String,
}

/// One process record as written by the process collector and read by the
/// terminating-pod diagnoser (spec.md §6.1 table).
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInformation {
    pub pid: i64,
    pub ppid: i64,
    pub tgid: i64,
    pub command: String,
    pub status: String,
    pub create_time: chrono::DateTime<chrono::Utc>,
    pub cpu_percent: f64,
    pub nice: i32,
    pub memory_info: ProcessMemoryInfo,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMemoryInfo {
    pub rss_bytes: u64,
    pub vms_bytes: u64,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilePathInformation {
    pub paths: Vec<String>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileStatusInformation {
    pub path: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub permission: Option<String>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemdUnitNameInformation {
    pub units: Vec<String>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemdUnitPropertyInformation {
    pub unit: String,
    pub properties: std::collections::HashMap<String, String>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodDiskUsageDiagnosis {
    pub pod_namespace: String,
    pub pod_name: String,
    pub used_bytes: u64,
    pub threshold_bytes: u64,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerminatingPodDiagnosis {
    pub pod_namespace: String,
    pub pod_name: String,
    pub node_name: String,
    pub grace_period_exceeded: bool,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SignalRecovery {
    pub pid: i64,
    /// POSIX signal number, e.g. `9` for SIGKILL (spec.md §8 scenario 2).
    pub signal: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn set_then_get_round_trips() {
        let mut context = Map::new();
        let info = PodInformation {
            namespace: "default".to_string(),
            name: "web-0".to_string(),
            uid: "abc-123".to_string(),
            node_name: "node-1".to_string(),
        };
        set(&mut context, ContextKey::PodInformation, &info).unwrap();

        let read: PodInformation = require(&context, ContextKey::PodInformation).unwrap();
        assert_eq!(read.name, "web-0");
    }

    #[test]
    fn unknown_keys_survive_a_set() {
        let mut context = Map::new();
        context.insert("CustomVendorKey".to_string(), serde_json::json!({"x": 1}));

        let info = ProcessInformation {
            pid: 42,
            ppid: 1,
            tgid: 42,
            command: "kubelet".to_string(),
            status: "running".to_string(),
            create_time: Utc::now(),
            cpu_percent: 0.5,
            nice: 0,
            memory_info: ProcessMemoryInfo {
                rss_bytes: 1024,
                vms_bytes: 2048,
            },
        };
        set(&mut context, ContextKey::ProcessInformation, &info).unwrap();

        assert!(context.contains_key("CustomVendorKey"));
        assert!(context.contains_key(ContextKey::ProcessInformation.as_str()));
    }

    #[test]
    fn missing_required_key_errors() {
        let context = Map::new();
        let result: Result<PodInformation> = require(&context, ContextKey::PodInformation);
        assert!(result.is_err());
    }

    #[test]
    fn missing_optional_key_is_none() {
        let context = Map::new();
        let result: Option<PodInformation> = get(&context, ContextKey::PodInformation).unwrap();
        assert!(result.is_none());
    }
}
