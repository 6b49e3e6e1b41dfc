use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Shared shape of the three processor registrations (spec.md §3 "Processor
/// registration"): each processor advertises an HTTP endpoint the dispatcher
/// will POST a Diagnosis to, optionally scoped to a subtype path segment.
/// `ip`/`port` default to the node-local agent when the processor is
/// colocated; `externalIp`/`externalPort` override them for a processor that
/// lives off-node.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorSpec {
    pub scheme: Scheme,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub external_ip: Option<String>,
    #[serde(default)]
    pub external_port: Option<u16>,
    #[serde(default)]
    pub path: String,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

impl ProcessorSpec {
    /// Resolves scheme://host:port/path[/subtype] per the dispatcher's
    /// endpoint-resolution rule (spec.md §4.3 step 1): `externalIp`/
    /// `externalPort` win when set (the processor lives off-node); otherwise
    /// fall back to `ip`/`port`, and finally to the node-local bind address
    /// passed in by the caller for a colocated processor.
    pub fn endpoint(&self, subtype: Option<&str>, node_bind_address: &str, node_bind_port: u16) -> String {
        let host = self
            .external_ip
            .clone()
            .or_else(|| self.ip.clone())
            .unwrap_or_else(|| node_bind_address.to_string());
        let port = self.external_port.or(self.port).unwrap_or(node_bind_port);

        let mut url = format!("{}://{}:{}/{}", self.scheme, host, port, self.path.trim_start_matches('/'));
        if let Some(subtype) = subtype {
            if !subtype.is_empty() {
                url = format!("{}/{}", url.trim_end_matches('/'), subtype);
            }
        }
        url
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubediag.io",
    version = "v1alpha1",
    kind = "InformationCollector",
    plural = "informationcollectors",
    shortname = "ic",
    namespaced,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".spec.ip"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.port"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InformationCollectorSpec {
    #[serde(flatten)]
    pub processor: ProcessorSpec,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubediag.io",
    version = "v1alpha1",
    kind = "Diagnoser",
    plural = "diagnosers",
    shortname = "diagn",
    namespaced,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".spec.ip"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.port"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoserSpec {
    #[serde(flatten)]
    pub processor: ProcessorSpec,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubediag.io",
    version = "v1alpha1",
    kind = "Recoverer",
    plural = "recoverers",
    shortname = "rec",
    namespaced,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".spec.ip"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.port"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RecovererSpec {
    #[serde(flatten)]
    pub processor: ProcessorSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_prefers_external_override_over_ip() {
        let spec = ProcessorSpec {
            scheme: Scheme::Http,
            ip: Some("10.0.0.5".to_string()),
            port: Some(8080),
            external_ip: Some("collector.kube-diag.svc".to_string()),
            external_port: Some(9443),
            path: "informationcollector".to_string(),
            timeout_seconds: 30,
        };
        assert_eq!(
            spec.endpoint(None, "127.0.0.1", 8090),
            "http://collector.kube-diag.svc:9443/informationcollector"
        );
    }

    #[test]
    fn endpoint_falls_back_to_node_bind_address_when_unset() {
        let spec = ProcessorSpec {
            scheme: Scheme::Https,
            ip: None,
            port: None,
            external_ip: None,
            external_port: None,
            path: "diagnoser".to_string(),
            timeout_seconds: 30,
        };
        assert_eq!(
            spec.endpoint(Some("podDiskUsageDiagnosis"), "10.1.2.3", 8090),
            "https://10.1.2.3:8090/diagnoser/podDiskUsageDiagnosis"
        );
    }

    #[test]
    fn endpoint_uses_registered_ip_and_port_over_node_default() {
        let spec = ProcessorSpec {
            scheme: Scheme::Http,
            ip: Some("10.0.0.5".to_string()),
            port: Some(9090),
            external_ip: None,
            external_port: None,
            path: "diagnoser".to_string(),
            timeout_seconds: 30,
        };
        assert_eq!(spec.endpoint(None, "127.0.0.1", 8090), "http://10.0.0.5:9090/diagnoser");
    }
}
