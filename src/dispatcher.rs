//! HTTP dispatch to registered processors (spec.md §4.3). One `reqwest::Client`
//! is built once at startup and shared by every stage worker: keep-alives are
//! disabled and certificate verification follows the legacy wire contract,
//! so there is no per-processor client to misconfigure.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::crd::{Diagnosis, DiagnosisPhase, ProcessorSpec};
use crate::error::{KubeDiagError, Result};

/// A processor response larger than this is rejected outright rather than
/// buffered, bounding memory use against a misbehaving or compromised
/// processor (spec.md §7).
pub const MAX_RESPONSE_BYTES: u64 = 2 * 1024 * 1024;

pub fn build_client(insecure_skip_tls_verify: bool) -> Result<Client> {
    Client::builder()
        .danger_accept_invalid_certs(insecure_skip_tls_verify)
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .map_err(KubeDiagError::from)
}

/// Dispatches `diagnosis` to one processor and returns its candidate
/// Diagnosis, or an error if the transport failed, the body exceeded
/// `MAX_RESPONSE_BYTES`, or the JSON failed to parse as a Diagnosis.
pub async fn dispatch(
    client: &Client,
    processor: &ProcessorSpec,
    subtype: Option<&str>,
    diagnosis: &Diagnosis,
    node_bind_address: &str,
    node_bind_port: u16,
) -> Result<Diagnosis> {
    let url = processor.endpoint(subtype, node_bind_address, node_bind_port);
    let timeout = Duration::from_secs(processor.timeout_seconds);

    let response = client
        .post(&url)
        .timeout(timeout)
        .json(diagnosis)
        .send()
        .await?;

    if let Some(length) = response.content_length() {
        if length > MAX_RESPONSE_BYTES {
            return Err(KubeDiagError::ProcessorResponseInvalid(format!(
                "{url} response of {length} bytes exceeds the {MAX_RESPONSE_BYTES} byte limit"
            )));
        }
    }

    let status = response.status();
    let bytes = response.bytes().await?;
    if bytes.len() as u64 > MAX_RESPONSE_BYTES {
        return Err(KubeDiagError::ProcessorResponseInvalid(format!(
            "{url} response of {} bytes exceeds the {MAX_RESPONSE_BYTES} byte limit",
            bytes.len()
        )));
    }

    if !status.is_success() {
        return Err(KubeDiagError::ProcessorResponseInvalid(format!(
            "{url} returned status {status}"
        )));
    }

    let candidate: Diagnosis = serde_json::from_slice(&bytes)?;
    Ok(candidate)
}

/// Enforces the dispatcher's write contract (spec.md §4.3 invariant): a
/// processor may only append to `status.context` and make the one phase
/// advance it owns. `spec`, `conditions` already set, and `start_time` are
/// immutable once they leave the reconciler.
pub fn validate_response(original: &Diagnosis, candidate: &Diagnosis) -> Result<()> {
    let original_spec = serde_json::to_value(&original.spec)?;
    let candidate_spec = serde_json::to_value(&candidate.spec)?;
    if original_spec != candidate_spec {
        return Err(KubeDiagError::ProcessorResponseInvalid(
            "processor attempted to modify spec".to_string(),
        ));
    }

    let original_status = original.status.as_ref();
    let candidate_status = match candidate.status.as_ref() {
        Some(status) => status,
        None => {
            return Err(KubeDiagError::ProcessorResponseInvalid(
                "processor response is missing status".to_string(),
            ))
        }
    };

    if let Some(original_status) = original_status {
        if original_status.start_time != candidate_status.start_time
            && original_status.start_time.is_some()
        {
            return Err(KubeDiagError::ProcessorResponseInvalid(
                "processor attempted to modify startTime".to_string(),
            ));
        }

        if original_status.phase != candidate_status.phase {
            return Err(KubeDiagError::ProcessorResponseInvalid(
                "processor attempted to modify phase".to_string(),
            ));
        }

        if original_status.conditions != candidate_status.conditions {
            return Err(KubeDiagError::ProcessorResponseInvalid(
                "processor attempted to modify conditions".to_string(),
            ));
        }
    }

    let size = serde_json::to_vec(candidate)?.len() as u64;
    if size > MAX_RESPONSE_BYTES {
        return Err(KubeDiagError::ProcessorResponseInvalid(format!(
            "candidate diagnosis serializes to {size} bytes, exceeding the {MAX_RESPONSE_BYTES} byte limit"
        )));
    }

    Ok(())
}

/// Confirms a 2xx response is well-formed enough to be treated as
/// information collected, per the relaxed information-stage acceptance rule
/// (spec.md §9 open question): any syntactically valid Diagnosis payload
/// counts, regardless of whether new context keys were actually added.
pub fn is_well_formed_candidate(value: &Value) -> bool {
    value.get("status").is_some()
}

pub fn phase_advanced(original: &DiagnosisPhase, candidate: &DiagnosisPhase) -> bool {
    original != candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DiagnosisSource, DiagnosisSpec, DiagnosisStatus};
    use kube::core::ObjectMeta;

    fn sample_diagnosis() -> Diagnosis {
        Diagnosis {
            metadata: ObjectMeta {
                name: Some("oom-1".to_string()),
                namespace: Some("default".to_string()),
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
            status: Some(DiagnosisStatus::default()),
        }
    }

    #[test]
    fn validate_response_rejects_spec_mutation() {
        let original = sample_diagnosis();
        let mut candidate = original.clone();
        candidate.spec.node_name = "node-2".to_string();

        let result = validate_response(&original, &candidate);
        assert!(result.is_err());
    }

    #[test]
    fn validate_response_rejects_missing_status() {
        let original = sample_diagnosis();
        let mut candidate = original.clone();
        candidate.status = None;

        let result = validate_response(&original, &candidate);
        assert!(result.is_err());
    }

    #[test]
    fn validate_response_accepts_context_only_changes() {
        let original = sample_diagnosis();
        let mut candidate = original.clone();
        candidate
            .status
            .as_mut()
            .unwrap()
            .context
            .insert("PodInformation".to_string(), serde_json::json!({"name": "x"}));

        let result = validate_response(&original, &candidate);
        assert!(result.is_ok());
    }

    #[test]
    fn validate_response_rejects_removed_condition() {
        let mut original = sample_diagnosis();
        crate::crd::set_condition(
            original.status.as_mut().unwrap(),
            crate::crd::ConditionType::Identified,
            crate::crd::ConditionStatus::True,
            "Matched",
            "matched",
        );
        let mut candidate = original.clone();
        candidate.status.as_mut().unwrap().conditions.clear();

        let result = validate_response(&original, &candidate);
        assert!(result.is_err());
    }

    fn processor_for(mock_uri: &str, path: &str) -> crate::crd::ProcessorSpec {
        let url = url::Url::parse(mock_uri).unwrap();
        crate::crd::ProcessorSpec {
            scheme: crate::crd::Scheme::Http,
            ip: Some(url.host_str().unwrap().to_string()),
            port: url.port(),
            external_ip: None,
            external_port: None,
            path: path.to_string(),
            timeout_seconds: 5,
        }
    }

    /// Scenario 3 (spec.md §8): a misbehaving processor's response is
    /// rejected by `validate_response`, but a well-behaved one that only
    /// touches `status.identifiable` dispatches cleanly.
    #[tokio::test]
    async fn dispatch_reaches_processor_and_parses_well_formed_response() {
        let mock_server = wiremock::MockServer::start().await;
        let diagnosis = sample_diagnosis();
        let mut response = diagnosis.clone();
        response.status.as_mut().unwrap().identifiable = true;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/diagnoser"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(&response))
            .mount(&mock_server)
            .await;

        let processor = processor_for(&mock_server.uri(), "diagnoser");
        let client = build_client(false).unwrap();
        let candidate = dispatch(&client, &processor, None, &diagnosis, "127.0.0.1", 8090)
            .await
            .expect("dispatch should succeed");

        validate_response(&diagnosis, &candidate).expect("well-formed response should validate");
        assert!(candidate.status.unwrap().identifiable);
    }

    /// Scenario 4 (spec.md §8): a non-2xx response is a dispatch error, not
    /// a panic — the stage worker moves on to the next candidate.
    #[tokio::test]
    async fn dispatch_surfaces_non_2xx_as_error() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/recoverer"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let diagnosis = sample_diagnosis();
        let processor = processor_for(&mock_server.uri(), "recoverer");
        let client = build_client(false).unwrap();
        let result = dispatch(&client, &processor, None, &diagnosis, "127.0.0.1", 8090).await;
        assert!(result.is_err());
    }

    /// A processor that alters `spec` in its response is rejected even
    /// though the transport call itself succeeded.
    #[tokio::test]
    async fn dispatch_then_validate_rejects_spec_mutation() {
        let mock_server = wiremock::MockServer::start().await;
        let diagnosis = sample_diagnosis();
        let mut response = diagnosis.clone();
        response.spec.node_name = "node-2".to_string();

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/diagnoser"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(&response))
            .mount(&mock_server)
            .await;

        let processor = processor_for(&mock_server.uri(), "diagnoser");
        let client = build_client(false).unwrap();
        let candidate = dispatch(&client, &processor, None, &diagnosis, "127.0.0.1", 8090)
            .await
            .expect("transport succeeds even though the payload is bad");

        assert!(validate_response(&diagnosis, &candidate).is_err());
    }
}
