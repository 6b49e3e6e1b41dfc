use std::collections::HashMap;
use std::net::SocketAddr;

use clap::Parser;

use crate::error::{KubeDiagError, Result};

/// KubeDiag node agent / master control plane.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct AppConfig {
    /// Run as the cluster-wide master (cluster-health evaluator) or as a
    /// per-node agent (stage pipeline + reaper).
    #[arg(long, env = "KUBEDIAG_MODE", default_value = "agent")]
    pub mode: Mode,

    /// Address the agent's HTTP surface binds to.
    #[arg(long, env = "KUBEDIAG_ADDRESS", default_value = "0.0.0.0:8090")]
    pub address: SocketAddr,

    /// This agent's node identifier; required in agent mode.
    #[arg(long, env = "KUBEDIAG_NODE_NAME", default_value = "")]
    pub node_name: String,

    /// Address the Prometheus metrics exporter binds to.
    #[arg(
        long,
        env = "KUBEDIAG_METRICS_ADDRESS",
        default_value = "0.0.0.0:10357"
    )]
    pub metrics_address: SocketAddr,

    /// Enable leader election (master mode only).
    #[arg(long, env = "KUBEDIAG_ENABLE_LEADER_ELECTION")]
    pub enable_leader_election: bool,

    /// Maximum age of a diagnosis before it is unconditionally reaped.
    #[arg(long, env = "KUBEDIAG_ABNORMAL_TTL_SECONDS", default_value = "864000")]
    pub abnormal_ttl_seconds: u64,

    /// Minimum age before a finished (Succeeded/Failed) diagnosis is eligible for reaping.
    #[arg(
        long,
        env = "KUBEDIAG_MINIMUM_ABNORMAL_TTL_SECONDS",
        default_value = "1800"
    )]
    pub minimum_abnormal_ttl_seconds: u64,

    /// Hard cap on retained diagnoses per node.
    #[arg(long, env = "KUBEDIAG_MAXIMUM_ABNORMALS_PER_NODE", default_value = "20")]
    pub maximum_abnormals_per_node: usize,

    /// Root directory for profiler/task artifacts reaped alongside diagnoses.
    #[arg(long, env = "KUBEDIAG_DATA_ROOT", default_value = "/var/lib/kubediag")]
    pub data_root: String,

    /// Comma-separated key=bool pairs enabling/disabling individual
    /// processors and subsystems, e.g. "PodCollector=true,SignalRecoverer=false".
    #[arg(long, env = "KUBEDIAG_FEATURE_GATES", value_parser = parse_feature_gates, default_value = "")]
    pub feature_gates: FeatureGates,

    /// Skip TLS certificate verification when dispatching to processors
    /// (the legacy wire contract). Set false to opt into real verification.
    #[arg(long, env = "KUBEDIAG_INSECURE_SKIP_TLS_VERIFY", default_value = "true")]
    pub insecure_skip_tls_verify: bool,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, env = "KUBEDIAG_LOG_JSON")]
    pub log_json: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Master,
    Agent,
}

#[derive(Clone, Debug, Default)]
pub struct FeatureGates(HashMap<String, bool>);

impl FeatureGates {
    /// Gates default to enabled when absent from the flag.
    pub fn enabled(&self, name: &str) -> bool {
        self.0.get(name).copied().unwrap_or(true)
    }
}

fn parse_feature_gates(raw: &str) -> std::result::Result<FeatureGates, String> {
    let mut gates = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid feature gate entry: {pair}"))?;
        let value: bool = value
            .parse()
            .map_err(|_| format!("invalid feature gate value for {key}: {value}"))?;
        gates.insert(key.to_string(), value);
    }
    Ok(FeatureGates(gates))
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config = Self::parse();
        if config.mode == Mode::Agent && config.node_name.is_empty() {
            return Err(KubeDiagError::ConfigError(
                "--node-name is required in agent mode".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn abnormal_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.abnormal_ttl_seconds as i64)
    }

    pub fn minimum_abnormal_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.minimum_abnormal_ttl_seconds as i64)
    }

    pub fn reaper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs((self.abnormal_ttl_seconds / 4).max(1))
    }
}
