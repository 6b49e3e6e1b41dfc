//! Metrics registry (spec.md §4.5/§6.2). Built once at startup and passed by
//! reference into whichever components need to record against it, rather
//! than living behind a process-wide singleton.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    pub stage: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeLabels {
    pub node: String,
}

pub struct Metrics {
    pub registry: Registry,
    pub stage_transitions: Family<StageLabels, Counter>,
    pub diagnoses_per_node: Family<NodeLabels, Gauge>,
    pub reaped_total: Counter,
    pub dispatch_errors: Family<StageLabels, Counter>,
    /// Completed reaper passes, split by whether the pass ran to
    /// completion without error (spec.md §4.5: "counters of success/error
    /// cycles").
    pub reaper_cycles: Family<CycleLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CycleLabels {
    pub outcome: String,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("kubediag");

        let stage_transitions = Family::<StageLabels, Counter>::default();
        registry.register(
            "stage_transitions",
            "Diagnosis phase transitions by stage and outcome",
            stage_transitions.clone(),
        );

        let diagnoses_per_node = Family::<NodeLabels, Gauge>::default();
        registry.register(
            "diagnoses_per_node",
            "Number of live Diagnosis objects currently assigned to a node",
            diagnoses_per_node.clone(),
        );

        let reaped_total = Counter::default();
        registry.register(
            "reaped_total",
            "Total Diagnosis objects deleted by the reaper",
            reaped_total.clone(),
        );

        let dispatch_errors = Family::<StageLabels, Counter>::default();
        registry.register(
            "dispatch_errors",
            "Processor dispatch failures by stage and outcome",
            dispatch_errors.clone(),
        );

        let reaper_cycles = Family::<CycleLabels, Counter>::default();
        registry.register(
            "reaper_cycles",
            "Completed reaper sweep passes by outcome",
            reaper_cycles.clone(),
        );

        Self {
            registry,
            stage_transitions,
            diagnoses_per_node,
            reaped_total,
            dispatch_errors,
            reaper_cycles,
        }
    }

    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_prometheus_text() {
        let metrics = Metrics::new();
        metrics
            .stage_transitions
            .get_or_create(&StageLabels {
                stage: "information".to_string(),
                outcome: "succeeded".to_string(),
            })
            .inc();

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("kubediag_stage_transitions"));
    }
}
