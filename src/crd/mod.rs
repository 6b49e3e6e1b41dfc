pub mod diagnosis;
pub mod processor;

pub use diagnosis::{
    has_condition, set_condition, CommandExecutorSpec, CommandExecutorStatus, ConditionStatus,
    ConditionType, Diagnosis, DiagnosisCondition, DiagnosisPhase, DiagnosisSource, DiagnosisSpec,
    DiagnosisStatus, PodReference, ProcessorRef, ProfilerKind, ProfilerSpec, ProfilerStatus,
};
pub use processor::{
    Diagnoser, DiagnoserSpec, InformationCollector, InformationCollectorSpec, ProcessorSpec,
    Recoverer, RecovererSpec, Scheme,
};
