//! The pipeline's entry point (spec.md §4.2 "Source stage"): does no HTTP,
//! only stamps `startTime` once and transitions a freshly created diagnosis
//! straight to `InformationCollecting`. This is the sole place `startTime`
//! is ever written (spec.md §3 invariant 3). Whether the information stage
//! then finds its assigned set empty and cascades straight on to diagnosis
//! is the information stage's concern, not this one's.

use crate::crd::{DiagnosisPhase, DiagnosisStatus};

/// Admits a freshly observed (Pending) diagnosis: stamps `startTime` if
/// absent and advances the phase to `InformationCollecting`. Safe to call
/// more than once on the same status; only the first call has any effect
/// on `startTime`.
pub fn admit(status: &mut DiagnosisStatus) {
    if status.start_time.is_none() {
        status.start_time = Some(chrono::Utc::now());
    }
    status.phase = DiagnosisPhase::InformationCollecting;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_stamps_start_time_and_advances_phase() {
        let mut status = DiagnosisStatus::default();
        admit(&mut status);
        assert!(status.start_time.is_some());
        assert_eq!(status.phase, DiagnosisPhase::InformationCollecting);
    }

    #[test]
    fn admit_is_idempotent_on_start_time() {
        let mut status = DiagnosisStatus::default();
        admit(&mut status);
        let first = status.start_time;

        admit(&mut status);
        assert_eq!(status.start_time, first);
    }
}
