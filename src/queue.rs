//! Bounded stage queues (spec.md §2/§5): the reconciler enqueues a
//! Diagnosis's namespaced name onto the queue matching its current phase;
//! stage workers dequeue, re-fetch the live object, and process it. A full
//! queue means backpressure, not data loss — the reconciler simply requeues
//! via the controller's own retry mechanism rather than blocking forever.

use tokio::sync::mpsc;

use crate::error::{KubeDiagError, Result};

pub const QUEUE_CAPACITY: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DiagnosisRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for DiagnosisRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub struct StageQueues {
    pub information_sender: mpsc::Sender<DiagnosisRef>,
    pub information_receiver: mpsc::Receiver<DiagnosisRef>,
    pub diagnosis_sender: mpsc::Sender<DiagnosisRef>,
    pub diagnosis_receiver: mpsc::Receiver<DiagnosisRef>,
    pub recovery_sender: mpsc::Sender<DiagnosisRef>,
    pub recovery_receiver: mpsc::Receiver<DiagnosisRef>,
}

impl StageQueues {
    pub fn new() -> Self {
        let (information_sender, information_receiver) = mpsc::channel(QUEUE_CAPACITY);
        let (diagnosis_sender, diagnosis_receiver) = mpsc::channel(QUEUE_CAPACITY);
        let (recovery_sender, recovery_receiver) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            information_sender,
            information_receiver,
            diagnosis_sender,
            diagnosis_receiver,
            recovery_sender,
            recovery_receiver,
        }
    }

    /// Handles to give to the reconciler for enqueuing; the receivers stay
    /// with `StageQueues` for the stage workers to drain.
    pub fn senders(&self) -> StageSenders {
        StageSenders {
            information: self.information_sender.clone(),
            diagnosis: self.diagnosis_sender.clone(),
            recovery: self.recovery_sender.clone(),
        }
    }
}

impl Default for StageQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct StageSenders {
    pub information: mpsc::Sender<DiagnosisRef>,
    pub diagnosis: mpsc::Sender<DiagnosisRef>,
    pub recovery: mpsc::Sender<DiagnosisRef>,
}

impl StageSenders {
    /// Non-blocking enqueue; a full queue surfaces as an error so the caller
    /// can requeue the reconcile and retry rather than stall the watch loop.
    pub fn try_enqueue(&self, stage: Stage, diagnosis: DiagnosisRef) -> Result<()> {
        let sender = match stage {
            Stage::Information => &self.information,
            Stage::Diagnosis => &self.diagnosis,
            Stage::Recovery => &self.recovery,
        };

        sender.try_send(diagnosis).map_err(|err| match err {
            mpsc::error::TrySendError::Full(diag) => {
                KubeDiagError::Internal(format!("{stage:?} queue full, dropping enqueue of {diag}"))
            }
            mpsc::error::TrySendError::Closed(diag) => {
                KubeDiagError::Internal(format!("{stage:?} queue closed, dropping enqueue of {diag}"))
            }
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Stage {
    Information,
    Diagnosis,
    Recovery,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_and_dequeue_round_trips() {
        let mut queues = StageQueues::new();
        let senders = queues.senders();

        let diag = DiagnosisRef {
            namespace: "default".to_string(),
            name: "oom-1".to_string(),
        };
        senders.try_enqueue(Stage::Information, diag.clone()).unwrap();

        let received = queues.information_receiver.recv().await.unwrap();
        assert_eq!(received, diag);
    }

    #[tokio::test]
    async fn full_queue_surfaces_as_error_not_block() {
        let (sender, _receiver) = mpsc::channel(1);
        let senders = StageSenders {
            information: sender.clone(),
            diagnosis: sender.clone(),
            recovery: sender,
        };

        let diag = DiagnosisRef {
            namespace: "default".to_string(),
            name: "a".to_string(),
        };
        senders.try_enqueue(Stage::Information, diag.clone()).unwrap();
        let result = senders.try_enqueue(Stage::Information, diag);
        assert!(result.is_err());
    }
}
