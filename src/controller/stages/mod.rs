pub mod diagnosis;
pub mod information;
pub mod recovery;
pub mod source;
pub mod traits;

pub use diagnosis::DiagnosisStage;
pub use information::InformationStage;
pub use recovery::RecoveryStage;
pub use traits::{StageContext, StageWorker};
