pub mod reconciler;
pub mod stages;

pub use reconciler::{reconcile, run_controller, ReconcilerContext};
