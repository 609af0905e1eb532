pub mod phase;
pub mod supervisor;
pub mod tracker;

pub use phase::TaskPhase;
pub use supervisor::SessionSupervisor;
pub use tracker::{Activation, ClearReason, DisplayDecision, Evaluation, SessionActivationTracker};
