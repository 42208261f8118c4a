mod synchronizer;

pub use synchronizer::{AppPhase, LifecycleSynchronizer, ReconcileOptions};
