//! Sample conversion and delay estimation

pub mod convert;
pub mod reconcile;
pub mod smoother;

pub use convert::{PacketData, SampleConverter};
pub use reconcile::{DelaySource, PauseState, Reconciliation, ReconcilerSettings, TimestampReconciler};
pub use smoother::DelaySmoother;
