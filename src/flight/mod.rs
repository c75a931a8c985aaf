//! Single-flight async stages.
//!
//! A stage gates an expensive [`Operation`] so that at most one call is
//! outstanding, coalescing requests that arrive in the meantime.

pub mod keyed;
pub mod operation;
pub mod stage;

pub use keyed::{KeyedResult, KeyedSingleFlight};
pub use operation::{CallLog, Failure, FnOperation, Gate, MockOperation, Operation, operation_fn};
pub use stage::{
    Admission, FlightOptions, FlightPhase, OverlapPolicy, SingleFlight, StageError, StageResult,
};
