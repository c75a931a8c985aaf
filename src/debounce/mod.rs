//! Debounced value stores.
//!
//! ```text
//!   producer threads ──push──▶ [channel] ──▶ DebouncedStore ──settled──▶ observers
//!                                              ▲       │
//!                                         poll tick    └──▶ SettledReader (any thread)
//! ```

pub mod debouncer;
pub mod handle;
pub mod store;

pub use debouncer::{Debouncer, PushOutcome, SettledValue};
pub use handle::{HandleOptions, StoreHandle, StorePusher};
pub use store::{DebouncedStore, SettledReader, SettledSource};
