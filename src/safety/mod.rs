//! Production safety layer
//!
//! Guard validations run before any read or write crosses an environment
//! boundary.

mod guard;

pub use guard::{Classification, OperationKind, ProductionSafetyGuard, ProductionSignal, SecurityAlert};
