//! Reference interpreter for woven modules.
//!
//! Stands in for the host runtime so woven output can be executed: module methods are
//! interpreted, the runtime surface woven code calls (method context, interceptor hooks,
//! async builders, promises, awaiters, lists) is provided by intrinsics, and the host
//! registers natives and interceptor factories by type name. Awaiting always suspends and
//! queues the state machine; [`Vm::run_scheduled`] resumes queued machines.
//!
//! Unsupported: finally/fault regions, value-type copy semantics, overload resolution
//! beyond name and arity.

pub mod context;
pub mod error;
mod intrinsics;
pub mod value;
pub mod vm;

pub use context::{Interceptor, MethodContext};
pub use error::VmError;
pub use value::{ExceptionData, TaskState, Value};
pub use vm::{NativeResult, Outcome, Stats, Vm};
