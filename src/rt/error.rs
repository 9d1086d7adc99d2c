use super::value::Value;
use thiserror::Error;

/// Interpreter faults. Exceptions raised by the interpreted code are values, not faults.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("evaluation stack underflow")]
    StackUnderflow,

    #[error("{method}: {message}")]
    Malformed { method: String, message: String },

    #[error("no implementation for {member}")]
    UnknownMember { member: String },

    #[error("unsupported: {what}")]
    Unsupported { what: String },

    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("{what} completed twice")]
    AlreadyCompleted { what: String },

    #[error("task still pending after all scheduled work ran")]
    Pending,

    #[error("step limit of {0} instructions exceeded")]
    StepLimit(u64),

    #[error("call depth limit of {0} exceeded")]
    DepthLimit(usize),

    #[error("unhandled {type_name}: {message}")]
    Unhandled { type_name: String, message: String },
}

impl VmError {
    pub fn malformed(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed { method: method.into(), message: message.into() }
    }

    pub fn unknown_member(member: impl Into<String>) -> Self {
        Self::UnknownMember { member: member.into() }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported { what: what.into() }
    }

    pub fn type_mismatch(expected: impl Into<String>, found: &Value) -> Self {
        Self::TypeMismatch { expected: expected.into(), found: found.type_name() }
    }

    pub fn unhandled(exception: &Value) -> Self {
        match exception.exception_data() {
            Some(data) => Self::Unhandled { type_name: data.type_name.clone(), message: data.message.clone() },
            None => Self::Unhandled { type_name: exception.type_name(), message: String::new() },
        }
    }
}
