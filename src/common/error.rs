use thiserror::Error;

/// Result type for weaving operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the weaving engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Malformed method body: {message}")]
    Body { message: String },

    #[error("[{method}] unable to find {anchor}")]
    MissingAnchor { method: String, anchor: String },

    #[error("[{method}] unexpected instruction at IL_{offset:04x}: {message}")]
    UnexpectedShape {
        method: String,
        offset: u32,
        message: String,
    },

    #[error("Unresolved type: {type_name}")]
    UnresolvedType { type_name: String },

    #[error("Unresolved member {member} on {type_name}")]
    UnresolvedMember { type_name: String, member: String },

    #[error("{type_name} has no constructor taking {arity} argument(s)")]
    MissingConstructor { type_name: String, arity: usize },

    #[error("[{method}] {message}")]
    Weave { method: String, message: String },
}

impl Error {
    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a malformed-body error
    pub fn body_error(message: impl Into<String>) -> Self {
        Self::Body { message: message.into() }
    }

    /// Create a missing-anchor error for a method
    pub fn missing_anchor(method: impl Into<String>, anchor: impl Into<String>) -> Self {
        Self::MissingAnchor {
            method: method.into(),
            anchor: anchor.into(),
        }
    }

    pub fn unexpected_shape(method: impl Into<String>, offset: u32, message: impl Into<String>) -> Self {
        Self::UnexpectedShape {
            method: method.into(),
            offset,
            message: message.into(),
        }
    }

    pub fn unresolved_type(type_name: impl Into<String>) -> Self {
        Self::UnresolvedType { type_name: type_name.into() }
    }

    pub fn unresolved_member(type_name: impl Into<String>, member: impl Into<String>) -> Self {
        Self::UnresolvedMember {
            type_name: type_name.into(),
            member: member.into(),
        }
    }

    /// Create a weaving error scoped to a method
    pub fn weave_error(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Weave {
            method: method.into(),
            message: message.into(),
        }
    }
}
