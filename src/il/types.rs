//! Type signatures as they appear in member references and local slots.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A type as seen by the instruction stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeSig {
    Void,
    Bool,
    Int32,
    Int64,
    String,
    Object,
    /// Reference type by full name.
    Class { name: String },
    /// Value type by full name.
    ValueType { name: String },
    GenericParam { name: String },
    Nullable { inner: Box<TypeSig> },
    Array { elem: Box<TypeSig> },
    ByRef { inner: Box<TypeSig> },
    GenericInst { base: Box<TypeSig>, args: Vec<TypeSig> },
}

impl TypeSig {
    pub fn class(name: impl Into<String>) -> Self {
        TypeSig::Class { name: name.into() }
    }

    pub fn value_type(name: impl Into<String>) -> Self {
        TypeSig::ValueType { name: name.into() }
    }

    pub fn generic_param(name: impl Into<String>) -> Self {
        TypeSig::GenericParam { name: name.into() }
    }

    pub fn array_of(elem: TypeSig) -> Self {
        TypeSig::Array { elem: Box::new(elem) }
    }

    pub fn by_ref(inner: TypeSig) -> Self {
        TypeSig::ByRef { inner: Box::new(inner) }
    }

    pub fn nullable(inner: TypeSig) -> Self {
        TypeSig::Nullable { inner: Box::new(inner) }
    }

    pub fn generic(base: TypeSig, args: Vec<TypeSig>) -> Self {
        TypeSig::GenericInst { base: Box::new(base), args }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeSig::Void)
    }

    pub fn is_by_ref(&self) -> bool {
        matches!(self, TypeSig::ByRef { .. })
    }

    pub fn is_object(&self) -> bool {
        matches!(self, TypeSig::Object)
    }

    pub fn is_generic_param(&self) -> bool {
        matches!(self, TypeSig::GenericParam { .. })
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, TypeSig::Nullable { .. })
    }

    /// Strip one level of by-ref.
    pub fn element(&self) -> &TypeSig {
        match self {
            TypeSig::ByRef { inner } => inner,
            other => other,
        }
    }

    pub fn is_value_type(&self) -> bool {
        match self {
            TypeSig::Bool | TypeSig::Int32 | TypeSig::Int64 => true,
            TypeSig::ValueType { .. } | TypeSig::Nullable { .. } => true,
            TypeSig::GenericInst { base, .. } => base.is_value_type(),
            _ => false,
        }
    }

    /// Whether a value of this type must be boxed before it can be stored in an object slot.
    pub fn needs_box(&self) -> bool {
        self.is_value_type() || self.is_generic_param()
    }

    /// Whether `null` is a legal value for a slot of this type, or can stand for its default.
    pub fn accepts_null(&self) -> bool {
        !self.is_value_type() || self.is_nullable()
    }

    /// Whether a default must be produced with `initobj` rather than `ldnull`.
    pub fn default_needs_initobj(&self) -> bool {
        self.is_generic_param() || self.is_value_type()
    }

    /// Fully qualified name, without generic arguments.
    pub fn full_name(&self) -> String {
        match self {
            TypeSig::Void => "System.Void".to_string(),
            TypeSig::Bool => "System.Boolean".to_string(),
            TypeSig::Int32 => "System.Int32".to_string(),
            TypeSig::Int64 => "System.Int64".to_string(),
            TypeSig::String => "System.String".to_string(),
            TypeSig::Object => "System.Object".to_string(),
            TypeSig::Class { name } | TypeSig::ValueType { name } | TypeSig::GenericParam { name } => name.clone(),
            TypeSig::Nullable { .. } => "System.Nullable`1".to_string(),
            TypeSig::Array { elem } => format!("{}[]", elem.full_name()),
            TypeSig::ByRef { inner } => format!("{}&", inner.full_name()),
            TypeSig::GenericInst { base, .. } => base.full_name(),
        }
    }

    pub fn generic_arg(&self, index: usize) -> Option<&TypeSig> {
        match self {
            TypeSig::GenericInst { args, .. } => args.get(index),
            TypeSig::Nullable { inner } if index == 0 => Some(inner),
            _ => None,
        }
    }

    /// Whether the type's full name starts with any of the given prefixes.
    pub fn name_starts_with(&self, prefixes: &[&str]) -> bool {
        let name = self.full_name();
        prefixes.iter().any(|p| name.starts_with(p))
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Void => write!(f, "void"),
            TypeSig::Bool => write!(f, "bool"),
            TypeSig::Int32 => write!(f, "int32"),
            TypeSig::Int64 => write!(f, "int64"),
            TypeSig::String => write!(f, "string"),
            TypeSig::Object => write!(f, "object"),
            TypeSig::Class { name } => write!(f, "class {}", name),
            TypeSig::ValueType { name } => write!(f, "valuetype {}", name),
            TypeSig::GenericParam { name } => write!(f, "!{}", name),
            TypeSig::Nullable { inner } => write!(f, "{}?", inner),
            TypeSig::Array { elem } => write!(f, "{}[]", elem),
            TypeSig::ByRef { inner } => write!(f, "{}&", inner),
            TypeSig::GenericInst { base, args } => {
                write!(f, "{}<", base)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ">")
            }
        }
    }
}
