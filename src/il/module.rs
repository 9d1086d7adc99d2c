//! Module model: types, fields, methods and the member references instructions carry.

use super::body::MethodBody;
use super::types::TypeSig;
use crate::common::consts::CTOR;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a method, as carried by call-like instructions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub declaring: TypeSig,
    pub name: String,
    #[serde(default)]
    pub params: Vec<TypeSig>,
    #[serde(default = "void")]
    pub return_type: TypeSig,
    #[serde(default)]
    pub has_this: bool,
}

impl MethodRef {
    pub fn instance(declaring: TypeSig, name: impl Into<String>, params: Vec<TypeSig>, return_type: TypeSig) -> Self {
        Self { declaring, name: name.into(), params, return_type, has_this: true }
    }

    pub fn static_method(declaring: TypeSig, name: impl Into<String>, params: Vec<TypeSig>, return_type: TypeSig) -> Self {
        Self { declaring, name: name.into(), params, return_type, has_this: false }
    }

    pub fn ctor(declaring: TypeSig, params: Vec<TypeSig>) -> Self {
        Self::instance(declaring, CTOR, params, TypeSig::Void)
    }

    pub fn is_ctor(&self) -> bool {
        self.name == CTOR
    }

    /// `Namespace.Type::Name`
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.declaring.full_name(), self.name)
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.return_type, self.full_name())?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub declaring: TypeSig,
    pub name: String,
    pub field_type: TypeSig,
}

impl FieldRef {
    pub fn new(declaring: TypeSig, name: impl Into<String>, field_type: TypeSig) -> Self {
        Self { declaring, name: name.into(), field_type }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}::{}", self.field_type, self.declaring.full_name(), self.name)
    }
}

/// Fixed argument of a custom attribute or interceptor constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrArg {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    /// A type, by full name.
    Type(String),
}

impl AttrArg {
    pub fn sig(&self) -> TypeSig {
        match self {
            AttrArg::Null => TypeSig::Object,
            AttrArg::Bool(_) => TypeSig::Bool,
            AttrArg::Int32(_) => TypeSig::Int32,
            AttrArg::Int64(_) => TypeSig::Int64,
            AttrArg::String(_) => TypeSig::String,
            AttrArg::Type(_) => TypeSig::class(crate::common::consts::TYPE_SYSTEM_TYPE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomAttribute {
    pub type_name: String,
    #[serde(default)]
    pub args: Vec<AttrArg>,
}

impl CustomAttribute {
    pub fn new(type_name: impl Into<String>, args: Vec<AttrArg>) -> Self {
        Self { type_name: type_name.into(), args }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeSig,
}

impl ParamDef {
    pub fn new(name: impl Into<String>, ty: TypeSig) -> Self {
        Self { name: name.into(), ty }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeSig,
    #[serde(default)]
    pub is_static: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: TypeSig) -> Self {
        Self { name: name.into(), ty, is_static: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub params: Vec<ParamDef>,
    #[serde(default = "void")]
    pub return_type: TypeSig,
    #[serde(default)]
    pub attributes: Vec<CustomAttribute>,
    #[serde(default)]
    pub body: Option<MethodBody>,
}

fn void() -> TypeSig {
    TypeSig::Void
}

impl MethodDef {
    pub fn new(name: impl Into<String>, params: Vec<ParamDef>, return_type: TypeSig) -> Self {
        Self {
            name: name.into(),
            is_static: false,
            is_private: false,
            params,
            return_type,
            attributes: Vec::new(),
            body: None,
        }
    }

    /// Argument slot of the first declared parameter.
    pub fn arg_offset(&self) -> u16 {
        if self.is_static {
            0
        } else {
            1
        }
    }

    pub fn find_attribute(&self, type_name: &str) -> Option<&CustomAttribute> {
        self.attributes.iter().find(|a| a.type_name == type_name)
    }

    pub fn to_ref(&self, declaring: TypeSig) -> MethodRef {
        MethodRef {
            declaring,
            name: self.name.clone(),
            params: self.params.iter().map(|p| p.ty.clone()).collect(),
            return_type: self.return_type.clone(),
            has_this: !self.is_static,
        }
    }

    pub fn is_ctor(&self) -> bool {
        self.name == CTOR
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDef {
    pub full_name: String,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub is_value_type: bool,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    #[serde(default)]
    pub attributes: Vec<CustomAttribute>,
}

impl TypeDef {
    pub fn new(full_name: impl Into<String>, base: Option<&str>) -> Self {
        Self {
            full_name: full_name.into(),
            base: base.map(str::to_string),
            is_value_type: false,
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn sig(&self) -> TypeSig {
        if self.is_value_type {
            TypeSig::value_type(self.full_name.clone())
        } else {
            TypeSig::class(self.full_name.clone())
        }
    }

    pub fn find_method(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_ref(&self, name: &str) -> Option<FieldRef> {
        self.find_field(name)
            .map(|f| FieldRef::new(self.sig(), f.name.clone(), f.ty.clone()))
    }

    pub fn constructors(&self) -> impl Iterator<Item = &MethodDef> {
        self.methods.iter().filter(|m| m.is_ctor())
    }
}

/// Position of a method inside a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodHandle {
    pub type_index: usize,
    pub method_index: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub types: Vec<TypeDef>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), types: Vec::new() }
    }

    pub fn find_type(&self, full_name: &str) -> Option<usize> {
        self.types.iter().position(|t| t.full_name == full_name)
    }

    pub fn type_def(&self, full_name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.full_name == full_name)
    }

    pub fn find_method(&self, type_name: &str, method_name: &str) -> Option<MethodHandle> {
        let type_index = self.find_type(type_name)?;
        let method_index = self.types[type_index].find_method(method_name)?;
        Some(MethodHandle { type_index, method_index })
    }

    pub fn method(&self, handle: MethodHandle) -> &MethodDef {
        &self.types[handle.type_index].methods[handle.method_index]
    }

    pub fn method_mut(&mut self, handle: MethodHandle) -> &mut MethodDef {
        &mut self.types[handle.type_index].methods[handle.method_index]
    }

    pub fn declaring_type(&self, handle: MethodHandle) -> &TypeDef {
        &self.types[handle.type_index]
    }

    /// `Namespace.Type::Method`
    pub fn method_full_name(&self, handle: MethodHandle) -> String {
        format!(
            "{}::{}",
            self.types[handle.type_index].full_name,
            self.method(handle).name
        )
    }

    /// The type and every ancestor defined in this module, nearest first.
    pub fn hierarchy(&self, full_name: &str) -> Vec<&TypeDef> {
        let mut chain = Vec::new();
        let mut cursor = self.type_def(full_name);
        while let Some(ty) = cursor {
            if chain.iter().any(|t: &&TypeDef| t.full_name == ty.full_name) {
                break;
            }
            chain.push(ty);
            cursor = ty.base.as_deref().and_then(|b| self.type_def(b));
        }
        chain
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
