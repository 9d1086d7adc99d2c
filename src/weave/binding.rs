//! Interceptor bindings and target-method records.
//!
//! A binding's feature set is computed once here, from the hooks its type hierarchy
//! actually overrides, and is consumed afterwards as static data.

use super::classify::{classify, MethodShape};
use crate::common::consts::{HOOK_ON_ENTRY, HOOK_ON_EXCEPTION, HOOK_ON_EXIT, HOOK_ON_SUCCESS};
use crate::il::{AttrArg, MethodHandle, MethodRef, Module, TypeSig};
use crate::{Error, Result};
use bitflags::Flags;
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Lifecycle hooks an interceptor implements plus the capabilities it uses.
    ///
    /// Every capability carries the bit of the hook it lives in, so a capability is only
    /// ever contained in a set that also contains its hook.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Feature: u32 {
        const ON_ENTRY = 1 << 0;
        const ON_EXCEPTION = 1 << 1;
        const ON_SUCCESS = 1 << 2;
        const ON_EXIT = 1 << 3;
        /// Reload parameters from the context when it asks for it.
        const REWRITE_ARGS = 1 << 4 | Self::ON_ENTRY.bits();
        /// Short-circuit when the entry hook replaced the return value.
        const ENTRY_REPLACE = 1 << 5 | Self::ON_ENTRY.bits();
        /// Swallow the exception when the context marks it handled.
        const EXCEPTION_HANDLE = 1 << 6 | Self::ON_EXCEPTION.bits();
        /// Take the context's return value after the success hook replaced it.
        const SUCCESS_REPLACE = 1 << 7 | Self::ON_SUCCESS.bits();
        const EXCEPTION_RETRY = 1 << 8 | Self::ON_EXCEPTION.bits();
        const SUCCESS_RETRY = 1 << 9 | Self::ON_SUCCESS.bits();
        /// Copy by-ref parameters back into the context after exception/success.
        const FRESH_ARGS = 1 << 10;

        const HOOKS = Self::ON_ENTRY.bits() | Self::ON_EXCEPTION.bits() | Self::ON_SUCCESS.bits() | Self::ON_EXIT.bits();
    }
}

bitflags::bitflags! {
    /// MethodContext members the binder knows are never read.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Omit: u8 {
        const MOS = 1 << 0;
        const ARGUMENTS = 1 << 1;
        const RETURN_VALUE = 1 << 2;
    }
}

/// One lifecycle hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    OnEntry,
    OnException,
    OnSuccess,
    OnExit,
}

impl Hook {
    pub const ALL: [Hook; 4] = [Hook::OnEntry, Hook::OnException, Hook::OnSuccess, Hook::OnExit];

    pub fn method_name(self) -> &'static str {
        match self {
            Hook::OnEntry => HOOK_ON_ENTRY,
            Hook::OnException => HOOK_ON_EXCEPTION,
            Hook::OnSuccess => HOOK_ON_SUCCESS,
            Hook::OnExit => HOOK_ON_EXIT,
        }
    }

    pub fn feature(self) -> Feature {
        match self {
            Hook::OnEntry => Feature::ON_ENTRY,
            Hook::OnException => Feature::ON_EXCEPTION,
            Hook::OnSuccess => Feature::ON_SUCCESS,
            Hook::OnExit => Feature::ON_EXIT,
        }
    }
}

/// Named property assignment applied after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedArg {
    pub name: String,
    pub value: AttrArg,
}

/// An interceptor as delivered by the selection layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptorSpec {
    pub type_name: String,
    #[serde(default)]
    pub ctor_args: Vec<AttrArg>,
    #[serde(default)]
    pub properties: Vec<NamedArg>,
    /// Capabilities the interceptor declares; all of them when absent.
    #[serde(default)]
    pub features: Option<Feature>,
    #[serde(default)]
    pub omits: Omit,
}

impl InterceptorSpec {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ctor_args: Vec::new(),
            properties: Vec::new(),
            features: None,
            omits: Omit::empty(),
        }
    }

    pub fn with_ctor_args(mut self, args: Vec<AttrArg>) -> Self {
        self.ctor_args = args;
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: AttrArg) -> Self {
        self.properties.push(NamedArg { name: name.into(), value });
        self
    }

    pub fn with_features(mut self, features: Feature) -> Self {
        self.features = Some(features);
        self
    }

    pub fn with_omits(mut self, omits: Omit) -> Self {
        self.omits = omits;
        self
    }
}

/// A resolved interceptor: how to construct it and what it does.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptorBinding {
    pub type_sig: TypeSig,
    pub ctor: MethodRef,
    pub ctor_args: Vec<AttrArg>,
    pub setters: Vec<(MethodRef, AttrArg)>,
    pub features: Feature,
    pub omits: Omit,
}

impl InterceptorBinding {
    pub fn has(&self, hook: Hook) -> bool {
        self.features.contains(hook.feature())
    }
}

/// Resolve an interceptor type against the module and compute its feature set.
pub fn bind_interceptor(module: &Module, spec: &InterceptorSpec) -> Result<InterceptorBinding> {
    let hierarchy = module.hierarchy(&spec.type_name);
    let Some(ty) = hierarchy.first() else {
        return Err(Error::unresolved_type(&spec.type_name));
    };

    let mut overridden = Feature::empty();
    for hook in Hook::ALL {
        if hierarchy
            .iter()
            .any(|t| t.methods.iter().any(|m| m.name == hook.method_name() && !m.is_static))
        {
            overridden |= hook.feature();
        }
    }

    let declared = spec.features.unwrap_or(Feature::all());
    let mut features = Feature::empty();
    for flag in Feature::FLAGS {
        let value = *flag.value();
        if value == Feature::HOOKS {
            continue;
        }
        if declared.contains(value) && overridden.contains(value & Feature::HOOKS) {
            features |= value;
        }
    }

    let ctor = ty
        .constructors()
        .find(|c| !c.is_static && c.params.len() == spec.ctor_args.len())
        .ok_or_else(|| Error::MissingConstructor {
            type_name: spec.type_name.clone(),
            arity: spec.ctor_args.len(),
        })?
        .to_ref(ty.sig());

    let mut setters = Vec::with_capacity(spec.properties.len());
    for prop in &spec.properties {
        let setter_name = format!("set_{}", prop.name);
        let setter = hierarchy
            .iter()
            .find_map(|t| {
                t.methods
                    .iter()
                    .find(|m| m.name == setter_name && !m.is_static && m.params.len() == 1)
                    .map(|m| m.to_ref(t.sig()))
            })
            .ok_or_else(|| Error::unresolved_member(&spec.type_name, &setter_name))?;
        setters.push((setter, prop.value.clone()));
    }

    log::debug!(
        "bound interceptor {} features={:?} omits={:?}",
        spec.type_name,
        features,
        spec.omits
    );

    Ok(InterceptorBinding {
        type_sig: ty.sig(),
        ctor,
        ctor_args: spec.ctor_args.clone(),
        setters,
        features,
        omits: spec.omits,
    })
}

/// A matched method with everything the weaver for its shape needs.
#[derive(Debug, Clone)]
pub struct TargetMethod {
    pub handle: MethodHandle,
    pub full_name: String,
    pub bindings: Vec<InterceptorBinding>,
    pub features: Feature,
    pub omits: Omit,
    pub shape: MethodShape,
}

impl TargetMethod {
    pub fn new(module: &Module, handle: MethodHandle, bindings: Vec<InterceptorBinding>) -> Self {
        let features = bindings
            .iter()
            .fold(Feature::empty(), |acc, b| acc | b.features);
        let omits = match bindings.split_first() {
            Some((first, rest)) => rest.iter().fold(first.omits, |acc, b| acc & b.omits),
            None => Omit::empty(),
        };
        Self {
            handle,
            full_name: module.method_full_name(handle),
            features,
            omits,
            shape: classify(module.method(handle)),
            bindings,
        }
    }

    /// Whether generated code uses `feature`. Replacing or handling needs the return value,
    /// so omitting it turns those features off.
    pub fn has(&self, feature: Feature) -> bool {
        let reads_return_value = [Feature::ENTRY_REPLACE, Feature::EXCEPTION_HANDLE, Feature::SUCCESS_REPLACE]
            .contains(&feature);
        self.features.contains(feature) && !(reads_return_value && self.omits.contains(Omit::RETURN_VALUE))
    }

    pub fn any(&self, hook: Hook) -> bool {
        self.bindings.iter().any(|b| b.has(hook))
    }
}
