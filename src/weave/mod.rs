//! Method-body weaving.
//!
//! - **binding**: interceptor bindings, feature sets and target-method records
//! - **classify**: assigns each target one of the five method shapes
//! - **advice**: hook-chain emission and the construction code shared by every weaver
//! - **empty**, **sync**: weavers for plain method bodies
//! - **state_machine**: what the async, iterator and async-iterator weavers share
//! - **async_task**, **iterator**, **async_iterator**: anchor-splicing weavers
//!
//! [`weave_module`] runs the whole pass on a staged copy of the module and only commits it
//! when every target wove cleanly.

pub mod advice;
pub mod async_iterator;
pub mod async_task;
pub mod binding;
pub mod classify;
pub mod empty;
pub mod iterator;
pub mod refs;
pub mod state_machine;
pub mod sync;

pub use binding::{bind_interceptor, Feature, Hook, InterceptorBinding, InterceptorSpec, NamedArg, Omit, TargetMethod};
pub use classify::{classify, MethodShape};

use crate::il::Module;
use crate::{Config, Error, Result};
use serde::{Deserialize, Serialize};

/// One targeted method as named by the selection layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRequest {
    #[serde(rename = "type")]
    pub type_name: String,
    pub method: String,
    #[serde(default)]
    pub interceptors: Vec<InterceptorSpec>,
}

/// Input document of the `weave` and `classify` commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaveRequest {
    pub module: Module,
    #[serde(default)]
    pub targets: Vec<TargetRequest>,
}

impl WeaveRequest {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Bind every target's interceptors against the request's module.
    pub fn resolve(&self) -> Result<Vec<TargetMethod>> {
        resolve_targets(&self.module, &self.targets)
    }
}

pub fn resolve_targets(module: &Module, targets: &[TargetRequest]) -> Result<Vec<TargetMethod>> {
    targets
        .iter()
        .map(|t| {
            let handle = module.find_method(&t.type_name, &t.method).ok_or_else(|| {
                Error::unresolved_member(&t.type_name, &t.method)
            })?;
            let bindings = t
                .interceptors
                .iter()
                .map(|spec| bind_interceptor(module, spec))
                .collect::<Result<Vec<_>>>()?;
            Ok(TargetMethod::new(module, handle, bindings))
        })
        .collect()
}

/// What happened to one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WovenMethod {
    pub method: String,
    pub shape: MethodShape,
    /// Private method now holding the original logic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow: Option<String>,
    /// State-machine type whose step function was rewritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub companion: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeaveReport {
    pub woven: Vec<WovenMethod>,
    /// Targets left untouched because nothing was bound to them.
    pub skipped: Vec<String>,
}

/// Weave every target into `module`. On error the module is left exactly as it was.
pub fn weave_module(module: &mut Module, targets: &[TargetMethod], config: &Config) -> Result<WeaveReport> {
    let mut report = WeaveReport::default();
    if !config.enabled {
        log::info!("weaving disabled, {} target(s) left untouched", targets.len());
        return Ok(report);
    }

    let mut staged = module.clone();
    for target in targets {
        if target.bindings.is_empty() {
            log::debug!("{}: no interceptors bound, skipping", target.full_name);
            report.skipped.push(target.full_name.clone());
            continue;
        }
        let woven = weave_method(&mut staged, target, config)?;
        log::info!(
            "wove {} as {} with {} interceptor(s)",
            target.full_name,
            target.shape,
            target.bindings.len()
        );
        report.woven.push(woven);
    }

    *module = staged;
    Ok(report)
}

/// Dispatch one target to the weaver for its shape.
pub fn weave_method(module: &mut Module, target: &TargetMethod, config: &Config) -> Result<WovenMethod> {
    match target.shape {
        MethodShape::Empty => empty::weave_empty(module, target, config),
        MethodShape::Sync => sync::weave_sync(module, target, config),
        MethodShape::AsyncTask => async_task::weave_async_task(module, target, config),
        MethodShape::Iterator => iterator::weave_iterator(module, target, config),
        MethodShape::AsyncIterator => async_iterator::weave_async_iterator(module, target, config),
    }
}
