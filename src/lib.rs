//! ilweave
//!
//! A method-body weaving engine: it rewrites compiled methods so that interceptor objects
//! observe, and may alter, every call at four lifecycle points (entry, exception, success,
//! exit) without the method's source being touched.
//!
//! ## Architecture
//!
//! - **il**: instruction-level model of a compiled module, emission toolkit, structural
//!   predicates and the branch post-pass
//! - **weave**: classification, interceptor binding and the five shape-specific weavers
//! - **rt**: reference interpreter that executes woven modules
//! - **config**: weave-time configuration
//! - **bin**: command-line interface
//!
//! ## Weaving Flow
//!
//! ```text
//! Request JSON → Module + targets → bind interceptors → classify → weave (staged) → Module JSON
//!                                                                     ↓
//!                                    Empty | Sync | AsyncTask | Iterator | AsyncIterator
//! ```

pub mod common;
pub mod config;
pub mod consts;
pub mod il;
pub mod rt;
pub mod weave;

pub use common::error::{Error, Result};
pub use crate::config::Config;

use il::Module;
use std::path::Path;
use weave::{WeaveReport, WeaveRequest};

/// Weave a request document and return the rewritten module with its report.
pub fn weave_json(request: &str, config: &Config) -> Result<(Module, WeaveReport)> {
    let request = WeaveRequest::from_json(request)?;
    let targets = request.resolve()?;
    log::debug!("request for module {} names {} target(s)", request.module.name, targets.len());

    let mut module = request.module;
    let report = weave::weave_module(&mut module, &targets, config)?;
    Ok((module, report))
}

/// Weave the request at `input` and write the rewritten module to `output`.
pub fn weave_file(input: impl AsRef<Path>, output: impl AsRef<Path>, config: &Config) -> Result<WeaveReport> {
    let input = input.as_ref();
    log::info!("weaving {}", input.display());
    let text = std::fs::read_to_string(input)?;
    let (module, report) = weave_json(&text, config)?;
    std::fs::write(output.as_ref(), module.to_json()?)?;
    log::info!("wrote {}", output.as_ref().display());
    Ok(report)
}
