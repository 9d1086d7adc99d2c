//! Weave-time configuration.
//!
//! Values are fixed into generated code; nothing here is consulted at run time.
//! Accepted text forms are one `key = value` per line (`#` starts a comment), read through
//! the `config` crate's INI source, or a single weaver element with attributes,
//! `<Weaver enabled="true" mo-array-threshold="8" />`, read with `quick-xml`.

use crate::consts::DEFAULT_MO_ARRAY_THRESHOLD;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Skip the whole pass when false.
    #[serde(alias = "@enabled")]
    pub enabled: bool,
    /// Also record iterator values into the context's return value.
    #[serde(alias = "@enumerable-returns")]
    pub enumerable_returns: bool,
    /// Exception/success/exit chains run in reverse bound order.
    #[serde(alias = "@reverse-call-ending")]
    pub reverse_call_ending: bool,
    /// Same reversal applied to the array-loop direction of non-entry hooks.
    #[serde(alias = "@reverse-call-non-entry")]
    pub reverse_call_non_entry: bool,
    /// Interceptor count above which an array and loop replace unrolled locals.
    #[serde(alias = "@mo-array-threshold")]
    pub mo_array_threshold: usize,
}

impl Config {
    pub fn new() -> Self {
        Self {
            enabled: true,
            enumerable_returns: false,
            reverse_call_ending: false,
            reverse_call_non_entry: false,
            mo_array_threshold: DEFAULT_MO_ARRAY_THRESHOLD,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_enumerable_returns(mut self, enabled: bool) -> Self {
        self.enumerable_returns = enabled;
        self
    }

    pub fn with_reverse_call_ending(mut self, enabled: bool) -> Self {
        self.reverse_call_ending = enabled;
        self
    }

    pub fn with_reverse_call_non_entry(mut self, enabled: bool) -> Self {
        self.reverse_call_non_entry = enabled;
        self
    }

    pub fn with_mo_array_threshold(mut self, threshold: usize) -> Self {
        self.mo_array_threshold = threshold;
        self
    }

    /// Whether non-entry hooks walk the interceptor set back to front.
    pub fn reverse_non_entry(&self) -> bool {
        self.reverse_call_ending || self.reverse_call_non_entry
    }

    /// Read a file in either text form. A missing file is an I/O error, not a default.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        text.parse()
    }

    fn from_element(text: &str) -> Result<Self> {
        quick_xml::de::from_str(text).map_err(|e| Error::config_error(format!("weaver element: {}", e)))
    }

    fn from_key_values(text: &str) -> Result<Self> {
        use ::config::{Config as ConfigLib, File, FileFormat};

        ConfigLib::builder()
            .add_source(File::from_str(text, FileFormat::Ini))
            .build()
            .and_then(|settings| settings.try_deserialize::<Self>())
            .map_err(|e| Error::config_error(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.starts_with('<') {
            Self::from_element(trimmed)
        } else {
            Self::from_key_values(trimmed)
        }
    }
}
