//! Plugin option string parsing.
//!
//! Plugins are configured as `name:opt1=val1;opt2=val2`. The value part is
//! optional; a bare option name is treated as a boolean switch.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OptionsError {
    #[error("empty plugin specification")]
    Empty,

    #[error("empty option name in \"{0}\"")]
    EmptyOption(String),
}

/// A parsed `name:opt=val;...` plugin specification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    options: HashMap<String, String>,
}

impl PluginSpec {
    /// Parses a plugin specification string.
    pub fn parse(spec: &str) -> Result<Self, OptionsError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(OptionsError::Empty);
        }
        let (name, params) = match spec.split_once(':') {
            Some((name, params)) => (name, params),
            None => (spec, ""),
        };
        if name.is_empty() {
            return Err(OptionsError::Empty);
        }

        let mut options = HashMap::new();
        for opt in params.split(';').filter(|o| !o.is_empty()) {
            let (key, value) = match opt.split_once('=') {
                Some((k, v)) => (k, v),
                None => (opt, "1"),
            };
            if key.is_empty() {
                return Err(OptionsError::EmptyOption(spec.to_string()));
            }
            options.insert(key.to_string(), value.to_string());
        }
        Ok(PluginSpec {
            name: name.to_string(),
            options,
        })
    }

    /// Returns the raw value of option `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|v| v.as_str())
    }

    /// Returns a boolean switch: present and not `0`/`false`.
    pub fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(v) => v != "0" && v != "false",
            None => false,
        }
    }
}
