// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Build options and configuration ids of generated device kernels.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Sorted set of compiler options (`-DNAME=VALUE` defines and bare flags).
///
/// Sorting makes the rendered option string, and therefore the program
/// cache key, independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BuildOptions {
    options: BTreeSet<String>,
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw option such as `-DVEC_SIZE=4` or `-cl-fast-relaxed-math`.
    pub fn add_option(&mut self, option: impl Into<String>) -> &mut Self {
        self.options.insert(option.into());
        self
    }

    pub fn add_option_if(&mut self, condition: bool, option: impl Into<String>) -> &mut Self {
        if condition {
            self.add_option(option);
        }
        self
    }

    pub fn add_option_if_else(
        &mut self,
        condition: bool,
        if_true: impl Into<String>,
        if_false: impl Into<String>,
    ) -> &mut Self {
        if condition {
            self.add_option(if_true)
        } else {
            self.add_option(if_false)
        }
    }

    /// Add `-DNAME=VALUE`; values are rendered with `Display`.
    pub fn define(&mut self, name: &str, value: impl fmt::Display) -> &mut Self {
        self.add_option(format!("-D{name}={value}"))
    }

    pub fn define_if(&mut self, condition: bool, name: &str, value: impl fmt::Display) -> &mut Self {
        if condition {
            self.define(name, value);
        }
        self
    }

    /// Add a valueless `-DNAME`.
    pub fn flag(&mut self, name: &str) -> &mut Self {
        self.add_option(format!("-D{name}"))
    }

    pub fn flag_if(&mut self, condition: bool, name: &str) -> &mut Self {
        if condition {
            self.flag(name);
        }
        self
    }

    /// Merge every option of `other`.
    pub fn add_options(&mut self, other: &BuildOptions) -> &mut Self {
        self.options.extend(other.options.iter().cloned());
        self
    }

    pub fn contains(&self, option: &str) -> bool {
        self.options.contains(option)
    }

    /// Whether `-DNAME` or `-DNAME=...` is present.
    pub fn has_define(&self, name: &str) -> bool {
        self.get(name).is_some() || self.contains(&format!("-D{name}"))
    }

    /// Value of `-DNAME=VALUE`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        let prefix = format!("-D{name}=");
        self.options.iter().find_map(|o| o.strip_prefix(prefix.as_str()))
    }

    pub fn get_parsed<T: FromStr>(&self, name: &str) -> Option<T> {
        self.get(name)?.parse().ok()
    }

    pub fn options(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

impl fmt::Display for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.options().collect();
        f.write_str(&joined.join(" "))
    }
}

/// Underscore-joined identifier of one kernel configuration, used for tuning lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigId {
    id: String,
}

impl ConfigId {
    pub fn new(kernel_name: &str) -> Self {
        Self {
            id: kernel_name.to_string(),
        }
    }

    /// Append one `_`-separated, lower-cased component.
    pub fn push(&mut self, part: impl fmt::Display) -> &mut Self {
        self.id.push('_');
        self.id.push_str(&part.to_string().to_lowercase());
        self
    }

    pub fn with(mut self, part: impl fmt::Display) -> Self {
        self.push(part);
        self
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl From<ConfigId> for String {
    fn from(id: ConfigId) -> Self {
        id.id
    }
}
