//! Selection of the attributes that travel with an outbound artifact.
//!
//! With neither an include list nor a pattern, every attribute is sent. As
//! soon as either is set, only attributes named in the list or whose key
//! fully matches the pattern are sent. Listed attributes the artifact does
//! not have are sent with an empty value. Core attributes (`filename`,
//! `path`, `uuid`, ...) are kept or dropped as a group.

use std::collections::BTreeSet;

use regex::Regex;

use super::AttributeMap;
use crate::error::{FlowError, Result};

/// Attributes every artifact carries regardless of its content.
pub const CORE_ATTRIBUTES: &[&str] = &[
    "filename",
    "path",
    "absolute.path",
    "uuid",
    "priority",
    "mime.type",
    "discard.reason",
    "alternate.identifier",
];

/// Attribute selection policy for outbound messages.
#[derive(Debug, Clone)]
pub struct AttributeFilter {
    include: BTreeSet<String>,
    pattern: Option<Regex>,
    include_core: bool,
}

impl AttributeFilter {
    /// Filter that passes every attribute.
    pub fn all() -> Self {
        Self {
            include: BTreeSet::new(),
            pattern: None,
            include_core: true,
        }
    }

    /// Add attribute names to the include list.
    pub fn include<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include.extend(names.into_iter().map(Into::into));
        self
    }

    /// Add a comma separated list of attribute names (whitespace trimmed).
    pub fn include_list(self, list: &str) -> Self {
        let names: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.include(names)
    }

    /// Send attributes whose whole key matches `pattern`.
    pub fn pattern(mut self, pattern: &str) -> Result<Self> {
        let anchored = format!("^(?:{})$", pattern);
        let regex = Regex::new(&anchored)
            .map_err(|e| FlowError::Config(format!("invalid attribute pattern: {}", e)))?;
        self.pattern = Some(regex);
        Ok(self)
    }

    /// Keep or drop the core attributes.
    pub fn include_core(mut self, include_core: bool) -> Self {
        self.include_core = include_core;
        self
    }

    /// Check whether any selection beyond "everything" is configured.
    #[inline]
    pub fn is_selective(&self) -> bool {
        self.pattern.is_some() || !self.include.is_empty()
    }

    /// Select the attributes to transmit.
    pub fn apply(&self, attributes: &AttributeMap) -> AttributeMap {
        if !self.is_selective() {
            return attributes
                .iter()
                .filter(|(key, _)| self.include_core || !is_core(key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }

        let mut selected: AttributeMap = attributes
            .iter()
            .filter(|(key, _)| self.selects(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for name in &self.include {
            selected.entry(name.clone()).or_default();
        }

        selected
    }

    fn selects(&self, key: &str) -> bool {
        self.include.contains(key)
            || self.pattern.as_ref().is_some_and(|p| p.is_match(key))
            || (self.include_core && is_core(key))
    }
}

impl Default for AttributeFilter {
    fn default() -> Self {
        Self::all()
    }
}

fn is_core(key: &str) -> bool {
    CORE_ATTRIBUTES.contains(&key)
}
