//! Typed, text-backed configuration entries.
//!
//! Every entry keeps its value as text. Reads and writes go through the
//! entry's kind, and a rejected write leaves the stored text untouched.

use crate::error::{SearchError, SearchResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    String,
    Path,
    Bool,
    Int,
    Float,
}

impl SettingKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Path => "path",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
        }
    }

    /// Parses `raw` according to this kind.
    pub fn parse(self, raw: &str) -> SearchResult<SettingValue> {
        let raw = raw.trim();
        match self {
            Self::String => Ok(SettingValue::String(raw.to_string())),
            Self::Path => {
                if raw.contains('\0') {
                    return Err(SearchError::invalid("path contains a NUL byte"));
                }
                Ok(SettingValue::Path(PathBuf::from(raw)))
            }
            Self::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(SettingValue::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(SettingValue::Bool(false)),
                _ => Err(SearchError::invalid(format!("{raw:?} is not a bool"))),
            },
            Self::Int => raw
                .parse::<i64>()
                .map(SettingValue::Int)
                .map_err(|_| SearchError::invalid(format!("{raw:?} is not an integer"))),
            Self::Float => match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(SettingValue::Float(v)),
                _ => Err(SearchError::invalid(format!("{raw:?} is not a finite number"))),
            },
        }
    }
}

impl fmt::Display for SettingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    String(String),
    Path(PathBuf),
    Bool(bool),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingEntry {
    pub name: String,
    pub kind: SettingKind,
    raw_value: String,
}

impl SettingEntry {
    /// Builds an entry, rejecting a default that does not parse as `kind`.
    pub fn new(name: impl Into<String>, kind: SettingKind, raw_value: impl Into<String>) -> SearchResult<Self> {
        let raw_value = raw_value.into();
        kind.parse(&raw_value)?;
        Ok(Self { name: name.into(), kind, raw_value: raw_value.trim().to_string() })
    }

    pub fn raw_value(&self) -> &str {
        &self.raw_value
    }

    pub fn value(&self) -> SearchResult<SettingValue> {
        self.kind.parse(&self.raw_value)
    }

    pub fn set(&mut self, raw: &str) -> SearchResult<()> {
        self.kind.parse(raw)?;
        self.raw_value = raw.trim().to_string();
        Ok(())
    }
}

const DEFAULTS: &[(&str, SettingKind, &str)] = &[
    ("ssl", SettingKind::Bool, "false"),
    ("address", SettingKind::String, "0.0.0.0"),
    ("port", SettingKind::Int, "8765"),
    ("cert", SettingKind::Path, ""),
    ("key", SettingKind::Path, ""),
    ("workers", SettingKind::Int, "2"),
    ("queue_limit", SettingKind::Int, "0"),
];

/// The fixed, ordered set of recognized settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    entries: Vec<SettingEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        let entries = DEFAULTS
            .iter()
            .map(|&(name, kind, raw)| SettingEntry { name: name.to_string(), kind, raw_value: raw.to_string() })
            .collect();
        Self { entries }
    }
}

impl Settings {
    pub fn entries(&self) -> &[SettingEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&SettingEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Validated write; unknown names and unparsable values leave everything as it was.
    pub fn set(&mut self, name: &str, raw: &str) -> SearchResult<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| SearchError::invalid(format!("unknown setting {name:?}")))?;
        entry.set(raw)
    }

    pub fn value(&self, name: &str) -> SearchResult<SettingValue> {
        self.get(name)
            .ok_or_else(|| SearchError::invalid(format!("unknown setting {name:?}")))?
            .value()
    }

    /// Restores defaults missing from an older snapshot.
    pub fn fill_defaults(&mut self) {
        for entry in Settings::default().entries {
            if self.get(&entry.name).is_none() {
                self.entries.push(entry);
            }
        }
    }

    pub fn ssl(&self) -> bool {
        matches!(self.value("ssl"), Ok(SettingValue::Bool(true)))
    }

    pub fn address(&self) -> String {
        match self.value("address") {
            Ok(SettingValue::String(s)) if !s.is_empty() => s,
            _ => "0.0.0.0".to_string(),
        }
    }

    pub fn port(&self) -> SearchResult<u16> {
        match self.value("port")? {
            SettingValue::Int(p) => u16::try_from(p).map_err(|_| SearchError::invalid(format!("port {p} out of range"))),
            other => Err(SearchError::invalid(format!("port has unexpected value {other:?}"))),
        }
    }

    pub fn cert(&self) -> Option<PathBuf> {
        self.path("cert")
    }

    pub fn key(&self) -> Option<PathBuf> {
        self.path("key")
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        match self.value(name) {
            Ok(SettingValue::Path(p)) if !p.as_os_str().is_empty() => Some(p),
            _ => None,
        }
    }

    /// Worker pool size, at least one.
    pub fn workers(&self) -> usize {
        match self.value("workers") {
            Ok(SettingValue::Int(n)) if n > 0 => n as usize,
            _ => 1,
        }
    }

    /// Dispatcher queue bound; `None` when unbounded.
    pub fn queue_limit(&self) -> Option<usize> {
        match self.value("queue_limit") {
            Ok(SettingValue::Int(n)) if n > 0 => Some(n as usize),
            _ => None,
        }
    }
}
