//! Qualified definition names

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{RegistryError, RegistryResult};

/// Separator between namespace segments.
pub const SEPARATOR: &str = "::";

/// A `::`-separated path naming a definition in the registry, e.g. `Outer::Inner`.
///
/// Always holds at least one segment and never an empty one. A leading `::`
/// (an explicit root reference) is accepted and dropped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QualifiedName(String);

impl QualifiedName {
    /// Parse and validate a name
    pub fn parse(name: &str) -> RegistryResult<Self> {
        let trimmed = name.trim();
        let trimmed = trimmed.strip_prefix(SEPARATOR).unwrap_or(trimmed);

        if trimmed.is_empty() {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        for segment in trimmed.split(SEPARATOR) {
            let valid = !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_')
                && !segment.starts_with(|c: char| c.is_ascii_digit());
            if !valid {
                return Err(RegistryError::InvalidName(name.to_string()));
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Iterate over the namespace segments, outermost first
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// The final segment (the binding removed from its container)
    pub fn last_segment(&self) -> &str {
        self.0.rsplit(SEPARATOR).next().unwrap_or(&self.0)
    }

    /// The enclosing namespace, or `None` for a top-level name
    pub fn parent(&self) -> Option<QualifiedName> {
        self.0
            .rfind(SEPARATOR)
            .map(|idx| QualifiedName(self.0[..idx].to_string()))
    }

    /// Name of a member nested directly inside this one
    pub fn child(&self, segment: &str) -> QualifiedName {
        QualifiedName(format!("{}{}{}", self.0, SEPARATOR, segment))
    }

    /// Whether this names a binding in the root namespace
    pub fn is_top_level(&self) -> bool {
        !self.0.contains(SEPARATOR)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QualifiedName {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for QualifiedName {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<QualifiedName> for String {
    fn from(name: QualifiedName) -> Self {
        name.0
    }
}

impl AsRef<str> for QualifiedName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
