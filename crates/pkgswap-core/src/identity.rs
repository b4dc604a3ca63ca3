use std::fmt;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Unique name of an installable application on the host, such as
/// `com.example.app`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageIdentity(String);

impl PackageIdentity {
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("package identity must not be empty"));
        }
        if trimmed.starts_with('.') || trimmed.ends_with('.') || trimmed.contains("..") {
            return Err(anyhow!(
                "package identity has an empty name segment: {trimmed}"
            ));
        }
        if let Some(invalid) = trimmed
            .chars()
            .find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '.' || *ch == '_'))
        {
            return Err(anyhow!(
                "package identity contains invalid character '{invalid}': {trimmed}"
            ));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PackageIdentity {
    type Error = anyhow::Error;

    fn try_from(value: String) -> anyhow::Result<Self> {
        Self::parse(&value)
    }
}

impl From<PackageIdentity> for String {
    fn from(value: PackageIdentity) -> Self {
        value.0
    }
}
