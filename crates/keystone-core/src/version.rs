use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleVersion {
    components: Vec<u64>,
}

impl BundleVersion {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("bundle version must not be empty"));
        }

        let components = trimmed
            .split('.')
            .map(|component| {
                component.parse::<u64>().with_context(|| {
                    format!("invalid bundle version component '{component}' in '{trimmed}'")
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { components })
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }
}

impl FromStr for BundleVersion {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        Self::parse(input)
    }
}

impl fmt::Display for BundleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .components
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&rendered)
    }
}

/// Upgrade ordering used by the installer.
///
/// An absent side always loses: anything is newer than nothing. Versions with
/// a different number of components are never compared and report `true` in
/// both directions; callers rely on that to force an install across a
/// version-scheme change.
pub fn is_version_greater(
    candidate: Option<&BundleVersion>,
    baseline: Option<&BundleVersion>,
) -> bool {
    let (Some(candidate), Some(baseline)) = (candidate, baseline) else {
        return true;
    };
    if candidate.components.len() != baseline.components.len() {
        return true;
    }

    for (left, right) in candidate.components.iter().zip(&baseline.components) {
        match left.cmp(right) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    false
}
