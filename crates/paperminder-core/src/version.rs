//! Firmware version strings.
//!
//! A version is a dot-separated list of at least two non-negative integers
//! (`1.2`, `2.0.0`, `1.10.3.7`). Ordering is component-wise with the shorter
//! version zero-padded, so `1.9.0 < 1.10.0` and `2.0 == 2.0.0`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("Version is empty")]
    Empty,

    #[error("Version {0:?} needs at least two components")]
    TooFewComponents(String),

    #[error("Version {0:?} has a non-numeric component")]
    NonNumeric(String),
}

/// A parsed firmware version.
#[derive(Debug, Clone)]
pub struct Version {
    parts: Vec<u64>,
    raw: String,
}

impl Version {
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(VersionError::Empty);
        }

        let parts = raw
            .split('.')
            .map(|p| {
                if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(VersionError::NonNumeric(raw.to_string()));
                }
                p.parse::<u64>()
                    .map_err(|_| VersionError::NonNumeric(raw.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if parts.len() < 2 {
            return Err(VersionError::TooFewComponents(raw.to_string()));
        }

        Ok(Self {
            parts,
            raw: raw.to_string(),
        })
    }

    /// The version exactly as it was given (trimmed).
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Compare two version strings numerically.
pub fn compare(a: &str, b: &str) -> Result<Ordering, VersionError> {
    Ok(Version::parse(a)?.cmp(&Version::parse(b)?))
}

/// `true` when `candidate` is strictly newer than `current`.
///
/// An unparseable `current` (for example a device that never reported a
/// version) is treated as older than any valid candidate.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    match (Version::parse(candidate), Version::parse(current)) {
        (Ok(c), Ok(cur)) => c > cur,
        (Ok(_), Err(_)) => true,
        (Err(_), _) => false,
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| {
                let a = self.parts.get(i).copied().unwrap_or(0);
                let b = other.parts.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
