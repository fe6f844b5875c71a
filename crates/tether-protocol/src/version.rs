//! Protocol versioning for Tether.
//!
//! The version is announced to the server in the `vsn` query parameter.
//! Only versions sharing [`PROTOCOL_VERSION`]'s major number use the frame
//! layout this crate encodes.

use std::fmt;
use std::str::FromStr;

/// Protocol version spoken by default (array frames with join refs).
pub const PROTOCOL_VERSION: Version = Version {
    major: 2,
    minor: 0,
    patch: 0,
};

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
    /// Patch version.
    pub patch: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Check if this version is compatible with another version.
    ///
    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.').map(str::parse::<u8>);
        let mut part = || {
            parts
                .next()
                .transpose()
                .map_err(|e| format!("invalid version `{s}`: {e}"))
        };
        let major = part()?.ok_or_else(|| format!("invalid version `{s}`"))?;
        let minor = part()?.unwrap_or(0);
        let patch = part()?.unwrap_or(0);
        Ok(Self::new(major, minor, patch))
    }
}
