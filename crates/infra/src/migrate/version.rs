//! Semantic schema versions (`major.minor.patch`).

use core::str::FromStr;

use super::MigrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub const ZERO: SchemaVersion = SchemaVersion::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl core::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SchemaVersion {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MigrationError::InvalidVersion(s.to_string());

        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, MigrationError> {
            parts
                .next()
                .ok_or_else(invalid)?
                .parse::<u32>()
                .map_err(|_| invalid())
        };
        let version = SchemaVersion::new(next()?, next()?, next()?);

        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}
