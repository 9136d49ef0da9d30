//! Firmware version parsing and feature gates.
use std::fmt;
use std::str::FromStr;

use super::error::BridgeError;
use super::snapshot::LocalIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = String;

    /// Accepts `2.5.6`, `2.5.6.abc1234` and `v2.5.6-beta`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches(['v', 'V']);
        let mut parts = trimmed
            .split(['.', '-', '+'])
            .map(|p| p.parse::<u32>());
        let mut next = |name: &str| -> Result<u32, String> {
            match parts.next() {
                Some(Ok(v)) => Ok(v),
                _ => Err(format!("invalid firmware version '{}' ({} part)", s, name)),
            }
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        Ok(Self::new(major, minor, patch))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    SessionPasskeys,
    FavoriteNodes,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Capability::SessionPasskeys => "session passkeys",
            Capability::FavoriteNodes => "favorite nodes",
        }
    }

    pub fn min_version(self) -> FirmwareVersion {
        match self {
            Capability::SessionPasskeys => FirmwareVersion::new(2, 5, 0),
            Capability::FavoriteNodes => FirmwareVersion::new(2, 4, 0),
        }
    }
}

/// Check a capability against the attached node's firmware. Unknown or unparseable
/// versions are allowed through; the device will reject what it cannot do.
pub fn require(identity: Option<&LocalIdentity>, cap: Capability) -> Result<(), BridgeError> {
    let Some(found) = identity.and_then(|id| id.firmware_version.as_deref()) else {
        return Ok(());
    };
    match found.parse::<FirmwareVersion>() {
        Ok(v) if v < cap.min_version() => Err(BridgeError::FirmwareUnsupported {
            feature: cap.name(),
            required: cap.min_version().to_string(),
            found: found.to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(fw: Option<&str>) -> LocalIdentity {
        LocalIdentity {
            node_num: 1,
            node_id: "!00000001".into(),
            long_name: String::new(),
            short_name: String::new(),
            firmware_version: fw.map(str::to_string),
            reboot_count: 0,
        }
    }

    #[test]
    fn parses_common_forms() {
        assert_eq!(
            "2.5.6.abc1234".parse::<FirmwareVersion>().unwrap(),
            FirmwareVersion::new(2, 5, 6)
        );
        assert_eq!(
            "v2.3.15-beta".parse::<FirmwareVersion>().unwrap(),
            FirmwareVersion::new(2, 3, 15)
        );
        assert!("2.x".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn old_firmware_rejected() {
        let old = identity(Some("2.3.2.63df972"));
        let err = require(Some(&old), Capability::SessionPasskeys).unwrap_err();
        match err {
            BridgeError::FirmwareUnsupported { feature, required, .. } => {
                assert_eq!(feature, "session passkeys");
                assert_eq!(required, "2.5.0");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn new_or_unknown_firmware_allowed() {
        let new = identity(Some("2.5.0.1"));
        assert!(require(Some(&new), Capability::SessionPasskeys).is_ok());
        assert!(require(Some(&identity(None)), Capability::FavoriteNodes).is_ok());
        assert!(require(None, Capability::FavoriteNodes).is_ok());
    }
}
