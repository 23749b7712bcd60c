//! Host directory mounts exposed to guests.
//!
//! A mount is written as `host`, `host:guest` or `host:guest:ro`. A bare
//! host path is mounted at the same path inside the guest.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// A host directory made visible to a guest under `guest_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MountSpec {
    /// Directory on the host.
    pub host_path: PathBuf,
    /// Path the guest sees.
    pub guest_path: String,
    /// Mounted without write access.
    pub read_only: bool,
}

impl MountSpec {
    /// Create a read-write mount.
    pub fn new(host_path: impl Into<PathBuf>, guest_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            guest_path: guest_path.into(),
            read_only: false,
        }
    }

    /// Mark the mount read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

impl FromStr for MountSpec {
    type Err = RuntimeError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut parts = spec.splitn(3, ':');
        let host = parts.next().unwrap_or_default();
        if host.is_empty() {
            return Err(RuntimeError::invalid_mount(spec, "empty host path"));
        }

        let guest = match parts.next() {
            Some("") => return Err(RuntimeError::invalid_mount(spec, "empty guest path")),
            Some(guest) => guest,
            None => host,
        };

        let read_only = match parts.next() {
            None => false,
            Some("ro") => true,
            Some(other) => {
                return Err(RuntimeError::invalid_mount(
                    spec,
                    format!("unknown modifier '{other}'"),
                ));
            }
        };

        Ok(Self {
            host_path: PathBuf::from(host),
            guest_path: guest.to_string(),
            read_only,
        })
    }
}

impl TryFrom<String> for MountSpec {
    type Error = RuntimeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MountSpec> for String {
    fn from(mount: MountSpec) -> Self {
        mount.to_string()
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_path.display(), self.guest_path)?;
        if self.read_only {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_only() {
        let mount: MountSpec = "/data".parse().unwrap();
        assert_eq!(mount.host_path, PathBuf::from("/data"));
        assert_eq!(mount.guest_path, "/data");
        assert!(!mount.read_only);
    }

    #[test]
    fn test_host_and_guest() {
        let mount: MountSpec = "/srv/files:/files".parse().unwrap();
        assert_eq!(mount.host_path, PathBuf::from("/srv/files"));
        assert_eq!(mount.guest_path, "/files");
        assert!(!mount.read_only);
    }

    #[test]
    fn test_read_only() {
        let mount: MountSpec = "/srv/files:/files:ro".parse().unwrap();
        assert_eq!(mount, MountSpec::new("/srv/files", "/files").read_only());
    }

    #[test]
    fn test_rejects_bad_specs() {
        assert!("".parse::<MountSpec>().is_err());
        assert!(":/guest".parse::<MountSpec>().is_err());
        assert!("/host:".parse::<MountSpec>().is_err());

        let err = "/host:/guest:rw".parse::<MountSpec>().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidMount { .. }));
        assert!(err.to_string().contains("rw"));
    }

    #[test]
    fn test_display() {
        let mount: MountSpec = "/a:/b:ro".parse().unwrap();
        assert_eq!(mount.to_string(), "/a:/b:ro");
        let mount: MountSpec = "/a".parse().unwrap();
        assert_eq!(mount.to_string(), "/a:/a");
    }
}
