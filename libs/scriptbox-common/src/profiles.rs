// Resource profile table
// Named CPU/memory/timeout presets plus clamped per-job overrides

use crate::types::{CustomLimits, ProfileName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const MEMORY_MB_RANGE: (u32, u32) = (256, 8192);
pub const CPU_SHARES_RANGE: (u32, u32) = (256, 4096);
pub const TIMEOUT_SECONDS_RANGE: (u64, u64) = (10, 3600);

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("failed to read profile file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse profile file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("profile '{0}' cannot be configured")]
    Reserved(ProfileName),
    #[error("profile '{name}' has invalid {field}: {value}")]
    Invalid {
        name: ProfileName,
        field: &'static str,
        value: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub name: ProfileName,
    pub cpu_shares: u32,
    pub memory_mb: u32,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub gpu: bool,
}

/// Limits actually applied to a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLimits {
    pub cpu_shares: u32,
    pub memory_mb: u32,
    pub timeout_seconds: u64,
    pub gpu_required: bool,
}

impl From<ResourceProfile> for ResolvedLimits {
    fn from(p: ResourceProfile) -> Self {
        Self {
            cpu_shares: p.cpu_shares,
            memory_mb: p.memory_mb,
            timeout_seconds: p.timeout_seconds,
            gpu_required: p.gpu,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProfilesFile {
    profiles: Vec<ResourceProfile>,
}

#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: BTreeMap<ProfileName, ResourceProfile>,
}

impl Default for ProfileTable {
    fn default() -> Self {
        let builtin = [
            ResourceProfile {
                name: ProfileName::Small,
                cpu_shares: 512,
                memory_mb: 512,
                timeout_seconds: 60,
                gpu: false,
            },
            ResourceProfile {
                name: ProfileName::Medium,
                cpu_shares: 1024,
                memory_mb: 2048,
                timeout_seconds: 300,
                gpu: false,
            },
            ResourceProfile {
                name: ProfileName::Large,
                cpu_shares: 2048,
                memory_mb: 4096,
                timeout_seconds: 900,
                gpu: false,
            },
            ResourceProfile {
                name: ProfileName::Gpu,
                cpu_shares: 2048,
                memory_mb: 6144,
                timeout_seconds: 1800,
                gpu: true,
            },
        ];
        Self {
            profiles: builtin.into_iter().map(|p| (p.name, p)).collect(),
        }
    }
}

impl ProfileTable {
    /// Load overrides from a profiles.json file on top of the built-in table.
    ///
    /// Profiles missing from the file keep their built-in values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProfileError> {
        let path_str = path.as_ref().display().to_string();
        let content = fs::read_to_string(path.as_ref()).map_err(|source| ProfileError::Read {
            path: path_str.clone(),
            source,
        })?;
        let file: ProfilesFile =
            serde_json::from_str(&content).map_err(|source| ProfileError::Parse {
                path: path_str,
                source,
            })?;

        let mut table = Self::default();
        for profile in file.profiles {
            validate(&profile)?;
            table.profiles.insert(profile.name, profile);
        }
        Ok(table)
    }

    /// Like [`ProfileTable::load`], but a missing file means the built-in table
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ProfileError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn get(&self, name: ProfileName) -> Option<&ResourceProfile> {
        self.profiles.get(&name)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ResourceProfile> {
        self.profiles.values()
    }

    /// Resolve a profile name plus optional overrides into concrete limits.
    ///
    /// `auto` or an unconfigured name resolves to medium. Overrides are clamped
    /// to the platform ranges.
    pub fn resolve(&self, name: ProfileName, custom: Option<&CustomLimits>) -> ResolvedLimits {
        let base = self
            .profiles
            .get(&name)
            .or_else(|| self.profiles.get(&ProfileName::Medium))
            .copied()
            .unwrap_or_else(fallback_medium);

        let mut limits = ResolvedLimits::from(base);
        if let Some(custom) = custom {
            if let Some(memory) = custom.memory_mb {
                limits.memory_mb = clamp_memory_mb(memory);
            }
            if let Some(shares) = custom.cpu_shares {
                limits.cpu_shares = clamp_cpu_shares(shares);
            }
            if let Some(timeout) = custom.timeout_seconds {
                limits.timeout_seconds = clamp_timeout_seconds(timeout);
            }
        }
        limits
    }
}

fn fallback_medium() -> ResourceProfile {
    ResourceProfile {
        name: ProfileName::Medium,
        cpu_shares: 1024,
        memory_mb: 2048,
        timeout_seconds: 300,
        gpu: false,
    }
}

fn validate(profile: &ResourceProfile) -> Result<(), ProfileError> {
    if profile.name == ProfileName::Auto {
        return Err(ProfileError::Reserved(profile.name));
    }
    let checks: [(&'static str, u64, u64, u64); 3] = [
        (
            "memory_mb",
            profile.memory_mb as u64,
            MEMORY_MB_RANGE.0 as u64,
            MEMORY_MB_RANGE.1 as u64,
        ),
        (
            "cpu_shares",
            profile.cpu_shares as u64,
            CPU_SHARES_RANGE.0 as u64,
            CPU_SHARES_RANGE.1 as u64,
        ),
        (
            "timeout_seconds",
            profile.timeout_seconds,
            TIMEOUT_SECONDS_RANGE.0,
            TIMEOUT_SECONDS_RANGE.1,
        ),
    ];
    for (field, value, min, max) in checks {
        if value < min || value > max {
            return Err(ProfileError::Invalid {
                name: profile.name,
                field,
                value,
            });
        }
    }
    Ok(())
}

pub fn clamp_memory_mb(value: u32) -> u32 {
    value.clamp(MEMORY_MB_RANGE.0, MEMORY_MB_RANGE.1)
}

pub fn clamp_cpu_shares(value: u32) -> u32 {
    value.clamp(CPU_SHARES_RANGE.0, CPU_SHARES_RANGE.1)
}

pub fn clamp_timeout_seconds(value: u64) -> u64 {
    value.clamp(TIMEOUT_SECONDS_RANGE.0, TIMEOUT_SECONDS_RANGE.1)
}
