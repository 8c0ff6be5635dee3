use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// largest part a large-blob manifest can describe (length field is u16)
pub const MAX_PART_LEN: u32 = u16::MAX as u32;

/// files at or above this size are chunked into a large blob
pub const LARGE_FILE_THRESHOLD: u64 = 1024 * 1024;

/// repository tuneables stored in `.silo/config`
///
/// the digest algorithm is recorded so a repository written by a build with
/// a different algorithm is rejected on open instead of silently misread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// content digest algorithm; this build only supports "sha256"
    #[serde(default = "default_digest")]
    pub digest: String,

    /// whether payloads are run through the compressibility probe
    #[serde(default = "default_true")]
    pub compression: bool,

    /// how large files are split
    #[serde(default)]
    pub chunker: ChunkerMode,
}

fn default_digest() -> String {
    "sha256".to_string()
}

fn default_true() -> bool {
    true
}

/// chunker selection for large files
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ChunkerMode {
    /// fixed-size windows
    Fixed { size: u32 },
    /// content-defined cuts from a rolling hash
    Rolling { target: u32, min: u32, max: u32 },
}

impl Default for ChunkerMode {
    fn default() -> Self {
        ChunkerMode::Rolling {
            target: 4096,
            min: 2048,
            max: 8192,
        }
    }
}

impl StoreConfig {
    /// load config from file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: StoreConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// reject configurations the store cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.digest != "sha256" {
            return Err(Error::InvalidConfig(format!(
                "unsupported digest algorithm: {}",
                self.digest
            )));
        }

        match self.chunker {
            ChunkerMode::Fixed { size } => {
                if size == 0 {
                    return Err(Error::InvalidConfig("fixed chunk size is zero".into()));
                }
                if size > MAX_PART_LEN {
                    return Err(Error::InvalidConfig(format!(
                        "fixed chunk size {} exceeds the {} byte manifest limit",
                        size, MAX_PART_LEN
                    )));
                }
            }
            ChunkerMode::Rolling { target, min, max } => {
                if target == 0 || min == 0 {
                    return Err(Error::InvalidConfig(
                        "rolling chunker target and min must be nonzero".into(),
                    ));
                }
                if min >= max {
                    return Err(Error::InvalidConfig(format!(
                        "rolling chunker min {} must be below max {}",
                        min, max
                    )));
                }
                if max > MAX_PART_LEN {
                    return Err(Error::InvalidConfig(format!(
                        "rolling chunker max {} exceeds the {} byte manifest limit",
                        max, MAX_PART_LEN
                    )));
                }
            }
        }

        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            digest: default_digest(),
            compression: true,
            chunker: ChunkerMode::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = StoreConfig {
            digest: "sha256".into(),
            compression: false,
            chunker: ChunkerMode::Fixed { size: 32768 },
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: StoreConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_missing_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::load(&dir.path().join("config")).unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");

        let config = StoreConfig {
            digest: "sha256".into(),
            compression: true,
            chunker: ChunkerMode::Rolling {
                target: 8192,
                min: 4096,
                max: 16384,
            },
        };
        config.save(&path).unwrap();

        let loaded = StoreConfig::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_rejects_unknown_digest() {
        let config = StoreConfig {
            digest: "skein256".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_fixed_chunks() {
        // a 64 KiB fixed chunk cannot be described by a u16 part length
        let config = StoreConfig {
            chunker: ChunkerMode::Fixed { size: 64 * 1024 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_rolling_bounds() {
        let config = StoreConfig {
            chunker: ChunkerMode::Rolling {
                target: 4096,
                min: 8192,
                max: 2048,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_rolling_max() {
        let config = StoreConfig {
            chunker: ChunkerMode::Rolling {
                target: 65536,
                min: 32768,
                max: 131072,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
