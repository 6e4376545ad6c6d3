//! Settings file.
//!
//! Every section is optional, missing keys take their defaults:
//!
//! ```toml
//! [store]
//! digest_algorithm = "sha256"
//!
//! [repack]
//! compression = "gzip"
//! mask_volumes = true
//! created_by = "oci-repack repack"
//! ```
use crate::{
    error::{Error, Result},
    mutate::Compression,
    store::StoreConfig,
};
use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path};

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "OCI_REPACK_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store: StoreConfig,
    pub repack: RepackConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepackConfig {
    pub compression: Compression,
    /// Leave paths under the image's declared volumes out of new layers.
    pub mask_volumes: bool,
    /// Default `created_by` of the history entry a repack records.
    pub created_by: String,
}

impl Default for RepackConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            mask_volumes: true,
            created_by: "oci-repack repack".to_owned(),
        }
    }
}

impl Config {
    /// Loads the settings file at `path`, or the defaults when there is none.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(format!("config file {}", path.display()))
            } else {
                e.into()
            }
        })?;
        let config = toml::from_str(&content)
            .map_err(|e| Error::Invalid(format!("config file {}: {e}", path.display())))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestAlgorithm;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.store.digest_algorithm, DigestAlgorithm::Sha256);
        assert_eq!(config.repack.compression, Compression::Gzip);
        assert!(config.repack.mask_volumes);
        assert_eq!(config.repack.created_by, "oci-repack repack");
    }

    #[test]
    fn test_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("repack.toml");
        fs::write(&path, "[repack]\ncompression = \"none\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.repack.compression, Compression::None);
        assert!(config.repack.mask_volumes);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_bad_files() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.toml");
        assert!(Config::load(Some(&missing)).unwrap_err().is_not_found());

        let path = temp_dir.path().join("bad.toml");
        fs::write(&path, "[store]\ndigest_algorithm = \"md5\"\n").unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(Error::Invalid(_))));

        fs::write(&path, "[repak]\n").unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(Error::Invalid(_))));
    }
}
