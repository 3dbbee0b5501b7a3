//! Package manifest metadata provider
//!
//! A TOML file maps package names to a version, a spec file and their
//! direct runtime dependencies:
//!
//! ```toml
//! [packages.requests]
//! version = "2.31.0"
//! spec = "specs/python3-requests.spec"
//! dependencies = ["urllib3", "idna", "charset-normalizer", "certifi"]
//! ```
//!
//! Spec paths are relative to the manifest. Names match by their canonical
//! form, the same one unit ids use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::resolver::{MetadataProvider, PackageMetadata};
use crate::core::unit::canonical_name;
use crate::error::ResolverError;
use crate::infra::filesystem;

#[derive(Debug, Default, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    packages: BTreeMap<String, ManifestEntry>,
}

/// One `[packages.<name>]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    pub version: Option<String>,
    pub spec: Option<PathBuf>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// [`MetadataProvider`] backed by a manifest file
#[derive(Debug, Clone)]
pub struct ManifestProvider {
    base_dir: PathBuf,
    packages: BTreeMap<String, ManifestEntry>,
}

impl ManifestProvider {
    /// Load a manifest file
    pub fn load(path: &Path) -> Result<Self, ResolverError> {
        let content = filesystem::read_file(path).map_err(|e| ResolverError::Manifest {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_toml(&content, base_dir).map_err(|error| ResolverError::Manifest {
            path: path.to_path_buf(),
            error,
        })
    }

    /// Parse manifest text; spec paths resolve against `base_dir`
    pub fn from_toml(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self, String> {
        let file: ManifestFile =
            toml::from_str(content).map_err(|e| format!("Failed to parse TOML: {e}"))?;
        let packages = file
            .packages
            .into_iter()
            .map(|(name, entry)| (canonical_name(&name), entry))
            .collect();
        Ok(Self {
            base_dir: base_dir.into(),
            packages,
        })
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[async_trait]
impl MetadataProvider for ManifestProvider {
    async fn lookup(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<PackageMetadata, ResolverError> {
        let metadata_error = |error: String| ResolverError::Metadata {
            name: name.to_string(),
            error,
        };
        let entry = self
            .packages
            .get(&canonical_name(name))
            .ok_or_else(|| metadata_error("not in package manifest".to_string()))?;

        if let (Some(wanted), Some(known)) = (version, entry.version.as_deref()) {
            if wanted != known {
                return Err(metadata_error(format!(
                    "manifest has version {known}, {wanted} was requested"
                )));
            }
        }

        let descriptor = match &entry.spec {
            Some(spec) => Some(
                filesystem::read_file(&self.base_dir.join(spec))
                    .map_err(|e| metadata_error(e.to_string()))?,
            ),
            None => None,
        };

        Ok(PackageMetadata {
            version: entry.version.clone(),
            descriptor,
            dependencies: entry.dependencies.clone(),
        })
    }
}
