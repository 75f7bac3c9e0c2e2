use std::fs;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::ArchiveDescriptor;
use crate::error::OmicError;
use crate::loader::DatasetSpec;

/// `omicbank.json`: user-defined datasets beyond the built-in registry.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatasetEntry {
    pub name: String,
    pub password: String,
    pub archives: Vec<ArchiveEntry>,
    #[serde(default)]
    pub species_marker: Option<String>,
    #[serde(default)]
    pub expected_digest: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ArchiveEntry {
    pub url: String,
    pub checksum: String,
    /// Local file name; defaults to the URL basename.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub datasets: Vec<DatasetSpec>,
}

impl ResolvedConfig {
    pub fn dataset(&self, name: &str) -> Option<&DatasetSpec> {
        self.datasets.iter().find(|spec| spec.name == name)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, OmicError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from("omicbank.json"),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Err(OmicError::MissingConfig);
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| OmicError::ConfigRead(config_path.clone()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|err| OmicError::ConfigParse(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, OmicError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let mut datasets = Vec::with_capacity(config.datasets.len());
        for entry in config.datasets {
            if entry.archives.is_empty() {
                return Err(OmicError::ConfigParse(format!(
                    "dataset {} lists no archives",
                    entry.name
                )));
            }
            let archives = entry
                .archives
                .into_iter()
                .map(|archive| {
                    let name = archive.name.unwrap_or_else(|| {
                        archive
                            .url
                            .rsplit('/')
                            .next()
                            .unwrap_or(archive.url.as_str())
                            .to_string()
                    });
                    ArchiveDescriptor::new(name, archive.url, archive.checksum)
                })
                .collect();
            datasets.push(DatasetSpec {
                name: entry.name,
                archives,
                password: entry.password,
                species_marker: entry.species_marker,
                expected_digest: entry.expected_digest,
            });
        }
        Ok(ResolvedConfig {
            schema_version,
            datasets,
        })
    }
}
