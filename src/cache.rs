use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::OmicError;
use crate::store::OmicStore;

pub const MANIFEST_FILE: &str = "manifest.json";
const CELLS_FILE: &str = "cells.txt";

/// Rows per persisted block; bounds peak memory while writing a layer.
const CHUNK_ROWS: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerEntry {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    pub matrix_file: String,
    pub features_file: String,
}

/// Integrity root of a persisted dataset. Derived artifacts (embeddings,
/// cluster labels) are computed lazily and never listed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub created_at: String,
    pub primary: String,
    pub cells_file: String,
    pub layers: Vec<LayerEntry>,
    /// SHA-256 per persisted file.
    pub files: BTreeMap<String, String>,
    /// Combined digest over `files`, the pinnable dataset checksum.
    pub digest: String,
}

pub fn combined_digest(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (file, checksum) in files {
        hasher.update(file.as_bytes());
        hasher.update(b":");
        hasher.update(checksum.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// On-disk layout of one preprocessed dataset: matrix files, label files
/// and the manifest. Written once; read-only afterwards except for an
/// explicit override rebuild.
#[derive(Debug, Clone)]
pub struct PersistedLayout {
    root: Utf8PathBuf,
}

impl PersistedLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.join(MANIFEST_FILE).as_std_path().exists()
    }

    pub fn purge(&self) -> Result<(), OmicError> {
        if self.root.as_std_path().exists() {
            fs::remove_dir_all(self.root.as_std_path())
                .map_err(|err| OmicError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    /// Persist a store's cell axis, layers and feature labels. Matrices
    /// are streamed in fixed-size row chunks as little-endian f32.
    pub fn write(&self, store: &OmicStore) -> Result<Manifest, OmicError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| OmicError::CacheWrite(err.to_string()))?;

        let mut files = BTreeMap::new();

        let cells_bytes = lines_bytes(store.cell_ids());
        write_atomic(&self.root.join(CELLS_FILE), &cells_bytes)
            .map_err(|err| OmicError::CacheWrite(err.to_string()))?;
        files.insert(CELLS_FILE.to_string(), sha256_bytes(&cells_bytes));

        let layer_names: Vec<String> = store.layer_names().map(str::to_string).collect();
        let mut entries = Vec::with_capacity(layer_names.len());
        let mut writers: BTreeMap<String, (BufWriter<File>, Sha256)> = BTreeMap::new();

        for name in &layer_names {
            let layer = store.layer(name)?;
            let features_file = format!("{name}.features.txt");
            let feature_bytes = lines_bytes(layer.feature_ids());
            write_atomic(&self.root.join(&features_file), &feature_bytes)
                .map_err(|err| OmicError::CacheWrite(err.to_string()))?;
            files.insert(features_file.clone(), sha256_bytes(&feature_bytes));

            let matrix_file = format!("{name}.mat");
            let file = File::create(self.root.join(&matrix_file).as_std_path())
                .map_err(|err| OmicError::CacheWrite(err.to_string()))?;
            writers.insert(name.clone(), (BufWriter::new(file), Sha256::new()));
            entries.push(LayerEntry {
                name: name.clone(),
                rows: store.n_samples(),
                cols: layer.n_features(),
                matrix_file,
                features_file,
            });
        }

        // One pass over aligned row chunks feeds every layer's file and
        // running digest; peak memory is one chunk per layer.
        for batch in store.batches(CHUNK_ROWS) {
            for (name, block) in &batch.layers {
                let (writer, hasher) = writers.get_mut(name).expect("writer per layer");
                for value in block.iter() {
                    let bytes = value.to_le_bytes();
                    writer
                        .write_all(&bytes)
                        .map_err(|err| OmicError::CacheWrite(err.to_string()))?;
                    hasher.update(bytes);
                }
            }
        }
        for entry in &entries {
            let (writer, hasher) = writers.remove(&entry.name).expect("writer per layer");
            writer
                .into_inner()
                .map_err(|err| OmicError::CacheWrite(err.to_string()))?
                .sync_all()
                .map_err(|err| OmicError::CacheWrite(err.to_string()))?;
            files.insert(entry.matrix_file.clone(), hex::encode(hasher.finalize()));
        }

        let digest = combined_digest(&files);
        let manifest = Manifest {
            name: store.name().to_string(),
            created_at: Utc::now().to_rfc3339(),
            primary: store.active_layer().to_string(),
            cells_file: CELLS_FILE.to_string(),
            layers: entries,
            files,
            digest,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| OmicError::CacheWrite(err.to_string()))?;
        write_atomic(&self.root.join(MANIFEST_FILE), &manifest_bytes)
            .map_err(|err| OmicError::CacheWrite(err.to_string()))?;
        info!(root = %self.root, "persisted dataset");
        Ok(manifest)
    }

    pub fn read_manifest(&self) -> Result<Manifest, OmicError> {
        let path = self.root.join(MANIFEST_FILE);
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| OmicError::Filesystem(format!("read {path}: {err}")))?;
        serde_json::from_str(&content).map_err(|err| OmicError::ConfigParse(err.to_string()))
    }

    /// Re-hash every persisted file against the manifest and re-derive the
    /// combined digest. Any mismatch means tampering or a torn write.
    pub fn verify(&self) -> Result<Manifest, OmicError> {
        let manifest = self.read_manifest()?;
        for (file, expected) in &manifest.files {
            let actual = sha256_file(&self.root.join(file))?;
            if &actual != expected {
                return Err(OmicError::Integrity {
                    stage: "cache",
                    name: file.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        let derived = combined_digest(&manifest.files);
        if derived != manifest.digest {
            return Err(OmicError::Integrity {
                stage: "cache",
                name: MANIFEST_FILE.to_string(),
                expected: manifest.digest.clone(),
                actual: derived,
            });
        }
        Ok(manifest)
    }

    /// Reconstruct a store from the persisted layout. Call [`verify`]
    /// first; this trusts the manifest's shapes.
    ///
    /// [`verify`]: PersistedLayout::verify
    pub fn load(&self) -> Result<OmicStore, OmicError> {
        let manifest = self.read_manifest()?;
        let cell_ids = read_lines(&self.root.join(&manifest.cells_file))?;

        let mut store: Option<OmicStore> = None;
        let primary_entry = manifest
            .layers
            .iter()
            .find(|entry| entry.name == manifest.primary)
            .ok_or_else(|| {
                OmicError::CacheWrite(format!(
                    "manifest lists no layer entry for primary {}",
                    manifest.primary
                ))
            })?;
        for entry in std::iter::once(primary_entry)
            .chain(manifest.layers.iter().filter(|e| e.name != manifest.primary))
        {
            let feature_ids = read_lines(&self.root.join(&entry.features_file))?;
            let matrix = read_matrix(&self.root.join(&entry.matrix_file), entry.rows, entry.cols)?;
            match &mut store {
                None => {
                    store = Some(OmicStore::new(
                        manifest.name.clone(),
                        cell_ids.clone(),
                        &entry.name,
                        matrix,
                        feature_ids,
                    )?);
                }
                Some(existing) => existing.add_layer(&entry.name, matrix, feature_ids)?,
            }
        }
        store.ok_or_else(|| OmicError::CacheWrite("manifest lists no layers".to_string()))
    }
}

/// Serve the cached dataset when its manifest checks out; otherwise purge
/// whatever is there and rebuild from scratch via `builder`. The returned
/// store is always constructed from the validated persisted form.
pub fn load_or_build(
    layout: &PersistedLayout,
    expected_digest: Option<&str>,
    override_cache: bool,
    builder: impl FnOnce() -> Result<OmicStore, OmicError>,
) -> Result<OmicStore, OmicError> {
    if override_cache {
        layout.purge()?;
    }
    if layout.exists() {
        match layout.verify() {
            Ok(manifest) => {
                let pinned_ok = expected_digest.is_none_or(|pin| pin == manifest.digest);
                if pinned_ok {
                    info!(root = %layout.root(), "serving cached dataset");
                    return layout.load();
                }
                warn!(
                    root = %layout.root(),
                    "cached dataset digest does not match pinned value, rebuilding"
                );
                layout.purge()?;
            }
            Err(err) => {
                warn!(root = %layout.root(), %err, "cached dataset failed verification, rebuilding");
                layout.purge()?;
            }
        }
    }

    let built = builder()?;
    layout.write(&built)?;
    let manifest = layout
        .verify()
        .map_err(|err| OmicError::CacheWrite(format!("fresh dataset failed re-verification: {err}")))?;
    if let Some(pin) = expected_digest {
        if pin != manifest.digest {
            layout.purge()?;
            return Err(OmicError::Integrity {
                stage: "dataset",
                name: layout.root().to_string(),
                expected: pin.to_string(),
                actual: manifest.digest,
            });
        }
    }
    layout
        .load()
        .map_err(|err| OmicError::CacheWrite(format!("fresh dataset is unreadable: {err}")))
}

fn lines_bytes(lines: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    out
}

fn read_lines(path: &Utf8Path) -> Result<Vec<String>, OmicError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| OmicError::Filesystem(format!("read {path}: {err}")))?;
    Ok(content.lines().map(str::to_string).collect())
}

fn read_matrix(path: &Utf8Path, rows: usize, cols: usize) -> Result<Array2<f32>, OmicError> {
    let bytes = fs::read(path.as_std_path())
        .map_err(|err| OmicError::Filesystem(format!("read {path}: {err}")))?;
    if bytes.len() != rows * cols * 4 {
        return Err(OmicError::CacheWrite(format!(
            "{path}: expected {} bytes for {rows}x{cols}, found {}",
            rows * cols * 4,
            bytes.len()
        )));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Array2::from_shape_vec((rows, cols), values)
        .map_err(|err| OmicError::CacheWrite(err.to_string()))
}

fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn sha256_file(path: &Utf8Path) -> Result<String, OmicError> {
    let mut file = File::open(path.as_std_path())
        .map_err(|err| OmicError::Filesystem(format!("open {path}: {err}")))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| OmicError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), OmicError> {
    let parent = path
        .parent()
        .ok_or_else(|| OmicError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| OmicError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix("omicbank-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| OmicError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| OmicError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| OmicError::Filesystem(err.to_string()))?;
    Ok(())
}
