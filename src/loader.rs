use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{PersistedLayout, load_or_build};
use crate::domain::{ArchiveDescriptor, OmicKind};
use crate::error::OmicError;
use crate::extract::{
    RawTable, check_cell_alignment, check_sample_counts, drop_allzero_columns, extract_tables,
    filter_marked_columns,
};
use crate::fetch::{ArchiveTransport, CryptoArchiveFetcher};
use crate::store::OmicStore;

/// Member names containing this marker are routed to the proteomic layer;
/// everything else feeds the transcriptomic layer.
const PROTEIN_MEMBER_MARKER: &str = "Protein";

/// Everything needed to acquire and preprocess one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub archives: Vec<ArchiveDescriptor>,
    pub password: String,
    /// Columns of the primary layer must match this prefix; the prefix is
    /// stripped from survivors. `None` keeps every column.
    #[serde(default)]
    pub species_marker: Option<String>,
    /// Pinned combined digest of the persisted dataset, when known.
    #[serde(default)]
    pub expected_digest: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Delete any persisted form and rebuild from the raw archives.
    pub override_cache: bool,
}

/// Root directories for downloaded archives and preprocessed datasets.
#[derive(Debug, Clone)]
pub struct Workspace {
    download_root: Utf8PathBuf,
    data_root: Utf8PathBuf,
}

impl Workspace {
    pub fn new() -> Result<Self, OmicError> {
        let base = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("omicbank")).ok()
            })
            .ok_or_else(|| OmicError::Filesystem("unable to resolve cache directory".to_string()))?;
        Ok(Self {
            download_root: base.join("downloads"),
            data_root: base.join("datasets"),
        })
    }

    pub fn new_with_roots(download_root: Utf8PathBuf, data_root: Utf8PathBuf) -> Self {
        Self {
            download_root,
            data_root,
        }
    }

    pub fn download_dir(&self, dataset: &str) -> Utf8PathBuf {
        self.download_root.join(dataset)
    }

    pub fn dataset_dir(&self, dataset: &str) -> Utf8PathBuf {
        self.data_root.join(dataset)
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn clear(&self) -> Result<(), OmicError> {
        for root in [&self.download_root, &self.data_root] {
            if root.as_std_path().exists() {
                std::fs::remove_dir_all(root.as_std_path())
                    .map_err(|err| OmicError::Filesystem(err.to_string()))?;
            }
        }
        Ok(())
    }
}

/// Acquire a dataset: serve the verified persisted form when present,
/// otherwise download, decrypt, checksum, parse, align and persist.
pub fn load_dataset<T: ArchiveTransport>(
    transport: &T,
    workspace: &Workspace,
    spec: &DatasetSpec,
    options: &LoadOptions,
) -> Result<OmicStore, OmicError> {
    let layout = PersistedLayout::new(workspace.dataset_dir(&spec.name));
    load_or_build(
        &layout,
        spec.expected_digest.as_deref(),
        options.override_cache,
        || build_dataset(transport, workspace, spec),
    )
}

fn build_dataset<T: ArchiveTransport>(
    transport: &T,
    workspace: &Workspace,
    spec: &DatasetSpec,
) -> Result<OmicStore, OmicError> {
    let fetcher =
        CryptoArchiveFetcher::new(transport, workspace.download_dir(&spec.name), &spec.password);

    // Deterministic archive order keeps rebuilds byte-identical.
    let mut archives = spec.archives.clone();
    archives.sort_by(|a, b| a.name.cmp(&b.name));

    let mut tables: BTreeMap<String, RawTable> = BTreeMap::new();
    for descriptor in &archives {
        info!(archive = %descriptor.name, "extracting");
        let plaintext = fetcher.fetch(descriptor)?;
        for (member, table) in extract_tables(&descriptor.name, &plaintext)? {
            // Hosted matrices are feature-major; flip to cells-as-rows.
            tables.insert(member, table.transposed());
        }
    }

    // Pre-alignment guard over every parsed block, before any zipping.
    check_sample_counts(tables.values())?;

    let mut genes: Option<(String, RawTable)> = None;
    let mut proteins: Option<(String, RawTable)> = None;
    for (member, table) in tables {
        let slot = if member.contains(PROTEIN_MEMBER_MARKER) {
            &mut proteins
        } else {
            &mut genes
        };
        if let Some((existing, _)) = slot {
            return Err(OmicError::Parse {
                member: member.clone(),
                reason: format!("duplicate member for one logical matrix (already saw {existing})"),
            });
        }
        *slot = Some((member, table));
    }
    let (gene_member, mut gene_table) = genes.ok_or_else(|| OmicError::Parse {
        member: spec.name.clone(),
        reason: "no transcript count member found".to_string(),
    })?;

    if let Some(marker) = &spec.species_marker {
        let pattern = Regex::new(&format!("^{}", regex::escape(marker)))
            .map_err(|err| OmicError::InvalidArgument(err.to_string()))?;
        let (filtered, dropped) = filter_marked_columns(gene_table, &pattern);
        info!(dropped, marker = %marker, "filtered foreign species genes");
        gene_table = filtered;
    }
    let (gene_table, dropped) = drop_allzero_columns(gene_table);
    info!(dropped, "dropped all-zero genes");

    if let Some((protein_member, protein_table)) = &proteins {
        check_cell_alignment(&gene_member, &gene_table, protein_member, protein_table)?;
    }

    let mut store = OmicStore::new(
        spec.name.clone(),
        gene_table.row_labels,
        OmicKind::Transcriptomic.as_str(),
        gene_table.values,
        gene_table.col_labels,
    )?;
    if let Some((_, protein_table)) = proteins {
        store.add_layer(
            OmicKind::Proteomic.as_str(),
            protein_table.values,
            protein_table.col_labels,
        )?;
    }
    store.set_active(OmicKind::Transcriptomic.as_str())?;
    Ok(store)
}
