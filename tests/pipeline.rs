use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Write};
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use omicbank::cache::{MANIFEST_FILE, PersistedLayout};
use omicbank::crypto::{encrypt_archive, sha256_hex};
use omicbank::domain::ArchiveDescriptor;
use omicbank::error::OmicError;
use omicbank::fetch::ArchiveTransport;
use omicbank::loader::{DatasetSpec, LoadOptions, Workspace, load_dataset};

const PASSWORD: &str = "uef-czi";

const GENE_CSV: &str = "\
,cell_a,cell_b,cell_c,cell_d
HUMAN_CD19,4,0,2,7
HUMAN_CD3,0,0,0,0
MOUSE_Trbc1,5,5,5,5
HUMAN_CD8,3,1,0,2
HUMAN_NKG7,9,2,8,1
";

const PROTEIN_CSV: &str = "\
,cell_a,cell_b,cell_c,cell_d
CD19,11,0,13,14
CD8,20,21,0,23
";

fn zip_of(members: &[(&str, &str)]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(&mut cursor);
    for (name, text) in members {
        writer
            .start_file(name.to_string(), zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(text.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
    cursor.into_inner()
}

struct MapTransport {
    archives: BTreeMap<String, Vec<u8>>,
    downloads: Mutex<Vec<String>>,
}

impl MapTransport {
    fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

impl ArchiveTransport for MapTransport {
    fn download(&self, url: &str, destination: &Utf8Path) -> Result<(), OmicError> {
        self.downloads.lock().unwrap().push(url.to_string());
        let payload = self
            .archives
            .get(url)
            .ok_or_else(|| OmicError::HttpStatus {
                url: url.to_string(),
                status: 404,
                message: "not found".to_string(),
            })?;
        fs::write(destination.as_std_path(), payload)
            .map_err(|err| OmicError::Filesystem(err.to_string()))
    }
}

struct Fixture {
    transport: MapTransport,
    workspace: Workspace,
    spec: DatasetSpec,
    _temp: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let gene_zip = zip_of(&[("GSE_test.rawCountData.csv", GENE_CSV)]);
    let protein_zip = zip_of(&[("GSE_test.rawCountProtein.csv", PROTEIN_CSV)]);
    let gene_sealed = encrypt_archive(PASSWORD, &[11u8; 12], &gene_zip).unwrap();
    let protein_sealed = encrypt_archive(PASSWORD, &[22u8; 12], &protein_zip).unwrap();

    let mut archives = BTreeMap::new();
    archives.insert("https://archive.test/genes.zip".to_string(), gene_sealed);
    archives.insert("https://archive.test/proteins.zip".to_string(), protein_sealed);

    let temp = tempfile::tempdir().unwrap();
    let workspace = Workspace::new_with_roots(
        Utf8PathBuf::from_path_buf(temp.path().join("downloads")).unwrap(),
        Utf8PathBuf::from_path_buf(temp.path().join("datasets")).unwrap(),
    );
    let spec = DatasetSpec {
        name: "pbmc_fixture".to_string(),
        archives: vec![
            ArchiveDescriptor::new(
                "genes.zip",
                "https://archive.test/genes.zip",
                sha256_hex(&gene_zip),
            ),
            ArchiveDescriptor::new(
                "proteins.zip",
                "https://archive.test/proteins.zip",
                sha256_hex(&protein_zip),
            ),
        ],
        password: PASSWORD.to_string(),
        species_marker: Some("HUMAN_".to_string()),
        expected_digest: None,
    };
    Fixture {
        transport: MapTransport {
            archives,
            downloads: Mutex::new(Vec::new()),
        },
        workspace,
        spec,
        _temp: temp,
    }
}

#[test]
fn pipeline_builds_filtered_aligned_store() {
    let fixture = fixture();
    let store = load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions::default(),
    )
    .unwrap();

    assert_eq!(store.n_samples(), 4);
    // MOUSE_ gene dropped by the species filter, all-zero CD3 dropped too.
    assert_eq!(
        store.layer("transcriptomic").unwrap().feature_ids(),
        &["CD19".to_string(), "CD8".to_string(), "NKG7".to_string()]
    );
    assert_eq!(store.values("proteomic").unwrap().dim(), (4, 2));
    // Both layers describe the same cells in the same order.
    assert_eq!(
        store.cell_ids(),
        &[
            "cell_a".to_string(),
            "cell_b".to_string(),
            "cell_c".to_string(),
            "cell_d".to_string()
        ]
    );
}

#[test]
fn pipeline_is_idempotent_with_one_download_per_url() {
    let fixture = fixture();
    let first = load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions::default(),
    )
    .unwrap();
    let second = load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions::default(),
    )
    .unwrap();

    assert_eq!(fixture.transport.download_count(), 2);
    for layer in ["transcriptomic", "proteomic"] {
        assert_eq!(first.values(layer).unwrap(), second.values(layer).unwrap());
    }

    // Persisted arrays are byte-identical across both invocations.
    let layout = PersistedLayout::new(fixture.workspace.dataset_dir(&fixture.spec.name));
    let manifest = layout.verify().unwrap();
    let digest_before = manifest.digest.clone();
    load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions::default(),
    )
    .unwrap();
    assert_eq!(layout.verify().unwrap().digest, digest_before);
}

#[test]
fn override_rebuilds_but_reuses_downloads() {
    let fixture = fixture();
    load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions::default(),
    )
    .unwrap();
    load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions {
            override_cache: true,
        },
    )
    .unwrap();
    // Archives were already on disk; only the persisted form was rebuilt.
    assert_eq!(fixture.transport.download_count(), 2);
}

#[test]
fn tampered_cache_is_purged_and_rebuilt() {
    let fixture = fixture();
    load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions::default(),
    )
    .unwrap();

    let layout = PersistedLayout::new(fixture.workspace.dataset_dir(&fixture.spec.name));
    let manifest_path = layout.root().join(MANIFEST_FILE);
    let mut manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(manifest_path.as_std_path()).unwrap()).unwrap();
    manifest["digest"] = serde_json::Value::String("0".repeat(64));
    fs::write(
        manifest_path.as_std_path(),
        serde_json::to_vec_pretty(&manifest).unwrap(),
    )
    .unwrap();

    let store = load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions::default(),
    )
    .unwrap();
    assert_eq!(store.n_samples(), 4);
    layout.verify().unwrap();
}

#[test]
fn wrong_password_fails_decryption() {
    let mut fixture = fixture();
    fixture.spec.password = "not-the-password".to_string();
    let err = load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions::default(),
    )
    .unwrap_err();
    assert_matches!(err, OmicError::Decryption { .. });
    // No persisted artifact may be left behind.
    let layout = PersistedLayout::new(fixture.workspace.dataset_dir(&fixture.spec.name));
    assert!(!layout.exists());
}

#[test]
fn corrupted_archive_fails_integrity_with_both_digests() {
    let mut fixture = fixture();
    fixture.spec.archives[0].checksum = "f".repeat(64);
    let err = load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions::default(),
    )
    .unwrap_err();
    match err {
        OmicError::Integrity {
            stage,
            expected,
            actual,
            ..
        } => {
            assert_eq!(stage, "archive");
            assert_eq!(expected, "f".repeat(64));
            assert_ne!(expected, actual);
        }
        other => panic!("expected integrity error, got {other:?}"),
    }
}

#[test]
fn pinned_dataset_digest_accepts_matching_build() {
    let mut fixture = fixture();
    // First build learns the digest; pin it and rebuild from scratch.
    let layout = PersistedLayout::new(fixture.workspace.dataset_dir(&fixture.spec.name));
    load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions::default(),
    )
    .unwrap();
    let digest = layout.verify().unwrap().digest;
    layout.purge().unwrap();

    fixture.spec.expected_digest = Some(digest);
    let store = load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &fixture.spec,
        &LoadOptions::default(),
    )
    .unwrap();
    assert_eq!(store.n_samples(), 4);
}

#[test]
fn failed_download_leaves_no_archive_behind() {
    let fixture = fixture();
    let mut spec = fixture.spec.clone();
    spec.archives[0].url = "https://archive.test/missing.zip".to_string();
    let err = load_dataset(
        &fixture.transport,
        &fixture.workspace,
        &spec,
        &LoadOptions::default(),
    )
    .unwrap_err();
    assert_matches!(err, OmicError::HttpStatus { status: 404, .. });

    let download_dir = fixture.workspace.download_dir(&spec.name);
    let leftover = fs::read_dir(download_dir.as_std_path())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}
