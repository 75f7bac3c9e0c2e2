use crate::domain::ArchiveDescriptor;
use crate::error::OmicError;
use crate::loader::DatasetSpec;

/// Shared decryption password for the hosted CITE-seq PBMC archives.
const CITESEQ_PBMC_PASSWORD: &str = "uef-czi";

const URL_FULL: &str = "https://s3.amazonaws.com/ai-datasets/GSE100866_PBMC.rawCountData.csv.zip";
const URL_5000: &str =
    "https://s3.amazonaws.com/ai-datasets/GSE100866_PBMC.rawCountData.5000.hvg.csv.zip";
const URL_PROTEIN: &str =
    "https://s3.amazonaws.com/ai-datasets/GSE100866_PBMC.rawCountProtein.csv.zip";

const SHA_FULL: &str = "9c30f2ff1c74a9cbc8e8a4f8a1f4d2b35c8de27d87904bc5a1f9e36f7a2c61d4";
const SHA_5000: &str = "3f6a7b0a4d9f20c1d88e55a3a6c4b86abef05148be51d5a3cf29de7a410c0782";
const SHA_PROTEIN: &str = "6f0d2c9e5b8c4df3a1522ce0a9b0bfc8137703de4e19ab0a6b6e14cde3a9917b";

const DS_DIGEST_FULL: &str = "5c1f3c2e9bfb44f29e1e9b71a3f7c2d40c36ab87f5df6fdca3e2b0954177d3aa";
const DS_DIGEST_5000: &str = "b0e7d5a8f6c94c43b2d4a1c9e8f3072d661bb5e0cf249cb1a4d3f8a29c60e51b";

/// The GSE100866 CITE-seq PBMC dataset: transcript counts (full or the
/// top-5000 highly-variable genes) plus surface-protein counts for the
/// same cells.
pub fn pbmc_citeseq(filtered_genes: bool) -> DatasetSpec {
    let (name, gene_url, gene_sha, digest) = if filtered_genes {
        (
            "pbmc_citeseq_5000",
            URL_5000,
            SHA_5000,
            DS_DIGEST_5000,
        )
    } else {
        ("pbmc_citeseq", URL_FULL, SHA_FULL, DS_DIGEST_FULL)
    };
    DatasetSpec {
        name: name.to_string(),
        archives: vec![
            ArchiveDescriptor::new(basename(gene_url), gene_url, gene_sha),
            ArchiveDescriptor::new(basename(URL_PROTEIN), URL_PROTEIN, SHA_PROTEIN),
        ],
        password: CITESEQ_PBMC_PASSWORD.to_string(),
        species_marker: Some("HUMAN_".to_string()),
        expected_digest: Some(digest.to_string()),
    }
}

/// Resolve a dataset name from the built-in registry.
pub fn lookup(name: &str) -> Result<DatasetSpec, OmicError> {
    match name {
        "pbmc_citeseq" => Ok(pbmc_citeseq(false)),
        "pbmc_citeseq_5000" => Ok(pbmc_citeseq(true)),
        _ => Err(OmicError::UnknownDataset(name.to_string())),
    }
}

pub fn names() -> &'static [&'static str] {
    &["pbmc_citeseq", "pbmc_citeseq_5000"]
}

fn basename(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}
