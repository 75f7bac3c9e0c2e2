use std::fs;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info};

use crate::crypto::{decrypt_archive, sha256_hex};
use crate::domain::ArchiveDescriptor;
use crate::error::OmicError;

/// Transport used to materialize a remote archive on disk. Abstracted so
/// tests can serve archives without a network.
pub trait ArchiveTransport: Send + Sync {
    fn download(&self, url: &str, destination: &Utf8Path) -> Result<(), OmicError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, OmicError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("omicbank/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| OmicError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| OmicError::Http {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl ArchiveTransport for HttpTransport {
    fn download(&self, url: &str, destination: &Utf8Path) -> Result<(), OmicError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| OmicError::Http {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "request failed".to_string());
            return Err(OmicError::HttpStatus {
                url: url.to_string(),
                status,
                message,
            });
        }

        // Stream into a sibling temp file, then rename, so an interrupted
        // download can never be mistaken for a complete archive.
        let parent = destination
            .parent()
            .ok_or_else(|| OmicError::Filesystem("invalid download path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| OmicError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("omicbank-dl")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| OmicError::Filesystem(err.to_string()))?;
        io::copy(&mut response, &mut temp).map_err(|err| OmicError::Http {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        temp.persist(destination.as_std_path())
            .map_err(|err| OmicError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

/// Downloads, decrypts and checksum-verifies encrypted remote archives.
///
/// One file is written per distinct URL; an archive already present in the
/// download directory is reused without touching the network.
pub struct CryptoArchiveFetcher<'a, T: ArchiveTransport> {
    transport: &'a T,
    download_dir: Utf8PathBuf,
    password: String,
}

impl<'a, T: ArchiveTransport> CryptoArchiveFetcher<'a, T> {
    pub fn new(transport: &'a T, download_dir: impl Into<Utf8PathBuf>, password: &str) -> Self {
        Self {
            transport,
            download_dir: download_dir.into(),
            password: password.to_string(),
        }
    }

    /// Return the decrypted plaintext of the archive, fetching it first if
    /// it is not cached locally. A checksum mismatch on the plaintext is
    /// fatal; the caller must not use partially-trusted bytes.
    pub fn fetch(&self, descriptor: &ArchiveDescriptor) -> Result<Vec<u8>, OmicError> {
        let path = self.download_dir.join(&descriptor.name);
        if path.as_std_path().exists() {
            debug!(archive = %descriptor.name, "reusing downloaded archive");
        } else {
            fs::create_dir_all(self.download_dir.as_std_path())
                .map_err(|err| OmicError::Filesystem(err.to_string()))?;
            info!(archive = %descriptor.name, url = %descriptor.url, "downloading archive");
            self.transport.download(&descriptor.url, &path)?;
        }

        let sealed = fs::read(path.as_std_path())
            .map_err(|err| OmicError::Filesystem(format!("read {path}: {err}")))?;
        let plaintext = decrypt_archive(&descriptor.name, &self.password, &sealed)?;

        let actual = sha256_hex(&plaintext);
        if actual != descriptor.checksum {
            return Err(OmicError::Integrity {
                stage: "archive",
                name: descriptor.name.clone(),
                expected: descriptor.checksum.clone(),
                actual,
            });
        }
        Ok(plaintext)
    }
}
