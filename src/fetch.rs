//! Built-in HTTP transport: streams an image and its side-car artifacts
//! into the image root.
//!
//! This is deliberately a modest puller: it downloads over http(s), stages
//! through a temporary file, optionally verifies a SHA-256 checksum against
//! the published `SHA256SUMS` file, and renames into place. Decompression
//! and unpacking are left to whatever consumes the store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::name;
use crate::policy::{PullFlags, VerifyMode};
use crate::puller::{PullError, PullRequest, Puller};

/// Side-car artifacts by flag, with the suffix appended to the
/// suffix-stripped image name on both the remote and local side.
const SIDECARS: [(PullFlags, &str); 4] = [
    (PullFlags::SETTINGS, ".nspawn"),
    (PullFlags::ROOTHASH, ".roothash"),
    (PullFlags::ROOTHASH_SIGNATURE, ".roothash.p7s"),
    (PullFlags::VERITY, ".verity"),
];

/// HTTP(S) puller for tar and raw images.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, PullError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("imgpull/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PullError::Transfer(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Download `url` into `dest`, staging through a temporary file in the
    /// same directory. When `expected_sha256` is given, the stream is
    /// hashed on the way through and a mismatch fails before the rename.
    async fn fetch_to_file(
        &self,
        url: &Url,
        dest: &Path,
        expected_sha256: Option<&str>,
    ) -> Result<(), PullError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| PullError::Http {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PullError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| PullError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let tmp_path = dest.with_file_name(format!(".pull-{file_name}.tmp"));
        let mut staging = StagingFile::create(&tmp_path).await?;

        let mut hasher = expected_sha256.map(|_| Sha256::new());
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| PullError::Http {
                url: url.to_string(),
                source,
            })?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            staging.write_all(&chunk).await?;
        }
        staging.flush().await?;

        if let (Some(hasher), Some(expected)) = (hasher, expected_sha256) {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(PullError::ChecksumMismatch {
                    file: file_name,
                    expected: expected.to_ascii_lowercase(),
                    actual,
                });
            }
        }

        staging.commit(dest).await
    }

    /// Fetch the `SHA256SUMS` file next to the image and return the entry
    /// for `file`.
    async fn fetch_checksum(&self, image_url: &Url, file: &str) -> Result<String, PullError> {
        let sums_url = image_url
            .join("SHA256SUMS")
            .map_err(|_| PullError::Transfer(format!("cannot derive checksum URL from '{image_url}'")))?;

        let response = self
            .client
            .get(sums_url.clone())
            .send()
            .await
            .map_err(|source| PullError::Http {
                url: sums_url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(PullError::Status {
                url: sums_url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await.map_err(|source| PullError::Http {
            url: sums_url.to_string(),
            source,
        })?;

        find_checksum(&body, file).ok_or_else(|| PullError::MissingChecksum {
            file: file.to_string(),
            sums: sums_url.to_string(),
        })
    }
}

#[async_trait]
impl Puller for HttpFetcher {
    async fn pull(&self, request: &PullRequest) -> Result<(), PullError> {
        // The built-in transport has no keyring; signature verification
        // needs an external puller.
        if request.verify == VerifyMode::Signature {
            return Err(PullError::SignatureUnsupported);
        }

        let remote_name = name::url_last_component(&request.url)
            .map_err(|_| PullError::Transfer(format!("URL '{}' has no file name", request.url)))?;
        let remote_base = name::strip_suffixes(request.kind, &remote_name);

        let local_file = match &request.local {
            Some(local) => format!("{local}{}", request.kind.file_extension()),
            None => remote_name.clone(),
        };
        let local_base = request.local.clone().unwrap_or_else(|| remote_base.clone());
        let dest = request.image_root.join(&local_file);

        let checksum = match request.verify {
            VerifyMode::Checksum => Some(self.fetch_checksum(&request.url, &remote_name).await?),
            _ => None,
        };

        info!(url = %request.url, dest = %dest.display(), "Downloading image");
        self.fetch_to_file(&request.url, &dest, checksum.as_deref())
            .await?;

        for (flag, suffix) in SIDECARS {
            if !request.flags.contains(flag) {
                continue;
            }

            let sidecar_url = request
                .url
                .join(&format!("{remote_base}{suffix}"))
                .map_err(|_| {
                    PullError::Transfer(format!("cannot derive side-car URL for '{suffix}'"))
                })?;
            let sidecar_dest = request.image_root.join(format!("{local_base}{suffix}"));

            debug!(url = %sidecar_url, "Downloading side-car artifact");
            match self.fetch_to_file(&sidecar_url, &sidecar_dest, None).await {
                Ok(()) => {}
                // Side-cars are best-effort; servers that do not publish
                // them simply answer 404.
                Err(PullError::Status { status: 404, url }) => {
                    debug!(url = %url, "Side-car not published, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Temporary download file that is removed on drop unless committed.
struct StagingFile {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl StagingFile {
    async fn create(path: &Path) -> Result<Self, PullError> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|source| PullError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    async fn write_all(&mut self, chunk: &[u8]) -> Result<(), PullError> {
        self.file
            .as_mut()
            .expect("staging file already committed")
            .write_all(chunk)
            .await
            .map_err(|source| PullError::Io {
                path: self.path.clone(),
                source,
            })
    }

    async fn flush(&mut self) -> Result<(), PullError> {
        self.file
            .as_mut()
            .expect("staging file already committed")
            .flush()
            .await
            .map_err(|source| PullError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Rename into the final destination, replacing any existing file.
    async fn commit(mut self, dest: &Path) -> Result<(), PullError> {
        drop(self.file.take());
        tokio::fs::rename(&self.path, dest)
            .await
            .map_err(|source| PullError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
        // Nothing left to clean up.
        std::mem::forget(self);
        Ok(())
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        drop(self.file.take());
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Find the hash entry for `file` in a `SHA256SUMS`-style listing.
fn find_checksum(sums: &str, file: &str) -> Option<String> {
    for line in sums.lines() {
        let mut parts = line.split_whitespace();
        let (Some(hash), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        // Binary-mode entries are marked with a leading asterisk.
        if name.strip_prefix('*').unwrap_or(name) == file {
            return Some(hash.to_string());
        }
    }
    None
}
