use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use futures::StreamExt;
use nodectl_protocol::DownloadProgress;
use nodectl_protocol::ReleaseInfo;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::debug;
use tracing::info;

use crate::error::TransferError;

/// Release index queried for the latest worker binary. GitHub-style "latest
/// release" document; overridable so tests and forks can point elsewhere.
pub const RELEASE_INDEX_URL: &str =
    "https://api.github.com/repos/nnlgsakib/open-hash-db/releases/latest";

const USER_AGENT: &str = concat!("nodectl/", env!("CARGO_PKG_VERSION"));

/// Emit a progress event roughly this often, by received bytes. Coalescing
/// keeps slow observers from being flooded by per-chunk updates.
const PROGRESS_EMIT_STEP: u64 = 128 * 1024;

/// Name of the worker binary inside the install location.
pub fn worker_binary_name() -> &'static str {
    if cfg!(windows) { "openhash.exe" } else { "openhash" }
}

/// Where the worker binary lives for a given data directory. Spawn and
/// update must agree on this path.
pub fn worker_binary_path(db_path: &str) -> PathBuf {
    Path::new(db_path).join(worker_binary_name())
}

#[derive(Debug, Deserialize)]
struct ReleaseDoc {
    tag_name: String,
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: u64,
}

/// Fetches release metadata and streams binaries to disk.
#[derive(Debug, Clone)]
pub struct ReleaseClient {
    http: reqwest::Client,
    index_url: String,
}

impl ReleaseClient {
    pub fn new(index_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            index_url: index_url.into(),
        }
    }

    /// Queries the release index for the newest published worker binary.
    pub async fn latest(&self) -> Result<ReleaseInfo, TransferError> {
        let response = self
            .http
            .get(&self.index_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(TransferError::network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Http {
                status: status.as_u16(),
            });
        }
        let doc: ReleaseDoc = response.json().await.map_err(TransferError::network)?;
        let wanted = worker_binary_name();
        let asset = doc
            .assets
            .into_iter()
            .find(|asset| asset.name == wanted)
            .ok_or_else(|| TransferError::NoReleaseFound {
                asset: wanted.to_string(),
            })?;
        info!(version = %doc.tag_name, "release index answered");
        Ok(ReleaseInfo {
            version: doc.tag_name,
            url: asset.browser_download_url,
            size: asset.size,
        })
    }

    /// Streams `url` into `dest`, reporting coalesced, non-decreasing
    /// progress through `on_progress`.
    ///
    /// The body is written to a temp file in `dest`'s directory and renamed
    /// into place only after the full expected length arrived, so a failed
    /// transfer never leaves a half-written binary at `dest`.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        expected_size: u64,
        mut on_progress: impl FnMut(DownloadProgress),
    ) -> Result<(), TransferError> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(TransferError::network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Http {
                status: status.as_u16(),
            });
        }

        let dir = dest.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir).map_err(TransferError::io)?;
        // Temp file lives next to dest so the final rename stays on one
        // filesystem. Dropping it on any error path removes the partial.
        let mut tmp = NamedTempFile::new_in(dir).map_err(TransferError::io)?;

        let mut received: u64 = 0;
        let mut last_emitted: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(TransferError::network)?;
            tmp.write_all(&chunk).map_err(TransferError::io)?;
            received += chunk.len() as u64;
            if received - last_emitted >= PROGRESS_EMIT_STEP {
                last_emitted = received;
                on_progress(DownloadProgress {
                    bytes_received: received,
                    bytes_total: expected_size,
                });
            }
        }

        if expected_size > 0 && received < expected_size {
            debug!(received, expected_size, "transfer ended early");
            return Err(TransferError::IncompleteTransfer {
                received,
                expected: expected_size,
            });
        }

        // Final progress always fires so observers see the terminal count.
        on_progress(DownloadProgress {
            bytes_received: received,
            bytes_total: expected_size,
        });

        tmp.as_file().sync_all().map_err(TransferError::io)?;
        set_executable(tmp.as_file())?;
        tmp.persist(dest)
            .map_err(|err| TransferError::io(err.error))?;
        info!(dest = %dest.display(), received, "worker binary installed");
        Ok(())
    }
}

#[cfg(unix)]
fn set_executable(file: &std::fs::File) -> Result<(), TransferError> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o755))
        .map_err(TransferError::io)
}

#[cfg(not(unix))]
fn set_executable(_file: &std::fs::File) -> Result<(), TransferError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_path_is_rooted_in_the_data_dir() {
        let path = worker_binary_path("data/data1/node1");
        assert!(path.starts_with("data/data1/node1"));
        assert!(path.ends_with(worker_binary_name()));
    }
}
