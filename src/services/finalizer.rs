//! Finalizer: moves a verified artifact into the output directory under a
//! collision-resistant name and clears the session's staging state.
//!
//! Final names have the form `<token>_<timestamp>_<name>`: an 8 hex
//! character random token, a `YYYYMMDDhhmmss` UTC timestamp, and the
//! client's filename reduced to its last path component.
//!
//! Relocation is a single `rename` when staging and output share a
//! filesystem. Across volumes the bytes are copied into a `.partial` file in
//! the output directory, synced, and renamed into place, so a final name
//! never refers to a truncated file. A crash mid-copy leaves only the
//! `.partial` marker, which [`Finalizer::sweep_partials`] removes at startup.

use chrono::{DateTime, Utc};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::fs::{self, File};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    chunk_store::ChunkStore,
    error::{UploadError, UploadResult},
    reassembler::StagedArtifact,
    transfer::{self, TransferError},
};

const PARTIAL_SUFFIX: &str = ".partial";
const FALLBACK_NAME: &str = "upload";
const MAX_NAME_ATTEMPTS: usize = 8;
/// NAME_MAX (255 bytes) less the `.` and `.partial` of the copy marker.
const MAX_FINAL_NAME_BYTES: usize = 255 - 1 - PARTIAL_SUFFIX.len();
/// `<8 hex>_<14 digits>_`.
const FINAL_NAME_PREFIX_BYTES: usize = 8 + 1 + 14 + 1;

#[derive(Clone, Debug)]
pub struct FinalizedFile {
    pub stored_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Clone, Debug)]
pub struct Finalizer {
    output_dir: PathBuf,
    store: ChunkStore,
}

impl Finalizer {
    pub fn new(output_dir: impl Into<PathBuf>, store: ChunkStore) -> Self {
        Self {
            output_dir: output_dir.into(),
            store,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Relocate a reassembled session artifact and purge its staging
    /// directory. On failure staging is left untouched.
    pub async fn finalize(
        &self,
        artifact: &StagedArtifact,
        original_filename: &str,
        cancel: &CancellationToken,
    ) -> UploadResult<FinalizedFile> {
        let finalized = self.place(&artifact.path, original_filename, cancel).await?;
        if let Err(err) = self.store.purge_session(&artifact.session_id).await {
            warn!(
                session_id = %artifact.session_id,
                "finalized but failed to purge staging: {}", err
            );
        }
        Ok(finalized)
    }

    /// Relocate any completed file into the output directory under a fresh
    /// final name.
    pub async fn place(
        &self,
        source: &Path,
        original_filename: &str,
        cancel: &CancellationToken,
    ) -> UploadResult<FinalizedFile> {
        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(UploadError::Finalize)?;

        let (stored_name, destination) = self.unused_destination(original_filename).await?;
        relocate(source, &destination, cancel).await?;

        let size_bytes = fs::metadata(&destination)
            .await
            .map_err(UploadError::Finalize)?
            .len();
        info!(
            stored_name = %stored_name,
            bytes = size_bytes,
            "finalized upload into {}",
            self.output_dir.display()
        );

        Ok(FinalizedFile {
            stored_name,
            path: destination,
            size_bytes,
        })
    }

    async fn unused_destination(&self, original_filename: &str) -> UploadResult<(String, PathBuf)> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = final_name(original_filename, Utc::now());
            let path = self.output_dir.join(&name);
            if !fs::try_exists(&path).await.map_err(UploadError::Finalize)? {
                return Ok((name, path));
            }
            debug!("final name {} already taken, drawing a new token", name);
        }
        Err(UploadError::Finalize(io::Error::new(
            ErrorKind::AlreadyExists,
            "could not find an unused final name",
        )))
    }

    /// Delete `.partial` files left by an interrupted cross-volume copy.
    pub async fn sweep_partials(&self) -> UploadResult<usize> {
        fs::create_dir_all(&self.output_dir).await?;
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_partial = entry
                .file_name()
                .to_str()
                .is_some_and(is_partial_marker);
            if !is_partial {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    warn!("removed interrupted copy {}", entry.path().display());
                    removed += 1;
                }
                Err(err) => warn!("failed to remove {}: {}", entry.path().display(), err),
            }
        }
        Ok(removed)
    }
}

/// Compose `<8 hex>_<YYYYMMDDhhmmss>_<sanitized name>`.
pub fn final_name(original_filename: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        random_token(),
        now.format("%Y%m%d%H%M%S"),
        sanitize_filename(original_filename)
    )
}

/// Four random bytes as eight lowercase hex characters.
fn random_token() -> String {
    Uuid::new_v4().as_bytes()[..4]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Reduce an untrusted client filename to a single safe path component.
///
/// Both `/` and `\` count as separators, control characters are dropped,
/// and names that are empty or consist only of dots fall back to `upload`.
/// The result is short enough that the full final name fits in NAME_MAX.
pub fn sanitize_filename(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        FALLBACK_NAME.to_string()
    } else {
        truncate_name(cleaned, MAX_FINAL_NAME_BYTES - FINAL_NAME_PREFIX_BYTES)
    }
}

/// Cut `name` to at most `max` bytes on a char boundary, keeping a short
/// extension when there is one.
fn truncate_name(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= max / 2 => name.split_at(dot),
        _ => (name, ""),
    };
    let mut end = max - ext.len();
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &stem[..end], ext)
}

/// `.name.partial`, as written by [`partial_path`]. Final names start with
/// their hex token, never a dot.
fn is_partial_marker(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)
}

async fn relocate(
    source: &Path,
    destination: &Path,
    cancel: &CancellationToken,
) -> UploadResult<()> {
    match fs::rename(source, destination).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::CrossesDevices => {
            debug!(
                "{} and {} are on different volumes, copying",
                source.display(),
                destination.display()
            );
            copy_across_volumes(source, destination, cancel).await
        }
        Err(err) => Err(UploadError::Finalize(err)),
    }
}

async fn copy_across_volumes(
    source: &Path,
    destination: &Path,
    cancel: &CancellationToken,
) -> UploadResult<()> {
    let partial = partial_path(destination);
    let result = async {
        let mut input = File::open(source).await?;
        let mut output = File::create(&partial).await?;
        transfer::copy(&mut output, &mut input, cancel).await?;
        output.sync_all().await?;
        drop(output);
        fs::rename(&partial, destination).await?;
        Ok::<(), TransferError>(())
    }
    .await;

    if let Err(err) = result {
        let _ = fs::remove_file(&partial).await;
        return Err(match err {
            TransferError::Cancelled(_) => UploadError::Cancelled,
            other => UploadError::Finalize(other.into_io()),
        });
    }

    fs::remove_file(source).await.map_err(UploadError::Finalize)
}

fn partial_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}{}", name, PARTIAL_SUFFIX))
}
