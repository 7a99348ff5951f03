//! Maps a request path onto a file below a root directory.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::File;

use crate::config::SendConfig;
use crate::error::{Result, SendError};
use crate::file::KnownSize;

/// Size and modification time of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl From<&std::fs::Metadata> for Metadata {
    fn from(metadata: &std::fs::Metadata) -> Self {
        Metadata {
            size: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// A resolved resource together with its byte source.
#[derive(Debug)]
pub struct Resource<S> {
    pub path: PathBuf,
    pub metadata: Metadata,
    pub source: S,
}

/// Weak validator derived from size and modification time.
pub fn etag(metadata: &Metadata) -> String {
    let mtime = metadata
        .modified
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |since| since.as_millis());
    format!("W/\"{:x}-{:x}\"", metadata.size, mtime)
}

/// Media type guessed from the file extension.
pub fn mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Resolves `raw_path`, as found in the request target, below `root` and
/// opens it for reading.
///
/// Directories resolve to their [`SendConfig::index_file`].
pub async fn resolve(root: &Path, raw_path: &str, config: &SendConfig) -> Result<Resource<KnownSize<File>>> {
    let mut path = normalize_path(root, raw_path)?;

    let mut metadata = stat(&path).await?;
    if metadata.is_dir() {
        path.push(&config.index_file);
        metadata = stat(&path).await?;
    }

    let file = File::open(&path).await.map_err(|e| {
        tracing::debug!(path = %path.display(), error = %e, "open failed");
        SendError::NotFound
    })?;

    let metadata = Metadata::from(&metadata);
    tracing::trace!(path = %path.display(), size = metadata.size, "resolved");
    Ok(Resource {
        path,
        metadata,
        source: KnownSize::sized(file, metadata.size),
    })
}

/// Decodes `raw_path` and joins it onto `root`, refusing dot segments.
pub fn normalize_path(root: &Path, raw_path: &str) -> Result<PathBuf> {
    let decoded = urlencoding::decode(raw_path).map_err(|_| SendError::BadRequest)?;
    if decoded.contains('\0') {
        return Err(SendError::BadRequest);
    }

    let mut path = root.to_path_buf();
    for segment in decoded.split(['/', '\\']) {
        match segment {
            "" => continue,
            "." | ".." => return Err(SendError::Forbidden),
            segment => path.push(segment),
        }
    }
    Ok(path)
}

async fn stat(path: &Path) -> Result<std::fs::Metadata> {
    tokio::fs::metadata(path).await.map_err(|_| SendError::NotFound)
}
