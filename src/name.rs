//! Local name resolution for incoming images.
//!
//! Derives the destination name from the source URL (or a caller-supplied
//! override), strips kind-specific archive suffixes, validates the result
//! against hostname-like syntax, and refuses to clobber an existing image
//! unless the pull was forced.

use thiserror::Error;
use url::Url;

use crate::policy::{ImageKind, PullFlags};
use crate::store::{ImageStore, StoreError};

/// Suffixes recognized on tar image names, longest first.
const TAR_SUFFIXES: &[&str] = &[".tar.bz2", ".tar.gz", ".tar.xz", ".tar.zst", ".tgz", ".tar"];

/// Suffixes recognized on raw image names, longest first.
const RAW_SUFFIXES: &[&str] = &[".qcow2", ".raw", ".img", ".bz2", ".zst", ".gz", ".xz"];

/// Maximum total length of a local image name.
const NAME_MAX: usize = 253;

/// Maximum length of a single dot-separated label.
const LABEL_MAX: usize = 63;

/// Errors from name resolution.
#[derive(Debug, Error)]
pub enum NameError {
    #[error("URL '{0}' is not valid")]
    InvalidUrl(String),

    #[error("URL '{0}' has no usable final path component")]
    NoFinalComponent(String),

    #[error("local image name '{0}' is not valid")]
    InvalidName(String),

    #[error("image '{0}' already exists")]
    AlreadyExists(String),

    #[error("failed to check whether image '{name}' exists")]
    Store {
        name: String,
        #[source]
        source: StoreError,
    },
}

/// Parse and validate an image source URL. Only http and https are pulled
/// over the wire, anything else is rejected up front.
pub fn parse_image_url(raw: &str) -> Result<Url, NameError> {
    let url = Url::parse(raw).map_err(|_| NameError::InvalidUrl(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(NameError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}

/// Resolve the local destination name for a pull.
///
/// Returns `Ok(None)` when the caller explicitly suppressed naming with
/// `-` (or an empty name); in that case the store is never queried.
/// Without `PullFlags::FORCE`, an existing image of the same name fails
/// resolution with [`NameError::AlreadyExists`].
pub fn resolve_local_name(
    kind: ImageKind,
    url: &Url,
    explicit: Option<&str>,
    flags: PullFlags,
    store: &dyn ImageStore,
) -> Result<Option<String>, NameError> {
    let candidate = match explicit {
        Some(name) => name.to_string(),
        None => url_last_component(url)?,
    };

    if candidate.is_empty() || candidate == "-" {
        return Ok(None);
    }

    let local = strip_suffixes(kind, &candidate);

    if !name_is_valid(&local) {
        return Err(NameError::InvalidName(local));
    }

    if !flags.contains(PullFlags::FORCE) {
        match store.find(kind, &local) {
            Ok(true) => return Err(NameError::AlreadyExists(local)),
            Ok(false) => {}
            Err(source) => {
                return Err(NameError::Store {
                    name: local,
                    source,
                })
            }
        }
    }

    Ok(Some(local))
}

/// Final non-empty path segment of the URL.
pub fn url_last_component(url: &Url) -> Result<String, NameError> {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
        .map(str::to_string)
        .ok_or_else(|| NameError::NoFinalComponent(url.to_string()))
}

/// Strip recognized archive suffixes, repeatedly, from a candidate name.
pub fn strip_suffixes(kind: ImageKind, name: &str) -> String {
    let suffixes = match kind {
        ImageKind::Tar => TAR_SUFFIXES,
        ImageKind::Raw => RAW_SUFFIXES,
    };

    let mut result = name;
    'outer: loop {
        for suffix in suffixes {
            if let Some(stripped) = result.strip_suffix(suffix) {
                if !stripped.is_empty() {
                    result = stripped;
                    continue 'outer;
                }
            }
        }
        break;
    }
    result.to_string()
}

/// Hostname-like validation: dot-separated labels of alphanumerics and
/// dashes, no label starting or ending with a dash.
pub fn name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > NAME_MAX {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= LABEL_MAX
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}
