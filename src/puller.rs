//! Puller interface and mock implementation.
//!
//! A puller performs the actual transfer, verification, and
//! materialization for one image kind. The orchestrator only sees this
//! narrow seam: one request in, exactly one terminal result out. The
//! built-in HTTP transport lives in [`crate::fetch`]; the mock here is
//! used for testing the orchestration layer without a network.

use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::policy::{ImageKind, PullFlags, PullPolicy, VerifyMode};

/// One in-flight pull operation, built after name resolution succeeded.
///
/// The flags are already filtered through the kind-specific mask, so a
/// puller never has to second-guess which side-cars apply to its kind.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub kind: ImageKind,
    pub url: Url,
    /// Resolved local name, or `None` to store by URL identity only.
    pub local: Option<String>,
    pub flags: PullFlags,
    pub verify: VerifyMode,
    pub image_root: PathBuf,
}

impl PullRequest {
    /// Build a request from the resolved name and the invocation policy,
    /// applying the kind mask to the policy flags.
    pub fn new(kind: ImageKind, url: Url, local: Option<String>, policy: &PullPolicy) -> Self {
        Self {
            kind,
            url,
            local,
            flags: policy.flags.masked_for(kind),
            verify: policy.verify,
            image_root: policy.image_root.clone(),
        }
    }
}

/// Errors reported by a puller through its terminal result.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("signature verification is not supported by the built-in transport")]
    SignatureUnsupported,

    #[error("request for '{url}' failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("server returned HTTP {status} for '{url}'")]
    Status { url: String, status: u16 },

    #[error("no checksum entry for '{file}' in {sums}")]
    MissingChecksum { file: String, sums: String },

    #[error("checksum mismatch for '{file}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transfer failed: {0}")]
    Transfer(String),
}

impl PullError {
    /// Process exit code for this failure: the magnitude of the underlying
    /// OS error when there is one, a generic failure otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            PullError::Io { source, .. } => match source.raw_os_error() {
                Some(code @ 1..=255) => code as u8,
                _ => 1,
            },
            _ => 1,
        }
    }
}

/// Transfer, verification, and materialization service for images.
///
/// Implementations report exactly one terminal result per request. The
/// orchestrator may drop the returned future early on cancellation;
/// implementations release in-flight resources through normal drop.
#[async_trait]
pub trait Puller: Send + Sync {
    async fn pull(&self, request: &PullRequest) -> Result<(), PullError>;
}

/// What a [`MockPuller`] should do with a request.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Complete successfully after recording the request.
    Succeed,
    /// Fail with a transfer error.
    Fail(String),
    /// Fail with an I/O error carrying an OS error code.
    FailOs(i32),
    /// Never complete; used to test cancellation.
    Hang,
}

/// Mock puller for testing the orchestration layer.
pub struct MockPuller {
    behavior: MockBehavior,
    requests: Mutex<Vec<PullRequest>>,
}

impl MockPuller {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(MockBehavior::Succeed)
    }

    pub fn hanging() -> Self {
        Self::new(MockBehavior::Hang)
    }

    /// Requests observed so far.
    pub fn requests(&self) -> Vec<PullRequest> {
        self.requests.lock().expect("mock lock poisoned").clone()
    }
}

#[async_trait]
impl Puller for MockPuller {
    async fn pull(&self, request: &PullRequest) -> Result<(), PullError> {
        info!(url = %request.url, kind = %request.kind, "[MOCK] Pulling image");
        self.requests
            .lock()
            .expect("mock lock poisoned")
            .push(request.clone());

        match &self.behavior {
            MockBehavior::Succeed => Ok(()),
            MockBehavior::Fail(message) => Err(PullError::Transfer(message.clone())),
            MockBehavior::FailOs(code) => Err(PullError::Io {
                path: request.image_root.clone(),
                source: io::Error::from_raw_os_error(*code),
            }),
            MockBehavior::Hang => std::future::pending().await,
        }
    }
}
