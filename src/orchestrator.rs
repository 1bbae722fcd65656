//! Pull orchestration: drives one asynchronous pull to completion.
//!
//! The orchestrator is a small state machine over one request:
//!
//! ```text
//! Idle -> ResolvingName -> Starting -> Running -> Completed
//!                                          \-> Cancelled
//! ```
//!
//! Name resolution happens synchronously, before the event loop exists; a
//! failure there never allocates a runtime. Once running, the puller
//! future and a cancellation watch channel are multiplexed by a biased
//! select, so an observed cancellation always wins over not-yet-observed
//! puller progress.

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::name::{self, NameError};
use crate::policy::{ImageKind, PullPolicy};
use crate::puller::{PullError, PullRequest, Puller};
use crate::store::ImageStore;

/// Phases of one pull invocation. Terminal phases are `Completed` and
/// `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPhase {
    Idle,
    ResolvingName,
    Starting,
    Running,
    Completed,
    Cancelled,
}

/// Terminal outcome of a pull that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The puller reported success.
    Completed,
    /// A cancellation request stopped the invocation first.
    Interrupted,
}

/// Validate the URL, resolve the local name, and build the pull request.
///
/// Runs before any event loop or network activity; on error the
/// invocation is already terminal.
pub fn prepare(
    kind: ImageKind,
    url: &str,
    explicit_name: Option<&str>,
    policy: &PullPolicy,
    store: &dyn ImageStore,
) -> Result<PullRequest, NameError> {
    debug!(phase = ?PullPhase::ResolvingName, kind = %kind, url, "Preparing pull");

    let url = name::parse_image_url(url)?;
    let local = name::resolve_local_name(kind, &url, explicit_name, policy.flags, store)?;

    Ok(PullRequest::new(kind, url, local, policy))
}

/// Run one pull to its terminal outcome.
///
/// The puller future is awaited against the cancellation channel; exactly
/// one of the following happens:
/// - the puller resolves with `Ok` -> `PullOutcome::Completed`,
/// - the puller resolves with `Err` -> that error,
/// - the channel observes `true` -> one abort notice, then
///   `PullOutcome::Interrupted`. The puller future is dropped, releasing
///   its in-flight resources.
pub async fn run(
    request: PullRequest,
    puller: &dyn Puller,
    mut cancel: watch::Receiver<bool>,
) -> Result<PullOutcome, PullError> {
    debug!(phase = ?PullPhase::Starting, "Starting pull task");
    match &request.local {
        Some(local) => info!(url = %request.url, local = %local, "Pulling image"),
        None => info!(url = %request.url, "Pulling image without local name"),
    }

    let pull = puller.pull(&request);
    tokio::pin!(pull);
    debug!(phase = ?PullPhase::Running, "Pull task running");

    // The sender side may go away (no signal watcher in tests); stop
    // polling the channel in that case instead of spinning.
    let mut watch_cancel = true;
    loop {
        tokio::select! {
            biased;

            changed = cancel.changed(), if watch_cancel => {
                match changed {
                    Ok(()) if *cancel.borrow_and_update() => {
                        warn!("Transfer aborted");
                        debug!(phase = ?PullPhase::Cancelled, "Pull cancelled");
                        return Ok(PullOutcome::Interrupted);
                    }
                    Ok(()) => {}
                    Err(_) => watch_cancel = false,
                }
            }

            result = &mut pull => {
                debug!(phase = ?PullPhase::Completed, "Pull task finished");
                return match result {
                    Ok(()) => {
                        info!("Operation completed successfully");
                        Ok(PullOutcome::Completed)
                    }
                    Err(e) => Err(e),
                };
            }
        }
    }
}
