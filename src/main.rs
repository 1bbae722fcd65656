//! imgpull - download container or virtual machine images.
//!
//! Fetches a tar or raw image from an HTTP(S) URL into the local image
//! store, optionally with side-car integrity artifacts. One invocation
//! performs exactly one pull on a single-threaded event loop; SIGTERM and
//! SIGINT cancel it cooperatively.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use imgpull::policy::{parse_boolean, PolicyOverride, PullPolicy, VerifyMode};
use imgpull::{orchestrator, DirStore, HttpFetcher, ImageKind, NameError, PullOutcome};

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
/// Usage and validation errors, matching clap's own exit code.
const EXIT_USAGE: u8 = 2;
/// Distinguished exit code for signal-driven cancellation.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "imgpull",
    version,
    about = "Download container or virtual machine images"
)]
struct Cli {
    /// Force creation of the image even if one with the same name exists.
    #[arg(long, global = true)]
    force: bool,

    /// Image root directory.
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "IMGPULL_IMAGE_ROOT",
        default_value = "/var/lib/machines"
    )]
    image_root: PathBuf,

    /// Verify the downloaded image: one of 'no', 'checksum', 'signature'.
    #[arg(
        long,
        global = true,
        value_name = "MODE",
        default_value = "signature",
        value_parser = VerifyMode::parse
    )]
    verify: VerifyMode,

    /// Download the settings file with the image.
    #[arg(long, global = true, value_name = "BOOL", value_parser = parse_boolean)]
    settings: Option<bool>,

    /// Download the root hash file with the image.
    #[arg(long, global = true, value_name = "BOOL", value_parser = parse_boolean)]
    roothash: Option<bool>,

    /// Download the root hash signature file with the image.
    #[arg(long, global = true, value_name = "BOOL", value_parser = parse_boolean)]
    roothash_signature: Option<bool>,

    /// Download the verity file with the image.
    #[arg(long, global = true, value_name = "BOOL", value_parser = parse_boolean)]
    verity: Option<bool>,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download a TAR image.
    Tar {
        /// Source URL.
        url: String,
        /// Local image name; '-' to store without a name.
        name: Option<String>,
    },
    /// Download a RAW image.
    Raw {
        /// Source URL.
        url: String,
        /// Local image name; '-' to store without a name.
        name: Option<String>,
    },
}

impl Cli {
    fn policy(&self) -> PullPolicy {
        let mut overrides = vec![
            PolicyOverride::ImageRoot(self.image_root.clone()),
            PolicyOverride::Verify(self.verify),
        ];
        if self.force {
            overrides.push(PolicyOverride::Force);
        }
        if let Some(on) = self.settings {
            overrides.push(PolicyOverride::Settings(on));
        }
        if let Some(on) = self.roothash {
            overrides.push(PolicyOverride::Roothash(on));
        }
        if let Some(on) = self.roothash_signature {
            overrides.push(PolicyOverride::RoothashSignature(on));
        }
        if let Some(on) = self.verity {
            overrides.push(PolicyOverride::Verity(on));
        }
        PullPolicy::resolve(overrides)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let policy = cli.policy();
    let (kind, url, name) = match &cli.command {
        Commands::Tar { url, name } => (ImageKind::Tar, url, name),
        Commands::Raw { url, name } => (ImageKind::Raw, url, name),
    };

    // Name resolution runs before the event loop exists; a failure here
    // never allocates one.
    let store = DirStore::new(&policy.image_root);
    let request = match orchestrator::prepare(kind, url, name.as_deref(), &policy, &store) {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Cannot pull image");
            return ExitCode::from(name_error_exit_code(&e));
        }
    };

    // One single-threaded event loop per invocation.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to allocate event loop");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let status = runtime.block_on(async {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        spawn_signal_watcher(cancel_tx);

        let fetcher = match HttpFetcher::new() {
            Ok(fetcher) => fetcher,
            Err(e) => {
                error!(error = %e, "Failed to initialize transport");
                return e.exit_code();
            }
        };

        match orchestrator::run(request, &fetcher, cancel_rx).await {
            Ok(PullOutcome::Completed) => EXIT_SUCCESS,
            Ok(PullOutcome::Interrupted) => EXIT_INTERRUPTED,
            Err(e) => {
                error!(error = %e, "Pull failed");
                e.exit_code()
            }
        }
    });

    debug!(status, "Exiting");
    ExitCode::from(status)
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("IMGPULL_LOG")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

fn name_error_exit_code(err: &NameError) -> u8 {
    match err {
        NameError::InvalidUrl(_)
        | NameError::NoFinalComponent(_)
        | NameError::InvalidName(_) => EXIT_USAGE,
        NameError::AlreadyExists(_) | NameError::Store { .. } => EXIT_FAILURE,
    }
}

/// Watch for termination signals and request cancellation. The watch
/// channel makes repeated deliveries idempotent: the loop stops once.
fn spawn_signal_watcher(cancel: watch::Sender<bool>) {
    tokio::spawn(async move {
        let signal_name = wait_for_termination().await;
        debug!(signal = signal_name, "Termination signal received");
        let _ = cancel.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_termination() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut terminate), Ok(mut interrupt)) => {
            tokio::select! {
                _ = terminate.recv() => "SIGTERM",
                _ = interrupt.recv() => "SIGINT",
            }
        }
        _ => {
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "interrupt"
}
