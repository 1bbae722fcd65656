//! Download policy: pull flags, verification mode, and image root.
//!
//! The policy is built exactly once at process start by folding
//! command-line overrides into the documented defaults, and is immutable
//! afterwards. Every pull request receives a copy filtered through the
//! kind-specific flag mask.

use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::path::PathBuf;

/// The two supported image kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// A tar archive unpacked into a directory tree.
    Tar,
    /// A raw (or qcow2) disk image stored as a single file.
    Raw,
}

impl ImageKind {
    /// Flags recognized by this kind. Flags outside the mask are ignored
    /// for pulls of this kind.
    pub fn recognized_flags(self) -> PullFlags {
        match self {
            // Tar images carry no verity metadata, so only the settings
            // side-car applies.
            ImageKind::Tar => PullFlags::FORCE | PullFlags::SETTINGS,
            ImageKind::Raw => {
                PullFlags::FORCE
                    | PullFlags::SETTINGS
                    | PullFlags::ROOTHASH
                    | PullFlags::ROOTHASH_SIGNATURE
                    | PullFlags::VERITY
            }
        }
    }

    /// File extension for the materialized main image.
    pub fn file_extension(self) -> &'static str {
        match self {
            ImageKind::Tar => ".tar",
            ImageKind::Raw => ".raw",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageKind::Tar => "tar",
            ImageKind::Raw => "raw",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitmask of per-pull options.
///
/// Invariant: `ROOTHASH_SIGNATURE` is never set without `ROOTHASH`.
/// [`PullPolicy::resolve`] maintains this; the mask operations preserve it.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PullFlags(u32);

impl PullFlags {
    pub const NONE: PullFlags = PullFlags(0);
    /// Allow overwriting an existing local image.
    pub const FORCE: PullFlags = PullFlags(1 << 0);
    /// Also fetch the settings side-car file.
    pub const SETTINGS: PullFlags = PullFlags(1 << 1);
    /// Also fetch the root hash side-car file.
    pub const ROOTHASH: PullFlags = PullFlags(1 << 2);
    /// Also fetch the root hash signature side-car file.
    pub const ROOTHASH_SIGNATURE: PullFlags = PullFlags(1 << 3);
    /// Also fetch the verity metadata side-car file.
    pub const VERITY: PullFlags = PullFlags(1 << 4);

    /// Default flag set: all side-cars on, no forced overwrite.
    pub const DEFAULT: PullFlags = PullFlags(
        Self::SETTINGS.0 | Self::ROOTHASH.0 | Self::ROOTHASH_SIGNATURE.0 | Self::VERITY.0,
    );

    pub fn contains(self, other: PullFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: PullFlags) -> PullFlags {
        PullFlags(self.0 | other.0)
    }

    pub fn without(self, other: PullFlags) -> PullFlags {
        PullFlags(self.0 & !other.0)
    }

    /// Set or clear `other` depending on `enable`.
    pub fn set(self, other: PullFlags, enable: bool) -> PullFlags {
        if enable {
            self.with(other)
        } else {
            self.without(other)
        }
    }

    /// Restrict to the flags recognized by `kind`.
    pub fn masked_for(self, kind: ImageKind) -> PullFlags {
        self & kind.recognized_flags()
    }
}

impl BitOr for PullFlags {
    type Output = PullFlags;

    fn bitor(self, rhs: PullFlags) -> PullFlags {
        PullFlags(self.0 | rhs.0)
    }
}

impl BitAnd for PullFlags {
    type Output = PullFlags;

    fn bitand(self, rhs: PullFlags) -> PullFlags {
        PullFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for PullFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (bit, label) in [
            (Self::FORCE, "FORCE"),
            (Self::SETTINGS, "SETTINGS"),
            (Self::ROOTHASH, "ROOTHASH"),
            (Self::ROOTHASH_SIGNATURE, "ROOTHASH_SIGNATURE"),
            (Self::VERITY, "VERITY"),
        ] {
            if self.contains(bit) {
                set.entry(&label);
            }
        }
        set.finish()
    }
}

/// How the puller authenticates downloaded content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// No integrity checking.
    No,
    /// Verify a SHA-256 checksum against the published checksum file.
    Checksum,
    /// Verify a cryptographic signature over the checksum file.
    #[default]
    Signature,
}

impl VerifyMode {
    /// Parse a verification mode literal. Used as a clap value parser so
    /// that the offending option and value appear in the usage error.
    pub fn parse(s: &str) -> Result<VerifyMode, String> {
        match s {
            "no" => Ok(VerifyMode::No),
            "checksum" => Ok(VerifyMode::Checksum),
            "signature" => Ok(VerifyMode::Signature),
            _ => Err(format!(
                "invalid verification setting '{s}', expected one of 'no', 'checksum', 'signature'"
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerifyMode::No => "no",
            VerifyMode::Checksum => "checksum",
            VerifyMode::Signature => "signature",
        }
    }
}

impl fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a boolean option literal.
///
/// Accepts the usual spellings so `--settings=no` and `--settings=0` both
/// work. Used as a clap value parser.
pub fn parse_boolean(s: &str) -> Result<bool, String> {
    match s {
        "1" | "yes" | "y" | "true" | "on" => Ok(true),
        "0" | "no" | "n" | "false" | "off" => Ok(false),
        _ => Err(format!("invalid boolean value '{s}'")),
    }
}

/// A single command-line override applied to the default policy.
#[derive(Debug, Clone)]
pub enum PolicyOverride {
    Force,
    ImageRoot(PathBuf),
    Verify(VerifyMode),
    Settings(bool),
    Roothash(bool),
    RoothashSignature(bool),
    Verity(bool),
}

/// The resolved, immutable download policy for one invocation.
#[derive(Debug, Clone)]
pub struct PullPolicy {
    pub flags: PullFlags,
    pub verify: VerifyMode,
    pub image_root: PathBuf,
}

impl Default for PullPolicy {
    fn default() -> Self {
        Self {
            flags: PullFlags::DEFAULT,
            verify: VerifyMode::Signature,
            image_root: PathBuf::from("/var/lib/machines"),
        }
    }
}

impl PullPolicy {
    /// Fold overrides, in command-line order, into the default policy.
    ///
    /// Disabling the root hash force-disables the root hash signature, and
    /// the implicit disable wins over an explicit enable in any order.
    pub fn resolve(overrides: impl IntoIterator<Item = PolicyOverride>) -> PullPolicy {
        let mut policy = overrides
            .into_iter()
            .fold(PullPolicy::default(), |p, o| p.apply(o));

        // A signature without its root hash is meaningless.
        if !policy.flags.contains(PullFlags::ROOTHASH) {
            policy.flags = policy.flags.without(PullFlags::ROOTHASH_SIGNATURE);
        }

        debug_assert!(
            policy.flags.contains(PullFlags::ROOTHASH)
                || !policy.flags.contains(PullFlags::ROOTHASH_SIGNATURE)
        );
        policy
    }

    fn apply(mut self, override_: PolicyOverride) -> PullPolicy {
        match override_ {
            PolicyOverride::Force => self.flags = self.flags.with(PullFlags::FORCE),
            PolicyOverride::ImageRoot(path) => self.image_root = path,
            PolicyOverride::Verify(mode) => self.verify = mode,
            PolicyOverride::Settings(on) => self.flags = self.flags.set(PullFlags::SETTINGS, on),
            PolicyOverride::Roothash(on) => {
                self.flags = self.flags.set(PullFlags::ROOTHASH, on);
                if !on {
                    self.flags = self.flags.without(PullFlags::ROOTHASH_SIGNATURE);
                }
            }
            PolicyOverride::RoothashSignature(on) => {
                self.flags = self.flags.set(PullFlags::ROOTHASH_SIGNATURE, on);
            }
            PolicyOverride::Verity(on) => self.flags = self.flags.set(PullFlags::VERITY, on),
        }
        self
    }
}
