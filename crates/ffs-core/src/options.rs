//! Typed mount options.
//!
//! Options are layered: built-in defaults, then the superblock's
//! default-mount-option bits and `s_errors`, then the option string stored in
//! the superblock (a parse failure there is only a warning), then the
//! caller's string (a parse failure there fails the mount).

use ffs_error::{FfsError, Result};
use ffs_ondisk::{DefaultMountOpts, Ext4Superblock};
use ffs_types::{
    DeviceNumber, EXT4_ERRORS_CONTINUE, EXT4_ERRORS_PANIC, EXT4_ERRORS_RO,
    EXT4_SUPERBLOCK_OFFSET,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_COMMIT_INTERVAL_SECS: u32 = 5;
pub const DEFAULT_INIT_ITABLE_MULTIPLIER: u32 = 10;

/// Options that older kernels knew and current ones silently accept.
const REMOVED_OPTIONS: &[&str] = &[
    "nobh",
    "bh",
    "oldalloc",
    "orlov",
    "check=none",
    "nocheck",
    "reservation",
    "noreservation",
];

/// What to do after a metadata fault (`errors=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorPolicy {
    Continue,
    RemountReadOnly,
    /// Terminate the process.
    Panic,
}

impl ErrorPolicy {
    fn from_stored(errors: u16) -> Option<Self> {
        match errors {
            EXT4_ERRORS_CONTINUE => Some(Self::Continue),
            EXT4_ERRORS_RO => Some(Self::RemountReadOnly),
            EXT4_ERRORS_PANIC => Some(Self::Panic),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::RemountReadOnly => "remount-ro",
            Self::Panic => "panic",
        }
    }
}

/// Data journalling mode (`data=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataMode {
    Journal,
    Ordered,
    Writeback,
}

impl DataMode {
    fn from_default_bits(opts: DefaultMountOpts) -> Option<Self> {
        match opts.journal_mode()? {
            mode if mode == DefaultMountOpts::JMODE_DATA => Some(Self::Journal),
            mode if mode == DefaultMountOpts::JMODE_ORDERED => Some(Self::Ordered),
            mode if mode == DefaultMountOpts::JMODE_WBACK => Some(Self::Writeback),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Journal => "journal",
            Self::Ordered => "ordered",
            Self::Writeback => "writeback",
        }
    }
}

/// Reaction to a data write error in ordered mode (`data_err=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataErrPolicy {
    Abort,
    Ignore,
}

/// Which options may appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Mount,
    /// `journal_dev=` cannot change on a live volume.
    Remount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct MountOptions {
    errors: ErrorPolicy,
    data: Option<DataMode>,
    data_err: DataErrPolicy,
    barrier: bool,
    delalloc: bool,
    explicit_delalloc: bool,
    init_itable: bool,
    init_itable_multiplier: u32,
    commit_secs: u32,
    stripe: u64,
    journal_dev: Option<DeviceNumber>,
    no_load: bool,
    journal_checksum: bool,
    journal_async_commit: bool,
    block_validity: bool,
    discard: bool,
    debug: bool,
    abort: bool,
    sb_block: Option<u64>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            errors: ErrorPolicy::RemountReadOnly,
            data: None,
            data_err: DataErrPolicy::Ignore,
            barrier: true,
            delalloc: true,
            explicit_delalloc: false,
            init_itable: true,
            init_itable_multiplier: DEFAULT_INIT_ITABLE_MULTIPLIER,
            commit_secs: DEFAULT_COMMIT_INTERVAL_SECS,
            stripe: 0,
            journal_dev: None,
            no_load: false,
            journal_checksum: false,
            journal_async_commit: false,
            block_validity: false,
            discard: false,
            debug: false,
            abort: false,
            sb_block: None,
        }
    }
}

impl MountOptions {
    /// Built-in defaults overlaid with the superblock's default bits.
    #[must_use]
    pub fn from_superblock(sb: &Ext4Superblock) -> Self {
        let mut opts = Self::default();
        let def = sb.default_mount_opts;
        opts.debug = def.contains(DefaultMountOpts::DEBUG);
        opts.data = DataMode::from_default_bits(def);
        if def.contains(DefaultMountOpts::NOBARRIER) {
            opts.barrier = false;
        }
        if def.contains(DefaultMountOpts::BLOCK_VALIDITY) {
            opts.block_validity = true;
        }
        if def.contains(DefaultMountOpts::DISCARD) {
            opts.discard = true;
        }
        if def.contains(DefaultMountOpts::NODELALLOC) {
            opts.delalloc = false;
        }
        if let Some(policy) = ErrorPolicy::from_stored(sb.errors) {
            opts.errors = policy;
        }
        opts
    }

    /// Full mount-time layering: defaults, superblock bits, the stored
    /// option string, then `caller`.
    pub fn parse(sb: &Ext4Superblock, caller: &str) -> Result<Self> {
        let mut opts = Self::from_superblock(sb);
        if !sb.mount_opts.is_empty() {
            let mut stored = opts.clone();
            match stored.apply(&sb.mount_opts, ParseMode::Mount) {
                Ok(()) => opts = stored,
                Err(err) => tracing::warn!(
                    target: "ffs::mount",
                    stored = %sb.mount_opts,
                    error = %err,
                    "stored_mount_options_ignored"
                ),
            }
        }
        opts.apply(caller, ParseMode::Mount)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Apply a comma-separated `key[=value]` string on top of `self`.
    pub fn apply(&mut self, text: &str, mode: ParseMode) -> Result<()> {
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            self.apply_one(item, mode)?;
        }
        Ok(())
    }

    fn apply_one(&mut self, item: &str, mode: ParseMode) -> Result<()> {
        if REMOVED_OPTIONS.contains(&item) {
            tracing::warn!(target: "ffs::mount", option = item, "ignoring_removed_mount_option");
            return Ok(());
        }
        let (key, value) = match item.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (item, None),
        };
        match (key, value) {
            ("errors", Some(v)) => {
                self.errors = match v {
                    "continue" => ErrorPolicy::Continue,
                    "remount-ro" => ErrorPolicy::RemountReadOnly,
                    "panic" => ErrorPolicy::Panic,
                    _ => return Err(invalid(item)),
                };
            }
            ("data", Some(v)) => {
                self.data = Some(match v {
                    "journal" => DataMode::Journal,
                    "ordered" => DataMode::Ordered,
                    "writeback" => DataMode::Writeback,
                    _ => return Err(invalid(item)),
                });
            }
            ("data_err", Some(v)) => {
                self.data_err = match v {
                    "abort" => DataErrPolicy::Abort,
                    "ignore" => DataErrPolicy::Ignore,
                    _ => return Err(invalid(item)),
                };
            }
            ("commit", Some(v)) => {
                let secs: u32 = parse_number(item, v)?;
                self.commit_secs = if secs == 0 {
                    DEFAULT_COMMIT_INTERVAL_SECS
                } else {
                    secs
                };
            }
            ("barrier", None) => self.barrier = true,
            ("barrier", Some(v)) => self.barrier = parse_number::<u32>(item, v)? != 0,
            ("nobarrier", None) => self.barrier = false,
            ("init_itable", None) => {
                self.init_itable = true;
                self.init_itable_multiplier = DEFAULT_INIT_ITABLE_MULTIPLIER;
            }
            ("init_itable", Some(v)) => {
                self.init_itable = true;
                self.init_itable_multiplier = parse_number(item, v)?;
            }
            ("noinit_itable", None) => self.init_itable = false,
            ("noload" | "norecovery", None) => self.no_load = true,
            ("delalloc", None) => {
                self.delalloc = true;
                self.explicit_delalloc = true;
            }
            ("nodelalloc", None) => {
                self.delalloc = false;
                self.explicit_delalloc = false;
            }
            ("journal_dev", Some(v)) => {
                if mode == ParseMode::Remount {
                    return Err(FfsError::InvalidOption(
                        "journal_dev cannot be changed on remount".to_owned(),
                    ));
                }
                self.journal_dev = Some(DeviceNumber(parse_number(item, v)?));
            }
            ("journal_checksum", None) => self.journal_checksum = true,
            ("journal_async_commit", None) => {
                self.journal_async_commit = true;
                self.journal_checksum = true;
            }
            ("debug", None) => self.debug = true,
            ("abort", None) => self.abort = true,
            ("stripe", Some(v)) => self.stripe = parse_number(item, v)?,
            ("block_validity", None) => self.block_validity = true,
            ("noblock_validity", None) => self.block_validity = false,
            ("discard", None) => self.discard = true,
            ("nodiscard", None) => self.discard = false,
            ("sb", Some(v)) => {
                let block: u64 = parse_number(item, v)?;
                if mode == ParseMode::Mount {
                    self.sb_block = Some(block);
                }
            }
            _ => return Err(invalid(item)),
        }
        Ok(())
    }

    /// Cross-option consistency.
    pub fn validate(&mut self) -> Result<()> {
        if self.data == Some(DataMode::Journal) {
            if self.explicit_delalloc {
                return Err(FfsError::InvalidOption(
                    "can't mount with both data=journal and delalloc".to_owned(),
                ));
            }
            self.delalloc = false;
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn error_policy(&self) -> ErrorPolicy {
        self.errors
    }

    /// `None` until a journal decides the default, and always `None` for a
    /// volume without a journal.
    #[must_use]
    pub fn data_mode(&self) -> Option<DataMode> {
        self.data
    }

    #[must_use]
    pub fn data_err(&self) -> DataErrPolicy {
        self.data_err
    }

    #[must_use]
    pub fn barrier(&self) -> bool {
        self.barrier
    }

    #[must_use]
    pub fn delalloc(&self) -> bool {
        self.delalloc
    }

    #[must_use]
    pub fn init_itable(&self) -> bool {
        self.init_itable
    }

    #[must_use]
    pub fn init_itable_multiplier(&self) -> u32 {
        self.init_itable_multiplier
    }

    #[must_use]
    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.commit_secs))
    }

    /// The `stripe=` value as given; see `Geometry::stripe` for the
    /// effective stripe.
    #[must_use]
    pub fn stripe(&self) -> u64 {
        self.stripe
    }

    #[must_use]
    pub fn journal_dev(&self) -> Option<DeviceNumber> {
        self.journal_dev
    }

    #[must_use]
    pub fn no_load(&self) -> bool {
        self.no_load
    }

    #[must_use]
    pub fn journal_checksum(&self) -> bool {
        self.journal_checksum
    }

    #[must_use]
    pub fn block_validity(&self) -> bool {
        self.block_validity
    }

    #[must_use]
    pub fn discard(&self) -> bool {
        self.discard
    }

    #[must_use]
    pub fn debug(&self) -> bool {
        self.debug
    }

    #[must_use]
    pub fn abort_requested(&self) -> bool {
        self.abort
    }

    /// Byte offset of the superblock selected by `sb=` (1 KiB units).
    #[must_use]
    pub fn superblock_byte_offset(&self) -> u64 {
        self.sb_block.map_or(EXT4_SUPERBLOCK_OFFSET as u64, |block| {
            block.saturating_mul(1024)
        })
    }

    pub(crate) fn set_data_mode(&mut self, mode: Option<DataMode>) {
        self.data = mode;
    }

    /// Canonical string of every option that differs from the built-in
    /// defaults.
    #[must_use]
    pub fn render(&self) -> String {
        let base = Self::default();
        let mut parts: Vec<String> = Vec::new();
        if self.errors != base.errors {
            parts.push(format!("errors={}", self.errors.as_str()));
        }
        if let Some(mode) = self.data {
            parts.push(format!("data={}", mode.as_str()));
        }
        if self.data_err == DataErrPolicy::Abort {
            parts.push("data_err=abort".to_owned());
        }
        if self.commit_secs != base.commit_secs {
            parts.push(format!("commit={}", self.commit_secs));
        }
        if !self.barrier {
            parts.push("nobarrier".to_owned());
        }
        if !self.delalloc {
            parts.push("nodelalloc".to_owned());
        }
        if !self.init_itable {
            parts.push("noinit_itable".to_owned());
        } else if self.init_itable_multiplier != base.init_itable_multiplier {
            parts.push(format!("init_itable={}", self.init_itable_multiplier));
        }
        if self.stripe != 0 {
            parts.push(format!("stripe={}", self.stripe));
        }
        if let Some(dev) = self.journal_dev {
            parts.push(format!("journal_dev={}", dev.0));
        }
        let flags = [
            (self.no_load, "noload"),
            (self.journal_async_commit, "journal_async_commit"),
            (
                self.journal_checksum && !self.journal_async_commit,
                "journal_checksum",
            ),
            (self.block_validity, "block_validity"),
            (self.discard, "discard"),
            (self.debug, "debug"),
            (self.abort, "abort"),
        ];
        parts.extend(
            flags
                .iter()
                .filter(|(set, _)| *set)
                .map(|(_, name)| (*name).to_owned()),
        );
        parts.join(",")
    }
}

fn invalid(item: &str) -> FfsError {
    FfsError::InvalidOption(format!("unrecognized mount option \"{item}\" or missing value"))
}

fn parse_number<T: std::str::FromStr>(item: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| FfsError::InvalidOption(format!("bad value in \"{item}\"")))
}
