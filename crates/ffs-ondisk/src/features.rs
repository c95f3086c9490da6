//! ext4 feature-flag bitsets and the default-mount-option word.
//!
//! | Set | Field | Unknown bit means |
//! |-----|-------|-------------------|
//! | compat | `s_feature_compat` | nothing, ignore |
//! | incompat | `s_feature_incompat` | refuse every mount |
//! | ro_compat | `s_feature_ro_compat` | refuse writable mounts |
//!
//! "Unknown" is measured against the `SUPPORTED` masks below, not against the
//! names in `KNOWN`: a named bit this implementation cannot honour is treated
//! exactly like an undefined one.

use serde::{Deserialize, Serialize};

/// ext4 compatible feature flags (`s_feature_compat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4CompatFeatures(pub u32);

impl Ext4CompatFeatures {
    pub const DIR_PREALLOC: Self = Self(0x0001);
    pub const IMAGIC_INODES: Self = Self(0x0002);
    pub const HAS_JOURNAL: Self = Self(0x0004);
    pub const EXT_ATTR: Self = Self(0x0008);
    pub const RESIZE_INODE: Self = Self(0x0010);
    pub const DIR_INDEX: Self = Self(0x0020);
    pub const SPARSE_SUPER2: Self = Self(0x0200);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "DIR_PREALLOC"),
        (0x0002, "IMAGIC_INODES"),
        (0x0004, "HAS_JOURNAL"),
        (0x0008, "EXT_ATTR"),
        (0x0010, "RESIZE_INODE"),
        (0x0020, "DIR_INDEX"),
        (0x0200, "SPARSE_SUPER2"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for Ext4CompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// ext4 incompatible feature flags (`s_feature_incompat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4IncompatFeatures(pub u32);

impl Ext4IncompatFeatures {
    pub const COMPRESSION: Self = Self(0x0001);
    pub const FILETYPE: Self = Self(0x0002);
    pub const RECOVER: Self = Self(0x0004);
    pub const JOURNAL_DEV: Self = Self(0x0008);
    pub const META_BG: Self = Self(0x0010);
    pub const EXTENTS: Self = Self(0x0040);
    pub const BIT64: Self = Self(0x0080);
    pub const MMP: Self = Self(0x0100);
    pub const FLEX_BG: Self = Self(0x0200);
    pub const EA_INODE: Self = Self(0x0400);
    pub const DIRDATA: Self = Self(0x1000);
    pub const CSUM_SEED: Self = Self(0x2000);
    pub const LARGEDIR: Self = Self(0x4000);
    pub const INLINE_DATA: Self = Self(0x8000);
    pub const ENCRYPT: Self = Self(0x1_0000);
    pub const CASEFOLD: Self = Self(0x2_0000);

    /// Bits a filesystem mount can honour. `JOURNAL_DEV` marks an external
    /// journal device, never a mountable filesystem.
    pub const SUPPORTED: Self = Self(
        Self::FILETYPE.0
            | Self::RECOVER.0
            | Self::META_BG.0
            | Self::EXTENTS.0
            | Self::BIT64.0
            | Self::MMP.0
            | Self::FLEX_BG.0
            | Self::EA_INODE.0
            | Self::DIRDATA.0
            | Self::CSUM_SEED.0
            | Self::LARGEDIR.0,
    );

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "COMPRESSION"),
        (0x0002, "FILETYPE"),
        (0x0004, "RECOVER"),
        (0x0008, "JOURNAL_DEV"),
        (0x0010, "META_BG"),
        (0x0040, "EXTENTS"),
        (0x0080, "64BIT"),
        (0x0100, "MMP"),
        (0x0200, "FLEX_BG"),
        (0x0400, "EA_INODE"),
        (0x1000, "DIRDATA"),
        (0x2000, "CSUM_SEED"),
        (0x4000, "LARGEDIR"),
        (0x8000, "INLINE_DATA"),
        (0x1_0000, "ENCRYPT"),
        (0x2_0000, "CASEFOLD"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[must_use]
    pub fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    /// Bits outside [`Self::SUPPORTED`].
    #[must_use]
    pub fn unsupported_bits(self) -> u32 {
        self.0 & !Self::SUPPORTED.0
    }
}

impl std::fmt::Display for Ext4IncompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// ext4 read-only compatible feature flags (`s_feature_ro_compat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4RoCompatFeatures(pub u32);

impl Ext4RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const LARGE_FILE: Self = Self(0x0002);
    pub const BTREE_DIR: Self = Self(0x0004);
    pub const HUGE_FILE: Self = Self(0x0008);
    pub const GDT_CSUM: Self = Self(0x0010);
    pub const DIR_NLINK: Self = Self(0x0020);
    pub const EXTRA_ISIZE: Self = Self(0x0040);
    pub const QUOTA: Self = Self(0x0100);
    pub const BIGALLOC: Self = Self(0x0200);
    pub const METADATA_CSUM: Self = Self(0x0400);
    pub const READONLY: Self = Self(0x1000);
    pub const PROJECT: Self = Self(0x2000);
    pub const VERITY: Self = Self(0x8000);

    pub const SUPPORTED: Self = Self(
        Self::SPARSE_SUPER.0
            | Self::LARGE_FILE.0
            | Self::BTREE_DIR.0
            | Self::HUGE_FILE.0
            | Self::GDT_CSUM.0
            | Self::DIR_NLINK.0
            | Self::EXTRA_ISIZE.0
            | Self::QUOTA.0
            | Self::BIGALLOC.0
            | Self::METADATA_CSUM.0
            | Self::PROJECT.0,
    );

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "SPARSE_SUPER"),
        (0x0002, "LARGE_FILE"),
        (0x0004, "BTREE_DIR"),
        (0x0008, "HUGE_FILE"),
        (0x0010, "GDT_CSUM"),
        (0x0020, "DIR_NLINK"),
        (0x0040, "EXTRA_ISIZE"),
        (0x0100, "QUOTA"),
        (0x0200, "BIGALLOC"),
        (0x0400, "METADATA_CSUM"),
        (0x1000, "READONLY"),
        (0x2000, "PROJECT"),
        (0x8000, "VERITY"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    /// Bits outside [`Self::SUPPORTED`].
    #[must_use]
    pub fn unsupported_bits(self) -> u32 {
        self.0 & !Self::SUPPORTED.0
    }
}

impl std::fmt::Display for Ext4RoCompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// `s_default_mount_opts`: mount defaults chosen at format time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DefaultMountOpts(pub u32);

impl DefaultMountOpts {
    pub const DEBUG: Self = Self(0x0001);
    pub const BSDGROUPS: Self = Self(0x0002);
    pub const XATTR_USER: Self = Self(0x0004);
    pub const ACL: Self = Self(0x0008);
    pub const UID16: Self = Self(0x0010);
    pub const JMODE_DATA: Self = Self(0x0020);
    pub const JMODE_ORDERED: Self = Self(0x0040);
    pub const JMODE_WBACK: Self = Self(0x0060);
    pub const NOBARRIER: Self = Self(0x0100);
    pub const BLOCK_VALIDITY: Self = Self(0x0200);
    pub const DISCARD: Self = Self(0x0400);
    pub const NODELALLOC: Self = Self(0x0800);

    const JMODE_MASK: u32 = 0x0060;

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }

    /// The two-bit journalling-mode field, or `None` when unset.
    #[must_use]
    pub fn journal_mode(self) -> Option<Self> {
        match self.0 & Self::JMODE_MASK {
            0 => None,
            bits => Some(Self(bits)),
        }
    }
}

/// Collect names of all set bits from a `(bit, name)` table.
fn describe_flags(bits: u32, known: &[(u32, &'static str)]) -> Vec<&'static str> {
    known
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Format a bitmask as a pipe-separated list of flag names.
///
/// Example output: `FILETYPE|EXTENTS|FLEX_BG` or `(none)` when zero.
/// Unknown bits are appended as hex, e.g. `FILETYPE|0x80000000`.
fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    bits: u32,
    known: &[(u32, &'static str)],
) -> std::fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    let mut remaining = bits;
    for &(bit, name) in known {
        if remaining & bit != 0 {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            remaining &= !bit;
            first = false;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str("|")?;
        }
        write!(f, "0x{remaining:X}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_masks_exclude_dangerous_bits() {
        let all = Ext4IncompatFeatures(u32::MAX);
        assert_ne!(all.unsupported_bits() & Ext4IncompatFeatures::JOURNAL_DEV.0, 0);
        assert_ne!(all.unsupported_bits() & Ext4IncompatFeatures::ENCRYPT.0, 0);
        assert_eq!(
            Ext4IncompatFeatures::SUPPORTED.unsupported_bits(),
            0,
            "supported set is self-consistent"
        );

        let ro = Ext4RoCompatFeatures(Ext4RoCompatFeatures::READONLY.0 | 0x8000_0000);
        assert_eq!(ro.unsupported_bits(), 0x8000_1000);
    }

    #[test]
    fn display_includes_unknown_hex() {
        let flags = Ext4IncompatFeatures(0x0042 | 0x8000_0000);
        assert_eq!(flags.to_string(), "FILETYPE|EXTENTS|0x80000000");
        assert_eq!(Ext4CompatFeatures(0).to_string(), "(none)");
    }

    #[test]
    fn with_without_toggle_recover() {
        let base = Ext4IncompatFeatures::FILETYPE;
        let set = base.with(Ext4IncompatFeatures::RECOVER);
        assert!(set.contains(Ext4IncompatFeatures::RECOVER));
        assert_eq!(set.without(Ext4IncompatFeatures::RECOVER), base);
    }

    #[test]
    fn journal_mode_field_decodes() {
        assert_eq!(DefaultMountOpts(0).journal_mode(), None);
        assert_eq!(
            DefaultMountOpts(0x0040 | 0x0004).journal_mode(),
            Some(DefaultMountOpts::JMODE_ORDERED)
        );
        assert_eq!(
            DefaultMountOpts(0x0060).journal_mode(),
            Some(DefaultMountOpts::JMODE_WBACK)
        );
        assert!(DefaultMountOpts(0x0900).contains(DefaultMountOpts::NODELALLOC));
    }
}
