//! JBD2 journal structures.
//!
//! Everything on the journal is big-endian. A log block is one of:
//!
//! | Block type | Value | Contents |
//! |------------|-------|----------|
//! | descriptor | 1 | header + tags naming the filesystem blocks that follow |
//! | commit | 2 | header; closes the transaction |
//! | superblock v1 | 3 | static/dynamic log geometry |
//! | superblock v2 | 4 | v1 + features, uuid, user list |
//! | revoke | 5 | header + `r_count` + revoked block numbers |

use ffs_types::{
    JBD2_MAGIC_NUMBER, ParseError, Uuid, read_be_u32, read_fixed, write_be_u32, write_bytes,
};
use serde::{Deserialize, Serialize};

pub const JBD2_DESCRIPTOR_BLOCK: u32 = 1;
pub const JBD2_COMMIT_BLOCK: u32 = 2;
pub const JBD2_SUPERBLOCK_V1: u32 = 3;
pub const JBD2_SUPERBLOCK_V2: u32 = 4;
pub const JBD2_REVOKE_BLOCK: u32 = 5;

pub const JBD2_HEADER_SIZE: usize = 12;

pub const JBD2_FEATURE_INCOMPAT_REVOKE: u32 = 0x1;
pub const JBD2_FEATURE_INCOMPAT_64BIT: u32 = 0x2;
pub const JBD2_FEATURE_INCOMPAT_ASYNC_COMMIT: u32 = 0x4;
pub const JBD2_FEATURE_INCOMPAT_CSUM_V2: u32 = 0x8;
pub const JBD2_FEATURE_INCOMPAT_CSUM_V3: u32 = 0x10;

/// Incompat bits replay understands. Checksummed tag formats are refused.
pub const JBD2_KNOWN_INCOMPAT: u32 =
    JBD2_FEATURE_INCOMPAT_REVOKE | JBD2_FEATURE_INCOMPAT_64BIT | JBD2_FEATURE_INCOMPAT_ASYNC_COMMIT;

pub const JBD2_FLAG_ESCAPE: u16 = 0x1;
pub const JBD2_FLAG_SAME_UUID: u16 = 0x2;
pub const JBD2_FLAG_DELETED: u16 = 0x4;
pub const JBD2_FLAG_LAST_TAG: u16 = 0x8;

const JSB_USERS_OFFSET: usize = 0x100;
const JSB_MAX_USERS: u32 = 48;
const REVOKE_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jbd2Header {
    pub magic: u32,
    pub block_type: u32,
    pub sequence: u32,
}

impl Jbd2Header {
    #[must_use]
    pub fn new(block_type: u32, sequence: u32) -> Self {
        Self {
            magic: JBD2_MAGIC_NUMBER,
            block_type,
            sequence,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            magic: read_be_u32(bytes, 0x0)?,
            block_type: read_be_u32(bytes, 0x4)?,
            sequence: read_be_u32(bytes, 0x8)?,
        })
    }

    /// A header that is not ours ends the log scan; it is not an error.
    pub fn parse_if_valid(bytes: &[u8]) -> Option<Self> {
        Self::parse(bytes)
            .ok()
            .filter(|header| header.magic == JBD2_MAGIC_NUMBER)
    }

    pub fn write_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(bytes, 0x0, self.magic)?;
        write_be_u32(bytes, 0x4, self.block_type)?;
        write_be_u32(bytes, 0x8, self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jbd2Superblock {
    pub header: Jbd2Header,
    pub block_size: u32,
    pub max_len: u32,
    pub first: u32,
    pub sequence: u32,
    pub start: u32,
    pub errno: i32,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: Uuid,
    pub nr_users: u32,
    /// First registered user; the filesystem UUID for an external journal.
    pub first_user: Uuid,
}

impl Jbd2Superblock {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let header = Jbd2Header::parse(bytes)?;
        if header.magic != JBD2_MAGIC_NUMBER {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(JBD2_MAGIC_NUMBER),
                actual: u64::from(header.magic),
            });
        }
        if header.block_type != JBD2_SUPERBLOCK_V1 && header.block_type != JBD2_SUPERBLOCK_V2 {
            return Err(ParseError::InvalidField {
                field: "h_blocktype",
                reason: "not a journal superblock",
            });
        }
        let v2 = header.block_type == JBD2_SUPERBLOCK_V2;
        let sb = Self {
            header,
            block_size: read_be_u32(bytes, 0x0C)?,
            max_len: read_be_u32(bytes, 0x10)?,
            first: read_be_u32(bytes, 0x14)?,
            sequence: read_be_u32(bytes, 0x18)?,
            start: read_be_u32(bytes, 0x1C)?,
            errno: i32::from_be_bytes(read_fixed::<4>(bytes, 0x20)?),
            feature_compat: if v2 { read_be_u32(bytes, 0x24)? } else { 0 },
            feature_incompat: if v2 { read_be_u32(bytes, 0x28)? } else { 0 },
            feature_ro_compat: if v2 { read_be_u32(bytes, 0x2C)? } else { 0 },
            uuid: Uuid(read_fixed::<16>(bytes, 0x30)?),
            nr_users: if v2 { read_be_u32(bytes, 0x40)? } else { 1 },
            first_user: Uuid(read_fixed::<16>(bytes, JSB_USERS_OFFSET)?),
        };
        if sb.first == 0 || sb.first >= sb.max_len {
            return Err(ParseError::InvalidField {
                field: "s_first",
                reason: "log start outside journal",
            });
        }
        if sb.nr_users > JSB_MAX_USERS {
            return Err(ParseError::InvalidField {
                field: "s_nr_users",
                reason: "too many users",
            });
        }
        Ok(sb)
    }

    /// Write the modelled fields, leaving the rest of `bytes` alone.
    pub fn serialize_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        self.header.write_into(bytes)?;
        write_be_u32(bytes, 0x0C, self.block_size)?;
        write_be_u32(bytes, 0x10, self.max_len)?;
        write_be_u32(bytes, 0x14, self.first)?;
        write_be_u32(bytes, 0x18, self.sequence)?;
        write_be_u32(bytes, 0x1C, self.start)?;
        write_bytes(bytes, 0x20, &self.errno.to_be_bytes())?;
        write_be_u32(bytes, 0x24, self.feature_compat)?;
        write_be_u32(bytes, 0x28, self.feature_incompat)?;
        write_be_u32(bytes, 0x2C, self.feature_ro_compat)?;
        write_bytes(bytes, 0x30, self.uuid.as_bytes())?;
        write_be_u32(bytes, 0x40, self.nr_users)?;
        write_bytes(bytes, JSB_USERS_OFFSET, self.first_user.as_bytes())
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.feature_incompat & JBD2_FEATURE_INCOMPAT_64BIT != 0
    }

    #[must_use]
    pub fn has_revoke(&self) -> bool {
        self.feature_incompat & JBD2_FEATURE_INCOMPAT_REVOKE != 0
    }

    #[must_use]
    pub fn unknown_incompat(&self) -> u32 {
        self.feature_incompat & !JBD2_KNOWN_INCOMPAT
    }

    /// `s_start == 0` means the log is empty and nothing needs replay.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.start == 0
    }

    #[must_use]
    pub fn tag_size(&self) -> usize {
        if self.is_64bit() { 12 } else { 8 }
    }
}

// ── Descriptor tags ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jbd2Tag {
    pub fs_block: u64,
    pub flags: u16,
}

impl Jbd2Tag {
    #[must_use]
    pub fn is_escaped(self) -> bool {
        self.flags & JBD2_FLAG_ESCAPE != 0
    }

    #[must_use]
    pub fn is_last(self) -> bool {
        self.flags & JBD2_FLAG_LAST_TAG != 0
    }
}

/// Decode every tag in a descriptor block, in order.
pub fn parse_descriptor_tags(block: &[u8], is_64bit: bool) -> Result<Vec<Jbd2Tag>, ParseError> {
    let tag_size = if is_64bit { 12 } else { 8 };
    let mut tags = Vec::new();
    let mut offset = JBD2_HEADER_SIZE;
    while offset + tag_size <= block.len() {
        let lo = u64::from(read_be_u32(block, offset)?);
        let flags = u16::from_be_bytes(read_fixed::<2>(block, offset + 6)?);
        let hi = if is_64bit {
            u64::from(read_be_u32(block, offset + 8)?)
        } else {
            0
        };
        let tag = Jbd2Tag {
            fs_block: lo | (hi << 32),
            flags,
        };
        tags.push(tag);
        offset += tag_size;
        if flags & JBD2_FLAG_SAME_UUID == 0 {
            offset += 16;
        }
        if tag.is_last() {
            break;
        }
    }
    Ok(tags)
}

/// Encode `tags` into a descriptor block. The first tag carries the UUID;
/// the final tag gets `LAST_TAG`.
#[allow(clippy::cast_possible_truncation)] // tag block numbers split into be32 halves
pub fn write_descriptor_block(
    block: &mut [u8],
    sequence: u32,
    tags: &[Jbd2Tag],
    uuid: Uuid,
    is_64bit: bool,
) -> Result<(), ParseError> {
    Jbd2Header::new(JBD2_DESCRIPTOR_BLOCK, sequence).write_into(block)?;
    let tag_size = if is_64bit { 12 } else { 8 };
    let mut offset = JBD2_HEADER_SIZE;
    for (idx, tag) in tags.iter().enumerate() {
        let mut flags = tag.flags & !(JBD2_FLAG_LAST_TAG | JBD2_FLAG_SAME_UUID);
        if idx > 0 {
            flags |= JBD2_FLAG_SAME_UUID;
        }
        if idx + 1 == tags.len() {
            flags |= JBD2_FLAG_LAST_TAG;
        }
        write_be_u32(block, offset, tag.fs_block as u32)?;
        write_bytes(block, offset + 6, &flags.to_be_bytes())?;
        if is_64bit {
            write_be_u32(block, offset + 8, (tag.fs_block >> 32) as u32)?;
        }
        offset += tag_size;
        if idx == 0 {
            write_bytes(block, offset, uuid.as_bytes())?;
            offset += 16;
        }
    }
    Ok(())
}

// ── Revoke records ──────────────────────────────────────────────────────────

/// Revoked filesystem block numbers carried by one revoke block.
pub fn parse_revoke_block(block: &[u8], is_64bit: bool) -> Result<Vec<u64>, ParseError> {
    let count = usize::try_from(read_be_u32(block, JBD2_HEADER_SIZE)?)
        .map_err(|_| ParseError::IntegerConversion { field: "r_count" })?;
    if count < REVOKE_HEADER_SIZE || count > block.len() {
        return Err(ParseError::InvalidField {
            field: "r_count",
            reason: "revoke record length outside block",
        });
    }
    let record = if is_64bit { 8 } else { 4 };
    let mut out = Vec::with_capacity((count - REVOKE_HEADER_SIZE) / record);
    let mut offset = REVOKE_HEADER_SIZE;
    while offset + record <= count {
        let block_nr = if is_64bit {
            u64::from_be_bytes(read_fixed::<8>(block, offset)?)
        } else {
            u64::from(read_be_u32(block, offset)?)
        };
        out.push(block_nr);
        offset += record;
    }
    Ok(out)
}

#[allow(clippy::cast_possible_truncation)] // 32-bit revoke records hold 32-bit block numbers
pub fn write_revoke_block(
    block: &mut [u8],
    sequence: u32,
    revoked: &[u64],
    is_64bit: bool,
) -> Result<(), ParseError> {
    Jbd2Header::new(JBD2_REVOKE_BLOCK, sequence).write_into(block)?;
    let record = if is_64bit { 8 } else { 4 };
    let mut offset = REVOKE_HEADER_SIZE;
    for &block_nr in revoked {
        if is_64bit {
            write_bytes(block, offset, &block_nr.to_be_bytes())?;
        } else {
            write_be_u32(block, offset, block_nr as u32)?;
        }
        offset += record;
    }
    let count = u32::try_from(offset).map_err(|_| ParseError::IntegerConversion { field: "r_count" })?;
    write_be_u32(block, JBD2_HEADER_SIZE, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sb() -> Jbd2Superblock {
        Jbd2Superblock {
            header: Jbd2Header::new(JBD2_SUPERBLOCK_V2, 0),
            block_size: 1024,
            max_len: 64,
            first: 1,
            sequence: 7,
            start: 1,
            errno: 0,
            feature_compat: 0,
            feature_incompat: JBD2_FEATURE_INCOMPAT_REVOKE,
            feature_ro_compat: 0,
            uuid: Uuid([0xAB; 16]),
            nr_users: 1,
            first_user: Uuid([0x11; 16]),
        }
    }

    #[test]
    fn superblock_serialize_then_parse() {
        let sb = sample_sb();
        let mut block = vec![0_u8; 1024];
        sb.serialize_into(&mut block).expect("serialize");
        let parsed = Jbd2Superblock::parse(&block).expect("parse");
        assert_eq!(parsed, sb);
        assert!(parsed.has_revoke());
        assert!(!parsed.is_clean());
        assert_eq!(parsed.tag_size(), 8);
    }

    #[test]
    fn superblock_rejects_bad_magic_and_block_type() {
        let mut block = vec![0_u8; 1024];
        sample_sb().serialize_into(&mut block).expect("serialize");
        let mut bad = block.clone();
        bad[0] ^= 0xFF;
        assert!(matches!(
            Jbd2Superblock::parse(&bad),
            Err(ParseError::InvalidMagic { .. })
        ));
        block[7] = JBD2_COMMIT_BLOCK as u8;
        assert!(matches!(
            Jbd2Superblock::parse(&block),
            Err(ParseError::InvalidField { field: "h_blocktype", .. })
        ));
    }

    #[test]
    fn checksummed_journal_is_unknown_incompat() {
        let mut sb = sample_sb();
        sb.feature_incompat |= JBD2_FEATURE_INCOMPAT_CSUM_V3;
        assert_eq!(sb.unknown_incompat(), JBD2_FEATURE_INCOMPAT_CSUM_V3);
    }

    #[test]
    fn descriptor_tags_round_trip_with_uuid_gap() {
        let mut block = vec![0_u8; 1024];
        let tags = [
            Jbd2Tag { fs_block: 10, flags: 0 },
            Jbd2Tag { fs_block: 11, flags: JBD2_FLAG_ESCAPE },
            Jbd2Tag { fs_block: 12, flags: 0 },
        ];
        write_descriptor_block(&mut block, 3, &tags, Uuid([1; 16]), false).expect("write");
        let header = Jbd2Header::parse_if_valid(&block).expect("header");
        assert_eq!(header.block_type, JBD2_DESCRIPTOR_BLOCK);
        assert_eq!(header.sequence, 3);

        let parsed = parse_descriptor_tags(&block, false).expect("tags");
        let blocks: Vec<u64> = parsed.iter().map(|t| t.fs_block).collect();
        assert_eq!(blocks, vec![10, 11, 12]);
        assert!(parsed[1].is_escaped());
        assert!(parsed[2].is_last());
    }

    #[test]
    fn descriptor_tags_64bit() {
        let mut block = vec![0_u8; 1024];
        let tags = [Jbd2Tag { fs_block: 0x1_0000_0005, flags: 0 }];
        write_descriptor_block(&mut block, 1, &tags, Uuid::NIL, true).expect("write");
        let parsed = parse_descriptor_tags(&block, true).expect("tags");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].fs_block, 0x1_0000_0005);
    }

    #[test]
    fn revoke_block_round_trip() {
        let mut block = vec![0_u8; 1024];
        write_revoke_block(&mut block, 4, &[5, 9], false).expect("write");
        assert_eq!(parse_revoke_block(&block, false).expect("parse"), vec![5, 9]);
    }

    #[test]
    fn revoke_count_out_of_range() {
        let mut block = vec![0_u8; 64];
        Jbd2Header::new(JBD2_REVOKE_BLOCK, 1).write_into(&mut block).expect("hdr");
        write_be_u32(&mut block, JBD2_HEADER_SIZE, 4096).expect("count");
        assert!(parse_revoke_block(&block, false).is_err());
    }

    #[test]
    fn foreign_block_is_not_a_header() {
        assert!(Jbd2Header::parse_if_valid(&[0_u8; 12]).is_none());
    }
}
