//! JBD2 log reader and recovery.
//!
//! Recovery runs the classic three passes over the circular log:
//!
//! 1. **Scan**: walk from `s_start` expecting `s_sequence`, stop at the
//!    first block that is not a header of the expected transaction. Each
//!    commit block closes a transaction.
//! 2. **Revoke**: collect the newest revoking transaction per block.
//! 3. **Replay**: copy every tagged block of every committed transaction to
//!    its home location unless a same-or-later transaction revoked it.

use crate::{Journal, RecoveryStats};
use ffs_block::BlockDevice;
use ffs_error::{FfsError, Result};
use ffs_ondisk::jbd2::{
    JBD2_COMMIT_BLOCK, JBD2_DESCRIPTOR_BLOCK, JBD2_REVOKE_BLOCK, Jbd2Header, Jbd2Superblock,
    Jbd2Tag, parse_descriptor_tags, parse_revoke_block,
};
use ffs_types::{BlockNumber, JBD2_MAGIC_NUMBER};
use std::collections::HashMap;
use std::sync::Arc;

/// How journal logical blocks map onto the device holding the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMap {
    /// A contiguous region starting at `start` (external journal device).
    Offset { start: u64, len: u64 },
    /// `(logical, physical, len)` runs from the journal inode.
    Runs(Vec<(u64, u64, u64)>),
}

impl LogMap {
    #[must_use]
    pub fn physical(&self, logical: u64) -> Option<u64> {
        match self {
            Self::Offset { start, len } => (logical < *len).then(|| start + logical),
            Self::Runs(runs) => runs
                .iter()
                .find(|(l, _, n)| logical >= *l && logical < l + n)
                .map(|(l, p, _)| p + (logical - l)),
        }
    }

    /// Number of logical blocks reachable from block 0 without a hole.
    #[must_use]
    pub fn contiguous_len(&self) -> u64 {
        match self {
            Self::Offset { len, .. } => *len,
            Self::Runs(runs) => {
                let mut end = 0_u64;
                for (logical, _, len) in runs {
                    if *logical != end {
                        break;
                    }
                    end += len;
                }
                end
            }
        }
    }
}

#[derive(Debug, Default)]
struct ScanResult {
    end_sequence: u32,
    transactions: u32,
    descriptors: Vec<(u32, u64, Vec<Jbd2Tag>)>,
    revokes: Vec<(u32, u64)>,
}

pub struct Jbd2Log {
    log_dev: Arc<dyn BlockDevice>,
    fs_dev: Arc<dyn BlockDevice>,
    map: LogMap,
    sb: Jbd2Superblock,
    writable: bool,
    aborted: bool,
}

impl std::fmt::Debug for Jbd2Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jbd2Log")
            .field("map", &self.map)
            .field("sb", &self.sb)
            .field("writable", &self.writable)
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}

fn journal_err(context: &str, err: impl std::fmt::Display) -> FfsError {
    FfsError::JournalFailure(format!("{context}: {err}"))
}

impl Jbd2Log {
    /// Read and validate the journal superblock at logical block 0.
    pub fn open(
        log_dev: Arc<dyn BlockDevice>,
        fs_dev: Arc<dyn BlockDevice>,
        map: LogMap,
        writable: bool,
    ) -> Result<Self> {
        let sb_block = map
            .physical(0)
            .ok_or_else(|| FfsError::JournalFailure("journal has no mapped blocks".to_owned()))?;
        let raw = log_dev
            .read_block(BlockNumber(sb_block))
            .map_err(|e| journal_err("reading journal superblock", e))?;
        let sb = Jbd2Superblock::parse(raw.as_slice())
            .map_err(|e| journal_err("invalid journal superblock", e))?;

        if sb.block_size != fs_dev.block_size() {
            return Err(FfsError::JournalFailure(format!(
                "journal block size {} does not match filesystem block size {}",
                sb.block_size,
                fs_dev.block_size()
            )));
        }
        let unknown = sb.unknown_incompat();
        if unknown != 0 {
            return Err(FfsError::JournalFailure(format!(
                "unsupported journal features 0x{unknown:x}"
            )));
        }
        let mapped = map.contiguous_len();
        if u64::from(sb.max_len) > mapped {
            return Err(FfsError::JournalFailure(format!(
                "journal superblock claims {} blocks but only {mapped} are mapped",
                sb.max_len
            )));
        }

        tracing::debug!(
            target: "ffs::journal",
            max_len = sb.max_len,
            first = sb.first,
            sequence = sb.sequence,
            start = sb.start,
            errno = sb.errno,
            writable,
            "jbd2_log_opened"
        );

        Ok(Self {
            log_dev,
            fs_dev,
            map,
            sb,
            writable,
            aborted: false,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Jbd2Superblock {
        &self.sb
    }

    fn wrap(&self, logical: u64) -> u64 {
        let max = u64::from(self.sb.max_len);
        if logical >= max {
            logical - max + u64::from(self.sb.first)
        } else {
            logical
        }
    }

    fn read_log(&self, logical: u64) -> Result<Vec<u8>> {
        let physical = self.map.physical(logical).ok_or_else(|| {
            FfsError::JournalFailure(format!("journal block {logical} is not mapped"))
        })?;
        self.log_dev
            .read_block(BlockNumber(physical))
            .map(ffs_block::BlockBuf::into_inner)
            .map_err(|e| journal_err(&format!("reading journal block {logical}"), e))
    }

    fn write_superblock(&self) -> Result<()> {
        if !self.writable {
            return Err(FfsError::ReadOnly);
        }
        let physical = self
            .map
            .physical(0)
            .ok_or_else(|| FfsError::JournalFailure("journal has no mapped blocks".to_owned()))?;
        let mut raw = self.log_dev.read_block(BlockNumber(physical))?;
        self.sb
            .serialize_into(raw.as_mut_slice())
            .map_err(|e| journal_err("encoding journal superblock", e))?;
        self.log_dev.write_block(BlockNumber(physical), raw.as_slice())?;
        self.log_dev.sync()
    }

    fn scan(&self) -> Result<ScanResult> {
        let mut result = ScanResult {
            end_sequence: self.sb.sequence,
            ..ScanResult::default()
        };
        if self.sb.is_clean() {
            return Ok(result);
        }

        let is_64bit = self.sb.is_64bit();
        let mut block = u64::from(self.sb.start);
        let mut walked = 0_u64;
        let limit = u64::from(self.sb.max_len);

        loop {
            if walked > limit {
                return Err(FfsError::JournalFailure(
                    "journal scan did not terminate within the log".to_owned(),
                ));
            }
            let buf = self.read_log(block)?;
            let Some(header) = Jbd2Header::parse_if_valid(&buf) else {
                break;
            };
            if header.sequence != result.end_sequence {
                break;
            }
            match header.block_type {
                JBD2_DESCRIPTOR_BLOCK => {
                    let tags = parse_descriptor_tags(&buf, is_64bit)
                        .map_err(|e| journal_err("corrupt descriptor block", e))?;
                    let count = tags.len() as u64;
                    result.descriptors.push((header.sequence, block, tags));
                    walked += 1 + count;
                    let mut next = block;
                    for _ in 0..=count {
                        next = self.wrap(next + 1);
                    }
                    block = next;
                }
                JBD2_COMMIT_BLOCK => {
                    result.transactions += 1;
                    result.end_sequence = result.end_sequence.wrapping_add(1);
                    walked += 1;
                    block = self.wrap(block + 1);
                }
                JBD2_REVOKE_BLOCK => {
                    result.revokes.push((header.sequence, block));
                    walked += 1;
                    block = self.wrap(block + 1);
                }
                other => {
                    return Err(FfsError::JournalFailure(format!(
                        "unrecognised journal block type {other} at log block {block}"
                    )));
                }
            }
        }

        tracing::debug!(
            target: "ffs::journal",
            start = self.sb.start,
            start_sequence = self.sb.sequence,
            end_sequence = result.end_sequence,
            transactions = result.transactions,
            "jbd2_scan_complete"
        );
        Ok(result)
    }

    fn committed(start: u32, end: u32, seq: u32) -> bool {
        seq.wrapping_sub(start) < end.wrapping_sub(start)
    }

    fn collect_revokes(&self, scan: &ScanResult) -> Result<HashMap<u64, u32>> {
        let mut revoked: HashMap<u64, u32> = HashMap::new();
        let is_64bit = self.sb.is_64bit();
        for &(seq, block) in &scan.revokes {
            if !Self::committed(self.sb.sequence, scan.end_sequence, seq) {
                continue;
            }
            let buf = self.read_log(block)?;
            let records = parse_revoke_block(&buf, is_64bit)
                .map_err(|e| journal_err("corrupt revoke block", e))?;
            for fs_block in records {
                revoked
                    .entry(fs_block)
                    .and_modify(|newest| {
                        if seq.wrapping_sub(*newest) < u32::MAX / 2 {
                            *newest = seq;
                        }
                    })
                    .or_insert(seq);
            }
        }
        Ok(revoked)
    }

    fn replay_descriptors(
        &self,
        scan: &ScanResult,
        revoked: &HashMap<u64, u32>,
        stats: &mut RecoveryStats,
    ) -> Result<()> {
        for (seq, descriptor_block, tags) in &scan.descriptors {
            if !Self::committed(self.sb.sequence, scan.end_sequence, *seq) {
                continue;
            }
            let mut data_block = *descriptor_block;
            for tag in tags {
                data_block = self.wrap(data_block + 1);
                if let Some(revoke_seq) = revoked.get(&tag.fs_block) {
                    if revoke_seq.wrapping_sub(*seq) < u32::MAX / 2 {
                        stats.blocks_revoked += 1;
                        continue;
                    }
                }
                let mut data = self.read_log(data_block)?;
                if tag.is_escaped() {
                    data[..4].copy_from_slice(&JBD2_MAGIC_NUMBER.to_be_bytes());
                }
                self.fs_dev
                    .write_block(BlockNumber(tag.fs_block), &data)
                    .map_err(|e| journal_err(&format!("replaying block {}", tag.fs_block), e))?;
                stats.blocks_replayed += 1;
            }
        }
        Ok(())
    }
}

impl Journal for Jbd2Log {
    fn needs_recovery(&self) -> bool {
        !self.sb.is_clean()
    }

    fn replay(&mut self) -> Result<RecoveryStats> {
        if self.aborted {
            return Err(FfsError::AlreadyAborted);
        }
        if !self.writable {
            return Err(FfsError::ReadOnlyRecoveryRefused);
        }
        let scan = self.scan()?;
        let revoked = self.collect_revokes(&scan)?;
        let mut stats = RecoveryStats {
            transactions: scan.transactions,
            end_sequence: scan.end_sequence,
            ..RecoveryStats::default()
        };
        self.replay_descriptors(&scan, &revoked, &mut stats)?;
        self.fs_dev
            .sync()
            .map_err(|e| journal_err("flushing replayed blocks", e))?;

        self.sb.sequence = scan.end_sequence.wrapping_add(1);
        self.sb.start = 0;
        self.write_superblock()?;

        tracing::info!(
            target: "ffs::journal",
            transactions = stats.transactions,
            replayed = stats.blocks_replayed,
            revoked = stats.blocks_revoked,
            end_sequence = stats.end_sequence,
            "jbd2_recovery_complete"
        );
        Ok(stats)
    }

    fn wipe(&mut self) -> Result<()> {
        if self.sb.is_clean() {
            return Ok(());
        }
        if !self.writable {
            tracing::warn!(
                target: "ffs::journal",
                start = self.sb.start,
                "jbd2_wipe_ignored_read_only"
            );
            return Ok(());
        }
        let scan = self.scan()?;
        tracing::warn!(
            target: "ffs::journal",
            start = self.sb.start,
            discarded_transactions = scan.transactions,
            "jbd2_clearing_journal"
        );
        self.sb.sequence = scan.end_sequence.wrapping_add(1);
        self.sb.start = 0;
        self.write_superblock()
    }

    fn flush(&mut self) -> Result<()> {
        if self.aborted {
            return Err(FfsError::AlreadyAborted);
        }
        if !self.writable {
            return Ok(());
        }
        self.write_superblock()
    }

    fn abort(&mut self, errno: i32, reason: &str) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        if self.sb.errno == 0 {
            self.sb.errno = errno;
        }
        tracing::error!(target: "ffs::journal", errno, reason, "jbd2_journal_aborted");
        if self.writable {
            if let Err(e) = self.write_superblock() {
                tracing::warn!(
                    target: "ffs::journal",
                    error = %e,
                    "jbd2_abort_errno_not_recorded"
                );
            }
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn last_error(&self) -> Option<i32> {
        (self.sb.errno != 0).then_some(self.sb.errno)
    }

    fn clear_error(&mut self) -> Result<()> {
        self.sb.errno = 0;
        if self.writable {
            self.write_superblock()?;
        }
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        if self.aborted {
            return Err(FfsError::AlreadyAborted);
        }
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_block::{ByteBlockDevice, ByteDevice, MemoryByteDevice};
    use ffs_ondisk::jbd2::{
        JBD2_FEATURE_INCOMPAT_REVOKE, JBD2_FLAG_ESCAPE, JBD2_SUPERBLOCK_V2, write_descriptor_block,
        write_revoke_block,
    };
    use ffs_types::Uuid;

    const BS: usize = 1024;
    const LOG_START: u64 = 20;
    const LOG_LEN: u32 = 16;

    struct Fixture {
        mem: Arc<MemoryByteDevice>,
        dev: Arc<dyn BlockDevice>,
    }

    fn fixture() -> Fixture {
        let mem = Arc::new(MemoryByteDevice::new(BS * 64));
        let dev: Arc<dyn BlockDevice> =
            Arc::new(ByteBlockDevice::new(Arc::clone(&mem), 1024).expect("dev"));
        Fixture { mem, dev }
    }

    fn log_write(fx: &Fixture, logical: u64, data: &[u8]) {
        fx.dev
            .write_block(BlockNumber(LOG_START + logical), data)
            .expect("log write");
    }

    fn write_jsb(fx: &Fixture, sequence: u32, start: u32, errno: i32) {
        let sb = Jbd2Superblock {
            header: Jbd2Header::new(JBD2_SUPERBLOCK_V2, 0),
            block_size: 1024,
            max_len: LOG_LEN,
            first: 1,
            sequence,
            start,
            errno,
            feature_compat: 0,
            feature_incompat: JBD2_FEATURE_INCOMPAT_REVOKE,
            feature_ro_compat: 0,
            uuid: Uuid([9; 16]),
            nr_users: 1,
            first_user: Uuid::NIL,
        };
        let mut block = vec![0_u8; BS];
        sb.serialize_into(&mut block).expect("jsb");
        log_write(fx, 0, &block);
    }

    fn descriptor(fx: &Fixture, logical: u64, seq: u32, tags: &[Jbd2Tag]) {
        let mut block = vec![0_u8; BS];
        write_descriptor_block(&mut block, seq, tags, Uuid([9; 16]), false).expect("desc");
        log_write(fx, logical, &block);
    }

    fn commit(fx: &Fixture, logical: u64, seq: u32) {
        let mut block = vec![0_u8; BS];
        Jbd2Header::new(JBD2_COMMIT_BLOCK, seq)
            .write_into(&mut block)
            .expect("commit");
        log_write(fx, logical, &block);
    }

    fn open(fx: &Fixture) -> Jbd2Log {
        Jbd2Log::open(
            Arc::clone(&fx.dev),
            Arc::clone(&fx.dev),
            LogMap::Offset {
                start: LOG_START,
                len: u64::from(LOG_LEN),
            },
            true,
        )
        .expect("open")
    }

    fn fs_block(fx: &Fixture, block: u64) -> Vec<u8> {
        fx.dev.read_block(BlockNumber(block)).expect("read").into_inner()
    }

    #[test]
    fn replays_committed_and_drops_uncommitted() {
        let fx = fixture();
        write_jsb(&fx, 5, 1, 0);
        // tx 5: block 3 ← 0xAA, committed
        descriptor(&fx, 1, 5, &[Jbd2Tag { fs_block: 3, flags: 0 }]);
        log_write(&fx, 2, &[0xAA; BS]);
        commit(&fx, 3, 5);
        // tx 6: block 4 ← 0xBB, no commit
        descriptor(&fx, 4, 6, &[Jbd2Tag { fs_block: 4, flags: 0 }]);
        log_write(&fx, 5, &[0xBB; BS]);

        let mut log = open(&fx);
        assert!(log.needs_recovery());
        let stats = log.replay().expect("replay");
        assert_eq!(stats.transactions, 1);
        assert_eq!(stats.blocks_replayed, 1);
        assert_eq!(stats.end_sequence, 6);
        assert_eq!(fs_block(&fx, 3), vec![0xAA; BS]);
        assert_eq!(fs_block(&fx, 4), vec![0; BS]);

        let reopened = open(&fx);
        assert!(!reopened.needs_recovery());
        assert_eq!(reopened.superblock().sequence, 7);
    }

    #[test]
    fn revoked_block_is_not_replayed() {
        let fx = fixture();
        write_jsb(&fx, 1, 1, 0);
        descriptor(&fx, 1, 1, &[Jbd2Tag { fs_block: 3, flags: 0 }]);
        log_write(&fx, 2, &[0xAA; BS]);
        commit(&fx, 3, 1);
        let mut revoke = vec![0_u8; BS];
        write_revoke_block(&mut revoke, 2, &[3], false).expect("revoke");
        log_write(&fx, 4, &revoke);
        commit(&fx, 5, 2);

        let stats = open(&fx).replay().expect("replay");
        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.blocks_revoked, 1);
        assert_eq!(stats.blocks_replayed, 0);
        assert_eq!(fs_block(&fx, 3), vec![0; BS]);
    }

    #[test]
    fn escaped_block_gets_magic_restored() {
        let fx = fixture();
        write_jsb(&fx, 1, 1, 0);
        descriptor(&fx, 1, 1, &[Jbd2Tag { fs_block: 5, flags: JBD2_FLAG_ESCAPE }]);
        log_write(&fx, 2, &[0x11; BS]);
        commit(&fx, 3, 1);

        open(&fx).replay().expect("replay");
        let block = fs_block(&fx, 5);
        assert_eq!(&block[..4], &JBD2_MAGIC_NUMBER.to_be_bytes());
        assert_eq!(block[4], 0x11);
    }

    #[test]
    fn log_wraps_to_first_block() {
        let fx = fixture();
        write_jsb(&fx, 3, 14, 0);
        descriptor(&fx, 14, 3, &[Jbd2Tag { fs_block: 6, flags: 0 }]);
        log_write(&fx, 15, &[0xCC; BS]);
        commit(&fx, 1, 3);

        let stats = open(&fx).replay().expect("replay");
        assert_eq!(stats.transactions, 1);
        assert_eq!(fs_block(&fx, 6), vec![0xCC; BS]);
    }

    #[test]
    fn read_only_replay_is_refused() {
        let fx = fixture();
        write_jsb(&fx, 1, 1, 0);
        let mut log = Jbd2Log::open(
            Arc::clone(&fx.dev),
            Arc::clone(&fx.dev),
            LogMap::Offset { start: LOG_START, len: u64::from(LOG_LEN) },
            false,
        )
        .expect("open");
        assert!(matches!(log.replay(), Err(FfsError::ReadOnlyRecoveryRefused)));
    }

    #[test]
    fn wipe_discards_log() {
        let fx = fixture();
        write_jsb(&fx, 1, 1, 0);
        descriptor(&fx, 1, 1, &[Jbd2Tag { fs_block: 3, flags: 0 }]);
        log_write(&fx, 2, &[0xAA; BS]);
        commit(&fx, 3, 1);

        open(&fx).wipe().expect("wipe");
        assert_eq!(fs_block(&fx, 3), vec![0; BS]);
        let reopened = open(&fx);
        assert!(!reopened.needs_recovery());
        assert_eq!(reopened.superblock().sequence, 3);
    }

    #[test]
    fn abort_records_errno_and_clear_resets_it() {
        let fx = fixture();
        write_jsb(&fx, 1, 0, 0);
        let mut log = open(&fx);
        log.abort(-5, "test");
        assert!(log.is_aborted());
        assert!(matches!(log.flush(), Err(FfsError::AlreadyAborted)));

        let mut reopened = open(&fx);
        assert_eq!(reopened.last_error(), Some(-5));
        reopened.clear_error().expect("clear");
        assert_eq!(open(&fx).last_error(), None);
    }

    #[test]
    fn block_size_mismatch_rejected() {
        let fx = fixture();
        write_jsb(&fx, 1, 0, 0);
        let big: Arc<dyn BlockDevice> =
            Arc::new(ByteBlockDevice::new(Arc::clone(&fx.mem), 4096).expect("dev"));
        let err = Jbd2Log::open(
            Arc::clone(&fx.dev),
            big,
            LogMap::Offset { start: LOG_START, len: u64::from(LOG_LEN) },
            true,
        )
        .expect_err("mismatch");
        assert!(matches!(err, FfsError::JournalFailure(_)));
        assert!(fx.mem.len_bytes() > 0);
    }

    #[test]
    fn run_map_resolves_and_measures_holes() {
        let map = LogMap::Runs(vec![(0, 100, 4), (4, 200, 2), (10, 300, 1)]);
        assert_eq!(map.physical(0), Some(100));
        assert_eq!(map.physical(5), Some(201));
        assert_eq!(map.physical(7), None);
        assert_eq!(map.contiguous_len(), 6);
    }
}
