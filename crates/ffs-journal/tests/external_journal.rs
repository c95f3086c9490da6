#![forbid(unsafe_code)]

use ffs_block::{BlockDevice, ByteBlockDevice, ByteDevice, MemoryByteDevice};
use ffs_error::FfsError;
use ffs_journal::{Jbd2Provider, JournalHandle, JournalSource, JournalState};
use ffs_ondisk::jbd2::{JBD2_FEATURE_INCOMPAT_REVOKE, JBD2_SUPERBLOCK_V2};
use ffs_ondisk::{Jbd2Header, Jbd2Superblock};
use ffs_types::{DeviceNumber, Uuid};
use std::sync::Arc;

const BS: usize = 1024;
const JOURNAL_UUID: Uuid = Uuid([0x4A; 16]);
const DEV: DeviceNumber = DeviceNumber(0x0803);

fn journal_device(uuid: Uuid, nr_users: u32) -> Arc<MemoryByteDevice> {
    let blocks = 32_u32;
    let mem = MemoryByteDevice::new(BS * blocks as usize);
    let mut sb = vec![0_u8; BS];
    sb[0x04..0x08].copy_from_slice(&blocks.to_le_bytes());
    sb[0x38..0x3A].copy_from_slice(&0xEF53_u16.to_le_bytes());
    sb[0x60..0x64].copy_from_slice(&0x0008_u32.to_le_bytes()); // JOURNAL_DEV
    sb[0x68..0x78].copy_from_slice(uuid.as_bytes());
    mem.write_all_at(1024, &sb).expect("ext4 header");

    let jsb = Jbd2Superblock {
        header: Jbd2Header::new(JBD2_SUPERBLOCK_V2, 0),
        block_size: 1024,
        max_len: blocks - 2,
        first: 1,
        sequence: 1,
        start: 0,
        errno: 0,
        feature_compat: 0,
        feature_incompat: JBD2_FEATURE_INCOMPAT_REVOKE,
        feature_ro_compat: 0,
        uuid,
        nr_users,
        first_user: Uuid([0x11; 16]),
    };
    let mut block = vec![0_u8; BS];
    jsb.serialize_into(&mut block).expect("jsb");
    mem.write_all_at(2048, &block).expect("jbd2 header");
    Arc::new(mem)
}

fn fs_dev() -> Arc<dyn BlockDevice> {
    Arc::new(ByteBlockDevice::new(MemoryByteDevice::new(BS * 16), 1024).expect("fs dev"))
}

fn source(uuid: Uuid) -> JournalSource {
    JournalSource::External {
        device: DEV,
        expected_uuid: uuid,
    }
}

#[test]
fn external_journal_opens_and_claims_device() {
    let provider = Jbd2Provider::new();
    provider.attach_external(DEV, journal_device(JOURNAL_UUID, 1));

    let handle =
        JournalHandle::open(&provider, &source(JOURNAL_UUID), fs_dev(), true).expect("open");
    assert_eq!(handle.state(), JournalState::Loading);
    assert!(!handle.needs_recovery());
    assert!(provider.is_claimed(DEV));

    let second = JournalHandle::open(&provider, &source(JOURNAL_UUID), fs_dev(), true);
    assert!(matches!(second, Err(FfsError::Busy(_))));

    handle.wipe_and_load().expect("load");
    handle.destroy().expect("destroy");
    assert!(!provider.is_claimed(DEV));
}

#[test]
fn uuid_mismatch_is_fatal() {
    let provider = Jbd2Provider::new();
    provider.attach_external(DEV, journal_device(Uuid([0x99; 16]), 1));
    let err = JournalHandle::open(&provider, &source(JOURNAL_UUID), fs_dev(), true)
        .expect_err("mismatch");
    assert!(matches!(err, FfsError::JournalFailure(ref msg) if msg.contains("UUID")));
    assert!(!provider.is_claimed(DEV));
}

#[test]
fn shared_journal_is_rejected() {
    let provider = Jbd2Provider::new();
    provider.attach_external(DEV, journal_device(JOURNAL_UUID, 2));
    let err = JournalHandle::open(&provider, &source(JOURNAL_UUID), fs_dev(), true)
        .expect_err("two users");
    assert!(matches!(err, FfsError::JournalFailure(_)));
}

#[test]
fn unknown_device_is_journal_failure() {
    let provider = Jbd2Provider::new();
    let err = JournalHandle::open(&provider, &source(JOURNAL_UUID), fs_dev(), true)
        .expect_err("missing");
    assert!(matches!(err, FfsError::JournalFailure(ref msg) if msg.contains("not found")));
}

#[test]
fn device_without_journal_marker_is_rejected() {
    let mem = journal_device(JOURNAL_UUID, 1);
    mem.write_all_at(1024 + 0x60, &0_u32.to_le_bytes()).expect("clear marker");
    let provider = Jbd2Provider::new();
    provider.attach_external(DEV, mem);
    let err = JournalHandle::open(&provider, &source(JOURNAL_UUID), fs_dev(), true)
        .expect_err("not a journal");
    assert!(matches!(err, FfsError::JournalFailure(ref msg) if msg.contains("not a journal device")));
}
