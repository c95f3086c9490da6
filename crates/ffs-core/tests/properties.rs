#![forbid(unsafe_code)]

use ffs_block::{ByteDevice, MemoryByteDevice};
use ffs_core::testing::{ChecksumStyle, ImageSpec, OrphanSpec};
use ffs_core::{
    LazyInitRegistry, LoadedSuperblock, MountConfig, MountedVolume, PersistContext,
    SuperblockRecord,
};
use ffs_error::FfsError;
use ffs_ondisk::{ErrorSite, SB_CHECKSUM_OFFSET, superblock_checksum};
use proptest::prelude::*;
use std::sync::Arc;

fn csum_image() -> Vec<u8> {
    ImageSpec {
        checksum: ChecksumStyle::MetadataCsum,
        ..ImageSpec::default()
    }
    .build()
    .expect("build")
    .bytes()
    .to_vec()
}

fn config() -> MountConfig {
    MountConfig {
        lazy_init: LazyInitRegistry::new(),
        ..MountConfig::default()
    }
}

fn load(mem: &Arc<MemoryByteDevice>) -> LoadedSuperblock {
    SuperblockRecord::load(Arc::clone(mem) as Arc<dyn ByteDevice>, 1024).expect("load")
}

#[test]
fn superblock_checksum_flip_fails_writable_mount_only() {
    let mut bytes = csum_image();
    // Volume name: covered by the checksum, ignored by everything else.
    bytes[1024 + 0x78] ^= 0x20;
    let mem = Arc::new(MemoryByteDevice::from_bytes(bytes));
    let err = MountedVolume::mount(Arc::clone(&mem) as Arc<dyn ByteDevice>, &config())
        .expect_err("writable");
    assert!(matches!(err, FfsError::CorruptMetadata { .. }), "{err:?}");

    let volume = MountedVolume::mount(
        Arc::clone(&mem) as Arc<dyn ByteDevice>,
        &config().read_only(true),
    )
    .expect("read-only mount");
    assert!(volume.is_read_only());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn superblock_checksum_is_deterministic_and_flip_sensitive(
        idx in 0_usize..SB_CHECKSUM_OFFSET,
        mask in 1_u8..=255,
    ) {
        let bytes = csum_image();
        let region = &bytes[1024..2048];
        let stored = u32::from_le_bytes(
            region[SB_CHECKSUM_OFFSET..SB_CHECKSUM_OFFSET + 4].try_into().expect("4 bytes"),
        );
        prop_assert_eq!(superblock_checksum(region), stored);
        prop_assert_eq!(superblock_checksum(region), superblock_checksum(region));

        let mut flipped = region.to_vec();
        flipped[idx] ^= mask;
        prop_assert_ne!(superblock_checksum(&flipped), stored);
    }

    #[test]
    fn descriptor_byte_flip_fails_writable_mount(
        idx in 0_usize..32,
        mask in 1_u8..=255,
    ) {
        let mut image = ImageSpec {
            checksum: ChecksumStyle::GdtCsum,
            ..ImageSpec::default()
        }
        .build()
        .expect("build");
        // Group 0's descriptor opens block 2.
        image.bytes_mut()[2048 + idx] ^= mask;
        let mem = Arc::new(image.into_memory_device());
        let err = MountedVolume::mount(Arc::clone(&mem) as Arc<dyn ByteDevice>, &config())
            .expect_err("corrupt descriptor");
        prop_assert!(matches!(err, FfsError::CorruptMetadata { .. }), "{:?}", err);
    }

    #[test]
    fn persist_then_load_round_trips(
        mnt_count in any::<u16>(),
        last_orphan in 0_u32..64,
        error_count in 0_u32..1000,
        func in "[a-z_]{1,31}",
        line in any::<u32>(),
        ino in any::<u32>(),
        block in any::<u64>(),
    ) {
        let mem = Arc::new(MemoryByteDevice::from_bytes(csum_image()));
        let LoadedSuperblock { mut record, device } = load(&mem);
        {
            let sb = record.superblock_mut();
            sb.mnt_count = mnt_count;
            sb.last_orphan = last_orphan;
            sb.error_count = error_count;
            sb.last_error = ErrorSite { time: 1_700_000_000, ino, block, func, line };
        }
        record
            .persist(device.as_ref(), PersistContext::default(), true)
            .expect("persist");

        let reloaded = load(&mem);
        prop_assert_eq!(reloaded.record.superblock(), record.superblock());
        reloaded.record.verify_checksum(false).expect("checksum");
    }

    #[test]
    fn orphan_chain_converges(links in proptest::collection::vec(any::<bool>(), 1..6)) {
        let orphans: Vec<OrphanSpec> = links
            .iter()
            .enumerate()
            .map(|(idx, &linked)| {
                let ino = 12 + u32::try_from(idx).expect("idx");
                if linked {
                    OrphanSpec::linked(ino, 1024, 2)
                } else {
                    OrphanSpec::unlinked(ino, 2)
                }
            })
            .collect();
        let spec = ImageSpec { orphans, ..ImageSpec::default() };
        let mem = Arc::new(spec.build().expect("build").into_memory_device());
        let volume = MountedVolume::mount(Arc::clone(&mem) as Arc<dyn ByteDevice>, &config())
            .expect("mount");
        let report = volume.orphan_report();
        let linked = u32::try_from(links.iter().filter(|&&l| l).count()).expect("count");
        let total = u32::try_from(links.len()).expect("len");
        prop_assert_eq!(report.truncated, linked);
        prop_assert_eq!(report.truncated + report.deleted, total);
        prop_assert_eq!(volume.superblock().last_orphan, 0);
        volume.unmount().expect("unmount");

        let reloaded = load(&mem);
        prop_assert_eq!(reloaded.record.superblock().last_orphan, 0);
    }
}
