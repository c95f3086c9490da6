#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ffs_block::{FileByteDevice, read_ext4_superblock_region};
use ffs_core::{MountConfig, MountedVolume, VolumeStats};
use ffs_ondisk::{ErrorSite, Ext4Superblock};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct ErrorOutput {
    time: u32,
    function: String,
    line: u32,
    inode: u32,
    block: u64,
}

impl From<&ErrorSite> for ErrorOutput {
    fn from(site: &ErrorSite) -> Self {
        Self {
            time: site.time,
            function: site.func.clone(),
            line: site.line,
            inode: site.ino,
            block: site.block,
        }
    }
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    uuid: String,
    volume_name: String,
    block_size: u32,
    blocks_count: u64,
    inodes_count: u32,
    groups_count: u32,
    free_blocks: u64,
    free_inodes: u32,
    state: u16,
    compat: String,
    incompat: String,
    ro_compat: String,
    needs_recovery: bool,
    last_orphan: u32,
    mount_count: u16,
    error_count: u32,
    first_error: Option<ErrorOutput>,
    last_error: Option<ErrorOutput>,
}

impl From<&Ext4Superblock> for InspectOutput {
    fn from(sb: &Ext4Superblock) -> Self {
        Self {
            uuid: sb.uuid.to_string(),
            volume_name: sb.volume_name.clone(),
            block_size: sb.block_size,
            blocks_count: sb.blocks_count,
            inodes_count: sb.inodes_count,
            groups_count: sb.groups_count(),
            free_blocks: sb.free_blocks_count,
            free_inodes: sb.free_inodes_count,
            state: sb.state,
            compat: sb.feature_compat.to_string(),
            incompat: sb.feature_incompat.to_string(),
            ro_compat: sb.feature_ro_compat.to_string(),
            needs_recovery: sb.needs_recovery(),
            last_orphan: sb.last_orphan,
            mount_count: sb.mnt_count,
            error_count: sb.error_count,
            first_error: sb
                .first_error
                .is_recorded()
                .then(|| ErrorOutput::from(&sb.first_error)),
            last_error: sb
                .last_error
                .is_recorded()
                .then(|| ErrorOutput::from(&sb.last_error)),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "mount-check" => {
            let Some(path) = args.next() else {
                bail!("mount-check requires a path argument");
            };
            let mut options = String::new();
            let mut read_only = false;
            let mut json = false;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "-o" => {
                        let Some(value) = args.next() else {
                            bail!("-o requires an option string");
                        };
                        options = value;
                    }
                    "--ro" => read_only = true,
                    "--json" => json = true,
                    other => bail!("unknown mount-check argument: {other}"),
                }
            }
            mount_check(Path::new(&path), &options, read_only, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("ffs-cli\n");
    println!("USAGE:");
    println!("  ffs-cli inspect <image-path> [--json]");
    println!("  ffs-cli mount-check <image-path> [-o <options>] [--ro] [--json]");
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let dev = FileByteDevice::open_read_only(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let region = read_ext4_superblock_region(&dev).context("read superblock region")?;
    let sb = Ext4Superblock::parse_superblock_region(&region)
        .with_context(|| format!("no ext4 superblock in {}", path.display()))?;
    let output = InspectOutput::from(&sb);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }
    println!("uuid: {}", output.uuid);
    println!("volume_name: {}", output.volume_name);
    println!("block_size: {}", output.block_size);
    println!("blocks_count: {}", output.blocks_count);
    println!("inodes_count: {}", output.inodes_count);
    println!("groups_count: {}", output.groups_count);
    println!("free: {} blocks, {} inodes", output.free_blocks, output.free_inodes);
    println!("state: {:#06x}", output.state);
    println!("features: compat [{}] incompat [{}] ro_compat [{}]", output.compat, output.incompat, output.ro_compat);
    println!("needs_recovery: {}", output.needs_recovery);
    println!("last_orphan: {}", output.last_orphan);
    println!("mount_count: {}", output.mount_count);
    println!("error_count: {}", output.error_count);
    for (label, site) in [("first_error", &output.first_error), ("last_error", &output.last_error)] {
        if let Some(site) = site {
            println!(
                "{label}: {}:{} inode {} block {} at {}",
                site.function, site.line, site.inode, site.block, site.time
            );
        }
    }
    Ok(())
}

fn mount_check(path: &Path, options: &str, read_only: bool, json: bool) -> Result<()> {
    let dev = if read_only {
        FileByteDevice::open_read_only(path)
    } else {
        FileByteDevice::open(path)
    }
    .with_context(|| format!("failed to open {}", path.display()))?;
    tracing::info!(target: "ffs::cli", path = %path.display(), read_only, options, "mount_check_start");
    let config = MountConfig::default()
        .with_options(options)
        .read_only(read_only);
    let volume = MountedVolume::mount(Arc::new(dev), &config)
        .with_context(|| format!("mount of {} failed", path.display()))?;
    let stats = volume.stats();
    volume.unmount().context("unmount failed")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&stats).context("serialize output")?
        );
    } else {
        print_stats(&stats);
    }
    Ok(())
}

fn print_stats(stats: &VolumeStats) {
    println!("mounted: {}", if stats.read_only { "read-only" } else { "read-write" });
    println!("options: {}", stats.options);
    println!("fault_state: {:?}", stats.fault_state);
    println!("journal: {:?}", stats.journal_state);
    if let Some(recovery) = &stats.recovery {
        println!(
            "recovery: {} transactions, {} blocks replayed, {} revoked",
            recovery.transactions, recovery.blocks_replayed, recovery.blocks_revoked
        );
    }
    println!(
        "orphans: {} truncated, {} deleted{}",
        stats.orphans.truncated,
        stats.orphans.deleted,
        stats
            .orphans
            .skipped
            .map_or(String::new(), |skip| format!(" (skipped: {skip:?})"))
    );
    match stats.first_uninitialized_group {
        Some(group) => println!("uninitialized inode tables from group {group}"),
        None => println!("all inode tables initialized"),
    }
    println!("free: {} blocks, {} inodes", stats.free_blocks, stats.free_inodes);
}
