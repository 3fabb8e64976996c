#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use scv_block::{ByteDevice, FileByteDevice};
use scv_fuse::{MountOptions, RescueFs};
use scv_index::{Index, IndexOptions, METADATA_VERSION};
use scv_ondisk::{
    DirEntryType, DirItem, FIRST_FREE_OBJECT_ID, FS_TREE_OBJECT_ID, object_id_name,
};
use scv_scan::{IdentifyOptions, NullProgress, ProgressSink, identify_device, recon_device};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "scavenge",
    version,
    about = "Recover data from damaged btrfs filesystems"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Metadata index file to use.
    #[arg(long, global = true, env = "BTRFSCUE_METADATA")]
    metadata: Option<PathBuf>,
    /// Filesystem block size.
    #[arg(long, global = true, default_value_t = scv_types::DEFAULT_BLOCK_SIZE)]
    block_size: u32,
    /// Explain what is being done.
    #[arg(long, global = true)]
    verbose: bool,
    /// Show progress while scanning.
    #[arg(long, global = true)]
    progress: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Identify btrfs filesystems on a device.
    Identify {
        /// Device or image file to sample.
        device: PathBuf,
        /// Fraction of blocks to sample for filesystem ids.
        #[arg(long, default_value_t = 0.0001)]
        sample_fraction: f64,
        /// Minimum number of blocks to scan.
        #[arg(long, default_value_t = 1000)]
        min_blocks: usize,
        /// Maximum number of blocks to scan.
        #[arg(long, default_value_t = 1_000_000)]
        max_blocks: usize,
        /// Minimum number of occurrences of an id for a filesystem to be
        /// reported.
        #[arg(long, default_value_t = 4)]
        min_occurrence: u64,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Gather metadata from a device for later use.
    Recon {
        /// Device or image file to sweep.
        device: PathBuf,
        /// UUID of the filesystem (see identify).
        #[arg(long)]
        id: Uuid,
        /// Extend an existing metadata file.
        #[arg(long)]
        append: bool,
    },
    /// List information about files, directories and subvolumes/snapshots.
    Ls {
        /// Paths to list.
        paths: Vec<String>,
        /// Recurse into sub-directories.
        #[arg(long)]
        recursive: bool,
        /// Show inode numbers.
        #[arg(long)]
        inode: bool,
    },
    /// Serve a read-only rescue filesystem backed by the index.
    Mount {
        /// Where to mount the rescue filesystem.
        mountpoint: PathBuf,
        /// Source device for file content; without it only inline data is
        /// visible.
        device: Option<PathBuf>,
        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,
    },
    /// For debugging, dump the index in text format.
    DumpIndex,
    /// Rewrite an index created by an older schema to the current one.
    UpgradeIndex {
        /// Accept an index written by an older version.
        #[arg(long)]
        allow_old_version: bool,
    },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    match cli.command {
        Command::Identify {
            device,
            sample_fraction,
            min_blocks,
            max_blocks,
            min_occurrence,
            json,
        } => identify(
            &cli.global,
            &device,
            IdentifyOptions {
                sample_fraction,
                min_blocks,
                max_blocks,
                min_occurrence,
                block_size: u64::from(cli.global.block_size),
            },
            json,
        ),
        Command::Recon { device, id, append } => recon(&cli.global, &device, id, append),
        Command::Ls {
            paths,
            recursive,
            inode,
        } => ls(&cli.global, &paths, recursive, inode),
        Command::Mount {
            mountpoint,
            device,
            allow_other,
        } => mount(&cli.global, &mountpoint, device.as_deref(), allow_other),
        Command::DumpIndex => dump_index(&cli.global),
        Command::UpgradeIndex { allow_old_version } => {
            upgrade_index(&cli.global, allow_old_version)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn metadata_path(global: &GlobalArgs) -> Result<&Path> {
    global
        .metadata
        .as_deref()
        .context("missing metadata option (--metadata or BTRFSCUE_METADATA)")
}

fn progress_sink(global: &GlobalArgs) -> Box<dyn ProgressSink> {
    if global.progress {
        Box::new(TerminalProgress::default())
    } else {
        Box::new(NullProgress)
    }
}

// ── Progress output ─────────────────────────────────────────────────────────

/// Prints a single self-overwriting percentage line to stderr.
#[derive(Debug, Default)]
struct TerminalProgress {
    total: u64,
    last_percent: u64,
}

impl ProgressSink for TerminalProgress {
    fn begin(&mut self, total: u64) {
        self.total = total.max(1);
        self.last_percent = u64::MAX;
    }

    fn advance(&mut self, position: u64) {
        let percent = position.min(self.total) * 100 / self.total;
        if percent != self.last_percent {
            self.last_percent = percent;
            eprint!("\r{percent:>3}%");
            let _ = std::io::stderr().flush();
        }
    }

    fn finish(&mut self) {
        eprintln!("\r100%");
    }
}

// ── identify ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct IdentifyRow {
    fsid: String,
    count: u64,
    entropy: f64,
    block_size: u32,
}

fn identify(
    global: &GlobalArgs,
    device: &Path,
    options: IdentifyOptions,
    json: bool,
) -> Result<()> {
    let dev = FileByteDevice::open(device)
        .with_context(|| format!("failed to open device: {}", device.display()))?;
    info!(
        samples = options.sample_count(dev.len_bytes()),
        "sampling device"
    );

    let mut progress = progress_sink(global);
    let entries = identify_device(&dev, &options, progress.as_mut())?;

    let rows: Vec<IdentifyRow> = entries
        .iter()
        .map(|entry| IdentifyRow {
            fsid: entry.fsid.to_string(),
            count: entry.count,
            entropy: entry.entropy,
            block_size: entry.block_size,
        })
        .collect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("serialize identify report")?
        );
        return Ok(());
    }

    if rows.is_empty() {
        eprintln!(
            "no filesystem id occurred more than {} times, check --min-occurrence",
            options.min_occurrence
        );
        return Ok(());
    }
    println!(
        "{:<36} {:>6} {:>9} {:>10}",
        "fsid", "count", "entropy", "block size"
    );
    for row in &rows {
        println!(
            "{:<36} {:>6} {:>9.6} {:>10}",
            row.fsid, row.count, row.entropy, row.block_size
        );
    }
    Ok(())
}

// ── recon ───────────────────────────────────────────────────────────────────

fn recon(global: &GlobalArgs, device: &Path, id: Uuid, append: bool) -> Result<()> {
    if id.is_nil() {
        bail!("missing id option (see identify)");
    }
    let metadata = metadata_path(global)?;
    if metadata.exists() && !append {
        bail!(
            "metadata file {} exists (use --append to extend it)",
            metadata.display()
        );
    }

    let dev = FileByteDevice::open(device)
        .with_context(|| format!("failed to open device: {}", device.display()))?;
    let mut index = Index::open(
        metadata,
        &IndexOptions {
            block_size: global.block_size,
            fsid: id,
            generation: u64::MAX,
            allow_old_version: false,
        },
    )
    .with_context(|| format!("failed to open metadata index: {}", metadata.display()))?;

    let mut progress = progress_sink(global);
    let report = recon_device(
        &dev,
        &mut index,
        id,
        u64::from(global.block_size),
        progress.as_mut(),
    )?;
    index.close()?;

    println!(
        "indexed {} items from {} leaves ({} blocks scanned)",
        report.items_inserted, report.leaves_indexed, report.blocks_scanned
    );
    Ok(())
}

// ── ls ──────────────────────────────────────────────────────────────────────

fn mode_string(mode: u32) -> String {
    const PERMS: [&str; 8] = ["---", "--x", "-w-", "-wx", "r--", "r-x", "rw-", "rwx"];
    let user = PERMS[(mode as usize >> 6) & 0x7];
    let group = PERMS[(mode as usize >> 3) & 0x7];
    let other = PERMS[mode as usize & 0x7];
    format!("{user}{group}{other}")
}

fn short_time(secs: i64) -> String {
    use chrono::TimeZone;
    match chrono::Utc.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(time) => time.format("%b %e %H:%M").to_string(),
        _ => "?".to_owned(),
    }
}

/// Directory listing data for one entry, resolved across subvolume
/// boundaries.
struct ListEntry {
    owner: u64,
    object_id: u64,
    name: String,
    entry_type: DirEntryType,
}

fn entry_target(owner: u64, dir: &DirItem<'_>) -> (u64, u64) {
    let location = dir.location();
    if dir.is_subvolume() {
        (location.object_id, FIRST_FREE_OBJECT_ID)
    } else {
        (owner, location.object_id)
    }
}

fn list_entries(index: &Index, owner: u64, dir_id: u64) -> Result<Vec<ListEntry>> {
    let mut entries = Vec::new();
    for entry in index.dir_items(owner, dir_id)? {
        let item = entry?;
        let Some((name, entry_type, target)) = item
            .as_dir_item()
            .map(|dir| (dir.name(), dir.entry_type(), entry_target(owner, &dir)))
        else {
            continue;
        };
        entries.push(ListEntry {
            owner: target.0,
            object_id: target.1,
            name,
            entry_type,
        });
    }
    // Non-directories first, then by name.
    entries.sort_by(|a, b| {
        let a_dir = a.entry_type == DirEntryType::Directory;
        let b_dir = b.entry_type == DirEntryType::Directory;
        a_dir.cmp(&b_dir).then_with(|| a.name.cmp(&b.name))
    });
    Ok(entries)
}

fn print_entry(index: &Index, entry: &ListEntry, show_inode: bool) -> Result<()> {
    let mut line = String::new();
    if show_inode {
        line.push_str(&format!("{:>9} ", entry.object_id));
    }
    line.push(entry.entry_type.list_marker());

    match index.find_inode_item(entry.owner, entry.object_id)? {
        Some(item) => match item.as_inode_item() {
            Some(inode) => line.push_str(&format!(
                "{} {:>4} {:>6} {:>6} {:>12} {}",
                mode_string(inode.mode()),
                inode.nlink(),
                inode.uid(),
                inode.gid(),
                inode.size(),
                short_time(inode.ctime().secs),
            )),
            None => line.push_str("????????? ? ? ? ? ?"),
        },
        None => line.push_str("????????? ? ? ? ? ?"),
    }

    println!("{line} {}", entry.name);
    Ok(())
}

fn list_directory(
    index: &Index,
    owner: u64,
    dir_id: u64,
    recursive: bool,
    show_inode: bool,
) -> Result<()> {
    let entries = list_entries(index, owner, dir_id)?;
    for entry in &entries {
        print_entry(index, entry, show_inode)?;
    }
    if recursive {
        for entry in entries
            .iter()
            .filter(|entry| entry.entry_type == DirEntryType::Directory)
        {
            println!("{}:", entry.name);
            list_directory(index, entry.owner, entry.object_id, true, show_inode)?;
        }
    }
    Ok(())
}

fn ls(global: &GlobalArgs, paths: &[String], recursive: bool, show_inode: bool) -> Result<()> {
    let metadata = metadata_path(global)?;
    let index = Index::open_read_only(metadata)
        .with_context(|| format!("failed to open metadata index: {}", metadata.display()))?;

    let paths: Vec<&str> = if paths.is_empty() {
        vec!["/"]
    } else {
        paths.iter().map(String::as_str).collect()
    };

    for path in paths {
        if path == "/" {
            list_directory(
                &index,
                FS_TREE_OBJECT_ID,
                FIRST_FREE_OBJECT_ID,
                recursive,
                show_inode,
            )?;
            continue;
        }

        let Some(matched) = index.find_dir_item_for_path(FS_TREE_OBJECT_ID, path)? else {
            eprintln!("cannot lookup '{path}': No such file or directory");
            continue;
        };
        let Some((name, entry_type)) = matched
            .item
            .as_dir_item()
            .map(|dir| (dir.name(), dir.entry_type()))
        else {
            continue;
        };
        if entry_type == DirEntryType::Directory {
            list_directory(&index, matched.owner, matched.object_id, recursive, show_inode)?;
        } else {
            let entry = ListEntry {
                owner: matched.owner,
                object_id: matched.object_id,
                name,
                entry_type,
            };
            print_entry(&index, &entry, show_inode)?;
        }
    }
    Ok(())
}

// ── mount ───────────────────────────────────────────────────────────────────

fn mount(
    global: &GlobalArgs,
    mountpoint: &Path,
    device: Option<&Path>,
    allow_other: bool,
) -> Result<()> {
    let metadata = metadata_path(global)?;
    let index = Index::open_read_only(metadata)
        .with_context(|| format!("failed to open metadata index: {}", metadata.display()))?;

    let device: Option<Box<dyn ByteDevice>> = match device {
        Some(path) => Some(Box::new(FileByteDevice::open(path).with_context(|| {
            format!("failed to open device: {}", path.display())
        })?)),
        None => {
            eprintln!("no device file given, only inline file data will be visible");
            None
        }
    };

    eprintln!(
        "serving rescue filesystem at {} (unmounts on interrupt)",
        mountpoint.display()
    );
    let fs = RescueFs::new(index, device);
    scv_fuse::mount(
        fs,
        mountpoint,
        &MountOptions {
            allow_other,
            auto_unmount: true,
        },
    )
    .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;
    Ok(())
}

// ── dump-index ──────────────────────────────────────────────────────────────

fn dump_index(global: &GlobalArgs) -> Result<()> {
    let metadata = metadata_path(global)?;
    let index = Index::open_read_only(metadata)
        .with_context(|| format!("failed to open metadata index: {}", metadata.display()))?;

    let mut last_owner = None;
    for entry in index.full_range()? {
        let item = entry?;
        if last_owner != Some(item.owner()) {
            println!("owner {}", object_id_name(item.owner()));
            last_owner = Some(item.owner());
        }
        println!("{} @ {}", item.key(), item.generation());
    }
    Ok(())
}

// ── upgrade-index ───────────────────────────────────────────────────────────

fn upgrade_index(global: &GlobalArgs, allow_old_version: bool) -> Result<()> {
    let metadata = metadata_path(global)?;
    let mut index = Index::open_for_upgrade(metadata)
        .with_context(|| format!("failed to open metadata index: {}", metadata.display()))?;

    if index.metadata().version == METADATA_VERSION {
        println!("index is already at v{METADATA_VERSION}");
        return Ok(());
    }
    if !allow_old_version {
        bail!(
            "index has v{}, pass --allow-old-version to rewrite it to v{METADATA_VERSION}",
            index.metadata().version
        );
    }

    let rewritten = index.upgrade_in_place()?;
    println!("rewrote {rewritten} entries to v{METADATA_VERSION}");
    Ok(())
}
