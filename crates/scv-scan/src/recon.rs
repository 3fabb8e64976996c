//! The reconnaissance pass: sweep the device and index every leaf item.
//!
//! Interior nodes are intentionally ignored. All useful information lives in
//! leaves, and interior pointers are exactly what a damaged filesystem
//! loses, so nothing here ever follows one.

use scv_block::{BlockScanner, ByteDevice, check_device_size};
use scv_error::Result;
use scv_index::Index;
use scv_ondisk::Leaf;
use scv_types::SUPER_INFO_OFFSET;
use tracing::{debug, info};
use uuid::Uuid;

/// Receives scan progress. Units are whatever the driver reports: device
/// bytes for recon, samples for identify.
pub trait ProgressSink {
    fn begin(&mut self, total: u64);
    fn advance(&mut self, position: u64);
    fn finish(&mut self);
}

/// Sink that swallows all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn begin(&mut self, _total: u64) {}
    fn advance(&mut self, _position: u64) {}
    fn finish(&mut self) {}
}

/// Counters from one recon sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconReport {
    pub blocks_scanned: u64,
    pub leaves_indexed: u64,
    pub items_inserted: u64,
}

/// Sweep the device in block-size steps, starting right after the first
/// superblock, and insert every item of every leaf that belongs to `fsid`.
///
/// Blocks with a foreign fsid, no items, or a non-zero level are skipped;
/// a malformed block never aborts the run. The pending index transaction is
/// committed before returning, and cancellation at any block boundary
/// leaves a valid, smaller index.
pub fn recon_device(
    dev: &dyn ByteDevice,
    index: &mut Index,
    fsid: Uuid,
    block_size: u64,
    progress: &mut dyn ProgressSink,
) -> Result<ReconReport> {
    check_device_size(dev.len_bytes(), block_size)?;

    let start = SUPER_INFO_OFFSET + block_size;
    let mut scanner = BlockScanner::new(dev, block_size, start);
    progress.begin(scanner.end());
    debug!(start, end = scanner.end(), block_size, "recon sweep");

    let mut buf = vec![0_u8; usize::try_from(block_size).unwrap_or(usize::MAX)];
    let mut report = ReconReport::default();
    while let Some(offset) = scanner.next_block(&mut buf)? {
        progress.advance(offset);
        report.blocks_scanned += 1;

        let Ok(leaf) = Leaf::new(&buf) else {
            continue;
        };
        let header = leaf.header();
        if header.fsid() != fsid || header.nr_items() == 0 || !header.is_leaf() {
            continue;
        }

        // Unknown key types are stored too; their payloads stay opaque so
        // later tooling can parse them.
        for i in 0..leaf.len() {
            index.insert_item(header.owner(), header.generation(), leaf.item(i), leaf.data(i))?;
        }
        report.items_inserted += leaf.len() as u64;
        report.leaves_indexed += 1;
    }

    index.commit()?;
    progress.finish();
    info!(
        blocks = report.blocks_scanned,
        leaves = report.leaves_indexed,
        items = report.items_inserted,
        "recon complete"
    );
    Ok(report)
}
