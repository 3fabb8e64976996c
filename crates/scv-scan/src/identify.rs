//! Filesystem identification by statistical sampling.
//!
//! With the superblocks gone there is no authoritative record of which
//! filesystems a device held. Every surviving leaf still carries its
//! filesystem id, though, so sampling a few thousand blocks and tallying the
//! ids of everything that looks like a leaf finds the candidates.

use rand::Rng;
use scv_block::{ByteDevice, check_device_size};
use scv_error::Result;
use scv_ondisk::{Header, Leaf};
use scv_types::{
    REGULAR_PAGE_SIZE, SUPER_INFO_OFFSET, SUPER_INFO_OFFSET_2, SUPER_INFO_OFFSET_3,
    SUPER_INFO_OFFSET_4, is_sentinel_uuid,
};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, hash_map::Entry};
use tracing::debug;
use uuid::Uuid;

use crate::recon::ProgressSink;

/// Shannon entropy of a byte string, in bits per byte.
#[must_use]
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0_u64; 256];
    for &byte in data {
        counts[usize::from(byte)] += 1;
    }
    let len = data.len() as f64;
    -counts
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            p * p.log2()
        })
        .sum::<f64>()
}

/// One candidate filesystem reported by the collector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FsEntry {
    pub fsid: Uuid,
    pub count: u64,
    /// Entropy of the 16 id bytes; random-looking ids are likelier real.
    pub entropy: f64,
    /// Block size guessed from first-item offsets, rounded up to 4 KiB.
    pub block_size: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct HistEntry {
    count: u64,
    block_size_sum: u64,
}

/// Streaming histogram of filesystem ids seen in sampled blocks.
#[derive(Debug, Default)]
pub struct FsidCollector {
    hist: HashMap<Uuid, HistEntry>,
}

impl FsidCollector {
    /// Tally one sampled block if it looks like a leaf with a real fsid.
    pub fn collect_block(&mut self, block: &[u8]) {
        let Ok(header) = Header::new(block) else {
            return;
        };
        if !header.is_leaf() {
            return;
        }
        let fsid = header.fsid();
        if is_sentinel_uuid(&fsid) {
            return;
        }
        match self.hist.entry(fsid) {
            Entry::Vacant(vacant) => {
                vacant.insert(HistEntry {
                    count: 1,
                    block_size_sum: 0,
                });
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if header.nr_items() > 0 {
                    // Item entries and their data grow toward each other, so
                    // the first item's back-offset is the largest in the
                    // leaf and approximates the usable block size.
                    if let Ok(leaf) = Leaf::new(block) {
                        if !leaf.is_empty() {
                            entry.block_size_sum += u64::from(leaf.item(0).offset());
                        }
                    }
                }
                entry.count += 1;
            }
        }
    }

    /// Candidate filesystems seen more than `min_occurrence` times, sorted
    /// by count, then entropy, then fsid, all descending.
    #[must_use]
    pub fn entries(&self, min_occurrence: u64) -> Vec<FsEntry> {
        let mut entries: Vec<FsEntry> = self
            .hist
            .iter()
            .filter(|(_, entry)| entry.count > min_occurrence)
            .map(|(&fsid, entry)| {
                let page = f64::from(REGULAR_PAGE_SIZE);
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let guess = ((entry.block_size_sum as f64 / entry.count as f64 + page) as u32)
                    / REGULAR_PAGE_SIZE
                    * REGULAR_PAGE_SIZE;
                FsEntry {
                    fsid,
                    count: entry.count,
                    entropy: shannon_entropy(fsid.as_bytes()),
                    block_size: guess,
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(b.entropy.partial_cmp(&a.entropy).unwrap_or(Ordering::Equal))
                .then(b.fsid.cmp(&a.fsid))
        });
        entries
    }
}

// ── Sample plan ─────────────────────────────────────────────────────────────

/// Produce the sorted, deduplicated block offsets to sample.
///
/// The plan always includes 100 consecutive blocks at each superblock copy
/// offset that fits in the device, because metadata clusters near them. The
/// remainder is filled with uniformly random block offsets. Sorting lets
/// the device be read in one forward sweep.
#[must_use]
pub fn make_sample_offsets(device_size: u64, block_size: u64, num_samples: usize) -> Vec<u64> {
    let mut offsets = BTreeSet::new();
    for super_offset in [
        SUPER_INFO_OFFSET,
        SUPER_INFO_OFFSET_2,
        SUPER_INFO_OFFSET_3,
        SUPER_INFO_OFFSET_4,
    ] {
        for i in 0..100_u64 {
            let offset = super_offset + i * block_size;
            if offset + block_size <= device_size {
                offsets.insert(offset);
            }
        }
    }

    let num_blocks = device_size / block_size;
    let target = num_samples.min(usize::try_from(num_blocks).unwrap_or(usize::MAX));
    let mut rng = rand::thread_rng();
    while offsets.len() < target {
        offsets.insert(rng.gen_range(0..num_blocks) * block_size);
    }
    offsets.into_iter().collect()
}

// ── Identify pass ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct IdentifyOptions {
    /// Fraction of device blocks to sample.
    pub sample_fraction: f64,
    pub min_blocks: usize,
    pub max_blocks: usize,
    /// Ids seen at most this often are not reported.
    pub min_occurrence: u64,
    pub block_size: u64,
}

impl Default for IdentifyOptions {
    fn default() -> Self {
        Self {
            sample_fraction: 0.0001,
            min_blocks: 1000,
            max_blocks: 1_000_000,
            min_occurrence: 4,
            block_size: u64::from(scv_types::DEFAULT_BLOCK_SIZE),
        }
    }
}

impl IdentifyOptions {
    /// Number of blocks to sample for a device of the given size.
    #[must_use]
    pub fn sample_count(&self, device_size: u64) -> usize {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let wanted = (self.sample_fraction * (device_size / self.block_size) as f64) as usize;
        wanted.clamp(self.min_blocks, self.max_blocks)
    }
}

/// Sample the device and report candidate filesystem ids. Progress is
/// reported in samples read.
pub fn identify_device(
    dev: &dyn ByteDevice,
    options: &IdentifyOptions,
    progress: &mut dyn ProgressSink,
) -> Result<Vec<FsEntry>> {
    check_device_size(dev.len_bytes(), options.block_size)?;

    let num_samples = options.sample_count(dev.len_bytes());
    let samples = make_sample_offsets(dev.len_bytes(), options.block_size, num_samples);
    debug!(samples = samples.len(), "sampling device");

    progress.begin(samples.len() as u64);
    let mut buf = vec![0_u8; usize::try_from(options.block_size).unwrap_or(usize::MAX)];
    let mut collector = FsidCollector::default();
    for (i, &offset) in samples.iter().enumerate() {
        dev.read_exact_at(offset, &mut buf)?;
        collector.collect_block(&buf);
        progress.advance(i as u64 + 1);
    }
    progress.finish();

    Ok(collector.entries(options.min_occurrence))
}
