#![forbid(unsafe_code)]
//! Device scanning passes.
//!
//! `identify` samples blocks statistically to discover which filesystems
//! exist on a device when no superblock survives; `recon` sweeps the whole
//! device and feeds every recognizable leaf into the persistent index.

mod identify;
mod recon;

pub use identify::{
    FsEntry, FsidCollector, IdentifyOptions, identify_device, make_sample_offsets,
    shannon_entropy,
};
pub use recon::{NullProgress, ProgressSink, ReconReport, recon_device};
