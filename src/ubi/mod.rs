//! A user-space UBI-style flash translation layer.
//!
//! Raw flash is addressed in physical eraseblocks (PEBs). This module and
//! its children present that as a set of *volumes*, each a linear array of
//! logical eraseblocks (LEBs) that can be read, written, atomically
//! replaced, and unmapped. Underneath, three engines cooperate:
//!
//! - [`scan`] walks the whole device once at attach time and reconstructs
//!   volume and eraseblock state from the on-flash EC/VID headers;
//! - [`eba`] owns the per-volume LEB→PEB tables and the locked
//!   read/write/atomic-change operations, including power-cut recovery;
//! - [`wl`] owns the erase-counter-ordered PEB pools, hands out fresh PEBs,
//!   takes back stale ones, and relocates data in the background to even
//!   out wear.
//!
//! [`device`] ties them together: `attach` runs the scan, loads the volume
//! table, seeds both engines, and starts the background worker.
//!
//! Every PEB begins with a 64-byte erase-counter ("EC") header, and, once
//! it holds data, a volume-identifier ("VID") header in the following
//! min. I/O unit. Both are CRC-protected; the VID header carries a global
//! sequence number used to resolve conflicting claims to the same LEB
//! after a power cut.

pub mod device;
pub mod eba;
pub mod headers;
pub mod io;
pub mod scan;
pub mod vtbl;
pub mod wl;

use thiserror::Error;

use crate::nand::MediaError;

/// Volume IDs at or above this value are internal to the translation layer.
pub const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_EFFF;

/// Highest legal user-volume count (and table slot count ceiling).
pub const UBI_MAX_VOLUMES: usize = 128;

/// Maximum volume name length, in bytes.
pub const UBI_VOL_NAME_MAX: usize = 127;

/// An erase counter beyond this is considered corrupt accounting.
pub const UBI_MAX_ERASECOUNTER: u64 = 0x7FFF_FFFF;

/// Compatibility tags carried by internal volumes we do not recognize.
pub const UBI_COMPAT_DELETE: u8 = 1;
pub const UBI_COMPAT_RO: u8 = 2;
pub const UBI_COMPAT_PRESERVE: u8 = 4;
pub const UBI_COMPAT_REJECT: u8 = 5;

/// Where a LEB's data is expected to live for the long or short term.
///
/// This is a wear-leveling allocation hint only; it never affects
/// correctness, just which end of the erase-counter range a fresh PEB is
/// drawn from.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum WriteHint {
    /// Data expected to stay put (give it a PEB with low remaining wear
    /// headroom is fine to avoid, so pick a relatively worn one).
    LongTerm,

    /// Data expected to be replaced soon; the most-worn free PEB will do.
    ShortTerm,

    /// No expectation either way.
    #[default]
    Unknown,
}

/// Tunable policy knobs.
///
/// These bound operator-visible risk; none of them affect correctness.
/// The defaults match the reference translation layer.
#[derive(Debug, Clone)]
pub struct UbiConfig {
    /// Erase-counter gap between the most-worn used PEB and a suitable
    /// free PEB that triggers a wear-leveling relocation.
    pub wl_threshold: u64,

    /// Free-pool selection spread: `LongTerm` allocation never picks a PEB
    /// whose EC exceeds the pool minimum by this much.
    pub free_max_diff: u64,

    /// Depth of the protection queue (in background work cycles).
    pub prot_queue_len: usize,

    /// Attach fails when preserved-corrupt PEBs exceed this percentage of
    /// the device.
    pub corr_limit_percent: u32,

    /// Bad-PEB reserve, in PEBs per 1024 of device size.
    pub beb_limit_per1024: u32,

    /// How many times a failed write is retried on a fresh PEB before the
    /// device goes read-only.
    pub io_retries: u32,

    /// Attach without ever writing: scan anomalies are not repaired, no
    /// erase work is performed, and all mutating operations fail.
    pub read_only: bool,
}

impl Default for UbiConfig {
    fn default() -> Self {
        Self {
            wl_threshold: 4096,
            free_max_diff: 2 * 4096,
            prot_queue_len: 10,
            corr_limit_percent: 5,
            beb_limit_per1024: 20,
            io_retries: 3,
            read_only: false,
        }
    }
}

/// Errors surfaced by the translation layer.
#[derive(Debug, Error)]
pub enum UbiError {
    /// The on-flash state is not a compatible image. Attach-time only;
    /// nothing has been modified.
    #[error("bad on-flash format: {0}")]
    BadFormat(String),

    /// A header carries an on-flash format version we do not implement.
    #[error("PEB {pnum} has unsupported format version {version}")]
    BadVersion { pnum: u32, version: u8 },

    /// Two PEBs carry different image sequence numbers: the device holds
    /// parts of two different images.
    #[error("PEB {pnum}: image sequence {found:#x} does not match {expected:#x}")]
    MixedImageSeq { pnum: u32, expected: u32, found: u32 },

    /// The device has been switched to read-only mode.
    #[error("device is in read-only mode")]
    ReadOnly,

    /// No free PEBs and no pending work that could produce one.
    #[error("out of free physical eraseblocks")]
    OutOfSpace,

    /// Data failed its CRC or ECC check.
    #[error("data integrity check failed on PEB {pnum}")]
    BadData { pnum: u32 },

    /// The volume is marked corrupted and cannot serve this request.
    #[error("volume {vol_id} is corrupted")]
    Corrupted { vol_id: u32 },

    /// Caller error: out-of-range LEB, bad offset/length, wrong volume
    /// type for the operation, and similar.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("volume {0} does not exist")]
    VolumeNotFound(u32),

    #[error("volume {vol_id} already exists (name {name:?})")]
    VolumeExists { vol_id: u32, name: String },

    /// A write failed on a specific PEB; the recovery path decides what
    /// happens next.
    #[error("write failed on PEB {pnum}")]
    WriteFailed { pnum: u32 },

    /// An erase failed on a specific PEB; the bad-block retirement path
    /// decides what happens next.
    #[error("erase failed on PEB {pnum}")]
    EraseFailed { pnum: u32 },

    /// Uncorrectable ECC failure reading a PEB.
    #[error("uncorrectable ECC error on PEB {pnum}")]
    Uncorrectable { pnum: u32 },

    /// Internal consistency violation. The device is switched read-only
    /// when one of these surfaces.
    #[error("internal inconsistency: {0}")]
    Internal(&'static str),

    #[error(transparent)]
    Media(MediaError),
}

impl From<MediaError> for UbiError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::Uncorrectable(pnum) => UbiError::Uncorrectable { pnum },
            MediaError::ProgramFailed(pnum) => UbiError::WriteFailed { pnum },
            MediaError::EraseFailed(pnum) => UbiError::EraseFailed { pnum },
            other => UbiError::Media(other),
        }
    }
}
