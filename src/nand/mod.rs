//! Abstractions and code to access raw NAND/NOR flash.
//!
//! Everything above this module speaks in terms of physical eraseblocks
//! (PEBs) and byte offsets within them. A [`Media`] implementation is
//! expected to behave like real flash: programming can only clear bits
//! (1 → 0), erasing a block resets it to all-0xFF, reads may report
//! corrected bit-flips, and blocks can go bad and be marked as such.

use std::io::{Read, Write};
use std::str::FromStr;

use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for `[u8]` slices holding flash contents.
pub trait PageUtil {
    /// Does this slice contain the all-1s (erased) bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a flash device.
#[derive(Debug, Copy, Clone)]
pub struct MediaGeometry {
    /// Number of physical eraseblocks.
    pub peb_count: u32,

    /// Bytes per physical eraseblock.
    pub peb_size: usize,

    /// Smallest unit that can be programmed in one go (the NAND page size,
    /// or 1 for NOR-like media).
    pub min_io_size: usize,

    /// Whether the device supports marking blocks bad. When `false`, any
    /// write/erase failure is treated as fatal for the whole device.
    pub can_mark_bad: bool,
}

/// Parse strings like "PEBSxBYTESxIO", e.g. "64x65536x512".
impl FromStr for MediaGeometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [peb_count, peb_size, min_io_size]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;

        Ok(MediaGeometry {
            peb_count: peb_count.parse()?,
            peb_size: peb_size.parse()?,
            min_io_size: min_io_size.parse()?,
            can_mark_bad: true,
        })
    }
}

/// How a read completed, when it did not fail outright.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadKind {
    /// Data returned with no correction applied.
    Clean,

    /// Data is correct, but the controller had to fix one or more
    /// bit-flips. The caller should consider relocating the block.
    BitFlips,
}

/// Errors reported by a [`Media`] implementation.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("physical eraseblock {0} out of range")]
    OutOfRange(u32),

    #[error("access to bad physical eraseblock {0}")]
    BadBlock(u32),

    #[error("unaligned access to PEB {pnum} at offset {offset}, length {len}")]
    Unaligned { pnum: u32, offset: usize, len: usize },

    #[error("uncorrectable ECC error on PEB {0}")]
    Uncorrectable(u32),

    #[error("program operation failed on PEB {0}")]
    ProgramFailed(u32),

    #[error("erase operation failed on PEB {0}")]
    EraseFailed(u32),

    #[error("bad-block marking is not supported by this media")]
    CannotMarkBad,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Represents a raw flash device, addressed by physical eraseblock.
pub trait Media: Send {
    /// Get the geometry of the device.
    fn geometry(&self) -> MediaGeometry;

    /// Is the given eraseblock marked bad?
    fn is_bad(&mut self, pnum: u32) -> Result<bool, MediaError>;

    /// Read `buf.len()` bytes starting at `offset` within `pnum`.
    ///
    /// Byte-granular; no alignment requirement.
    fn read(&mut self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<ReadKind, MediaError>;

    /// Program `data` at `offset` within `pnum`.
    ///
    /// `offset` and `data.len()` must be multiples of `min_io_size`, and
    /// the target range must be in the erased state.
    fn program(&mut self, pnum: u32, offset: usize, data: &[u8]) -> Result<(), MediaError>;

    /// Erase `pnum`, returning it to the all-0xFF state.
    fn erase(&mut self, pnum: u32) -> Result<(), MediaError>;

    /// Mark `pnum` bad. It will never be accessible again.
    fn mark_bad(&mut self, pnum: u32) -> Result<(), MediaError>;
}

/// Which operation an injected fault should fire on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOp {
    Read,
    Program,
    Erase,
}

/// A one-shot fault, consumed by the first matching operation.
#[derive(Debug, Copy, Clone)]
pub enum Fault {
    /// Read succeeds with correct data but reports a corrected bit-flip.
    BitFlips,

    /// Read fails with an uncorrectable ECC error.
    Uncorrectable,

    /// Program writes nothing and fails.
    ProgramFail,

    /// Program writes only the first `keep` bytes, then fails. Emulates a
    /// power cut mid-write.
    PowerCut { keep: usize },

    /// Erase leaves the block untouched and fails.
    EraseFail,
}

/// A simulated in-memory flash device, for testing purposes.
///
/// Models the physics the translation layer depends on: programming can
/// only clear bits, the target range must be erased first, and erases
/// reset the block to 0xFF. Faults can be queued against specific
/// `(operation, pnum)` pairs to exercise recovery paths.
pub struct SimMedia {
    pebs: Vec<SimPeb>,
    geometry: MediaGeometry,
    faults: Vec<(FaultOp, u32, Fault)>,
}

struct SimPeb {
    data: Vec<u8>,
    bad: bool,
}

impl SimMedia {
    /// Create an empty (all-0xFF) simulated device.
    pub fn new(geometry: MediaGeometry) -> Self {
        let pebs = (0..geometry.peb_count)
            .map(|_| SimPeb {
                data: vec![0xFF; geometry.peb_size],
                bad: false,
            })
            .collect();

        Self {
            pebs,
            geometry,
            faults: Vec::new(),
        }
    }

    /// Queue a one-shot fault for the next matching operation on `pnum`.
    pub fn inject(&mut self, op: FaultOp, pnum: u32, fault: Fault) {
        self.faults.push((op, pnum, fault));
    }

    fn take_fault(&mut self, op: FaultOp, pnum: u32) -> Option<Fault> {
        let idx = self
            .faults
            .iter()
            .position(|&(o, p, _)| o == op && p == pnum)?;
        Some(self.faults.remove(idx).2)
    }

    /// Overwrite bytes directly, bypassing the program-only-clears-bits
    /// rule. Test helper for manufacturing corrupt on-flash states.
    pub fn scribble(&mut self, pnum: u32, offset: usize, data: &[u8]) {
        self.pebs[pnum as usize].data[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Initialize the contents from a flat image (PEB after PEB).
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        for peb in &mut self.pebs {
            peb.bad = false;
            read.read_exact(&mut peb.data)?;
        }
        Ok(())
    }

    /// Dump the contents as a flat image. Bad blocks come out as 0xBD.
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let filler = vec![0xBD; self.geometry.peb_size];
        for peb in &self.pebs {
            write.write_all(if peb.bad { &filler } else { &peb.data })?;
        }
        Ok(())
    }

    fn peb(&mut self, pnum: u32) -> Result<&mut SimPeb, MediaError> {
        let peb = self
            .pebs
            .get_mut(pnum as usize)
            .ok_or(MediaError::OutOfRange(pnum))?;
        if peb.bad {
            return Err(MediaError::BadBlock(pnum));
        }
        Ok(peb)
    }

    fn check_range(&self, pnum: u32, offset: usize, len: usize) -> Result<(), MediaError> {
        if offset + len > self.geometry.peb_size {
            return Err(MediaError::Unaligned { pnum, offset, len });
        }
        Ok(())
    }
}

impl Media for SimMedia {
    fn geometry(&self) -> MediaGeometry {
        self.geometry
    }

    fn is_bad(&mut self, pnum: u32) -> Result<bool, MediaError> {
        self.pebs
            .get(pnum as usize)
            .map(|p| p.bad)
            .ok_or(MediaError::OutOfRange(pnum))
    }

    fn read(&mut self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<ReadKind, MediaError> {
        self.check_range(pnum, offset, buf.len())?;
        let fault = self.take_fault(FaultOp::Read, pnum);

        let peb = self.peb(pnum)?;
        buf.copy_from_slice(&peb.data[offset..offset + buf.len()]);

        match fault {
            Some(Fault::Uncorrectable) => Err(MediaError::Uncorrectable(pnum)),
            Some(Fault::BitFlips) => Ok(ReadKind::BitFlips),
            _ => Ok(ReadKind::Clean),
        }
    }

    fn program(&mut self, pnum: u32, offset: usize, data: &[u8]) -> Result<(), MediaError> {
        self.check_range(pnum, offset, data.len())?;
        let min_io = self.geometry.min_io_size;
        if offset % min_io != 0 || data.len() % min_io != 0 {
            return Err(MediaError::Unaligned {
                pnum,
                offset,
                len: data.len(),
            });
        }

        let fault = self.take_fault(FaultOp::Program, pnum);
        let peb = self.peb(pnum)?;
        let target = &mut peb.data[offset..offset + data.len()];

        // Real flash cannot raise bits back to 1 without an erase. An
        // attempt to program over non-erased content is a driver bug.
        if target.iter().zip(data).any(|(&old, &new)| old & new != new) {
            return Err(MediaError::ProgramFailed(pnum));
        }

        match fault {
            Some(Fault::ProgramFail) => Err(MediaError::ProgramFailed(pnum)),
            Some(Fault::PowerCut { keep }) => {
                let keep = keep.min(data.len());
                target[..keep].copy_from_slice(&data[..keep]);
                Err(MediaError::ProgramFailed(pnum))
            }
            _ => {
                target.copy_from_slice(data);
                Ok(())
            }
        }
    }

    fn erase(&mut self, pnum: u32) -> Result<(), MediaError> {
        let fault = self.take_fault(FaultOp::Erase, pnum);
        let peb = self.peb(pnum)?;

        match fault {
            Some(Fault::EraseFail) => Err(MediaError::EraseFailed(pnum)),
            _ => {
                peb.data.fill(0xFF);
                Ok(())
            }
        }
    }

    fn mark_bad(&mut self, pnum: u32) -> Result<(), MediaError> {
        if !self.geometry.can_mark_bad {
            return Err(MediaError::CannotMarkBad);
        }
        let peb = self
            .pebs
            .get_mut(pnum as usize)
            .ok_or(MediaError::OutOfRange(pnum))?;
        peb.bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_GEOMETRY: MediaGeometry = MediaGeometry {
    peb_count: 8,
    peb_size: 4096,
    min_io_size: 256,
    can_mark_bad: true,
};

#[test]
fn test_sim_read_write() {
    let mut media = SimMedia::new(TEST_GEOMETRY);

    let data_in = vec![0xA5u8; 256];
    let mut data_out = vec![0u8; 256];

    media.program(0, 512, &data_in).unwrap();
    assert_eq!(media.read(0, 512, &mut data_out).unwrap(), ReadKind::Clean);
    assert_eq!(data_out, data_in);

    media.read(0, 0, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    // Reprogramming the same range must fail without an erase in between.
    assert!(media.program(0, 512, &[0xFFu8; 256]).is_err());
    media.erase(0).unwrap();
    media.read(0, 512, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_alignment() {
    let mut media = SimMedia::new(TEST_GEOMETRY);
    assert!(media.program(0, 128, &[0u8; 256]).is_err());
    assert!(media.program(0, 0, &[0u8; 100]).is_err());

    // Reads have no alignment requirement.
    let mut buf = [0u8; 3];
    media.read(0, 5, &mut buf).unwrap();
}

#[test]
fn test_sim_mark_bad() {
    let mut media = SimMedia::new(TEST_GEOMETRY);
    assert!(!media.is_bad(3).unwrap());
    media.mark_bad(3).unwrap();
    assert!(media.is_bad(3).unwrap());
    assert!(matches!(media.erase(3), Err(MediaError::BadBlock(3))));
}

#[test]
fn test_sim_faults() {
    let mut media = SimMedia::new(TEST_GEOMETRY);
    let mut buf = [0u8; 16];

    media.inject(FaultOp::Read, 1, Fault::BitFlips);
    assert_eq!(media.read(1, 0, &mut buf).unwrap(), ReadKind::BitFlips);
    assert_eq!(media.read(1, 0, &mut buf).unwrap(), ReadKind::Clean);

    media.inject(FaultOp::Program, 2, Fault::PowerCut { keep: 256 });
    assert!(media.program(2, 0, &vec![0u8; 512]).is_err());
    let mut page = vec![0xFFu8; 512];
    media.read(2, 0, &mut page).unwrap();
    assert!(page[..256].iter().all(|&b| b == 0));
    assert!(page[256..].is_erased());

    media.inject(FaultOp::Erase, 2, Fault::EraseFail);
    assert!(media.erase(2).is_err());
    media.erase(2).unwrap();
}
