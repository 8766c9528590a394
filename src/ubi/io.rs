//! Flash I/O layer: byte-granular PEB access plus EC/VID header reads and
//! writes with typed outcomes.
//!
//! Everything above this module asks questions like "give me the VID
//! header of PEB 17" and expects a classified answer (valid, valid with
//! corrected bit-flips, blank, or garbage), because the scanner and the
//! recovery paths branch on exactly that classification. Raw media errors
//! are only propagated when they are not one of those states.

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::headers::{Ec, HdrError, Vid, UBI_HDR_SIZE};
use super::UbiError;
use crate::nand::{Media, MediaError, PageUtil, ReadKind};

/// Patterns written during a torture erase, in order.
const TORTURE_PATTERNS: [u8; 3] = [0xA5, 0x5A, 0x00];

/// Outcome of a raw data read.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataKind {
    Clean,
    /// Data is correct but the PEB should be scrubbed.
    BitFlips,
    /// Uncorrectable ECC failure; buffer contents are whatever the media
    /// returned and must not be trusted.
    Ecc,
}

/// Outcome of reading an EC or VID header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HdrRead<T> {
    /// A valid header.
    Ok { hdr: T, bitflips: bool },

    /// The header region is fully erased. `bitflips` hints that the PEB
    /// should be erased before reuse anyway.
    Blank { bitflips: bool },

    /// Garbage: bad magic or bad CRC. `ecc` records whether the read
    /// itself failed ECC, which matters for corruption triage.
    Bad { ecc: bool },
}

/// The flash I/O collaborator: owns the media and the derived layout.
pub struct UbiIo {
    media: Mutex<Box<dyn Media>>,

    pub peb_count: u32,
    pub peb_size: usize,
    pub min_io_size: usize,

    /// Offset of the VID header within each PEB.
    pub vid_hdr_offset: usize,

    /// Offset of the data region within each PEB.
    pub data_offset: usize,

    /// Bytes of data a PEB can hold (before per-volume alignment padding).
    pub leb_size: usize,

    /// Whether write/erase failures can be contained by retiring blocks.
    pub can_mark_bad: bool,
}

fn round_up(val: usize, granularity: usize) -> usize {
    val.div_ceil(granularity) * granularity
}

impl UbiIo {
    pub fn new(media: Box<dyn Media>) -> Result<Self, UbiError> {
        let geo = media.geometry();

        if geo.min_io_size == 0 || geo.peb_size % geo.min_io_size != 0 {
            return Err(UbiError::BadFormat(format!(
                "PEB size {} not a multiple of min. I/O size {}",
                geo.peb_size, geo.min_io_size
            )));
        }

        let hdr_alsize = round_up(UBI_HDR_SIZE, geo.min_io_size);
        let vid_hdr_offset = hdr_alsize;
        let data_offset = vid_hdr_offset + hdr_alsize;

        if geo.peb_size < data_offset + geo.min_io_size {
            return Err(UbiError::BadFormat(format!(
                "PEB size {} too small for headers plus data",
                geo.peb_size
            )));
        }
        // Room for the two volume-table copies plus minimal reserves.
        if geo.peb_count < 5 {
            return Err(UbiError::BadFormat(format!(
                "{} PEBs is too small a device",
                geo.peb_count
            )));
        }

        Ok(Self {
            media: Mutex::new(media),
            peb_count: geo.peb_count,
            peb_size: geo.peb_size,
            min_io_size: geo.min_io_size,
            vid_hdr_offset,
            data_offset,
            leb_size: geo.peb_size - data_offset,
            can_mark_bad: geo.can_mark_bad,
        })
    }

    pub fn is_bad(&self, pnum: u32) -> Result<bool, UbiError> {
        Ok(self.media.lock().is_bad(pnum)?)
    }

    pub fn mark_bad(&self, pnum: u32) -> Result<(), UbiError> {
        warn!(pnum, "marking physical eraseblock bad");
        Ok(self.media.lock().mark_bad(pnum)?)
    }

    /// Read into `buf` at an absolute offset within the PEB.
    pub fn read(&self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<DataKind, UbiError> {
        match self.media.lock().read(pnum, offset, buf) {
            Ok(ReadKind::Clean) => Ok(DataKind::Clean),
            Ok(ReadKind::BitFlips) => {
                debug!(pnum, offset, "corrected bit-flips while reading");
                Ok(DataKind::BitFlips)
            }
            Err(MediaError::Uncorrectable(_)) => Ok(DataKind::Ecc),
            Err(e) => Err(e.into()),
        }
    }

    /// Read from the data region (offset relative to `data_offset`).
    pub fn read_data(&self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<DataKind, UbiError> {
        self.read(pnum, self.data_offset + offset, buf)
    }

    /// Write at an absolute offset within the PEB. Alignment is enforced
    /// by the media; callers pad with 0xFF as needed.
    pub fn write(&self, pnum: u32, offset: usize, data: &[u8]) -> Result<(), UbiError> {
        Ok(self.media.lock().program(pnum, offset, data)?)
    }

    /// Write into the data region, padding the tail with 0xFF up to the
    /// min. I/O unit.
    pub fn write_data(&self, pnum: u32, offset: usize, data: &[u8]) -> Result<(), UbiError> {
        let aligned = round_up(data.len(), self.min_io_size);
        if aligned == data.len() {
            return self.write(pnum, self.data_offset + offset, data);
        }

        let mut padded = Vec::with_capacity(aligned);
        padded.extend_from_slice(data);
        padded.resize(aligned, 0xFF);
        self.write(pnum, self.data_offset + offset, &padded)
    }

    /// Erase the PEB. With `torture` set, additionally verify it by
    /// writing and reading back test patterns (destructive verify) before
    /// the final erase.
    pub fn sync_erase(&self, pnum: u32, torture: bool) -> Result<(), UbiError> {
        let mut media = self.media.lock();

        if torture {
            debug!(pnum, "torturing physical eraseblock");
            let mut buf = vec![0u8; self.peb_size];
            for pattern in TORTURE_PATTERNS {
                media.erase(pnum)?;

                media.read(pnum, 0, &mut buf)?;
                if !buf.is_erased() {
                    warn!(pnum, "erased PEB reads back non-0xFF");
                    return Err(UbiError::EraseFailed { pnum });
                }

                buf.fill(pattern);
                media.program(pnum, 0, &buf)?;

                media.read(pnum, 0, &mut buf)?;
                if buf.iter().any(|&b| b != pattern) {
                    warn!(pnum, pattern, "torture pattern did not stick");
                    return Err(UbiError::EraseFailed { pnum });
                }
            }
        }

        media.erase(pnum)?;
        Ok(())
    }

    fn read_hdr_region(
        &self,
        pnum: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(DataKind, bool), UbiError> {
        let kind = self.read(pnum, offset, buf)?;
        Ok((kind, buf.is_erased()))
    }

    /// Read and classify the erase-counter header.
    ///
    /// A version mismatch in an intact header is returned as a hard error:
    /// the device was written by an incompatible implementation.
    pub fn read_ec_hdr(&self, pnum: u32) -> Result<HdrRead<Ec>, UbiError> {
        let mut buf = [0u8; UBI_HDR_SIZE];
        let (kind, blank) = self.read_hdr_region(pnum, 0, &mut buf)?;

        if blank {
            return Ok(HdrRead::Blank {
                bitflips: kind != DataKind::Clean,
            });
        }
        if kind == DataKind::Ecc {
            return Ok(HdrRead::Bad { ecc: true });
        }

        match Ec::decode(&buf) {
            Ok(hdr) => Ok(HdrRead::Ok {
                hdr,
                bitflips: kind == DataKind::BitFlips,
            }),
            Err(HdrError::BadVersion(version)) => Err(UbiError::BadVersion { pnum, version }),
            Err(_) => Ok(HdrRead::Bad { ecc: false }),
        }
    }

    pub fn write_ec_hdr(&self, pnum: u32, ec: Ec) -> Result<(), UbiError> {
        let mut buf = vec![0xFF; self.vid_hdr_offset];
        ec.encode(&mut buf);
        self.write(pnum, 0, &buf)
    }

    /// Read and classify the volume-identifier header.
    pub fn read_vid_hdr(&self, pnum: u32) -> Result<HdrRead<Vid>, UbiError> {
        let mut buf = [0u8; UBI_HDR_SIZE];
        let (kind, blank) = self.read_hdr_region(pnum, self.vid_hdr_offset, &mut buf)?;

        if blank {
            return Ok(HdrRead::Blank {
                bitflips: kind != DataKind::Clean,
            });
        }
        if kind == DataKind::Ecc {
            return Ok(HdrRead::Bad { ecc: true });
        }

        match Vid::decode(&buf) {
            Ok(hdr) => Ok(HdrRead::Ok {
                hdr,
                bitflips: kind == DataKind::BitFlips,
            }),
            Err(HdrError::BadVersion(version)) => Err(UbiError::BadVersion { pnum, version }),
            Err(_) => Ok(HdrRead::Bad { ecc: false }),
        }
    }

    pub fn write_vid_hdr(&self, pnum: u32, vid: Vid) -> Result<(), UbiError> {
        let mut buf = vec![0xFF; self.data_offset - self.vid_hdr_offset];
        vid.encode(&mut buf);
        self.write(pnum, self.vid_hdr_offset, &buf)
    }

    /// Is the PEB's data region fully erased?
    ///
    /// Used for corruption triage during scan (a power cut during erase
    /// leaves a garbage header over blank data) and for the paranoid
    /// check that freshly allocated PEBs really are empty.
    pub fn is_data_blank(&self, pnum: u32) -> Result<bool, UbiError> {
        let mut buf = vec![0u8; self.leb_size];
        match self.read_data(pnum, 0, &mut buf)? {
            DataKind::Ecc => Ok(false),
            _ => Ok(buf.is_erased()),
        }
    }

    /// The meaningful length of dynamic-volume LEB contents: everything up
    /// to the last non-0xFF byte, rounded up to the min. I/O unit.
    pub fn calc_data_len(&self, buf: &[u8]) -> usize {
        match buf.iter().rposition(|&b| b != 0xFF) {
            Some(idx) => round_up(idx + 1, self.min_io_size),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::{Fault, FaultOp, MediaGeometry, SimMedia};

    const TEST_GEOMETRY: MediaGeometry = MediaGeometry {
        peb_count: 8,
        peb_size: 4096,
        min_io_size: 256,
        can_mark_bad: true,
    };

    fn test_io() -> UbiIo {
        UbiIo::new(Box::new(SimMedia::new(TEST_GEOMETRY))).unwrap()
    }

    #[test]
    fn test_layout() {
        let io = test_io();
        assert_eq!(io.vid_hdr_offset, 256);
        assert_eq!(io.data_offset, 512);
        assert_eq!(io.leb_size, 4096 - 512);
    }

    #[test]
    fn test_header_round_trip() {
        let io = test_io();

        assert_eq!(io.read_ec_hdr(0).unwrap(), HdrRead::Blank { bitflips: false });

        let ec = Ec {
            ec: 3,
            vid_hdr_offset: 256,
            data_offset: 512,
            image_seq: 1,
        };
        io.write_ec_hdr(0, ec).unwrap();
        assert_eq!(
            io.read_ec_hdr(0).unwrap(),
            HdrRead::Ok {
                hdr: ec,
                bitflips: false
            }
        );

        let vid = Vid {
            vol_id: 0,
            lnum: 4,
            sqnum: 17,
            ..Default::default()
        };
        io.write_vid_hdr(0, vid).unwrap();
        assert_eq!(
            io.read_vid_hdr(0).unwrap(),
            HdrRead::Ok {
                hdr: vid,
                bitflips: false
            }
        );
    }

    #[test]
    fn test_bad_header_classification() {
        let mut media = SimMedia::new(TEST_GEOMETRY);
        media.scribble(1, 0, b"garbage bytes here");
        media.scribble(2, 0, b"more garbage here");
        media.inject(FaultOp::Read, 2, Fault::Uncorrectable);

        let io = UbiIo::new(Box::new(media)).unwrap();
        assert_eq!(io.read_ec_hdr(1).unwrap(), HdrRead::Bad { ecc: false });
        assert_eq!(io.read_ec_hdr(2).unwrap(), HdrRead::Bad { ecc: true });
    }

    #[test]
    fn test_torture_erase() {
        let io = test_io();
        io.write_ec_hdr(3, Ec::default()).unwrap();
        io.sync_erase(3, true).unwrap();
        assert!(io.is_data_blank(3).unwrap());
        assert_eq!(io.read_ec_hdr(3).unwrap(), HdrRead::Blank { bitflips: false });
    }

    #[test]
    fn test_calc_data_len() {
        let io = test_io();
        let mut buf = vec![0xFFu8; 1024];
        assert_eq!(io.calc_data_len(&buf), 0);
        buf[0] = 1;
        assert_eq!(io.calc_data_len(&buf), 256);
        buf[700] = 2;
        assert_eq!(io.calc_data_len(&buf), 768);
    }
}
