//! This module contains the code necessary to read, write, and manipulate
//! EC/VID headers and volume-table records, with CRC
//! verification/computation.
//!
//! The raw on-flash records come from the `income` crate; the ergonomic
//! structs here carry only the fields the engines care about, and decoding
//! reports *why* a header was rejected, because the scanner treats a bad
//! CRC very differently from a bad format version.

use crc::{Crc, CRC_32_JAMCRC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, VtblRecord, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};

use super::UBI_VOL_NAME_MAX;

pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

/// Size of an EC or VID header on flash, in bytes.
pub const UBI_HDR_SIZE: usize = 64;

/// Size of one volume-table record on flash, in bytes.
pub const UBI_VTBL_RECORD_SIZE: usize = 0xAC;

/// Why a header failed to decode.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HdrError {
    /// Wrong or missing magic; the bytes are not a header at all.
    BadMagic,

    /// Valid magic but an on-flash format version we do not implement.
    /// Fatal for the whole attach, unlike the other variants.
    BadVersion(u8),

    /// CRC mismatch over the header bytes.
    BadCrc,

    /// CRC was fine but a field holds a value that cannot occur (e.g. an
    /// unknown volume type). Treated like corruption.
    BadField(&'static str),
}

/// Parsing of UBI headers from byteslices, with magic, version, and CRC
/// verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];
    fn get_hdr_version(&self) -> u8;

    fn parse(buf: &'a [u8]) -> Result<Self, HdrError> {
        let (_, header) = Self::from_bytes((buf, 0)).map_err(|_| HdrError::BadMagic)?;

        if header.get_hdr_magic() != Self::get_magic() {
            return Err(HdrError::BadMagic);
        }
        // CRC before version: a corrupted version byte is reclassifiable
        // damage, while a version mismatch in an intact header is fatal.
        if !header.check_crc() {
            return Err(HdrError::BadCrc);
        }
        if header.get_hdr_version() != UBI_VERSION {
            return Err(HdrError::BadVersion(header.get_hdr_version()));
        }

        Ok(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VidHdr {
    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

/// Computes/repairs the trailing CRC of a Vid/Ec header or vtbl record.
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let header_bytes = self.to_bytes().unwrap();
        let header_len = header_bytes.len() - std::mem::size_of::<u32>();
        UBI_CRC.checksum(&header_bytes[..header_len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VtblRecord {
    fn get_crc(&self) -> u32 {
        self.crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.crc = crc;
    }
}

/// The fields of an erase-counter header the engines care about.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// Change the erase counter of this EC header
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    /// Decode from a byte slice.
    pub fn decode(bytes: &[u8]) -> Result<Self, HdrError> {
        EcHdr::parse(bytes).map(Into::into)
    }

    /// Write into the first [`UBI_HDR_SIZE`] bytes of a slice.
    pub fn encode(self, out_bytes: &mut [u8]) {
        let bytes = EcHdr::from(self).to_bytes().unwrap();
        out_bytes[..bytes.len()].copy_from_slice(&bytes);
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        let mut target = Self {
            magic: UBI_EC_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except
    /// for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// The fields of a volume-identifier header the engines care about.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a verified copy of another PEB
    /// (wear-leveling relocation or atomic LEB change).
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how an implementation that
    /// does not recognize the volume should handle it.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes covered
    /// by `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is
    /// `Dynamic`.
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB
    /// down to a multiple of the requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for
    /// resolving `vol_id:lnum` collisions.
    pub sqnum: u64,
}

impl Vid {
    /// Change the sequence number for this `Vid`
    pub fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    /// Decode from a byte slice.
    pub fn decode(bytes: &[u8]) -> Result<Self, HdrError> {
        VidHdr::parse(bytes)?
            .try_into()
            .map_err(|_| HdrError::BadField("vol_type"))
    }

    /// Write into the first [`UBI_HDR_SIZE`] bytes of a slice.
    pub fn encode(self, out_bytes: &mut [u8]) {
        let bytes = VidHdr::from(self).to_bytes().unwrap();
        out_bytes[..bytes.len()].copy_from_slice(&bytes);
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = ();

    fn try_from(value: VidHdr) -> Result<Self, Self::Error> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let vol_type = vol_type.into();
        let copy_flag = copy_flag.into();

        let mut target = Self {
            magic: UBI_VID_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// The fields of a volume table record the engines care about.
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each PEB to ensure
    /// alignment.
    pub data_pad: u32,

    /// The type of volume.
    pub vol_type: VolType,

    /// Set to `true` during a whole-volume update, so that if interrupted,
    /// it's possible to detect that the volume is corrupt.
    pub upd_marker: bool,

    /// The name of the volume. Any UTF-8 string works here, but other
    /// implementations may assume ASCII.
    pub name: String,

    /// Any flags set on this volume.
    pub flags: u8,
}

impl VolTableRecord {
    /// Decode one table slot.
    ///
    /// `Ok(None)` is an empty slot; `Err` means the copy of the table
    /// holding this record is corrupt.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, HdrError> {
        let (_, rec) = VtblRecord::from_bytes((bytes, 0)).map_err(|_| HdrError::BadMagic)?;
        if !rec.check_crc() {
            return Err(HdrError::BadCrc);
        }
        if rec.reserved_pebs == 0 {
            return Ok(None);
        }

        let rec: VolTableRecord = rec.try_into().map_err(|_| HdrError::BadField("vtbl"))?;
        rec.validate()?;
        Ok(Some(rec))
    }

    fn validate(&self) -> Result<(), HdrError> {
        if self.alignment == 0 {
            return Err(HdrError::BadField("alignment"));
        }
        if self.name.is_empty() || self.name.len() > UBI_VOL_NAME_MAX {
            return Err(HdrError::BadField("name"));
        }
        Ok(())
    }

    /// Encode into a `Vec<u8>` of [`UBI_VTBL_RECORD_SIZE`] bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        VtblRecord::from(self).to_bytes().unwrap()
    }

    /// The on-flash representation of an empty table slot.
    pub fn none_into_bytes() -> Vec<u8> {
        let mut record = VtblRecord {
            reserved_pebs: Default::default(),
            alignment: Default::default(),
            data_pad: Default::default(),
            vol_type: Default::default(),
            upd_marker: Default::default(),
            name: std::array::from_fn(|_| 0u8),
            name_len: Default::default(),
            flags: Default::default(),
            crc: Default::default(),
            padding: Default::default(),
        };
        record.fix_crc();
        record.to_bytes().unwrap()
    }
}

pub trait OptionIntoBytes {
    fn into_bytes(self) -> Vec<u8>;
}

impl OptionIntoBytes for Option<VolTableRecord> {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Some(x) => x.into_bytes(),
            None => VolTableRecord::none_into_bytes(),
        }
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = ();

    fn try_from(value: VtblRecord) -> Result<Self, Self::Error> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let upd_marker = upd_marker != 0;
        let name = std::str::from_utf8(name.get(..name_len as usize).ok_or(())?)
            .map_err(|_| ())?
            .to_string();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        })
    }
}

impl From<VolTableRecord> for VtblRecord {
    fn from(value: VolTableRecord) -> VtblRecord {
        let VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        } = value;

        let vol_type = vol_type.into();
        let upd_marker = upd_marker.into();
        let name_len = name.len() as _;

        let name_bytes = name.as_bytes();
        let mut name = std::array::from_fn(|_| 0u8);
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        let mut target = Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,

            crc: Default::default(),
            padding: Default::default(),
        };

        target.fix_crc();
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let ec = Ec {
            ec: 7,
            vid_hdr_offset: 512,
            data_offset: 1024,
            image_seq: 0xCAFE,
        };
        let vid = Vid {
            vol_id: 3,
            lnum: 9,
            sqnum: 41,
            ..Default::default()
        };

        let mut buf = vec![0xFFu8; 1024];

        ec.encode(&mut buf);
        assert_eq!(Ec::decode(&buf), Ok(ec));

        vid.encode(&mut buf);
        assert_eq!(Vid::decode(&buf), Ok(vid));

        let vtbl = VolTableRecord {
            reserved_pebs: 4,
            alignment: 1024,
            name: "example".to_string(),
            ..Default::default()
        };
        let bytes = vtbl.clone().into_bytes();
        assert_eq!(bytes.len(), UBI_VTBL_RECORD_SIZE);
        assert_eq!(VolTableRecord::decode(&bytes), Ok(Some(vtbl)));

        let empty = VolTableRecord::none_into_bytes();
        assert_eq!(VolTableRecord::decode(&empty), Ok(None));
    }

    #[test]
    fn test_decode_rejects_damage() {
        let mut buf = vec![0xFFu8; UBI_HDR_SIZE];
        assert_eq!(Ec::decode(&buf), Err(HdrError::BadMagic));

        Ec::default().encode(&mut buf);
        buf[20] ^= 0x01;
        assert_eq!(Ec::decode(&buf), Err(HdrError::BadCrc));

        // A future format version in an otherwise-intact header is the
        // one fatal decode outcome.
        let mut hdr = income::VidHdr::from(Vid {
            vol_id: 1,
            ..Default::default()
        });
        hdr.version = 9;
        hdr.fix_crc();
        let bytes = hdr.to_bytes().unwrap();
        assert_eq!(Vid::decode(&bytes), Err(HdrError::BadVersion(9)));
    }
}
