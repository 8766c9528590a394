//! The volume table and its layout volume.
//!
//! Volume metadata lives in an internal "layout" volume of two LEBs, each
//! holding an identical copy of the table: one CRC-protected record per
//! possible volume. Updates always rewrite both copies, so a power cut
//! leaves at least one intact; attach reads both, prefers an undamaged
//! one, and rewrites its damaged twin.
//!
//! During attach the association and wear-leveling engines are not up
//! yet, so repairs here go through the scan result directly: a fresh PEB
//! is pulled out of the scanned free/erase lists, written, and registered
//! back into the scan as live data.

use tracing::{info, warn};

use super::headers::{OptionIntoBytes, Vid, VolTableRecord, VolType, UBI_VTBL_RECORD_SIZE};
use super::io::{DataKind, UbiIo};
use super::scan::ScanResult;
use super::{UbiConfig, UbiError, UBI_COMPAT_REJECT, UBI_MAX_VOLUMES};

/// Volume ID of the internal layout volume.
pub const UBI_LAYOUT_VOLUME_ID: u32 = 0x7FFF_EFFF;

/// The layout volume always spans exactly two LEBs (the two table copies).
pub(crate) const UBI_LAYOUT_VOLUME_EBS: u32 = 2;

/// Implementations that do not recognize the layout volume must not touch
/// the device.
pub(crate) const UBI_LAYOUT_VOLUME_COMPAT: u8 = UBI_COMPAT_REJECT;

/// Number of volume-table slots this device supports.
pub(crate) fn vtbl_slots(io: &UbiIo) -> usize {
    (io.leb_size / UBI_VTBL_RECORD_SIZE).min(UBI_MAX_VOLUMES)
}

/// Serialize a full table (one record per slot, empty slots included).
pub(crate) fn records_to_bytes(records: &[Option<VolTableRecord>]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(records.len() * UBI_VTBL_RECORD_SIZE);
    for record in records {
        bytes.append(&mut record.clone().into_bytes());
    }
    bytes
}

/// Parse one on-flash copy of the table. Any damaged record condemns the
/// whole copy.
pub(crate) fn parse_copy(bytes: &[u8], slots: usize) -> Option<Vec<Option<VolTableRecord>>> {
    let mut records = Vec::with_capacity(slots);
    for slot in 0..slots {
        let chunk = bytes.get(slot * UBI_VTBL_RECORD_SIZE..(slot + 1) * UBI_VTBL_RECORD_SIZE)?;
        records.push(VolTableRecord::decode(chunk).ok()?);
    }
    Some(records)
}

fn read_copy(io: &UbiIo, pnum: u32, slots: usize) -> Option<Vec<Option<VolTableRecord>>> {
    let mut bytes = vec![0u8; slots * UBI_VTBL_RECORD_SIZE];
    match io.read_data(pnum, 0, &mut bytes) {
        Ok(DataKind::Ecc) | Err(_) => None,
        Ok(_) => parse_copy(&bytes, slots),
    }
}

/// Write one copy of the table onto a freshly grabbed PEB and register it
/// with the scan. Attach-time only.
fn write_copy(
    io: &UbiIo,
    scan: &mut ScanResult,
    lnum: u32,
    bytes: &[u8],
    retries: u32,
) -> Result<(), UbiError> {
    for _ in 0..retries.max(1) {
        let (pnum, ec) = scan.grab_free_peb(io)?;

        scan.max_sqnum += 1;
        let vid = Vid {
            vol_type: VolType::Dynamic,
            vol_id: UBI_LAYOUT_VOLUME_ID,
            compat: UBI_LAYOUT_VOLUME_COMPAT,
            lnum,
            sqnum: scan.max_sqnum,
            ..Default::default()
        };

        let result = io
            .write_vid_hdr(pnum, vid)
            .and_then(|()| io.write_data(pnum, 0, bytes));

        match result {
            Ok(()) => {
                scan.register_leb(&vid, pnum, ec);
                return Ok(());
            }
            Err(UbiError::WriteFailed { .. }) => {
                warn!(pnum, "volume table write failed, trying another PEB");
                // The half-written PEB goes back through an erase.
                scan.erase.push_back(super::scan::ScanPeb {
                    pnum,
                    ec: Some(ec),
                });
            }
            Err(e) => return Err(e),
        }
    }

    Err(UbiError::WriteFailed { pnum: u32::MAX })
}

/// Load the volume table from the scanned layout volume, repairing a
/// damaged copy; on a blank device, create an empty table.
pub(crate) fn read_or_create(
    io: &UbiIo,
    scan: &mut ScanResult,
    config: &UbiConfig,
) -> Result<Vec<Option<VolTableRecord>>, UbiError> {
    let slots = vtbl_slots(io);

    let layout = scan.volumes.get(&UBI_LAYOUT_VOLUME_ID);
    let copy_pnums: [Option<u32>; 2] = match layout {
        Some(vol) => [
            vol.lebs.get(&0).map(|l| l.pnum),
            vol.lebs.get(&1).map(|l| l.pnum),
        ],
        None => [None, None],
    };

    if copy_pnums == [None, None] {
        if !scan.is_empty {
            return Err(UbiError::BadFormat(
                "device carries data but no volume table".to_string(),
            ));
        }

        let records = vec![None; slots];
        if !config.read_only {
            info!("blank device, creating an empty volume table");
            let bytes = records_to_bytes(&records);
            for lnum in 0..UBI_LAYOUT_VOLUME_EBS {
                write_copy(io, scan, lnum, &bytes, config.io_retries)?;
            }
        }
        return Ok(records);
    }

    let copy0 = copy_pnums[0].and_then(|p| read_copy(io, p, slots));
    let copy1 = copy_pnums[1].and_then(|p| read_copy(io, p, slots));

    match (copy0, copy1) {
        (Some(a), Some(b)) => {
            if a != b {
                // Both copies intact but different: the update protocol
                // cannot legitimately produce this.
                return Err(UbiError::BadFormat(
                    "the two volume table copies disagree".to_string(),
                ));
            }
            Ok(a)
        }

        (Some(good), None) => repair_copy(io, scan, config, 1, good),
        (None, Some(good)) => repair_copy(io, scan, config, 0, good),

        (None, None) => Err(UbiError::BadFormat(
            "both volume table copies are damaged".to_string(),
        )),
    }
}

/// Rewrite a damaged table copy from its surviving twin.
fn repair_copy(
    io: &UbiIo,
    scan: &mut ScanResult,
    config: &UbiConfig,
    broken_lnum: u32,
    good: Vec<Option<VolTableRecord>>,
) -> Result<Vec<Option<VolTableRecord>>, UbiError> {
    warn!(lnum = broken_lnum, "one volume table copy is damaged");
    if config.read_only {
        return Ok(good);
    }

    // Retire the damaged copy's PEB, if it exists at all.
    if let Some(vol) = scan.volumes.get_mut(&UBI_LAYOUT_VOLUME_ID) {
        if let Some(leb) = vol.lebs.remove(&broken_lnum) {
            scan.erase.push_back(super::scan::ScanPeb {
                pnum: leb.pnum,
                ec: leb.ec,
            });
        }
    }

    write_copy(io, scan, broken_lnum, &records_to_bytes(&good), config.io_retries)?;
    info!(lnum = broken_lnum, "volume table copy repaired");
    Ok(good)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::{MediaGeometry, SimMedia};
    use crate::ubi::scan::scan_media;

    const TEST_GEOMETRY: MediaGeometry = MediaGeometry {
        peb_count: 16,
        peb_size: 4096,
        min_io_size: 256,
        can_mark_bad: true,
    };

    fn fresh_io() -> UbiIo {
        UbiIo::new(Box::new(SimMedia::new(TEST_GEOMETRY))).unwrap()
    }

    #[test]
    fn test_record_round_trip() {
        let records = vec![
            Some(VolTableRecord {
                reserved_pebs: 4,
                alignment: 1,
                vol_type: VolType::Dynamic,
                name: "boot".into(),
                ..Default::default()
            }),
            None,
            Some(VolTableRecord {
                reserved_pebs: 2,
                alignment: 1,
                vol_type: VolType::Static,
                name: "fw".into(),
                ..Default::default()
            }),
        ];

        let bytes = records_to_bytes(&records);
        assert_eq!(bytes.len(), 3 * UBI_VTBL_RECORD_SIZE);
        assert_eq!(parse_copy(&bytes, 3), Some(records));
    }

    #[test]
    fn test_create_on_blank_device() {
        let io = fresh_io();
        let mut scan = scan_media(&io, &UbiConfig::default()).unwrap();

        let records = read_or_create(&io, &mut scan, &UbiConfig::default()).unwrap();
        assert!(records.iter().all(Option::is_none));

        // The layout volume is now registered as live data.
        let layout = &scan.volumes[&UBI_LAYOUT_VOLUME_ID];
        assert_eq!(layout.lebs.len(), 2);

        // A second scan of the same media finds the same table.
        let mut rescan = scan_media(&io, &UbiConfig::default()).unwrap();
        let records2 = read_or_create(&io, &mut rescan, &UbiConfig::default()).unwrap();
        assert_eq!(records, records2);
    }

    #[test]
    fn test_missing_table_on_nonblank_device() {
        let io = fresh_io();
        // One stray user LEB, no layout volume.
        io.write_ec_hdr(
            0,
            crate::ubi::headers::Ec {
                ec: 1,
                vid_hdr_offset: io.vid_hdr_offset as u32,
                data_offset: io.data_offset as u32,
                image_seq: 0,
            },
        )
        .unwrap();
        io.write_vid_hdr(
            0,
            Vid {
                vol_id: 3,
                lnum: 0,
                sqnum: 1,
                ..Default::default()
            },
        )
        .unwrap();

        let mut scan = scan_media(&io, &UbiConfig::default()).unwrap();
        assert!(matches!(
            read_or_create(&io, &mut scan, &UbiConfig::default()),
            Err(UbiError::BadFormat(_))
        ));
    }

    #[test]
    fn test_repair_damaged_copy() {
        // Build a valid table, dump the device, then reload it with the
        // data region of copy 1 smashed.
        let io = fresh_io();
        let mut scan = scan_media(&io, &UbiConfig::default()).unwrap();
        read_or_create(&io, &mut scan, &UbiConfig::default()).unwrap();
        let copy1 = scan.volumes[&UBI_LAYOUT_VOLUME_ID].lebs[&1].pnum;

        let mut image = Vec::new();
        let mut buf = vec![0u8; io.peb_size];
        for pnum in 0..io.peb_count {
            io.read(pnum, 0, &mut buf).unwrap();
            image.extend_from_slice(&buf);
        }

        let mut media = SimMedia::new(TEST_GEOMETRY);
        media.load(&mut image.as_slice()).unwrap();
        media.scribble(copy1, 512 + 8, &[0xAAu8; 16]);

        let io = UbiIo::new(Box::new(media)).unwrap();
        let mut scan = scan_media(&io, &UbiConfig::default()).unwrap();
        let records = read_or_create(&io, &mut scan, &UbiConfig::default()).unwrap();
        assert!(records.iter().all(Option::is_none));

        // Repaired: a rescan now finds two intact copies.
        let mut rescan = scan_media(&io, &UbiConfig::default()).unwrap();
        let layout = &rescan.volumes[&UBI_LAYOUT_VOLUME_ID];
        assert_eq!(layout.lebs.len(), 2);
        read_or_create(&io, &mut rescan, &UbiConfig::default()).unwrap();
    }
}
