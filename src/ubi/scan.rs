//! Attach-time scan: walk every physical eraseblock once and reconstruct
//! the state of the device from its EC and VID headers.
//!
//! The scan never repairs anything in place. It only *classifies*: every
//! PEB ends up either attributed to a `(volume, LEB)` slot, or on exactly
//! one of the free/erase/corrupted/alien lists. The erase-block
//! association and wear-leveling engines are then seeded from the result,
//! and the erase list is worked off in the background after attach.
//!
//! Classification is deliberately forgiving: a single unreadable header
//! reclassifies one PEB, it never fails the attach. Only format-level
//! problems (wrong header version, two images interleaved on one device,
//! inconsistent volume metadata) are fatal, because no amount of scanning
//! produces a trustworthy device from those.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, error, info, warn};

use super::headers::{Ec, Vid, VolType, UBI_CRC};
use super::io::{DataKind, HdrRead, UbiIo};
use super::{
    UbiConfig, UbiError, UBI_COMPAT_DELETE, UBI_COMPAT_PRESERVE, UBI_COMPAT_RO, UBI_INTERNAL_VOL_START,
    UBI_MAX_ERASECOUNTER,
};
use crate::ubi::vtbl::UBI_LAYOUT_VOLUME_ID;

/// One PEB attributed to a `(volume, LEB)` slot by the scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanLeb {
    pub pnum: u32,
    /// `None` until unknown erase counters are stamped with the mean.
    pub ec: Option<u64>,
    pub sqnum: u64,
    pub copy_flag: bool,
    /// The PEB held valid data but showed soft errors; relocate it.
    pub scrub: bool,
}

/// Everything the scan learned about one volume.
#[derive(Debug, Clone)]
pub struct ScanVolume {
    pub vol_id: u32,
    pub vol_type: VolType,
    pub compat: u8,
    /// For static volumes, from the VID headers; 0 for dynamic.
    pub used_ebs: u32,
    pub data_pad: u32,
    pub highest_lnum: u32,
    /// `data_size` of the highest-numbered LEB seen.
    pub last_data_size: u32,
    pub lebs: BTreeMap<u32, ScanLeb>,
}

/// A PEB on one of the non-volume lists.
#[derive(Debug, Clone, Copy)]
pub struct ScanPeb {
    pub pnum: u32,
    pub ec: Option<u64>,
}

/// The product of a full-device scan.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub volumes: BTreeMap<u32, ScanVolume>,

    /// Erased and carrying a valid EC header; ready for reuse.
    pub free: Vec<ScanPeb>,

    /// Need an erase (and a fresh EC header) before reuse.
    pub erase: VecDeque<ScanPeb>,

    /// Unexplained corruption; preserved, never erased, counted against
    /// capacity.
    pub corrupted: Vec<ScanPeb>,

    /// Unknown-but-compatible internal volumes, preserved as-is.
    pub alien: Vec<ScanPeb>,

    pub bad_peb_count: u32,
    pub corr_peb_count: u32,
    pub empty_peb_count: u32,

    /// The device carries no image at all (every good PEB is blank).
    pub is_empty: bool,

    pub mean_ec: u64,
    pub max_ec: u64,

    /// Highest sequence number observed; seeds the global counter.
    pub max_sqnum: u64,

    /// Image sequence number shared by every EC header (0 if none seen).
    pub image_seq: u32,

    /// An internal volume demanded read-only compatibility.
    pub force_ro: bool,
}

/// Outcome of resolving two PEBs that claim the same `(volume, LEB)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LebContest {
    /// The newly scanned PEB beat the already-recorded one.
    pub new_wins: bool,

    /// The winner showed soft errors during the comparison; scrub it.
    pub scrub_winner: bool,

    /// The loser raised an error while being examined; erase it sooner.
    pub loser_error: bool,
}

impl ScanResult {
    fn add_free(&mut self, pnum: u32, ec: Option<u64>) {
        self.free.push(ScanPeb { pnum, ec });
    }

    fn add_erase(&mut self, pnum: u32, ec: Option<u64>, front: bool) {
        let peb = ScanPeb { pnum, ec };
        if front {
            self.erase.push_front(peb);
        } else {
            self.erase.push_back(peb);
        }
    }

    /// Pull an erased, EC-stamped PEB out of the scan result before the
    /// engines are running. Used by the volume-table code to repair or
    /// create the layout volume during attach.
    pub fn grab_free_peb(&mut self, io: &UbiIo) -> Result<(u32, u64), UbiError> {
        if let Some(peb) = self.free.pop() {
            return Ok((peb.pnum, peb.ec.unwrap_or(self.mean_ec)));
        }

        let mut skipped = Vec::new();
        let mut found = Err(UbiError::OutOfSpace);
        while let Some(peb) = self.erase.pop_front() {
            let ec = peb.ec.unwrap_or(self.mean_ec) + 1;
            match io.sync_erase(peb.pnum, false) {
                Ok(()) => {}
                Err(UbiError::EraseFailed { .. }) => {
                    // Let attach finish; the wear-leveling engine will
                    // retire this PEB when it reprocesses the erase list.
                    warn!(pnum = peb.pnum, "erase failed while building volume table");
                    skipped.push(peb);
                    continue;
                }
                Err(e) => return Err(e),
            }
            io.write_ec_hdr(
                peb.pnum,
                Ec {
                    ec,
                    vid_hdr_offset: io.vid_hdr_offset as u32,
                    data_offset: io.data_offset as u32,
                    image_seq: self.image_seq,
                },
            )?;
            found = Ok((peb.pnum, ec));
            break;
        }

        self.erase.extend(skipped);
        found
    }

    /// Record a PEB written during attach (volume-table creation) so the
    /// engines see it as live data.
    pub fn register_leb(&mut self, vid: &Vid, pnum: u32, ec: u64) {
        self.max_sqnum = self.max_sqnum.max(vid.sqnum);
        let vol = self
            .volumes
            .entry(vid.vol_id)
            .or_insert_with(|| ScanVolume::new(vid));
        if let Some(old) = vol.lebs.insert(
            vid.lnum,
            ScanLeb {
                pnum,
                ec: Some(ec),
                sqnum: vid.sqnum,
                copy_flag: vid.copy_flag,
                scrub: false,
            },
        ) {
            self.add_erase(old.pnum, old.ec, false);
        }
    }

    /// Drop a volume's eraseblocks onto the erase list and forget it.
    pub fn forget_volume(&mut self, vol_id: u32) {
        if let Some(vol) = self.volumes.remove(&vol_id) {
            for leb in vol.lebs.into_values() {
                self.add_erase(leb.pnum, leb.ec, false);
            }
        }
    }
}

impl ScanVolume {
    fn new(vid: &Vid) -> Self {
        Self {
            vol_id: vid.vol_id,
            vol_type: vid.vol_type,
            compat: vid.compat,
            used_ebs: vid.used_ebs,
            data_pad: vid.data_pad,
            highest_lnum: 0,
            last_data_size: 0,
            lebs: BTreeMap::new(),
        }
    }
}

/// Walk the whole device and classify every PEB.
pub fn scan_media(io: &UbiIo, config: &UbiConfig) -> Result<ScanResult, UbiError> {
    let mut scan = ScanResult::default();

    for pnum in 0..io.peb_count {
        process_peb(io, &mut scan, pnum)?;
    }

    // Preserved corruption beyond the configured ceiling means this is
    // most likely not a valid image at all.
    let corr_limit = (io.peb_count * config.corr_limit_percent / 100).max(8);
    if scan.corr_peb_count > corr_limit {
        error!(
            corrupted = scan.corr_peb_count,
            limit = corr_limit,
            "too many corrupted eraseblocks, not a valid image"
        );
        return Err(UbiError::BadFormat(format!(
            "{} corrupted PEBs exceeds the limit of {}",
            scan.corr_peb_count, corr_limit
        )));
    }

    finish_ec_accounting(&mut scan);

    scan.is_empty = scan.empty_peb_count == io.peb_count - scan.bad_peb_count;

    info!(
        volumes = scan.volumes.len(),
        free = scan.free.len(),
        erase = scan.erase.len(),
        corrupted = scan.corr_peb_count,
        bad = scan.bad_peb_count,
        mean_ec = scan.mean_ec,
        max_sqnum = scan.max_sqnum,
        "media scan complete"
    );

    Ok(scan)
}

fn process_peb(io: &UbiIo, scan: &mut ScanResult, pnum: u32) -> Result<(), UbiError> {
    if io.is_bad(pnum)? {
        scan.bad_peb_count += 1;
        return Ok(());
    }

    let (ec, ec_bad) = match io.read_ec_hdr(pnum)? {
        HdrRead::Ok { hdr, bitflips } => {
            if hdr.vid_hdr_offset as usize != io.vid_hdr_offset
                || hdr.data_offset as usize != io.data_offset
            {
                return Err(UbiError::BadFormat(format!(
                    "PEB {pnum} was formatted with VID offset {}, data offset {} \
                     (expected {}, {})",
                    hdr.vid_hdr_offset, hdr.data_offset, io.vid_hdr_offset, io.data_offset
                )));
            }
            if hdr.ec > UBI_MAX_ERASECOUNTER {
                return Err(UbiError::BadFormat(format!(
                    "PEB {pnum} claims erase counter {}",
                    hdr.ec
                )));
            }

            if hdr.image_seq != 0 {
                if scan.image_seq == 0 {
                    scan.image_seq = hdr.image_seq;
                } else if scan.image_seq != hdr.image_seq {
                    return Err(UbiError::MixedImageSeq {
                        pnum,
                        expected: scan.image_seq,
                        found: hdr.image_seq,
                    });
                }
            }

            (Some(hdr.ec), bitflips)
        }

        HdrRead::Blank { bitflips: _ } => {
            // No EC header at all: nothing else can be on this PEB. It
            // needs a fresh header (and a precautionary erase) before use.
            scan.empty_peb_count += 1;
            scan.add_erase(pnum, None, false);
            return Ok(());
        }

        // Erase counter is unknown; the VID header decides the PEB's fate.
        HdrRead::Bad { .. } => (None, true),
    };

    match io.read_vid_hdr(pnum)? {
        HdrRead::Blank { bitflips } => {
            if ec_bad || bitflips {
                scan.add_erase(pnum, ec, false);
            } else {
                scan.add_free(pnum, ec);
            }
        }

        HdrRead::Bad { ecc } => {
            if io.is_data_blank(pnum)? {
                // Power cut between erasing and finishing the headers.
                // Harmless; quietly reclaim.
                debug!(pnum, ecc, "unreadable VID header over blank data, will erase");
                scan.add_erase(pnum, ec, false);
            } else {
                // Unexplained: a broken header over real data. Preserve
                // the PEB for forensics and count it against capacity.
                warn!(pnum, ecc, "corrupted VID header over non-blank data, preserving");
                scan.corr_peb_count += 1;
                scan.corrupted.push(ScanPeb { pnum, ec });
            }
        }

        HdrRead::Ok { hdr, bitflips } => {
            let scrub = ec_bad || bitflips;

            if hdr.vol_id >= UBI_INTERNAL_VOL_START && hdr.vol_id != UBI_LAYOUT_VOLUME_ID {
                return process_alien_peb(scan, pnum, ec, &hdr);
            }

            add_leb(io, scan, pnum, ec, &hdr, scrub)?;
        }
    }

    Ok(())
}

/// Handle a PEB belonging to an internal volume this implementation does
/// not recognize, according to its compatibility tag.
fn process_alien_peb(
    scan: &mut ScanResult,
    pnum: u32,
    ec: Option<u64>,
    vid: &Vid,
) -> Result<(), UbiError> {
    match vid.compat {
        UBI_COMPAT_DELETE => {
            debug!(pnum, vol_id = vid.vol_id, "internal volume in delete-compatible mode");
            scan.add_erase(pnum, ec, false);
            Ok(())
        }
        UBI_COMPAT_RO => {
            warn!(
                vol_id = vid.vol_id,
                "internal volume is read-only-compatible, forcing device read-only"
            );
            scan.force_ro = true;
            scan.alien.push(ScanPeb { pnum, ec });
            Ok(())
        }
        UBI_COMPAT_PRESERVE => {
            debug!(pnum, vol_id = vid.vol_id, "preserving alien internal volume");
            scan.alien.push(ScanPeb { pnum, ec });
            Ok(())
        }
        // UBI_COMPAT_REJECT and anything unrecognized.
        compat => Err(UbiError::BadFormat(format!(
            "internal volume {:#x} carries incompatible tag {compat}",
            vid.vol_id
        ))),
    }
}

fn add_leb(
    io: &UbiIo,
    scan: &mut ScanResult,
    pnum: u32,
    ec: Option<u64>,
    vid: &Vid,
    scrub: bool,
) -> Result<(), UbiError> {
    scan.max_sqnum = scan.max_sqnum.max(vid.sqnum);

    let vol = scan
        .volumes
        .entry(vid.vol_id)
        .or_insert_with(|| ScanVolume::new(vid));

    // Metadata must agree across every PEB of a volume.
    if vol.vol_type != vid.vol_type {
        return Err(UbiError::BadFormat(format!(
            "volume {} has PEBs of both types",
            vid.vol_id
        )));
    }
    if vol.data_pad != vid.data_pad {
        return Err(UbiError::BadFormat(format!(
            "volume {} has inconsistent data_pad",
            vid.vol_id
        )));
    }
    if vid.vol_type == VolType::Static {
        if vol.used_ebs != vid.used_ebs {
            return Err(UbiError::BadFormat(format!(
                "volume {} has inconsistent used_ebs",
                vid.vol_id
            )));
        }
        if vid.lnum >= vid.used_ebs {
            return Err(UbiError::BadFormat(format!(
                "static volume {} has LEB {} beyond used_ebs {}",
                vid.vol_id, vid.lnum, vid.used_ebs
            )));
        }
        if vid.data_size as usize > io.leb_size {
            return Err(UbiError::BadFormat(format!(
                "volume {} LEB {} claims {} data bytes",
                vid.vol_id, vid.lnum, vid.data_size
            )));
        }
    }

    let candidate = ScanLeb {
        pnum,
        ec,
        sqnum: vid.sqnum,
        copy_flag: vid.copy_flag,
        scrub,
    };

    if !vol.lebs.contains_key(&vid.lnum) {
        if vid.lnum >= vol.highest_lnum || vol.lebs.is_empty() {
            vol.highest_lnum = vid.lnum;
            vol.last_data_size = vid.data_size;
        }
        vol.lebs.insert(vid.lnum, candidate);
        return Ok(());
    }

    let existing = vol.lebs[&vid.lnum];
    debug!(
        vol_id = vid.vol_id,
        lnum = vid.lnum,
        old_pnum = existing.pnum,
        new_pnum = pnum,
        "two PEBs claim the same logical eraseblock"
    );

    let contest = compare_lebs(io, &existing, pnum, vid)?;
    if contest.new_wins {
        vol.lebs.insert(
            vid.lnum,
            ScanLeb {
                scrub: candidate.scrub || contest.scrub_winner,
                ..candidate
            },
        );
        if vid.lnum >= vol.highest_lnum {
            vol.highest_lnum = vid.lnum;
            vol.last_data_size = vid.data_size;
        }
        scan.add_erase(existing.pnum, existing.ec, contest.loser_error);
    } else {
        vol.lebs.get_mut(&vid.lnum).unwrap().scrub |= contest.scrub_winner;
        scan.add_erase(pnum, ec, contest.loser_error);
    }

    Ok(())
}

/// Decide which of two PEBs claiming the same `(volume, LEB)` holds the
/// live copy.
///
/// Higher sequence number is provisionally newer. An unflagged
/// provisionally-older PEB settles it immediately in the newer one's
/// favor; an unflagged provisionally-newer PEB concedes to the older one
/// (the copy was never finished). When both carry the verified-copy flag,
/// the provisionally-newer PEB must prove itself: its data is re-read and
/// checksummed, and a mismatch reverses the decision.
fn compare_lebs(
    io: &UbiIo,
    existing: &ScanLeb,
    new_pnum: u32,
    new_vid: &Vid,
) -> Result<LebContest, UbiError> {
    if existing.sqnum == new_vid.sqnum {
        // The global counter never hands out a sequence number twice.
        return Err(UbiError::BadFormat(format!(
            "PEBs {} and {} share sequence number {}",
            existing.pnum, new_pnum, new_vid.sqnum
        )));
    }

    let new_is_newer = new_vid.sqnum > existing.sqnum;
    let (newer_flag, older_flag) = if new_is_newer {
        (new_vid.copy_flag, existing.copy_flag)
    } else {
        (existing.copy_flag, new_vid.copy_flag)
    };

    if !older_flag {
        return Ok(LebContest {
            new_wins: new_is_newer,
            scrub_winner: false,
            loser_error: false,
        });
    }
    if !newer_flag {
        return Ok(LebContest {
            new_wins: !new_is_newer,
            scrub_winner: false,
            loser_error: false,
        });
    }

    // Both are verified copies; checksum the provisionally-newer one.
    let (check_pnum, data_size, data_crc) = if new_is_newer {
        (new_pnum, new_vid.data_size, new_vid.data_crc)
    } else {
        // The recorded PEB's VID header was not kept around; re-read it.
        match io.read_vid_hdr(existing.pnum)? {
            HdrRead::Ok { hdr, .. } => (existing.pnum, hdr.data_size, hdr.data_crc),
            _ => {
                // It was readable moments ago; treat like a failed check.
                return Ok(LebContest {
                    new_wins: new_is_newer,
                    scrub_winner: true,
                    loser_error: true,
                });
            }
        }
    };

    let mut buf = vec![0u8; data_size as usize];
    let kind = io.read_data(check_pnum, 0, &mut buf)?;
    let crc_ok = kind != DataKind::Ecc && UBI_CRC.checksum(&buf) == data_crc;
    let bitflips = kind == DataKind::BitFlips;

    if crc_ok {
        Ok(LebContest {
            new_wins: new_is_newer,
            scrub_winner: bitflips,
            loser_error: false,
        })
    } else {
        // The apparently-newer copy is garbage; the older data stands.
        Ok(LebContest {
            new_wins: !new_is_newer,
            scrub_winner: true,
            loser_error: true,
        })
    }
}

/// Compute the erase-counter statistics and stamp every unknown counter
/// with the mean, so nothing downstream has to handle "unknown".
fn finish_ec_accounting(scan: &mut ScanResult) {
    let mut ec_sum: u64 = 0;
    let mut ec_count: u64 = 0;
    let mut max_ec: u64 = 0;

    {
        let mut tally = |ec: &Option<u64>| {
            if let Some(ec) = ec {
                ec_sum += ec;
                ec_count += 1;
                max_ec = max_ec.max(*ec);
            }
        };

        for vol in scan.volumes.values() {
            for leb in vol.lebs.values() {
                tally(&leb.ec);
            }
        }
        for peb in scan
            .free
            .iter()
            .chain(scan.erase.iter())
            .chain(scan.corrupted.iter())
            .chain(scan.alien.iter())
        {
            tally(&peb.ec);
        }
    }

    // Round to nearest; a scan that saw no counters at all starts at 1.
    let mean_ec = (ec_sum + ec_count / 2).checked_div(ec_count).unwrap_or(1);
    scan.mean_ec = mean_ec;
    scan.max_ec = max_ec;

    let stamp = |ec: &mut Option<u64>| {
        if ec.is_none() {
            *ec = Some(mean_ec);
        }
    };

    for vol in scan.volumes.values_mut() {
        for leb in vol.lebs.values_mut() {
            stamp(&mut leb.ec);
        }
    }
    for peb in scan
        .free
        .iter_mut()
        .chain(scan.erase.iter_mut())
        .chain(scan.corrupted.iter_mut())
        .chain(scan.alien.iter_mut())
    {
        stamp(&mut peb.ec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::{MediaGeometry, SimMedia};

    const TEST_GEOMETRY: MediaGeometry = MediaGeometry {
        peb_count: 16,
        peb_size: 4096,
        min_io_size: 256,
        can_mark_bad: true,
    };

    fn fresh_io() -> UbiIo {
        UbiIo::new(Box::new(SimMedia::new(TEST_GEOMETRY))).unwrap()
    }

    fn write_ec(io: &UbiIo, pnum: u32, ec: u64) {
        io.write_ec_hdr(
            pnum,
            Ec {
                ec,
                vid_hdr_offset: io.vid_hdr_offset as u32,
                data_offset: io.data_offset as u32,
                image_seq: 0x1234,
            },
        )
        .unwrap();
    }

    fn write_leb(io: &UbiIo, pnum: u32, vid: Vid, data: &[u8]) {
        io.write_vid_hdr(pnum, vid).unwrap();
        if !data.is_empty() {
            io.write_data(pnum, 0, data).unwrap();
        }
    }

    #[test]
    fn test_scan_empty_device() {
        let io = fresh_io();
        let scan = scan_media(&io, &UbiConfig::default()).unwrap();

        assert!(scan.is_empty);
        assert_eq!(scan.erase.len(), 16);
        assert!(scan.volumes.is_empty());
        assert_eq!(scan.mean_ec, 1);
    }

    #[test]
    fn test_scan_reconstructs_volume() {
        let io = fresh_io();

        for pnum in 0..16 {
            write_ec(&io, pnum, 10 + pnum as u64);
        }
        for lnum in 0..3u32 {
            write_leb(
                &io,
                lnum + 4,
                Vid {
                    vol_id: 2,
                    lnum,
                    sqnum: 100 + lnum as u64,
                    ..Default::default()
                },
                b"hello",
            );
        }

        let scan = scan_media(&io, &UbiConfig::default()).unwrap();
        assert!(!scan.is_empty);
        assert_eq!(scan.free.len(), 13);

        let vol = &scan.volumes[&2];
        assert_eq!(vol.lebs.len(), 3);
        assert_eq!(vol.lebs[&1].pnum, 5);
        assert_eq!(scan.max_sqnum, 102);
        assert_eq!(scan.image_seq, 0x1234);
    }

    #[test]
    fn test_scan_idempotent() {
        let io = fresh_io();
        for pnum in 0..8 {
            write_ec(&io, pnum, pnum as u64);
        }
        write_leb(
            &io,
            0,
            Vid {
                vol_id: 1,
                lnum: 0,
                sqnum: 5,
                ..Default::default()
            },
            b"data",
        );

        let a = scan_media(&io, &UbiConfig::default()).unwrap();
        let b = scan_media(&io, &UbiConfig::default()).unwrap();

        let lebs =
            |s: &ScanResult| -> Vec<(u32, u32, u32)> {
                s.volumes
                    .iter()
                    .flat_map(|(&v, sv)| sv.lebs.iter().map(move |(&l, e)| (v, l, e.pnum)))
                    .collect()
            };
        assert_eq!(lebs(&a), lebs(&b));
        assert_eq!(a.free.len(), b.free.len());
        assert_eq!(a.erase.len(), b.erase.len());
    }

    #[test]
    fn test_scan_mixed_image_seq_is_fatal() {
        let io = fresh_io();
        write_ec(&io, 0, 1);
        io.write_ec_hdr(
            1,
            Ec {
                ec: 1,
                vid_hdr_offset: io.vid_hdr_offset as u32,
                data_offset: io.data_offset as u32,
                image_seq: 0x9999,
            },
        )
        .unwrap();

        assert!(matches!(
            scan_media(&io, &UbiConfig::default()),
            Err(UbiError::MixedImageSeq { .. })
        ));
    }

    #[test]
    fn test_scan_corruption_triage() {
        let mut media = SimMedia::new(TEST_GEOMETRY);

        // Valid EC headers, so classification proceeds to the VID stage.
        let mut ecbuf = vec![0xFFu8; 256];
        Ec {
            ec: 1,
            vid_hdr_offset: 256,
            data_offset: 512,
            image_seq: 0,
        }
        .encode(&mut ecbuf);
        media.scribble(0, 0, &ecbuf);
        media.scribble(1, 0, &ecbuf);

        // PEB 0: garbage VID header over blank data -> quietly erased.
        // PEB 1: garbage VID header over real data -> preserved.
        media.scribble(0, 256, b"not a vid header");
        media.scribble(1, 256, b"not a vid header");
        media.scribble(1, 512, b"user data that must not be lost");

        let io = UbiIo::new(Box::new(media)).unwrap();
        let scan = scan_media(&io, &UbiConfig::default()).unwrap();

        assert!(scan.erase.iter().any(|p| p.pnum == 0));
        assert_eq!(scan.corr_peb_count, 1);
        assert_eq!(scan.corrupted[0].pnum, 1);
    }

    #[test]
    fn test_conflict_newer_unflagged_write_wins() {
        let io = fresh_io();
        write_ec(&io, 0, 1);
        write_ec(&io, 1, 1);

        let base = Vid {
            vol_id: 0,
            lnum: 0,
            ..Default::default()
        };
        write_leb(&io, 0, base.sqnum(10), b"old");
        write_leb(&io, 1, base.sqnum(20), b"new");

        let scan = scan_media(&io, &UbiConfig::default()).unwrap();
        assert_eq!(scan.volumes[&0].lebs[&0].pnum, 1);
        assert!(scan.erase.iter().any(|p| p.pnum == 0));
    }

    #[test]
    fn test_conflict_unverified_copy_loses() {
        let io = fresh_io();
        write_ec(&io, 0, 1);
        write_ec(&io, 1, 1);

        // The older PEB is a verified copy; the newer one is too, but its
        // data does not match its CRC (interrupted copy).
        let data = b"payload".as_slice();
        let crc = UBI_CRC.checksum(data);
        write_leb(
            &io,
            0,
            Vid {
                vol_id: 0,
                lnum: 0,
                sqnum: 10,
                copy_flag: true,
                data_size: data.len() as u32,
                data_crc: crc,
                ..Default::default()
            },
            data,
        );
        write_leb(
            &io,
            1,
            Vid {
                vol_id: 0,
                lnum: 0,
                sqnum: 20,
                copy_flag: true,
                data_size: data.len() as u32,
                data_crc: crc ^ 0xDEAD_BEEF,
                ..Default::default()
            },
            data,
        );

        let scan = scan_media(&io, &UbiConfig::default()).unwrap();
        let leb = scan.volumes[&0].lebs[&0];
        assert_eq!(leb.pnum, 0);
        // The surviving copy is suspect; it must be scrubbed.
        assert!(leb.scrub);
        // The garbage copy is risky; it goes to the head of the queue.
        assert_eq!(scan.erase.front().unwrap().pnum, 1);
    }

    #[test]
    fn test_compare_lebs_deterministic() {
        let io = fresh_io();
        write_ec(&io, 0, 1);
        write_ec(&io, 1, 1);

        let data = b"stable".as_slice();
        let crc = UBI_CRC.checksum(data);
        let vid = |sqnum| Vid {
            vol_id: 0,
            lnum: 0,
            sqnum,
            copy_flag: true,
            data_size: data.len() as u32,
            data_crc: crc,
            ..Default::default()
        };
        write_leb(&io, 0, vid(10), data);
        write_leb(&io, 1, vid(20), data);

        let existing = ScanLeb {
            pnum: 0,
            ec: Some(1),
            sqnum: 10,
            copy_flag: true,
            scrub: false,
        };
        let first = compare_lebs(&io, &existing, 1, &vid(20)).unwrap();
        for _ in 0..4 {
            assert_eq!(compare_lebs(&io, &existing, 1, &vid(20)).unwrap(), first);
        }
        assert!(first.new_wins);
    }

    #[test]
    fn test_scan_duplicate_sqnum_is_fatal() {
        let io = fresh_io();
        write_ec(&io, 0, 1);
        write_ec(&io, 1, 1);

        let vid = Vid {
            vol_id: 0,
            lnum: 0,
            sqnum: 7,
            ..Default::default()
        };
        write_leb(&io, 0, vid, b"a");
        write_leb(&io, 1, vid, b"b");

        assert!(matches!(
            scan_media(&io, &UbiConfig::default()),
            Err(UbiError::BadFormat(_))
        ));
    }
}
