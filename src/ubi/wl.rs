//! Wear-leveling engine: owns every physical eraseblock not currently
//! pinned by a volume table entry being written, decides which PEB serves
//! the next write, and relocates data in the background so erase wear
//! spreads across the device.
//!
//! The engine keeps four erase-counter-ordered sets (`free`, `used`,
//! `scrub`, `erroneous`) plus a circular protection queue for
//! just-allocated PEBs, a `pnum → descriptor` lookup table, and a FIFO of
//! background jobs. A PEB lives in exactly one container at any moment;
//! every transfer happens under the single `state` mutex.
//!
//! Only one relocation can be in flight at a time. `move_from`/`move_to`
//! record it, and the `move_mutex` is held for its whole duration, which
//! is what lets `put_peb` detect and wait out "this PEB is being moved".

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::device::Ubi;
use super::eba::MoveError;
use super::headers::Ec;
use super::io::HdrRead;
use super::scan::ScanResult;
use super::{UbiError, WriteHint, UBI_MAX_ERASECOUNTER};

/// PEBs the wear-leveling engine keeps for its own relocation use.
pub(crate) const WL_RESERVED_PEBS: u32 = 1;

/// Which container currently owns a PEB.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PebContainer {
    Free,
    Used,
    Scrub,
    Erroneous,
    /// Protection queue, remembering the slot for O(1) removal.
    ProtQueue(usize),
    /// Owned by a pending or running erase job.
    Erasing,
    /// One end of the in-flight relocation.
    Moving,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct PebInfo {
    pub(crate) ec: u64,
    pub(crate) container: PebContainer,
}

/// A queued unit of background work.
#[derive(Debug, Copy, Clone)]
pub(crate) enum WlJob {
    Erase {
        pnum: u32,
        torture: bool,
        attempts: u32,
    },
    Relocate,
}

#[derive(Default)]
pub(crate) struct WlState {
    /// Erased, EC-stamped, ready to hand out. Keyed `(ec, pnum)`.
    pub(crate) free: BTreeSet<(u64, u32)>,

    /// Holding live data.
    pub(crate) used: BTreeSet<(u64, u32)>,

    /// Holding live data that showed soft errors; relocate first.
    pub(crate) scrub: BTreeSet<(u64, u32)>,

    /// Failed in a way we no longer trust without a torture erase.
    pub(crate) erroneous: BTreeSet<(u64, u32)>,
    pub(crate) erroneous_count: u32,

    /// Every PEB the engine knows about.
    pub(crate) lookup: HashMap<u32, PebInfo>,

    /// Circular ring of just-allocated PEBs riding out their grace period.
    pub(crate) prot_queue: Vec<VecDeque<u32>>,
    pub(crate) pq_head: usize,

    pub(crate) works: VecDeque<WlJob>,

    /// A `Relocate` job is queued or running.
    pub(crate) wl_scheduled: bool,

    /// The single in-flight relocation, if any.
    pub(crate) move_from: Option<u32>,
    pub(crate) move_to: Option<u32>,
    /// The move target was released while the move was still running;
    /// erase it instead of keeping it once the move completes.
    pub(crate) move_to_put: bool,

    /// Erroneous-PEB ceiling before the device goes read-only.
    pub(crate) max_erroneous: u32,

    /// Jobs popped from the queue but still executing; `flush` must wait
    /// these out too.
    pub(crate) running_jobs: u32,

    pub(crate) shutdown: bool,
}

pub(crate) struct WearLevel {
    pub(crate) state: Mutex<WlState>,
    pub(crate) cond: Condvar,
    /// Serializes the whole relocation job against concurrent scheduling
    /// of a second one, and gives `put_peb` something to wait on.
    pub(crate) move_mutex: Mutex<()>,
}

impl WearLevel {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WlState::default()),
            cond: Condvar::new(),
            move_mutex: Mutex::new(()),
        }
    }
}

/// Free-PEB selection. The free set is ordered by `(ec, pnum)`.
///
/// `LongTerm` picks the highest EC still within `max_diff` of the pool
/// minimum, keeping the freshest PEBs in reserve for short-lived data.
/// `ShortTerm` takes the most-worn PEB outright. `Unknown` splits the
/// difference when the pool's spread is wide, and doesn't care otherwise.
fn pick_free(free: &BTreeSet<(u64, u32)>, hint: WriteHint, max_diff: u64) -> Option<(u64, u32)> {
    let &(min_ec, _) = free.first()?;
    let &(max_ec, _) = free.last()?;

    let within = |diff: u64| free.range(..(min_ec + diff, 0)).next_back().copied();

    match hint {
        WriteHint::LongTerm => within(max_diff.max(1)),
        WriteHint::ShortTerm => free.first().copied(),
        WriteHint::Unknown => {
            if max_ec - min_ec < max_diff {
                free.iter().nth(free.len() / 2).copied()
            } else {
                within((max_diff / 2).max(1))
            }
        }
    }
}

impl WlState {
    fn remove_from_container(&mut self, pnum: u32) -> Result<PebInfo, UbiError> {
        let info = *self
            .lookup
            .get(&pnum)
            .ok_or(UbiError::Internal("PEB unknown to wear-leveling"))?;
        let key = (info.ec, pnum);

        let removed = match info.container {
            PebContainer::Free => self.free.remove(&key),
            PebContainer::Used => self.used.remove(&key),
            PebContainer::Scrub => self.scrub.remove(&key),
            PebContainer::Erroneous => {
                self.erroneous_count -= 1;
                self.erroneous.remove(&key)
            }
            PebContainer::ProtQueue(slot) => {
                let queue = &mut self.prot_queue[slot];
                match queue.iter().position(|&p| p == pnum) {
                    Some(i) => {
                        queue.remove(i);
                        true
                    }
                    None => false,
                }
            }
            PebContainer::Erasing | PebContainer::Moving => false,
        };

        if !removed {
            return Err(UbiError::Internal("PEB not in its recorded container"));
        }
        Ok(info)
    }

    fn insert(&mut self, pnum: u32, ec: u64, container: PebContainer) -> Result<(), UbiError> {
        if self
            .lookup
            .insert(pnum, PebInfo { ec, container })
            .is_some()
        {
            return Err(UbiError::Internal("PEB registered twice"));
        }
        self.place(pnum, ec, container);
        Ok(())
    }

    /// Put an already-known PEB into a container. The caller has removed
    /// it from its previous one.
    fn place(&mut self, pnum: u32, ec: u64, container: PebContainer) {
        match container {
            PebContainer::Free => {
                self.free.insert((ec, pnum));
            }
            PebContainer::Used => {
                self.used.insert((ec, pnum));
            }
            PebContainer::Scrub => {
                self.scrub.insert((ec, pnum));
            }
            PebContainer::Erroneous => {
                self.erroneous.insert((ec, pnum));
                self.erroneous_count += 1;
            }
            PebContainer::ProtQueue(slot) => self.prot_queue[slot].push_back(pnum),
            PebContainer::Erasing | PebContainer::Moving => {}
        }
        self.lookup.insert(pnum, PebInfo { ec, container });
    }

    /// The protection-queue slot new allocations land in: the one that
    /// will be served last, a full ring rotation from now.
    fn pq_tail(&self) -> usize {
        (self.pq_head + self.prot_queue.len() - 1) % self.prot_queue.len()
    }

    /// Age the protection queue by one work cycle: everything in the head
    /// slot has survived its grace period and becomes eligible for
    /// wear-leveling.
    fn serve_prot_queue(&mut self) {
        let head = self.pq_head;
        while let Some(pnum) = self.prot_queue[head].pop_front() {
            let ec = self.lookup[&pnum].ec;
            self.place(pnum, ec, PebContainer::Used);
        }
        self.pq_head = (head + 1) % self.prot_queue.len();
    }

    fn enqueue_erase(&mut self, pnum: u32, ec: u64, torture: bool) {
        self.lookup.insert(
            pnum,
            PebInfo {
                ec,
                container: PebContainer::Erasing,
            },
        );
        self.works.push_back(WlJob::Erase {
            pnum,
            torture,
            attempts: 0,
        });
    }
}

impl Ubi {
    /// Seed the engine from the scan result, queue up the deferred
    /// erases, and kick off the first wear-leveling evaluation.
    pub(crate) fn wl_init_from_scan(&self, scan: &ScanResult) -> Result<(), UbiError> {
        let mut st = self.wl.state.lock();

        st.prot_queue = vec![VecDeque::new(); self.config.prot_queue_len.max(1)];
        st.max_erroneous = (self.io.peb_count / 10).max(1);

        for peb in &scan.free {
            st.insert(peb.pnum, peb.ec.unwrap_or(scan.mean_ec), PebContainer::Free)?;
        }
        for peb in &scan.erase {
            let ec = peb.ec.unwrap_or(scan.mean_ec);
            st.insert(peb.pnum, ec, PebContainer::Erasing)?;
            st.works.push_back(WlJob::Erase {
                pnum: peb.pnum,
                torture: false,
                attempts: 0,
            });
        }
        for vol in scan.volumes.values() {
            for leb in vol.lebs.values() {
                let container = if leb.scrub {
                    PebContainer::Scrub
                } else {
                    PebContainer::Used
                };
                st.insert(leb.pnum, leb.ec.unwrap_or(scan.mean_ec), container)?;
            }
        }
        // Corrupted and alien PEBs stay out of the engine entirely: they
        // are preserved, never reused and never relocated.

        drop(st);

        self.ensure_wear_leveling();
        Ok(())
    }

    /// Allocate a PEB for writing. Synchronously works off background
    /// jobs when the free pool is starved; fails with `OutOfSpace` only
    /// once no job could possibly produce a free PEB.
    pub(crate) fn wl_get_peb(&self, hint: WriteHint) -> Result<u32, UbiError> {
        if self.is_ro() {
            return Err(UbiError::ReadOnly);
        }

        loop {
            let job = {
                let mut st = self.wl.state.lock();

                if let Some((ec, pnum)) = pick_free(&st.free, hint, self.config.free_max_diff) {
                    st.free.remove(&(ec, pnum));
                    let slot = st.pq_tail();
                    st.place(pnum, ec, PebContainer::ProtQueue(slot));
                    drop(st);

                    #[cfg(debug_assertions)]
                    self.paranoid_check_blank(pnum)?;

                    return Ok(pnum);
                }

                match st.works.pop_front() {
                    Some(job) => {
                        st.running_jobs += 1;
                        Some(job)
                    }
                    // The worker has the last job in flight; it may yet
                    // produce a free PEB.
                    None if st.running_jobs > 0 => {
                        self.wl.cond.wait(&mut st);
                        None
                    }
                    None => return Err(UbiError::OutOfSpace),
                }
            };

            if let Some(job) = job {
                // Backpressure: the caller pays for the erase directly.
                let result = self.do_wl_job(job);
                self.finish_job();
                result?;
            }
        }
    }

    fn finish_job(&self) {
        self.wl.state.lock().running_jobs -= 1;
        self.wl.cond.notify_all();
    }

    /// Handing out a PEB with stale data in it would be silent data
    /// corruption; make sure that cannot happen in development builds.
    #[cfg(debug_assertions)]
    fn paranoid_check_blank(&self, pnum: u32) -> Result<(), UbiError> {
        if !self.io.is_data_blank(pnum)? {
            error!(pnum, "allocated PEB is not erased");
            self.ro_mode("free pool handed out a non-blank PEB");
            return Err(UbiError::Internal("allocated PEB is not erased"));
        }
        Ok(())
    }

    /// Return a PEB whose mapping has been dropped. It will be erased in
    /// the background (with a destructive verify when `torture` is set or
    /// the PEB was on the erroneous list) and then becomes free again.
    pub(crate) fn wl_put_peb(&self, pnum: u32, mut torture: bool) -> Result<(), UbiError> {
        loop {
            let mut st = self.wl.state.lock();

            if st.move_from == Some(pnum) {
                // In-flight relocation source; wait for the move to end
                // and look again.
                drop(st);
                drop(self.wl.move_mutex.lock());
                continue;
            }
            if st.move_to == Some(pnum) {
                debug!(pnum, "PEB released while still the move target");
                st.move_to_put = true;
                return Ok(());
            }

            let info = st.remove_from_container(pnum)?;
            match info.container {
                PebContainer::Used | PebContainer::Scrub | PebContainer::ProtQueue(_) => {}
                PebContainer::Erroneous => torture = true,
                _ => return Err(UbiError::Internal("released PEB was not in use")),
            }

            st.enqueue_erase(pnum, info.ec, torture);
            drop(st);
            self.wl.cond.notify_one();
            return Ok(());
        }
    }

    /// Ask for a PEB's data to be relocated because a soft error was seen
    /// on it. Idempotent; never fails the caller's operation.
    pub(crate) fn wl_scrub_peb(&self, pnum: u32) {
        loop {
            let mut st = self.wl.state.lock();

            if st.move_to == Some(pnum) {
                drop(st);
                std::thread::yield_now();
                continue;
            }
            if st.move_from == Some(pnum) {
                // Already being relocated; nothing more to ask for.
                return;
            }

            let Some(info) = st.lookup.get(&pnum).copied() else {
                return;
            };
            match info.container {
                PebContainer::Used | PebContainer::ProtQueue(_) => {
                    if st.remove_from_container(pnum).is_err() {
                        return;
                    }
                    st.place(pnum, info.ec, PebContainer::Scrub);
                }
                // Already queued for scrubbing, erasing, or distrusted.
                _ => return,
            }

            drop(st);
            debug!(pnum, "PEB queued for scrubbing");
            self.ensure_wear_leveling();
            return;
        }
    }

    /// Schedule a relocation pass if one is warranted and none is queued.
    pub(crate) fn ensure_wear_leveling(&self) {
        let mut st = self.wl.state.lock();
        if st.wl_scheduled || st.free.is_empty() {
            return;
        }

        let needed = if !st.scrub.is_empty() {
            true
        } else {
            match (st.used.first(), pick_free(&st.free, WriteHint::LongTerm, self.config.free_max_diff)) {
                (Some(&(used_ec, _)), Some((free_ec, _))) => {
                    free_ec.saturating_sub(used_ec) >= self.config.wl_threshold
                }
                _ => false,
            }
        };

        if needed {
            st.wl_scheduled = true;
            st.works.push_back(WlJob::Relocate);
            drop(st);
            self.wl.cond.notify_one();
        }
    }

    /// Synchronously complete all pending background work, including any
    /// job the worker thread is in the middle of.
    pub(crate) fn wl_flush(&self) -> Result<(), UbiError> {
        loop {
            let job = {
                let mut st = self.wl.state.lock();
                match st.works.pop_front() {
                    Some(job) => {
                        st.running_jobs += 1;
                        job
                    }
                    None if st.running_jobs > 0 => {
                        self.wl.cond.wait(&mut st);
                        continue;
                    }
                    None => return Ok(()),
                }
            };

            let result = self.do_wl_job(job);
            self.finish_job();
            result?;
        }
    }

    pub(crate) fn do_wl_job(&self, job: WlJob) -> Result<(), UbiError> {
        if self.is_ro() {
            // A read-only device performs no background work; drop it.
            if let WlJob::Relocate = job {
                self.wl.state.lock().wl_scheduled = false;
            }
            return Ok(());
        }

        match job {
            WlJob::Erase {
                pnum,
                torture,
                attempts,
            } => self.erase_job(pnum, torture, attempts),
            WlJob::Relocate => self.relocate_job(),
        }
    }

    fn erase_job(&self, pnum: u32, torture: bool, attempts: u32) -> Result<(), UbiError> {
        let ec = match self.wl.state.lock().lookup.get(&pnum) {
            Some(info) => info.ec,
            None => return Err(UbiError::Internal("erase job for unknown PEB")),
        };

        let result = self
            .io
            .sync_erase(pnum, torture)
            .and_then(|()| {
                let new_ec = ec + 1;
                if new_ec > UBI_MAX_ERASECOUNTER {
                    error!(pnum, ec = new_ec, "erase counter overflow");
                    return Err(UbiError::Internal("erase counter overflow"));
                }
                self.io.write_ec_hdr(
                    pnum,
                    Ec {
                        ec: new_ec,
                        vid_hdr_offset: self.io.vid_hdr_offset as u32,
                        data_offset: self.io.data_offset as u32,
                        image_seq: self.image_seq,
                    },
                )?;
                Ok(new_ec)
            });

        match result {
            Ok(new_ec) => {
                let mut st = self.wl.state.lock();
                st.place(pnum, new_ec, PebContainer::Free);
                st.serve_prot_queue();
                drop(st);
                self.ensure_wear_leveling();
                Ok(())
            }

            // The erase itself failed: the block is going bad.
            Err(UbiError::EraseFailed { .. }) => self.retire_peb(pnum),

            // The erase went through but the fresh EC header would not
            // stick, or the media hiccuped; re-run with a torture erase
            // to shake out a marginal block.
            Err(UbiError::WriteFailed { .. }) | Err(UbiError::Media(_))
                if attempts + 1 < self.config.io_retries =>
            {
                warn!(pnum, attempts, "erase cycle failed, retrying");
                let mut st = self.wl.state.lock();
                st.works.push_back(WlJob::Erase {
                    pnum,
                    torture: true,
                    attempts: attempts + 1,
                });
                drop(st);
                self.wl.cond.notify_one();
                Ok(())
            }

            // Out of retries: retire the block.
            Err(UbiError::WriteFailed { .. }) => self.retire_peb(pnum),

            Err(e) => {
                error!(pnum, error = %e, "erase failed fatally");
                self.ro_mode("unrecoverable erase failure");
                Err(e)
            }
        }
    }

    /// Bad-PEB retirement: consume one unit of the bad-block reserve and
    /// mark the block bad at the media layer. The device goes read-only
    /// when the reserve is exhausted or the media cannot mark blocks bad.
    fn retire_peb(&self, pnum: u32) -> Result<(), UbiError> {
        if !self.io.can_mark_bad {
            self.ro_mode("erase failure on media without bad-block support");
            return Ok(());
        }

        {
            let mut counts = self.counts.lock();
            if counts.beb_rsvd_pebs == 0 {
                drop(counts);
                self.ro_mode("bad-PEB reserve exhausted");
                return Ok(());
            }
            counts.beb_rsvd_pebs -= 1;
            counts.bad_peb_count += 1;
            counts.good_peb_count -= 1;
            info!(
                pnum,
                remaining_reserve = counts.beb_rsvd_pebs,
                "retiring bad physical eraseblock"
            );
        }

        self.io.mark_bad(pnum)?;
        self.wl.state.lock().lookup.remove(&pnum);
        Ok(())
    }

    /// One wear-leveling or scrub relocation pass.
    fn relocate_job(&self) -> Result<(), UbiError> {
        let _move = self.wl.move_mutex.lock();

        // Select source and target.
        let (from, from_ec, to, to_ec, scrubbing) = {
            let mut st = self.wl.state.lock();
            st.wl_scheduled = false;

            let scrubbing = !st.scrub.is_empty();
            let source = if scrubbing {
                st.scrub.first().copied()
            } else {
                st.used.first().copied()
            };
            let target = pick_free(&st.free, WriteHint::LongTerm, self.config.free_max_diff);

            let (Some((from_ec, from)), Some((to_ec, to))) = (source, target) else {
                return Ok(());
            };
            if !scrubbing && to_ec.saturating_sub(from_ec) < self.config.wl_threshold {
                // The gap closed while the job sat in the queue.
                return Ok(());
            }

            st.remove_from_container(from)?;
            st.free.remove(&(to_ec, to));
            st.lookup.insert(from, PebInfo { ec: from_ec, container: PebContainer::Moving });
            st.lookup.insert(to, PebInfo { ec: to_ec, container: PebContainer::Moving });
            st.move_from = Some(from);
            st.move_to = Some(to);
            st.move_to_put = false;

            (from, from_ec, to, to_ec, scrubbing)
        };

        debug!(from, to, scrubbing, "relocating physical eraseblock");

        // What ultimately happens to source and target.
        enum SrcFate {
            Erase,
            Erroneous,
            Protect,
            Scrub,
        }
        enum DstFate {
            Used,
            Free,
            Erase { torture: bool },
        }

        // A hard error reading the source header is handled like garbage:
        // the PEB stops being trusted, but the in-flight move state must
        // still be unwound below.
        let vid_read = self.io.read_vid_hdr(from).unwrap_or_else(|e| {
            warn!(from, error = %e, "failed to read source VID header");
            HdrRead::Bad { ecc: false }
        });

        let (src, dst) = match vid_read {
            // Mid-first-write: no VID header yet. Leave the data alone
            // and give the PEB a fresh grace period.
            HdrRead::Blank { .. } => (SrcFate::Protect, DstFate::Free),

            // The source's header is garbage; stop trusting the PEB but
            // keep it (and its data) for forensics on the erroneous list.
            HdrRead::Bad { .. } => (SrcFate::Erroneous, DstFate::Free),

            HdrRead::Ok { hdr, bitflips } => {
                let src_scrub = scrubbing || bitflips;
                let mut vid = hdr;

                match self.eba_copy_leb(from, to, &mut vid) {
                    Ok(()) => (SrcFate::Erase, DstFate::Used),
                    Err(MoveError::Retry) => (
                        if src_scrub { SrcFate::Scrub } else { SrcFate::Protect },
                        DstFate::Free,
                    ),
                    // The LEB was unmapped or remapped under us; the
                    // source holds stale data now.
                    Err(MoveError::CancelRace) => (SrcFate::Erase, DstFate::Free),
                    Err(MoveError::SourceRead { .. }) => (SrcFate::Erroneous, DstFate::Free),
                    Err(MoveError::TargetWrite)
                    | Err(MoveError::TargetRead)
                    | Err(MoveError::TargetBitflips) => (
                        if src_scrub { SrcFate::Scrub } else { SrcFate::Protect },
                        DstFate::Erase { torture: true },
                    ),
                }
            }
        };

        let mut st = self.wl.state.lock();
        st.move_from = None;
        st.move_to = None;

        match dst {
            DstFate::Used if st.move_to_put => st.enqueue_erase(to, to_ec, false),
            DstFate::Used => st.place(to, to_ec, PebContainer::Used),
            DstFate::Free => st.place(to, to_ec, PebContainer::Free),
            DstFate::Erase { torture } => st.enqueue_erase(to, to_ec, torture),
        }

        let mut too_many_erroneous = false;
        match src {
            SrcFate::Erase => st.enqueue_erase(from, from_ec, false),
            SrcFate::Scrub => st.place(from, from_ec, PebContainer::Scrub),
            SrcFate::Protect => {
                let slot = st.pq_tail();
                st.place(from, from_ec, PebContainer::ProtQueue(slot));
            }
            SrcFate::Erroneous => {
                st.place(from, from_ec, PebContainer::Erroneous);
                warn!(from, count = st.erroneous_count, "PEB moved to erroneous list");
                too_many_erroneous = st.erroneous_count > st.max_erroneous;
            }
        }
        st.serve_prot_queue();
        drop(st);

        if too_many_erroneous {
            self.ro_mode("too many erroneous PEBs");
            return Ok(());
        }

        self.wl.cond.notify_one();
        self.ensure_wear_leveling();
        Ok(())
    }
}

/// Body of the background worker thread: drain jobs until shutdown.
pub(crate) fn worker_loop(ubi: &Arc<Ubi>) {
    loop {
        let job = {
            let mut st = ubi.wl.state.lock();
            loop {
                if st.shutdown {
                    if !st.works.is_empty() {
                        debug!(pending = st.works.len(), "worker exiting with pending jobs");
                    }
                    return;
                }
                if let Some(job) = st.works.pop_front() {
                    st.running_jobs += 1;
                    break job;
                }
                ubi.wl.cond.wait(&mut st);
            }
        };

        if let Err(e) = ubi.do_wl_job(job) {
            error!(error = %e, "background job failed");
        }
        ubi.finish_job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_set(ecs: &[u64]) -> BTreeSet<(u64, u32)> {
        ecs.iter().enumerate().map(|(i, &ec)| (ec, i as u32)).collect()
    }

    #[test]
    fn test_pick_free_short_term() {
        let free = free_set(&[10, 3, 7]);
        assert_eq!(pick_free(&free, WriteHint::ShortTerm, 8), Some((3, 1)));
    }

    #[test]
    fn test_pick_free_long_term_respects_spread() {
        // min EC is 3; with max_diff 8 anything below 11 qualifies, and
        // the highest qualifying EC is chosen.
        let free = free_set(&[10, 3, 7, 30]);
        assert_eq!(pick_free(&free, WriteHint::LongTerm, 8), Some((10, 0)));

        // Tight spread: the highest EC under min+diff.
        let free = free_set(&[4, 3, 5]);
        assert_eq!(pick_free(&free, WriteHint::LongTerm, 8), Some((5, 2)));
    }

    #[test]
    fn test_pick_free_unknown() {
        // Narrow pool: an arbitrary pick is fine, but it must exist.
        let free = free_set(&[4, 3, 5]);
        assert!(pick_free(&free, WriteHint::Unknown, 8).is_some());

        // Wide pool: behaves like LongTerm at half the spread.
        let free = free_set(&[3, 6, 100]);
        assert_eq!(pick_free(&free, WriteHint::Unknown, 8), Some((6, 1)));
    }

    #[test]
    fn test_pick_free_empty() {
        let free = BTreeSet::new();
        assert_eq!(pick_free(&free, WriteHint::Unknown, 8), None);
    }

    #[test]
    fn test_prot_queue_rotation() {
        let mut st = WlState {
            prot_queue: vec![VecDeque::new(); 4],
            ..Default::default()
        };
        st.insert(7, 2, PebContainer::ProtQueue(st.pq_tail())).unwrap();

        // Three rotations leave the entry protected; the fourth serves it.
        for _ in 0..3 {
            st.serve_prot_queue();
            assert_eq!(st.lookup[&7].container, PebContainer::ProtQueue(3));
        }
        st.serve_prot_queue();
        assert_eq!(st.lookup[&7].container, PebContainer::Used);
        assert!(st.used.contains(&(2, 7)));
    }

    #[test]
    fn test_container_transfer_is_exclusive() {
        let mut st = WlState {
            prot_queue: vec![VecDeque::new(); 2],
            ..Default::default()
        };
        st.insert(1, 5, PebContainer::Used).unwrap();

        // Registering the same PEB again is an invariant violation.
        assert!(st.insert(1, 5, PebContainer::Free).is_err());

        let info = st.remove_from_container(1).unwrap();
        assert!(st.used.is_empty());
        st.place(1, info.ec, PebContainer::Scrub);
        assert!(st.scrub.contains(&(5, 1)));
        assert!(!st.used.contains(&(5, 1)));
    }
}
