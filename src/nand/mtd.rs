//! [`Media`] implementation over the Linux MTD subsystem.

use super::{Media, MediaError, MediaGeometry, ReadKind};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// Raw flash that wraps an open `/dev/mtdX` file.
#[derive(Debug)]
pub struct MtdMedia {
    file: File,
    geometry: MediaGeometry,
}

impl MtdMedia {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0").
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let geometry = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, geometry })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`.
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line.split(':').next().unwrap();
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        anyhow::bail!("MTD device {name} could not be found");
    }

    fn base(&self, pnum: u32) -> Result<u64, MediaError> {
        if pnum >= self.geometry.peb_count {
            return Err(MediaError::OutOfRange(pnum));
        }
        Ok(pnum as u64 * self.geometry.peb_size as u64)
    }

    fn ecc_corrected(&self) -> u32 {
        let stats = unsafe {
            let mut stats = MaybeUninit::<ioctl::mtd_ecc_stats>::uninit();
            if ioctl::eccgetstats(self.file.as_raw_fd(), stats.as_mut_ptr()).is_err() {
                return 0;
            }
            stats.assume_init()
        };
        stats.corrected
    }
}

impl Media for MtdMedia {
    fn geometry(&self) -> MediaGeometry {
        self.geometry
    }

    fn is_bad(&mut self, pnum: u32) -> Result<bool, MediaError> {
        let base = self.base(pnum)?;
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &base) }
            .map_err(std::io::Error::from)?;
        Ok(bad != 0)
    }

    fn read(&mut self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<ReadKind, MediaError> {
        let pos = self.base(pnum)? + offset as u64;
        let corrected_before = self.ecc_corrected();

        match self.file.read_exact_at(buf, pos) {
            Ok(()) => {}
            // The MTD character device reports uncorrectable ECC errors as
            // EBADMSG on the read syscall.
            Err(e) if e.raw_os_error() == Some(nix::libc::EBADMSG) => {
                return Err(MediaError::Uncorrectable(pnum));
            }
            Err(e) => return Err(e.into()),
        }

        if self.ecc_corrected() > corrected_before {
            Ok(ReadKind::BitFlips)
        } else {
            Ok(ReadKind::Clean)
        }
    }

    fn program(&mut self, pnum: u32, offset: usize, data: &[u8]) -> Result<(), MediaError> {
        let min_io = self.geometry.min_io_size;
        if offset % min_io != 0 || data.len() % min_io != 0 {
            return Err(MediaError::Unaligned {
                pnum,
                offset,
                len: data.len(),
            });
        }
        let pos = self.base(pnum)? + offset as u64;
        self.file
            .write_all_at(data, pos)
            .map_err(|_| MediaError::ProgramFailed(pnum))
    }

    fn erase(&mut self, pnum: u32) -> Result<(), MediaError> {
        let erase_info = ioctl::erase_info_user {
            start: self.base(pnum)? as u32,
            length: self.geometry.peb_size as u32,
        };
        unsafe { ioctl::memerase(self.file.as_raw_fd(), &erase_info) }
            .map_err(|_| MediaError::EraseFailed(pnum))?;
        Ok(())
    }

    fn mark_bad(&mut self, pnum: u32) -> Result<(), MediaError> {
        if !self.geometry.can_mark_bad {
            return Err(MediaError::CannotMarkBad);
        }
        let base = self.base(pnum)?;
        unsafe { ioctl::memsetbadblock(self.file.as_raw_fd(), &base) }
            .map_err(std::io::Error::from)?;
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::{MediaError, MediaGeometry};

    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    const MTD_NANDFLASH: u8 = 4;
    const MTD_MLCNANDFLASH: u8 = 8;

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<MediaGeometry> for mtd_info_user {
        type Error = MediaError;

        fn try_into(mut self) -> Result<MediaGeometry, MediaError> {
            if self.writesize == 1 {
                // Hack for debugging on mtdram devices
                self.writesize = 64;
            }

            if self.size % self.erasesize != 0 || self.erasesize % self.writesize != 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "MTD size/erasesize/writesize are inconsistent",
                )
                .into());
            }

            Ok(MediaGeometry {
                peb_count: self.size / self.erasesize,
                peb_size: self.erasesize as usize,
                min_io_size: self.writesize as usize,
                can_mark_bad: matches!(self.r#type, MTD_NANDFLASH | MTD_MLCNANDFLASH),
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[repr(C)]
    pub struct mtd_ecc_stats {
        pub corrected: u32,
        pub failed: u32,
        pub badblocks: u32,
        pub bbtblocks: u32,
    }
    ioctl_read!(eccgetstats, MTD_IOC_MAGIC, 18, mtd_ecc_stats);
}
