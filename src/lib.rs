//! `ubicore` is a user-space flash translation layer for raw NAND/NOR
//! flash, speaking the UBI on-flash format.
//!
//! It presents erase-block-addressed flash as a set of volumes of logical
//! eraseblocks, hiding wear-leveling, bad-block handling, and power-loss
//! recovery from the layers above (typically a log-structured filesystem
//! or a firmware store).
//!
//! ```no_run
//! use ubicore::{attach, SimMedia, MediaGeometry, UbiConfig, VolumeSpec, WriteHint};
//!
//! let media = SimMedia::new(MediaGeometry {
//!     peb_count: 64,
//!     peb_size: 64 * 1024,
//!     min_io_size: 512,
//!     can_mark_bad: true,
//! });
//!
//! let dev = attach(Box::new(media), UbiConfig::default())?;
//! let vol = dev.create_volume(VolumeSpec {
//!     name: "config".into(),
//!     reserved_pebs: 4,
//!     ..Default::default()
//! })?;
//! vol.atomic_change(0, b"hello", WriteHint::Unknown)?;
//! # Ok::<(), ubicore::UbiError>(())
//! ```

pub mod nand;
pub mod ubi;

pub use nand::{Media, MediaError, MediaGeometry, ReadKind, SimMedia};
pub use ubi::device::{
    attach, DeviceInfo, SubscriptionId, UbiDevice, VolumeEvent, VolumeHandle, VolumeInfo,
    VolumeSpec,
};
pub use ubi::headers::VolType;
pub use ubi::{UbiConfig, UbiError, WriteHint};
