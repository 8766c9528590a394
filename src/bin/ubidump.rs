//! Inspect a UBI image or MTD partition without modifying it: geometry,
//! erase-counter statistics, the volume table, and every volume's
//! LEB→PEB mapping.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use tracing_subscriber::EnvFilter;

#[cfg(target_os = "linux")]
use ubicore::nand::mtd::MtdMedia;
use ubicore::{attach, Media, MediaGeometry, SimMedia, UbiConfig, VolType};

#[derive(Args, Debug)]
#[group(required = true)]
struct MediaOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "media-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "media-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to a flat flash image to inspect
    #[clap(long, group = "media-options", requires = "geometry")]
    image: Option<PathBuf>,

    /// Geometry of the image, as "PEBSxBYTESxIO" (e.g. "1024x131072x2048")
    #[clap(long)]
    geometry: Option<MediaGeometry>,
}

impl MediaOptions {
    fn open(self) -> Result<Box<dyn Media>> {
        #[cfg(target_os = "linux")]
        if let Some(name) = self.mtd_name {
            return Ok(Box::new(MtdMedia::open_named(&name)?));
        }
        #[cfg(target_os = "linux")]
        if let Some(dev) = self.mtd_dev {
            return Ok(Box::new(MtdMedia::open(dev)?));
        }

        let path = self.image.expect("clap enforces one media option");
        let mut media = SimMedia::new(self.geometry.unwrap());
        let mut file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        media
            .load(&mut file)
            .with_context(|| format!("loading {}", path.display()))?;
        Ok(Box::new(media))
    }
}

/// Dump the contents of a UBI device, read-only.
#[derive(Parser, Debug)]
struct Cli {
    #[clap(flatten)]
    media: MediaOptions,

    /// Also print the LEB→PEB mapping of every volume
    #[clap(long, short)]
    mappings: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let media = cli.media.open()?;

    let config = UbiConfig {
        read_only: true,
        ..Default::default()
    };
    let dev = attach(media, config).context("attaching device")?;

    let info = dev.info();
    println!("device:");
    println!("  PEBs:         {} x {} bytes", info.peb_count, info.peb_size);
    println!("  min I/O:      {} bytes", info.min_io_size);
    println!("  LEB size:     {} bytes", info.leb_size);
    println!("  mean EC:      {}", info.mean_ec);
    println!("  available:    {} PEBs", info.avail_pebs);
    println!("  bad:          {} PEBs", info.bad_peb_count);
    println!("  corrupted:    {} PEBs", info.corr_peb_count);

    let volumes = dev.volumes();
    println!("\n{} volume(s):", volumes.len());
    for vol in &volumes {
        let kind = match vol.vol_type {
            VolType::Dynamic => "dynamic",
            VolType::Static => "static",
        };
        println!(
            "  {:3}  {:8}  {:5} PEBs  {:10} bytes/LEB  {}{}",
            vol.vol_id,
            kind,
            vol.reserved_pebs,
            vol.usable_leb_size,
            vol.name,
            if vol.corrupted { "  (corrupted)" } else { "" },
        );

        if cli.mappings {
            let handle = dev.open_volume(vol.vol_id)?;
            for lnum in 0..vol.reserved_pebs {
                if let Some(pnum) = handle.mapping(lnum)? {
                    println!("       LEB {lnum:5} -> PEB {pnum}");
                }
            }
        }
    }

    dev.detach();
    Ok(())
}
