// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin CLI front-end over the `ubidump` library: argument parsing
//! only, no parsing/CRC/tree-walking logic of its own (section 10.5).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use ubidump::config::{autodetect, ImageType, Options};
use ubidump::sink::LocalDiskEmitter;
use ubidump::summary::{ImageSummary, MasterSummary, SuperblockSummary};
use ubidump::{io::FileByteSource, ubi, ubifs, Driver};

#[derive(Parser)]
#[command(
    name = "ubidump",
    author = "Oxide Computer Company",
    version,
    about = "Read-only parser and extractor for UBI/UBIFS flash images"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,

    #[command(flatten)]
    scan: ScanOpts,
}

#[derive(Parser)]
struct ScanOpts {
    /// First byte of UBI/UBIFS data within the file; auto-detected if absent.
    #[arg(long, global = true)]
    start_offset: Option<u64>,

    /// Hint for where to start looking when `start_offset` isn't given.
    #[arg(long, global = true)]
    guess_offset: Option<u64>,

    /// One past the last byte of UBI/UBIFS data; defaults to the file's length.
    #[arg(long, global = true)]
    end_offset: Option<u64>,

    /// PEB (UBI) or LEB (UBIFS) size, in bytes; auto-detected if absent.
    #[arg(long, global = true)]
    block_size: Option<u32>,

    /// Force the image type instead of auto-detecting it from the magic bytes.
    #[arg(long, global = true, value_enum)]
    image_type: Option<ImageTypeArg>,

    /// Log bad blocks and CRC failures instead of aborting on the first one.
    #[arg(long, global = true)]
    warn_only: bool,

    /// Accept EC/VID headers whose CRC doesn't match.
    #[arg(long, global = true)]
    ignore_header_errors: bool,

    /// Merge image_seq == 0 blocks into every image found (firmware workaround).
    #[arg(long, global = true)]
    uboot_fix: bool,

    /// Preserve uid/gid/mode/timestamps on extracted entries.
    #[arg(long, global = true)]
    permissions: bool,

    /// Path to a 64-byte binary key, for volumes encrypted with fscrypt.
    #[arg(long, global = true)]
    master_key: Option<PathBuf>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ImageTypeArg {
    Ubi,
    Ubifs,
}

#[derive(Subcommand)]
enum Command {
    /// Prints the volume table and superblock/master node summary without extracting anything.
    Info {
        /// Path to the flash image.
        image: PathBuf,
    },
    /// Walks every UBIFS volume found and writes its contents under out_dir.
    Extract {
        /// Path to the flash image.
        image: PathBuf,
        /// Directory to extract into; created if it doesn't exist.
        out_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ubidump: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_options(scan: &ScanOpts) -> Result<Options, Box<dyn std::error::Error>> {
    let master_key = match &scan.master_key {
        Some(path) => {
            let bytes = std::fs::read(path)?;
            let arr: [u8; 64] = bytes
                .try_into()
                .map_err(|_| "master key file must be exactly 64 bytes")?;
            Some(arr)
        }
        None => None,
    };
    Ok(Options {
        start_offset: scan.start_offset,
        end_offset: scan.end_offset,
        guess_offset: scan.guess_offset,
        block_size: scan.block_size,
        image_type: scan.image_type.map(|t| match t {
            ImageTypeArg::Ubi => ImageType::Ubi,
            ImageTypeArg::Ubifs => ImageType::Ubifs,
        }),
        warn_only_block_read_errors: scan.warn_only,
        ignore_block_header_errors: scan.ignore_header_errors,
        uboot_fix: scan.uboot_fix,
        permissions: scan.permissions,
        master_key,
    })
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut opts = build_options(&cli.scan)?;
    let image_path = match &cli.cmd {
        Command::Info { image } => image,
        Command::Extract { image, .. } => image,
    };
    autodetect_missing(&mut opts, image_path)?;
    match cli.cmd {
        Command::Info { image } => info(&image, &opts),
        Command::Extract { image, out_dir } => extract(&image, &out_dir, &opts),
    }
}

/// Fills in `block_size`/`image_type` from the two heuristics in
/// section 6 when the user didn't pass them explicitly, by sniffing
/// the raw file once up front.
fn autodetect_missing(opts: &mut Options, path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if opts.start_offset.is_some() && opts.block_size.is_some() && opts.image_type.is_some() {
        return Ok(());
    }
    let data = std::fs::read(path)?;
    if opts.start_offset.is_none() {
        opts.start_offset = autodetect::detect_start_offset(&data, opts.guess_offset);
    }
    let from = opts.start_offset.unwrap_or(0) as usize;
    let tail = data.get(from..).unwrap_or(&[]);
    if opts.image_type.is_none() {
        opts.image_type = autodetect::detect_image_type(tail);
    }
    if opts.block_size.is_none() {
        opts.block_size = match opts.image_type {
            Some(ImageType::Ubifs) => autodetect::detect_leb_size(tail),
            _ => autodetect::detect_block_size(tail),
        };
    }
    Ok(())
}

fn info(image: &PathBuf, opts: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let mut src = FileByteSource::open(image, opts)?;
    let images = ubi::scan(&mut src, opts)?;
    for img in &images {
        print!("{}", ImageSummary(img));
        for volume in &img.volumes {
            let mut stream = ubi::LebStream::new(&mut src, volume);
            match ubifs::Instance::open(&mut stream, opts) {
                Ok(fs) => {
                    print!("{}", SuperblockSummary(fs.superblock()));
                    let (root_lnum, root_offs, cmt_no) = fs.master_summary();
                    print!(
                        "{}",
                        MasterSummary {
                            root_lnum,
                            root_offs,
                            cmt_no,
                        }
                    );
                }
                Err(e) => println!("  (volume {}: not a UBIFS instance: {e})", volume.name),
            }
        }
    }
    Ok(())
}

fn extract(
    image: &PathBuf,
    out_dir: &PathBuf,
    opts: &Options,
) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(out_dir)?;
    let driver = Driver::new(opts.clone());
    let mut emitter = LocalDiskEmitter::new(out_dir, opts.permissions);
    let all_warnings = driver.run(image, &mut emitter)?;
    for warnings in &all_warnings {
        for warning in &warnings.0 {
            log::warn!("{warning}");
        }
    }
    Ok(())
}
