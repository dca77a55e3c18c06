use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use partimg_core::config::{DEFAULT_BLOCKS_PER_CHECKSUM, DEFAULT_IO_BUFFER_SIZE};
use partimg_core::device::{self, DeviceInfo};
use partimg_core::image::BitmapEncoding;
use partimg_core::probe::DEFAULT_RAW_BLOCK_SIZE;
use partimg_core::progress::ProgressEvent;
use partimg_core::{
    ChecksumAlgorithm, ImageInfo, RawProbe, TransferConfig, TransferSummary, worker,
};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "partimg")]
#[command(about = "Image and restore only the used blocks of a partition", version)]
struct Cli {
    /// Increase log output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Do not ask for confirmation before writing
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Image the used blocks of a device into an image file
    Clone {
        /// Device or file to read
        source: PathBuf,
        /// Image file to create
        image: PathBuf,

        #[command(flatten)]
        read: ReadArgs,

        #[command(flatten)]
        checksum: ChecksumArgs,

        /// Replace an existing image file
        #[arg(long)]
        overwrite: bool,
    },
    /// Copy the used blocks of a device onto another device
    Copy {
        /// Device or file to read
        source: PathBuf,
        /// Device or file to write
        target: PathBuf,

        #[command(flatten)]
        read: ReadArgs,

        /// Log and continue when a block cannot be written
        #[arg(long)]
        skip_write_errors: bool,

        /// Compare source and target after copying
        #[arg(long)]
        verify: bool,

        /// Write over an existing regular file (block devices only need confirmation)
        #[arg(long)]
        overwrite: bool,
    },
    /// Restore an image file onto a device
    Restore {
        /// Image file to read
        image: PathBuf,
        /// Device or file to write
        target: PathBuf,

        /// Bytes moved per I/O cycle
        #[arg(long, default_value_t = DEFAULT_IO_BUFFER_SIZE)]
        buffer_size: usize,

        /// Skip checksum comparison
        #[arg(long)]
        ignore_checksum: bool,

        /// Write over an existing regular file (block devices only need confirmation)
        #[arg(long)]
        overwrite: bool,
    },
    /// Verify every checksum of an image without writing anything
    Check {
        /// Image file to read
        image: PathBuf,

        /// Bytes moved per I/O cycle
        #[arg(long, default_value_t = DEFAULT_IO_BUFFER_SIZE)]
        buffer_size: usize,
    },
    /// Print the metadata of an image file
    Info {
        /// Image file to read
        image: PathBuf,

        /// Show the image even if its bitmap is corrupt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct ReadArgs {
    /// Block size used when imaging a device without a filesystem probe
    #[arg(long, default_value_t = DEFAULT_RAW_BLOCK_SIZE)]
    block_size: u32,

    /// Bytes moved per I/O cycle
    #[arg(long, default_value_t = DEFAULT_IO_BUFFER_SIZE)]
    buffer_size: usize,

    /// Zero-fill unreadable sectors instead of aborting
    #[arg(long)]
    rescue: bool,
}

#[derive(Args)]
struct ChecksumArgs {
    /// Checksum written into the image
    #[arg(long, value_enum, default_value_t = ChecksumChoice::Crc32)]
    checksum: ChecksumChoice,

    /// Blocks covered by each checksum (0 disables checksums)
    #[arg(long, default_value_t = DEFAULT_BLOCKS_PER_CHECKSUM)]
    blocks_per_checksum: u32,

    /// Keep one running checksum across the whole image
    #[arg(long)]
    no_reseed: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ChecksumChoice {
    None,
    Crc32,
}

impl From<ChecksumChoice> for ChecksumAlgorithm {
    fn from(choice: ChecksumChoice) -> Self {
        match choice {
            ChecksumChoice::None => ChecksumAlgorithm::None,
            ChecksumChoice::Crc32 => ChecksumAlgorithm::Crc32,
        }
    }
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// Disabling it keeps the progress bar line clean when the user cancels.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("confirmation needs an interactive terminal; pass --yes to skip it")?;

    Ok(confirmation)
}

fn describe(path: &Path) -> String {
    match device::inspect(path) {
        Ok(info) => info.to_string(),
        Err(_) => format!("{:<15} (will be created)", path.display()),
    }
}

fn bar_style(colour: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{colour}/black}}] {{human_pos}}/{{human_len}} blocks ({{per_sec}}, {{eta}})"
    );
    Ok(ProgressStyle::default_bar()
        .template(&template)?
        .progress_chars("■ "))
}

/// Runs a session on the worker thread and mirrors its progress on a bar.
fn run_session<J>(
    label: &'static str,
    colour: &str,
    capacity: usize,
    running: &AtomicBool,
    job: J,
) -> Result<TransferSummary>
where
    J: FnOnce(
            Arc<AtomicBool>,
            &mut dyn FnMut(&ProgressEvent),
        ) -> partimg_core::Result<TransferSummary>
        + Send
        + 'static,
{
    let pb = ProgressBar::new(0);
    pb.set_prefix(label);
    pb.set_style(bar_style(colour)?);

    let handle = worker::spawn(capacity, job)?;
    let show = |event: ProgressEvent| {
        pb.set_length(event.total_units);
        pb.set_position(event.units_done);
    };
    while !handle.is_finished() {
        if !running.load(Ordering::SeqCst) {
            handle.cancel();
        }
        if let Some(event) = handle.latest() {
            show(event);
        }
        thread::sleep(POLL_INTERVAL);
    }
    if let Some(event) = handle.latest() {
        show(event);
    }
    debug!(dropped = handle.dropped_events(), "progress events dropped");

    match handle.join() {
        Ok(summary) => {
            pb.finish_with_message("done");
            Ok(summary)
        }
        Err(partimg_core::Error::Cancelled) => {
            pb.abandon_with_message("Cancelled.");
            Err(partimg_core::Error::Cancelled.into())
        }
        Err(e) => {
            pb.abandon_with_message("❌ Operation failed.");
            Err(e.into())
        }
    }
}

fn print_summary(summary: &TransferSummary) {
    println!(
        "  {} blocks, {} in {:.1?}",
        summary.blocks_transferred,
        HumanBytes(summary.bytes_transferred),
        summary.elapsed
    );
    if summary.checksum_tags > 0 {
        println!("  {} checksum groups", summary.checksum_tags);
    }
    if summary.bad_sectors > 0 {
        println!(
            "  {} {} unreadable sectors were zero-filled",
            style("WARNING:").yellow().bold(),
            summary.bad_sectors
        );
    }
    if summary.skipped_write_errors > 0 {
        println!(
            "  {} {} blocks could not be written and may hold stale data",
            style("WARNING:").yellow().bold(),
            summary.skipped_write_errors
        );
    }
    if summary.used_blocks_mismatch() {
        println!(
            "  {} header claims {} used blocks, bitmap holds {}",
            style("NOTE:").yellow().bold(),
            summary.used_blocks_reported,
            summary.used_blocks_verified
        );
    }
}

fn print_info(path: &Path, info: &ImageInfo) {
    let head = &info.head;
    let desc = &head.descriptor;
    let opts = &head.options;
    let encoding = match opts.bitmap_encoding {
        BitmapEncoding::Bit => "bit per block",
        BitmapEncoding::Byte => "byte per block",
    };

    println!("  Image:        {}", style(path.display()).cyan());
    println!(
        "  Format:       {} v{} (writer {})",
        String::from_utf8_lossy(&head.header.magic),
        String::from_utf8_lossy(&head.header.format_version),
        String::from_utf8_lossy(&head.header.writer_version),
    );
    println!("  Filesystem:   {}", desc.fs_name());
    println!("  Device size:  {}", HumanBytes(desc.device_size));
    println!("  Block size:   {}", desc.block_size);
    println!("  Total blocks: {}", desc.total_blocks);
    println!("  Used blocks:  {}", desc.used_blocks);
    if info.used_blocks_mismatch() {
        println!(
            "                {} bitmap holds {}",
            style("NOTE:").yellow().bold(),
            info.used_blocks_counted
        );
    }
    println!("  Bitmap:       {encoding}");
    if opts.blocks_per_checksum == 0 || opts.checksum == ChecksumAlgorithm::None {
        println!("  Checksum:     none");
    } else {
        println!(
            "  Checksum:     {} every {} blocks{}",
            opts.checksum,
            opts.blocks_per_checksum,
            if opts.reseed { ", reseeded" } else { "" }
        );
    }
    println!("  Image size:   {}", HumanBytes(info.expected_size));
    if let Some(err) = &info.bitmap_corruption {
        println!("  {} {err}", style("WARNING:").red().bold());
    }
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    match cli.command {
        Commands::Clone {
            source,
            image,
            read,
            checksum,
            overwrite,
        } => {
            let probe = RawProbe::new(read.block_size)?;
            let config = TransferConfig::new()
                .io_buffer_size(read.buffer_size)
                .rescue(read.rescue)
                .checksum(checksum.checksum.into(), checksum.blocks_per_checksum)
                .reseed(!checksum.no_reseed);

            println!("  Source: {}", style(describe(&source)).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            println!();
            if !confirm_operation("Start imaging?", cli.yes)? {
                println!("Clone operation cancelled.");
                return Ok(());
            }

            let capacity = config.progress_capacity;
            let (src, dst) = (source.clone(), image.clone());
            let summary = run_session(
                "Imaging",
                "green",
                capacity,
                &running,
                move |flag, progress| {
                    partimg_core::clone_to_image(
                        &probe, &src, &dst, overwrite, &config, flag, progress,
                    )
                },
            )
            .with_context(|| format!("failed to image {}", source.display()))?;

            println!(
                "\n✨ Successfully imaged {} to {}.",
                style(source.display()).cyan(),
                style(image.display()).cyan()
            );
            print_summary(&summary);
        }
        Commands::Copy {
            source,
            target,
            read,
            skip_write_errors,
            verify,
            overwrite,
        } => {
            let probe = RawProbe::new(read.block_size)?;
            let config = TransferConfig::new()
                .io_buffer_size(read.buffer_size)
                .rescue(read.rescue)
                .skip_write_errors(skip_write_errors)
                .verify(verify);

            let target_info: Option<DeviceInfo> = device::inspect(&target).ok();
            println!(
                "{} This will overwrite the used blocks of '{}'.",
                style("WARNING:").red().bold(),
                target.display()
            );
            println!("  Source: {}", style(describe(&source)).cyan());
            match &target_info {
                Some(info) => println!("  Target: {}", style(info).cyan()),
                None => println!("  Target: {}", style(describe(&target)).cyan()),
            }
            println!();
            if !confirm_operation("Are you sure you want to proceed?", cli.yes)? {
                println!("Copy operation cancelled.");
                return Ok(());
            }

            let capacity = config.progress_capacity;
            let (src, dst) = (source.clone(), target.clone());
            let summary = run_session(
                "Copying",
                "green",
                capacity,
                &running,
                move |flag, progress| {
                    partimg_core::clone_to_partition(
                        &probe, &src, &dst, overwrite, &config, flag, progress,
                    )
                },
            )
            .with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    source.display(),
                    target.display()
                )
            })?;

            println!(
                "\n✨ Successfully copied {} to {}{}.",
                style(source.display()).cyan(),
                style(target.display()).cyan(),
                if verify { " (verified)" } else { "" }
            );
            print_summary(&summary);
        }
        Commands::Restore {
            image,
            target,
            buffer_size,
            ignore_checksum,
            overwrite,
        } => {
            let config = TransferConfig::new()
                .io_buffer_size(buffer_size)
                .ignore_checksum(ignore_checksum);

            println!(
                "{} This will overwrite data on '{}'.",
                style("WARNING:").red().bold(),
                target.display()
            );
            println!("  Image:  {}", style(image.display()).cyan());
            println!("  Target: {}", style(describe(&target)).cyan());
            println!();
            if !confirm_operation("Are you sure you want to proceed?", cli.yes)? {
                println!("Restore operation cancelled.");
                return Ok(());
            }

            let capacity = config.progress_capacity;
            let (src, dst) = (image.clone(), target.clone());
            let summary = run_session(
                "Restoring",
                "magenta",
                capacity,
                &running,
                move |flag, progress| {
                    partimg_core::restore(&src, &dst, overwrite, &config, flag, progress)
                },
            )
            .with_context(|| format!("failed to restore {}", image.display()))?;

            println!(
                "\n✨ Successfully restored {} to {}.",
                style(image.display()).cyan(),
                style(target.display()).cyan()
            );
            print_summary(&summary);
        }
        Commands::Check { image, buffer_size } => {
            let config = TransferConfig::new().io_buffer_size(buffer_size);
            let capacity = config.progress_capacity;
            let src = image.clone();
            let summary = run_session(
                "Checking",
                "blue",
                capacity,
                &running,
                move |flag, progress| partimg_core::check_image(&src, &config, flag, progress),
            )
            .with_context(|| format!("image {} failed the check", image.display()))?;

            println!("\n✨ {} is intact.", style(image.display()).cyan());
            print_summary(&summary);
        }
        Commands::Info { image, force } => {
            let info = partimg_core::image_info(&image, force)
                .with_context(|| format!("failed to read {}", image.display()))?;
            print_info(&image, &info);
        }
    }

    Ok(())
}
