//! PDF Size-Target Compressor CLI
//!
//! Command-line interface for shrinking PDFs into a byte-size window.

use anyhow::Context;
use clap::Parser;
use pdf_size_target::{image_inventory, CompressOptions, SizeTargetCompressor, TargetWindow};
use std::fs;
use std::path::PathBuf;

/// Recompress the images in a PDF until it fits a size window
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input PDF file path
    #[arg(short, long)]
    input: PathBuf,

    /// Output PDF file path (required unless --inspect)
    #[arg(short, long, required_unless_present = "inspect")]
    output: Option<PathBuf>,

    /// Lower bound of the target window in KB
    #[arg(long, default_value = "80")]
    min_kb: usize,

    /// Upper bound of the target window in KB
    #[arg(long, default_value = "100")]
    max_kb: usize,

    /// Remove watermark-like content from the middle of each page first
    #[arg(long)]
    strip_watermarks: bool,

    /// Print the image inventory of the input and exit
    #[arg(long)]
    inspect: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let input = fs::read(&args.input).with_context(|| format!("reading {:?}", args.input))?;

    if args.inspect {
        return inspect(&input);
    }

    let window = TargetWindow::from_kb(args.min_kb, args.max_kb)?;
    let mut options = CompressOptions::default();
    if args.strip_watermarks {
        options = options.with_watermark_stripping();
    }

    println!("PDF Size-Target Compressor");
    println!("==========================");
    println!(
        "Input: {} ({}), target {} - {}",
        args.input.display(),
        format_size(input.len()),
        format_size(window.min),
        format_size(window.max)
    );

    let result = SizeTargetCompressor::new(options).compress(&input, window)?;

    let output = args.output.context("--output is required")?;
    fs::write(&output, &result.bytes).with_context(|| format!("writing {:?}", output))?;

    println!(
        "\nDone! {} -> {} via {} ({} probes)",
        format_size(input.len()),
        format_size(result.len()),
        result.stage,
        result.probes
    );
    if !result.fits(window) {
        println!("Note: the target window could not be reached; this is the closest result.");
    }
    println!("Output saved to: {}", output.display());

    Ok(())
}

fn inspect(input: &[u8]) -> anyhow::Result<()> {
    let pages = image_inventory(input)?;
    if pages.is_empty() {
        println!("No images found.");
        return Ok(());
    }

    for page in &pages {
        println!("Page {} ({})", page.page_number, format_size(page.total_bytes()));
        for img in &page.images {
            println!(
                "  {} {} {}: {}x{} {} {}bpc {} {}",
                img.object_id.0,
                img.object_id.1,
                img.kind,
                img.width,
                img.height,
                img.color_space,
                img.bits_per_component,
                img.filter,
                format_size(img.size_bytes)
            );
            for rect in &img.placements {
                println!(
                    "      at [{:.1} {:.1} {:.1} {:.1}]",
                    rect.x0, rect.y0, rect.x1, rect.y1
                );
            }
        }
    }
    Ok(())
}

/// Human-readable size: B, KB or MB with one decimal.
fn format_size(bytes: usize) -> String {
    const KB: f64 = 1024.0;
    let size = bytes as f64;
    if size < KB {
        format!("{} B", bytes)
    } else if size < KB * KB {
        format!("{:.1} KB", size / KB)
    } else {
        format!("{:.1} MB", size / (KB * KB))
    }
}
