use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use nuicam_lib::CamMode;
use nuicam_lib::decode::{PixelBuffer, decode};

/// Convert a raw frame dump into a PGM (depth, infrared) or PPM (visible) image.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Mode the frame was captured in, e.g. `depth` or `visible:yuv:vga:15`
    #[arg(short, long)]
    mode: CamMode,
    /// Raw frame bytes as delivered by the frame stream
    input: PathBuf,
    /// Output image path
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let raw = fs::read(&cli.input).with_context(|| format!("Failed to read {:?}", cli.input))?;
    let pixels = decode(&raw, &cli.mode)?;
    let (width, height) = pixels.dimensions();

    let mut out = Vec::new();
    match &pixels {
        PixelBuffer::Gray16 { bits, data, .. } => {
            // 16-bit PGM samples are big-endian
            write!(out, "P5\n{width} {height}\n{}\n", (1u32 << bits) - 1)?;
            for sample in data {
                out.extend_from_slice(&sample.to_be_bytes());
            }
        }
        PixelBuffer::Rgb8 { data, .. } => {
            write!(out, "P6\n{width} {height}\n255\n")?;
            out.extend_from_slice(data);
        }
    }

    fs::write(&cli.output, &out).with_context(|| format!("Failed to write {:?}", cli.output))?;
    info!(mode = %cli.mode, width, height, output = ?cli.output, "Frame decoded");
    Ok(())
}
