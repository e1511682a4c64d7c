//! Raw frame to pixel conversion.
//!
//! Pure functions, one per wire format. [`decoder_for`] picks the right one
//! for a mode and [`decode`] runs it on a complete frame.

use crate::error::CamError;
use crate::mode::{CamMode, VisibleFormat};

/// Decoded pixels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelBuffer {
    /// Depth or infrared samples, one `u16` per pixel, `bits` significant
    Gray16 {
        width: usize,
        height: usize,
        bits: usize,
        data: Vec<u16>,
    },
    /// Interleaved RGB, three bytes per pixel
    Rgb8 { width: usize, height: usize, data: Vec<u8> },
}

impl PixelBuffer {
    pub fn dimensions(&self) -> (usize, usize) {
        match self {
            PixelBuffer::Gray16 { width, height, .. } | PixelBuffer::Rgb8 { width, height, .. } => (*width, *height),
        }
    }

    /// RGBA for display. Gray is scaled to full range; the all-ones sample
    /// marks "no reading" and becomes transparent black.
    pub fn to_rgba8(&self) -> Vec<u8> {
        match self {
            PixelBuffer::Gray16 { bits, data, .. } => {
                let max = (1u32 << bits) - 1;
                data.iter()
                    .flat_map(|&p| {
                        if u32::from(p) >= max {
                            [0, 0, 0, 0]
                        } else {
                            let v = (u32::from(p) * 255 / max) as u8;
                            [v, v, v, 255]
                        }
                    })
                    .collect()
            }
            PixelBuffer::Rgb8 { data, .. } => data.chunks_exact(3).flat_map(|p| [p[0], p[1], p[2], 255]).collect(),
        }
    }
}

/// Which conversion a mode's frames need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDecoder {
    /// Big-endian bit-packed gray samples
    Gray { bits: usize },
    /// GRBG Bayer mosaic
    Bayer,
    /// UYVY 4:2:2
    Uyvy,
}

impl PixelDecoder {
    pub fn decode(self, raw: &[u8], width: usize, height: usize) -> PixelBuffer {
        match self {
            PixelDecoder::Gray { bits } => PixelBuffer::Gray16 {
                width,
                height,
                bits,
                data: unpack_gray(bits, raw),
            },
            PixelDecoder::Bayer => PixelBuffer::Rgb8 {
                width,
                height,
                data: bayer_to_rgb(raw, width, height),
            },
            PixelDecoder::Uyvy => PixelBuffer::Rgb8 {
                width,
                height,
                data: uyvy_to_rgb(raw),
            },
        }
    }
}

pub fn decoder_for(mode: &CamMode) -> Option<PixelDecoder> {
    match mode {
        CamMode::Off => None,
        CamMode::Depth(_) | CamMode::Infrared(_) => mode.bits_per_pixel().map(|bits| PixelDecoder::Gray { bits }),
        CamMode::Visible(s) => Some(match s.format {
            VisibleFormat::Bayer => PixelDecoder::Bayer,
            VisibleFormat::Yuv => PixelDecoder::Uyvy,
        }),
    }
}

/// Decode a complete raw frame assembled under `mode`
pub fn decode(raw: &[u8], mode: &CamMode) -> Result<PixelBuffer, CamError> {
    let (Some(decoder), Some((width, height))) = (decoder_for(mode), mode.dimensions()) else {
        return Err(CamError::InvalidMode("no pixels to decode for mode off".to_string()));
    };
    if raw.len() != mode.frame_size() {
        return Err(CamError::InvalidMode(format!(
            "frame is {} bytes, {mode} frames are {}",
            raw.len(),
            mode.frame_size()
        )));
    }
    Ok(decoder.decode(raw, width, height))
}

/// Unpack MSB-first bit-packed samples of `bits` width. Trailing bits that do
/// not fill a whole sample are ignored. Widths outside `1..=16` yield nothing.
pub fn unpack_gray(bits: usize, packed: &[u8]) -> Vec<u16> {
    if !(1..=16).contains(&bits) {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(packed.len() * 8 / bits);
    let mut window: u32 = 0;
    let mut filled = 0;
    for &byte in packed {
        window = (window << 8) | u32::from(byte);
        filled += 8;
        while filled >= bits {
            filled -= bits;
            out.push((window >> filled) as u16);
            window &= (1 << filled) - 1;
        }
    }
    out
}

/// Mirror an out-of-range coordinate back inside `0..n`, keeping its parity
/// so a neighbour in the mosaic stays the same colour.
fn mirror(i: isize, n: usize) -> usize {
    let n = n as isize;
    let i = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    i.clamp(0, n - 1) as usize
}

/// Bilinear demosaic of a GRBG mosaic (row 0 is G R G R, row 1 is B G B G)
pub fn bayer_to_rgb(raw: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut rgb = vec![0u8; width * height * 3];
    if width == 0 || height == 0 || raw.len() < width * height {
        return rgb;
    }

    let px = |x: isize, y: isize| -> u16 { u16::from(raw[mirror(y, height) * width + mirror(x, width)]) };

    for y in 0..height {
        for x in 0..width {
            let (xi, yi) = (x as isize, y as isize);
            let centre = px(xi, yi);
            let horizontal = (px(xi - 1, yi) + px(xi + 1, yi)) / 2;
            let vertical = (px(xi, yi - 1) + px(xi, yi + 1)) / 2;
            let cross = (px(xi - 1, yi) + px(xi + 1, yi) + px(xi, yi - 1) + px(xi, yi + 1)) / 4;
            let diagonal =
                (px(xi - 1, yi - 1) + px(xi + 1, yi - 1) + px(xi - 1, yi + 1) + px(xi + 1, yi + 1)) / 4;

            let (r, g, b) = match (y % 2, x % 2) {
                // green on a red row
                (0, 0) => (horizontal, centre, vertical),
                (0, _) => (centre, cross, diagonal),
                (_, 0) => (diagonal, cross, centre),
                // green on a blue row
                _ => (vertical, centre, horizontal),
            };

            let o = (y * width + x) * 3;
            rgb[o] = r as u8;
            rgb[o + 1] = g as u8;
            rgb[o + 2] = b as u8;
        }
    }
    rgb
}

/// BT.601 full-range UYVY to RGB. Each 4-byte group `U Y0 V Y1` yields two
/// pixels sharing chroma.
pub fn uyvy_to_rgb(raw: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(raw.len() / 4 * 6);
    for group in raw.chunks_exact(4) {
        let u = f32::from(group[0]) - 128.0;
        let v = f32::from(group[2]) - 128.0;
        let r_off = 1.402 * v;
        let g_off = -0.344136 * u - 0.714136 * v;
        let b_off = 1.772 * u;
        for y in [group[1], group[3]] {
            let y = f32::from(y);
            rgb.push((y + r_off).round().clamp(0.0, 255.0) as u8);
            rgb.push((y + g_off).round().clamp(0.0, 255.0) as u8);
            rgb.push((y + b_off).round().clamp(0.0, 255.0) as u8);
        }
    }
    rgb
}
