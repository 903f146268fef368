//! Writing assembled file groups to disk.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use ulid::Ulid;

use super::group::AssembledFile;
use crate::{GdsError, Result};

/// Paths written for one file group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFiles {
    pub raw: PathBuf,
    pub hex: PathBuf,
    /// Absent when the grid is empty.
    pub grey_png: Option<PathBuf>,
    pub color_png: Option<PathBuf>,
}

/// Writes images as `img_<prefix>__<ULID>__<fgid>.*` into `dir`.
#[derive(Debug, Clone)]
pub struct ImageWriter {
    dir: PathBuf,
    prefix: String,
}

impl ImageWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self { dir: dir.into(), prefix: prefix.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name stem for a file group. The ULID keeps names sortable by
    /// export time.
    pub fn stem(&self, ulid: Ulid, file_group_id: u16) -> String {
        format!("img_{}__{}__{}", self.prefix, ulid, file_group_id)
    }

    pub fn write(&self, file: &AssembledFile) -> Result<ExportedFiles> {
        let fgid = file.file_group_id;
        let fail = |details: String| GdsError::Export { file_group_id: fgid, details };
        fs::create_dir_all(&self.dir).map_err(|e| GdsError::io_error(&self.dir, e))?;
        if !file.valid() {
            warn!(fgid, invalid_lines = file.invalid_lines, "exporting file group with inconsistent lines");
        }

        let stem = self.stem(Ulid::new(), fgid);
        let path = |ext: &str| self.dir.join(format!("{stem}.{ext}"));

        let raw = path("raw");
        fs::write(&raw, &file.grid).map_err(|e| GdsError::io_error(&raw, e))?;

        let hex = path("txt");
        write_hex(&hex, file).map_err(|e| GdsError::io_error(&hex, e))?;

        let (mut grey_png, mut color_png) = (None, None);
        if file.rows > 0 && file.cols > 0 {
            let grey = path("raw.png");
            write_png(&grey, file.cols, file.rows, png::ColorType::Grayscale, &file.grid).map_err(fail)?;
            grey_png = Some(grey);

            let color = path("color.png");
            let rgb = debayer_rggb(&file.grid, file.cols, file.rows);
            write_png(&color, file.cols, file.rows, png::ColorType::Rgb, &rgb).map_err(fail)?;
            color_png = Some(color);
        }

        info!(fgid, rows = file.rows, cols = file.cols, complete = file.complete, "exported {stem}");
        Ok(ExportedFiles { raw, hex, grey_png, color_png })
    }
}

/// One text line per file line, bytes in upper-case hex grouped by four.
fn write_hex(path: &Path, file: &AssembledFile) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for row in file.grid.chunks(file.cols.max(1)) {
        let groups: Vec<String> = row.chunks(4).map(hex::encode_upper).collect();
        writeln!(out, "{}", groups.join(" "))?;
    }
    out.flush()
}

fn write_png(path: &Path, width: usize, height: usize, color: png::ColorType, data: &[u8]) -> std::result::Result<(), String> {
    let dims = |n: usize| u32::try_from(n).map_err(|_| format!("{n} pixels does not fit a PNG"));
    let file = File::create(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), dims(width)?, dims(height)?);
    encoder.set_color(color);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header().map_err(|e| e.to_string())?;
    writer.write_image_data(data).map_err(|e| e.to_string())
}

/// Demosaics an RGGB Bayer mosaic by giving every pixel of each 2x2 cell the
/// cell's red, mean green and blue. Edge cells of odd-sized images reuse the
/// nearest in-bounds sample.
pub fn debayer_rggb(mosaic: &[u8], width: usize, height: usize) -> Vec<u8> {
    let at = |x: usize, y: usize| mosaic[y.min(height - 1) * width + x.min(width - 1)];
    let mut rgb = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        for x in 0..width {
            let (cx, cy) = (x & !1, y & !1);
            let r = at(cx, cy);
            let g = ((u16::from(at(cx + 1, cy)) + u16::from(at(cx, cy + 1))) / 2) as u8;
            let b = at(cx + 1, cy + 1);
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    rgb
}
