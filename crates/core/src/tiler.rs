//! Fixed-size tile grids over RGBA8 buffers.
//!
//! Tiles are visited row-major (top row left to right, then the next row).
//! Edge tiles are clipped to the image, never padded.

use anyhow::{bail, Result};

use crate::types::{PixelBuffer, Tile, CHANNELS};

/// Default tile edge in pixels. Bounds the per-inference working set
/// regardless of input image size.
pub const DEFAULT_TILE_SIZE: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Lazily enumerated tile layout for a `width`×`height` image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    width: u32,
    height: u32,
    tile_size: u32,
    columns: u32,
    rows: u32,
}

impl TileGrid {
    pub fn new(width: u32, height: u32, tile_size: u32) -> Result<Self> {
        if tile_size == 0 {
            bail!("tile size must be positive");
        }
        Ok(Self {
            width,
            height,
            tile_size,
            columns: width.div_ceil(tile_size),
            rows: height.div_ceil(tile_size),
        })
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rect(&self, index: usize) -> Option<TileRect> {
        if index >= self.len() {
            return None;
        }
        let col = (index % self.columns as usize) as u32;
        let row = (index / self.columns as usize) as u32;
        let x = col * self.tile_size;
        let y = row * self.tile_size;
        Some(TileRect {
            x,
            y,
            width: self.tile_size.min(self.width - x),
            height: self.tile_size.min(self.height - y),
        })
    }

    /// Each call starts a fresh pass from the first tile.
    pub fn iter(&self) -> impl Iterator<Item = TileRect> + '_ {
        (0..self.len()).filter_map(move |index| self.rect(index))
    }
}

/// Split `buffer` into owned tiles, row-major.
pub fn split(buffer: &PixelBuffer, tile_size: u32) -> Result<Vec<Tile>> {
    let grid = TileGrid::new(buffer.width(), buffer.height(), tile_size)?;
    grid.iter()
        .map(|rect| {
            Ok(Tile {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
                buffer: extract(buffer, rect.x, rect.y, rect.width, rect.height)?,
            })
        })
        .collect()
}

/// Copy the `w`×`h` sub-rectangle at (`x`, `y`) out of `source`.
pub fn extract(source: &PixelBuffer, x: u32, y: u32, w: u32, h: u32) -> Result<PixelBuffer> {
    if x.saturating_add(w) > source.width() || y.saturating_add(h) > source.height() {
        bail!(
            "extract region {}x{} at ({}, {}) exceeds {}x{} source",
            w,
            h,
            x,
            y,
            source.width(),
            source.height()
        );
    }

    let stride = source.stride();
    let row_bytes = w as usize * CHANNELS;
    let mut data = Vec::with_capacity(row_bytes * h as usize);
    for row in y as usize..(y + h) as usize {
        let start = row * stride + x as usize * CHANNELS;
        data.extend_from_slice(&source.data()[start..start + row_bytes]);
    }

    PixelBuffer::new(w, h, data)
}

/// Write `tile` into `dest` with its top-left corner at (`x`, `y`).
pub fn paste(dest: &mut PixelBuffer, tile: &PixelBuffer, x: u32, y: u32) -> Result<()> {
    if x.saturating_add(tile.width()) > dest.width()
        || y.saturating_add(tile.height()) > dest.height()
    {
        bail!(
            "paste of {}x{} at ({}, {}) exceeds {}x{} destination",
            tile.width(),
            tile.height(),
            x,
            y,
            dest.width(),
            dest.height()
        );
    }

    let dest_stride = dest.stride();
    let row_bytes = tile.stride();
    for (row, src_row) in tile.data().chunks_exact(row_bytes.max(1)).enumerate() {
        let start = (y as usize + row) * dest_stride + x as usize * CHANNELS;
        dest.data_mut()[start..start + row_bytes].copy_from_slice(src_row);
    }

    Ok(())
}
