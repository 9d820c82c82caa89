use image::{DynamicImage, GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::error::{PilotError, Result};

/// Layout of a fixed-size character grid.
///
/// Each text row is `line_height` scanlines tall; the glyph occupies
/// `cell_height` of them starting `line_offset` scanlines from the top.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellGeometry {
    pub cell_width: u32,
    pub cell_height: u32,
    pub line_height: u32,
    pub line_offset: u32,
}

impl CellGeometry {
    /// A grid with no spacing between rows.
    #[cfg(test)]
    pub fn tight(cell_width: u32, cell_height: u32) -> Self {
        Self {
            cell_width,
            cell_height,
            line_height: cell_height,
            line_offset: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cell_width == 0 || self.cell_width > 32 {
            return Err(PilotError::config(format!(
                "cell width {} must be between 1 and 32",
                self.cell_width
            )));
        }
        if self.cell_height == 0 {
            return Err(PilotError::config("cell height must be at least 1"));
        }
        if self.cell_height + self.line_offset > self.line_height {
            return Err(PilotError::config(format!(
                "went off the bottom of the cell: cell height {} + line offset {} > line height {}",
                self.cell_height, self.line_offset, self.line_height
            )));
        }
        Ok(())
    }

    /// Grid size in characters (columns, rows) for an image, if it fits exactly.
    pub fn grid_size(&self, width: u32, height: u32) -> std::result::Result<(u32, u32), String> {
        if width % self.cell_width != 0 {
            return Err(format!(
                "image width {} is not a multiple of {}",
                width, self.cell_width
            ));
        }
        if height % self.line_height != 0 {
            return Err(format!(
                "image height {} is not a multiple of {}",
                height, self.line_height
            ));
        }
        Ok((width / self.cell_width, height / self.line_height))
    }
}

/// One character cell cut out of a screen image.
#[derive(Debug, Clone)]
pub struct Cell {
    pub row: u32,
    pub col: u32,
    pub image: GrayImage,
}

/// Converts an image to on/off pixels.
///
/// A pixel is on (255) when its luma exceeds `threshold`; `invert` swaps
/// on and off afterwards. Everything else becomes 0.
pub fn to_monochrome(img: &DynamicImage, threshold: u8, invert: bool) -> GrayImage {
    let luma = img.to_luma8();
    let (width, height) = luma.dimensions();
    let mut output = GrayImage::new(width, height);

    for (x, y, pixel) in luma.enumerate_pixels() {
        let on = (pixel[0] > threshold) != invert;
        output.put_pixel(x, y, Luma([if on { 255 } else { 0 }]));
    }

    output
}

/// Slices a monochrome image into cells, row by row.
///
/// The caller decides what a size mismatch means; it is reported as a plain message.
pub fn cut_cells(
    img: &GrayImage,
    geometry: &CellGeometry,
) -> std::result::Result<(u32, u32, Vec<Cell>), String> {
    let (columns, rows) = geometry.grid_size(img.width(), img.height())?;
    let mut cells = Vec::with_capacity((columns * rows) as usize);

    for row in 0..rows {
        for col in 0..columns {
            let x = col * geometry.cell_width;
            let y = row * geometry.line_height + geometry.line_offset;
            let image =
                image::imageops::crop_imm(img, x, y, geometry.cell_width, geometry.cell_height)
                    .to_image();
            cells.push(Cell { row, col, image });
        }
    }

    Ok((columns, rows, cells))
}

/// Surrounds a cell with a white border so it stands out when shown to the operator.
pub fn put_box_around(cell: &GrayImage, border: u32) -> GrayImage {
    let mut output = GrayImage::from_pixel(
        cell.width() + border * 2,
        cell.height() + border * 2,
        Luma([255]),
    );
    image::imageops::replace(&mut output, cell, border as i64, border as i64);
    output
}
