use std::fmt;

use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Per-scanline bitmask of a character cell.
///
/// Bit `x` of row `y` is set when pixel `(x, y)` of the monochrome cell is on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PixelKey(Vec<u32>);

impl PixelKey {
    pub fn new(rows: Vec<u32>) -> Self {
        Self(rows)
    }

    /// The all-zero key of an empty cell.
    pub fn blank(cell_height: u32) -> Self {
        Self(vec![0; cell_height as usize])
    }

    /// Computes the key of a monochrome cell, shifting each row left by `left_shift` bits.
    pub fn from_cell(cell: &GrayImage, left_shift: u32) -> Self {
        let rows = (0..cell.height())
            .map(|y| {
                let row = (0..cell.width())
                    .filter(|&x| cell.get_pixel(x, y)[0] != 0)
                    .fold(0u32, |bits, x| bits | (1 << x));
                row << left_shift
            })
            .collect();
        Self(rows)
    }

    /// The same glyph drawn in reverse video.
    pub fn complement(&self, cell_width: u32) -> Self {
        let mask = full_width_mask(cell_width);
        Self(self.0.iter().map(|row| row ^ mask).collect())
    }

    #[cfg(test)]
    pub fn rows(&self) -> &[u32] {
        &self.0
    }

    pub fn truncate(&mut self, cell_height: u32) {
        self.0.truncate(cell_height as usize);
    }

    /// Draws the key as `#`/`.` rows, `width` columns wide.
    pub fn render(&self, width: u32) -> String {
        self.0
            .iter()
            .map(|row| {
                (0..width)
                    .map(|x| if row & (1 << x) != 0 { '#' } else { '.' })
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for PixelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

fn full_width_mask(cell_width: u32) -> u32 {
    if cell_width >= 32 {
        u32::MAX
    } else {
        (1u32 << cell_width) - 1
    }
}
