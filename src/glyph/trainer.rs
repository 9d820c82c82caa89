//! Asking a human what an unknown glyph is.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use image::GrayImage;

use super::key::PixelKey;
use super::preprocess::put_box_around;
use crate::error::{PilotError, Result};

/// An unrecognized cell waiting for a decision.
pub struct TrainingRequest<'a> {
    pub cell: &'a GrayImage,
    pub key: &'a PixelKey,
    pub row: u32,
    pub col: u32,
    /// Glyph map the answer will be stored in.
    pub map_path: &'a Path,
}

/// Source of glyph identifications. Blocks until it has an answer.
pub trait GlyphTrainer {
    fn identify(&mut self, request: &TrainingRequest<'_>) -> Result<char>;
}

/// Trainer that shows the glyph on the terminal and reads the answer from a line of input.
///
/// The boxed cell is also written as a PNG so it can be opened in an image viewer.
pub struct ConsoleTrainer<R, W> {
    input: R,
    output: W,
    image_dir: Option<PathBuf>,
}

impl ConsoleTrainer<std::io::StdinLock<'static>, std::io::Stdout> {
    pub fn stdio(image_dir: Option<PathBuf>) -> Self {
        Self::new(std::io::stdin().lock(), std::io::stdout(), image_dir)
    }
}

impl<R: BufRead, W: Write> ConsoleTrainer<R, W> {
    pub fn new(input: R, output: W, image_dir: Option<PathBuf>) -> Self {
        Self {
            input,
            output,
            image_dir,
        }
    }

    fn save_cell(&self, request: &TrainingRequest<'_>) -> Option<PathBuf> {
        let dir = self.image_dir.as_ref()?;
        let path = dir.join(format!("unknown_r{:02}_c{:02}.png", request.row, request.col));
        match put_box_around(request.cell, 1).save(&path) {
            Ok(()) => Some(path),
            Err(e) => {
                crate::log(&format!(
                    "Warning: could not save glyph image {}: {}",
                    path.display(),
                    e
                ));
                None
            }
        }
    }
}

impl<R: BufRead, W: Write> GlyphTrainer for ConsoleTrainer<R, W> {
    fn identify(&mut self, request: &TrainingRequest<'_>) -> Result<char> {
        let saved = self.save_cell(request);

        writeln!(self.output, "Unknown character:")?;
        writeln!(self.output, "{}", request.key.render(request.cell.width()))?;
        if let Some(path) = saved {
            writeln!(self.output, "(image: {})", path.display())?;
        }

        loop {
            write!(
                self.output,
                "{} ({},{}) Enter character: ",
                request.map_path.display(),
                request.row,
                request.col
            )?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Err(PilotError::Training(
                    "input closed while waiting for a character".to_string(),
                ));
            }

            let answer = line.strip_suffix('\n').unwrap_or(&line);
            let answer = answer.strip_suffix('\r').unwrap_or(answer);
            let mut chars = answer.chars();
            if let (Some(ch), None) = (chars.next(), chars.next()) {
                return Ok(ch);
            }
        }
    }
}
