//! Numbered disk images and the interactive disk swapper.

use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{PilotError, Result};
use crate::vm::{ScanCode, VmSession};

/// A disk image whose file stem ends in a number, e.g. `BaseOperatingSystem_12.img`.
///
/// Orders by prefix, then number, then file name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NumberedImage {
    pub prefix: String,
    pub number: u64,
    pub file_name: String,
}

/// Adds the leading dot to a non-empty extension.
pub fn normalize_extension(extension: &str) -> String {
    if extension.is_empty() || extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{}", extension)
    }
}

/// Lists the numbered images in `dir` with the given extension, sorted.
///
/// The extension match ignores case. An empty extension matches files
/// without one.
pub fn numbered_images(dir: &Path, extension: &str) -> Result<Vec<NumberedImage>> {
    let trailing_digits =
        Regex::new(r"^(.*?)(\d+)$").map_err(|e| PilotError::config(e.to_string()))?;
    let extension_lower = extension.to_lowercase();

    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(file_name) = entry.file_name().into_string() else {
            continue;
        };
        let Some(split) = file_name.len().checked_sub(extension.len()) else {
            continue;
        };
        if !file_name.is_char_boundary(split) || file_name[split..].to_lowercase() != extension_lower {
            continue;
        }
        let stem = &file_name[..split];

        let Some(caps) = trailing_digits.captures(stem) else {
            continue;
        };
        let Ok(number) = caps[2].parse::<u64>() else {
            crate::log(&format!("Warning: skipping {}: number too large", file_name));
            continue;
        };
        images.push(NumberedImage {
            prefix: caps[1].to_string(),
            number,
            file_name: file_name.clone(),
        });
    }

    images.sort();
    Ok(images)
}

/// Settings of one swap-disks session.
#[derive(Debug, Clone)]
pub struct SwapPlan {
    pub dir: PathBuf,
    pub slot: String,
    /// Key pressed in the guest after each swap
    pub keypress: Option<ScanCode>,
}

impl SwapPlan {
    /// Index of the first image to insert: the one after `current`, or the
    /// first if `current` is not among them.
    pub fn start_index(&self, images: &[NumberedImage], current: Option<&Path>) -> usize {
        current
            .and_then(|current| {
                images
                    .iter()
                    .position(|image| self.dir.join(&image.file_name) == current)
            })
            .map_or(0, |pos| pos + 1)
    }

    /// Inserts each remaining image after the operator presses Enter.
    ///
    /// Stops early when input closes. Returns how many images were inserted.
    pub fn run(
        &self,
        session: &mut dyn VmSession,
        images: &[NumberedImage],
        current: Option<&Path>,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
    ) -> Result<usize> {
        let start = self.start_index(images, current);
        let mut inserted = 0;

        for image in &images[start.min(images.len())..] {
            writeln!(output, "Press Enter to switch to {}", image.file_name)?;
            output.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                crate::log("Input closed, stopping disk swap");
                break;
            }

            let medium = self.dir.join(&image.file_name);
            crate::log(&format!("Inserting {} into {}", medium.display(), self.slot));
            session.attach_media(&self.slot, &medium)?;
            if let Some(key) = self.keypress {
                session.inject_scan_codes(&key.stroke())?;
            }
            inserted += 1;
        }

        Ok(inserted)
    }
}
