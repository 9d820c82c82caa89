//! Screen text recognition.
//!
//! Every character cell is reduced to a [`PixelKey`] and looked up in the
//! glyph map. Reverse-video cells match through the complement key; anything
//! else is handed to a [`GlyphTrainer`] and the answer is stored right away.

use std::collections::BTreeMap;
use std::path::PathBuf;

use image::DynamicImage;

use super::frame::Frame;
use super::key::PixelKey;
use super::preprocess::{cut_cells, to_monochrome, Cell, CellGeometry};
use super::store::{load_map, save_map, GlyphMap};
use super::trainer::{GlyphTrainer, TrainingRequest};
use crate::automation::config::{ReaderProfile, RunConfig};
use crate::error::{PilotError, Result};
use crate::vm::VmSession;

/// Recognizer for one font and grid layout.
pub struct TextReader {
    name: String,
    geometry: CellGeometry,
    threshold: u8,
    invert: bool,
    map: GlyphMap,
    map_path: PathBuf,
}

impl TextReader {
    pub fn new(name: impl Into<String>, geometry: CellGeometry, map: GlyphMap, map_path: PathBuf) -> Self {
        Self {
            name: name.into(),
            geometry,
            threshold: 0,
            invert: false,
            map,
            map_path,
        }
    }

    pub fn with_polarity(mut self, threshold: u8, invert: bool) -> Self {
        self.threshold = threshold;
        self.invert = invert;
        self
    }

    /// Loads the profile's glyph map, seeds it from the reference chart if
    /// one is configured, and makes the empty cell read as a space.
    pub fn open(name: &str, profile: &ReaderProfile) -> Result<Self> {
        let geometry = profile.geometry();
        geometry.validate()?;

        let map = load_map(&profile.glyph_map, geometry.cell_height)?;
        let mut reader = Self::new(name, geometry, map, profile.glyph_map.clone())
            .with_polarity(profile.threshold, profile.invert);

        if let (Some(reference), Some(reference_geometry)) =
            (&profile.reference, profile.reference_geometry())
        {
            if !reference.image.is_file() {
                return Err(PilotError::config(format!(
                    "reference image {} for profile {:?} not found",
                    reference.image.display(),
                    name
                )));
            }
            let chart = image::open(&reference.image)?;
            let added = reader.bootstrap(
                &chart,
                &reference_geometry,
                reference.left_shift,
                reference.invert,
            )?;
            crate::log(&format!(
                "Profile {}: {} glyphs seeded from {}",
                name,
                added,
                reference.image.display()
            ));
        }

        reader.prefer_space_for_blank();
        Ok(reader)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn map(&self) -> &GlyphMap {
        &self.map
    }

    /// Adds the characters of a reference chart to the map.
    ///
    /// The cell at `(row, col)` is the character whose code is
    /// `row * columns + col`. Keys already in the map keep their character.
    /// Returns how many entries were added; the map is saved if any were.
    pub fn bootstrap(
        &mut self,
        chart: &DynamicImage,
        geometry: &CellGeometry,
        left_shift: u32,
        invert: bool,
    ) -> Result<usize> {
        geometry.validate()?;
        let mono = to_monochrome(chart, 0, invert);
        let (columns, _, cells) = cut_cells(&mono, geometry)
            .map_err(|e| PilotError::config(format!("reference chart: {}", e)))?;

        let mut added = 0;
        for cell in cells {
            let Some(ch) = char::from_u32(cell.row * columns + cell.col) else {
                continue;
            };
            let key = PixelKey::from_cell(&cell.image, left_shift);
            if self.map.insert_if_absent(key, ch) {
                added += 1;
            }
        }

        if added > 0 {
            save_map(&self.map, &self.map_path)?;
        }
        Ok(added)
    }

    /// Maps the all-zero key to `' '`, whatever the chart said.
    pub fn prefer_space_for_blank(&mut self) {
        self.map.insert(PixelKey::blank(self.geometry.cell_height), ' ');
    }

    /// Reads all text lines of a screen image.
    ///
    /// An image that does not fit the grid is a transient failure: the
    /// guest is probably between display modes.
    pub fn read_image(&mut self, screen: &DynamicImage, trainer: &mut dyn GlyphTrainer) -> Result<Frame> {
        let mono = to_monochrome(screen, self.threshold, self.invert);
        let (columns, rows, cells) = cut_cells(&mono, &self.geometry)
            .map_err(|e| PilotError::transient(format!("profile {}: {}", self.name, e)))?;

        let mut lines = vec![String::with_capacity(columns as usize); rows as usize];
        for cell in &cells {
            let ch = self.recognize(cell, trainer)?;
            lines[cell.row as usize].push(ch);
        }
        Ok(Frame::new(lines))
    }

    /// Captures the screen and reads it.
    pub fn read(&mut self, session: &mut dyn VmSession, trainer: &mut dyn GlyphTrainer) -> Result<Frame> {
        let screen = session.capture_screen()?;
        self.read_image(&screen, trainer)
    }

    fn lookup(&self, key: &PixelKey) -> Option<char> {
        self.map
            .get(key)
            .or_else(|| self.map.get(&key.complement(self.geometry.cell_width)))
    }

    fn recognize(&mut self, cell: &Cell, trainer: &mut dyn GlyphTrainer) -> Result<char> {
        let key = PixelKey::from_cell(&cell.image, 0);
        if let Some(ch) = self.lookup(&key) {
            return Ok(ch);
        }

        let ch = trainer.identify(&TrainingRequest {
            cell: &cell.image,
            key: &key,
            row: cell.row,
            col: cell.col,
            map_path: &self.map_path,
        })?;

        let report = self.map.insert(key.clone(), ch);
        for old_key in &report.other_keys {
            crate::log(&format!(
                "Warning: ({},{}) {:?}: old value {} new value {}",
                cell.row, cell.col, ch, old_key, key
            ));
        }
        save_map(&self.map, &self.map_path)?;
        Ok(ch)
    }
}

/// Source of recognized screens for the automation driver.
pub trait ScreenReader {
    fn read_frame(&mut self, session: &mut dyn VmSession) -> Result<Frame>;

    /// Switches to another recognition profile.
    fn select_profile(&mut self, name: &str) -> Result<()> {
        Err(PilotError::config(format!(
            "cannot switch to profile {:?}: reader has no profiles",
            name
        )))
    }
}

/// All configured profiles plus the trainer shared between them.
///
/// A profile's glyph map and reference chart are loaded the first time the
/// profile is selected.
pub struct ProfiledReader {
    readers: BTreeMap<String, TextReader>,
    unopened: BTreeMap<String, ReaderProfile>,
    active: String,
    trainer: Box<dyn GlyphTrainer>,
}

impl ProfiledReader {
    pub fn new(
        readers: impl IntoIterator<Item = TextReader>,
        active: &str,
        trainer: Box<dyn GlyphTrainer>,
    ) -> Result<Self> {
        let readers: BTreeMap<String, TextReader> = readers
            .into_iter()
            .map(|reader| (reader.name().to_string(), reader))
            .collect();
        if !readers.contains_key(active) {
            return Err(PilotError::config(format!("unknown recognition profile {:?}", active)));
        }
        Ok(Self {
            readers,
            unopened: BTreeMap::new(),
            active: active.to_string(),
            trainer,
        })
    }

    /// Opens `active` from the configuration; the other profiles open on demand.
    pub fn open(config: &RunConfig, active: &str, trainer: Box<dyn GlyphTrainer>) -> Result<Self> {
        let reader = TextReader::open(active, config.profile(active)?)?;
        let mut profiled = Self::new([reader], active, trainer)?;
        profiled.unopened = config
            .profiles
            .iter()
            .filter(|(name, _)| name.as_str() != active)
            .map(|(name, profile)| (name.clone(), profile.clone()))
            .collect();
        Ok(profiled)
    }

    #[cfg(test)]
    pub fn active(&self) -> &str {
        &self.active
    }
}

impl ScreenReader for ProfiledReader {
    fn read_frame(&mut self, session: &mut dyn VmSession) -> Result<Frame> {
        let reader = self
            .readers
            .get_mut(&self.active)
            .ok_or_else(|| PilotError::config(format!("unknown recognition profile {:?}", self.active)))?;
        reader.read(session, self.trainer.as_mut())
    }

    fn select_profile(&mut self, name: &str) -> Result<()> {
        if !self.readers.contains_key(name) {
            let profile = self
                .unopened
                .get(name)
                .ok_or_else(|| PilotError::config(format!("unknown recognition profile {:?}", name)))?;
            let reader = TextReader::open(name, profile)?;
            self.unopened.remove(name);
            self.readers.insert(name.to_string(), reader);
        }
        if self.active != name {
            crate::log(&format!("Switching recognition profile: {} -> {}", self.active, name));
            self.active = name.to_string();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::config::ReferenceFont;
    use crate::glyph::trainer::scripted::ScriptedTrainer;
    use crate::vm::fake::FakeSession;
    use image::{GrayImage, Luma};
    use tempfile::tempdir;

    const TOP: &str = "ABCDEFGHIJKLMNOP";
    const BOTTOM: &str = "abcdefghijklmnop";

    /// Key of test glyph `i`: a distinct top scanline, the rest dark.
    fn glyph(i: u32, height: u32) -> PixelKey {
        let mut rows = vec![0; height as usize];
        rows[0] = i + 1;
        PixelKey::new(rows)
    }

    /// Draws keys into a screen image, `columns` cells per row.
    fn render(keys: &[PixelKey], columns: u32, geometry: &CellGeometry) -> DynamicImage {
        let rows = (keys.len() as u32).div_ceil(columns);
        let mut img = GrayImage::new(columns * geometry.cell_width, rows * geometry.line_height);
        for (i, key) in keys.iter().enumerate() {
            let (row, col) = (i as u32 / columns, i as u32 % columns);
            for (y, bits) in key.rows().iter().enumerate() {
                for x in 0..geometry.cell_width {
                    if bits & (1 << x) != 0 {
                        img.put_pixel(
                            col * geometry.cell_width + x,
                            row * geometry.line_height + geometry.line_offset + y as u32,
                            Luma([255]),
                        );
                    }
                }
            }
        }
        DynamicImage::ImageLuma8(img)
    }

    #[test]
    fn test_sixteen_by_two_screen_with_one_unknown_glyph() {
        let dir = tempdir().unwrap();
        let map_path = dir.path().join("ch_map.json");
        let geometry = CellGeometry::tight(8, 8);
        let chars: Vec<char> = TOP.chars().chain(BOTTOM.chars()).collect();

        // Everything but the 'e' at (1, 4) is known
        let map: GlyphMap = chars
            .iter()
            .enumerate()
            .filter(|&(_, &ch)| ch != 'e')
            .map(|(i, &ch)| (glyph(i as u32, 8), ch))
            .collect();
        let keys: Vec<PixelKey> = (0..32).map(|i| glyph(i, 8)).collect();

        let mut reader = TextReader::new("test", geometry, map, map_path.clone());
        let mut trainer = ScriptedTrainer::new("e");
        let frame = reader
            .read_image(&render(&keys, 16, &geometry), &mut trainer)
            .unwrap();

        assert_eq!(frame.lines(), &[TOP.to_string(), BOTTOM.to_string()]);
        assert_eq!(trainer.asked, vec![(1, 4, glyph(20, 8))]);

        let saved = load_map(&map_path, 8).unwrap();
        assert_eq!(saved.len(), 32);
        assert_eq!(saved.get(&glyph(20, 8)), Some('e'));

        // Second read needs no help
        let mut silent = ScriptedTrainer::new("");
        let again = reader
            .read_image(&render(&keys, 16, &geometry), &mut silent)
            .unwrap();
        assert_eq!(again, frame);
        assert!(silent.asked.is_empty());
    }

    #[test]
    fn test_reverse_video_matches_known_glyph() {
        let dir = tempdir().unwrap();
        let geometry = CellGeometry::tight(8, 8);
        let map: GlyphMap = [(glyph(0, 8), 'A')].into_iter().collect();
        let mut reader = TextReader::new("test", geometry, map, dir.path().join("m.json"));

        let screen = render(&[glyph(0, 8).complement(8), glyph(0, 8)], 2, &geometry);
        let mut trainer = ScriptedTrainer::new("");
        let frame = reader.read_image(&screen, &mut trainer).unwrap();

        assert_eq!(frame.lines(), &["AA".to_string()]);
        assert!(trainer.asked.is_empty());
        assert!(!dir.path().join("m.json").exists());
    }

    #[test]
    fn test_collision_is_stored_anyway() {
        let dir = tempdir().unwrap();
        let geometry = CellGeometry::tight(8, 8);
        let map: GlyphMap = [(glyph(0, 8), 'l')].into_iter().collect();
        let mut reader = TextReader::new("test", geometry, map, dir.path().join("m.json"));

        let screen = render(&[glyph(0, 8), glyph(1, 8)], 2, &geometry);
        let frame = reader
            .read_image(&screen, &mut ScriptedTrainer::new("l"))
            .unwrap();

        assert_eq!(frame.lines(), &["ll".to_string()]);
        assert_eq!(reader.map().keys_for('l').count(), 2);
    }

    #[test]
    fn test_blank_cells_read_as_spaces() {
        let dir = tempdir().unwrap();
        let geometry = CellGeometry {
            cell_width: 8,
            cell_height: 12,
            line_height: 14,
            line_offset: 0,
        };
        let mut reader = TextReader::new("vga", geometry, GlyphMap::new(), dir.path().join("m.json"));
        reader.prefer_space_for_blank();

        let screen = DynamicImage::ImageLuma8(GrayImage::new(80, 28));
        let frame = reader.read_image(&screen, &mut ScriptedTrainer::new("")).unwrap();

        assert_eq!(frame.lines(), &[" ".repeat(10), " ".repeat(10)]);
    }

    #[test]
    fn test_screen_not_fitting_grid_is_transient() {
        let dir = tempdir().unwrap();
        let mut reader = TextReader::new(
            "bios",
            CellGeometry::tight(9, 16),
            GlyphMap::new(),
            dir.path().join("m.json"),
        );
        let screen = DynamicImage::ImageLuma8(GrayImage::new(640, 480));

        let err = reader
            .read_image(&screen, &mut ScriptedTrainer::new(""))
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_bootstrap_keeps_existing_entries_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let map_path = dir.path().join("ch_map.json");
        let geometry = CellGeometry::tight(8, 8);
        let chart_geometry = CellGeometry {
            cell_width: 8,
            cell_height: 8,
            line_height: 10,
            line_offset: 1,
        };
        // 16 x 6 chart, codes 0..96
        let keys: Vec<PixelKey> = (0..96).map(|i| glyph(i, 8)).collect();
        let chart = render(&keys, 16, &chart_geometry);

        let existing: GlyphMap = [(glyph(65, 8), 'Z')].into_iter().collect();
        let mut reader = TextReader::new("test", geometry, existing, map_path.clone());

        assert_eq!(reader.bootstrap(&chart, &chart_geometry, 0, false).unwrap(), 95);
        assert_eq!(reader.map().get(&glyph(65, 8)), Some('Z'));
        assert_eq!(reader.map().get(&glyph(66, 8)), Some('B'));
        assert_eq!(load_map(&map_path, 8).unwrap(), reader.map().clone());

        let before = reader.map().clone();
        assert_eq!(reader.bootstrap(&chart, &chart_geometry, 0, false).unwrap(), 0);
        assert_eq!(reader.map(), &before);
    }

    #[test]
    fn test_bootstrap_with_shift_and_inverted_chart() {
        let dir = tempdir().unwrap();
        let geometry = CellGeometry::tight(8, 2);
        // Dark-on-light chart of two glyphs whose first column is lit
        let mut chart = GrayImage::from_pixel(16, 2, Luma([255]));
        chart.put_pixel(0, 0, Luma([0]));
        chart.put_pixel(8, 1, Luma([0]));

        let mut reader = TextReader::new("test", geometry, GlyphMap::new(), dir.path().join("m.json"));
        reader
            .bootstrap(&DynamicImage::ImageLuma8(chart), &geometry, 1, true)
            .unwrap();

        assert_eq!(reader.map().get(&PixelKey::new(vec![0b10, 0])), Some('\u{0}'));
        assert_eq!(reader.map().get(&PixelKey::new(vec![0, 0b10])), Some('\u{1}'));
    }

    #[test]
    fn test_open_with_missing_reference_image() {
        let dir = tempdir().unwrap();
        let profile = ReaderProfile {
            glyph_map: dir.path().join("ch_map.json"),
            cell_width: 8,
            cell_height: 12,
            line_height: Some(14),
            line_offset: 0,
            threshold: 0,
            invert: false,
            reference: Some(ReferenceFont {
                image: dir.path().join("pgcfont.png"),
                line_height: Some(16),
                line_offset: 1,
                left_shift: 1,
                invert: true,
            }),
        };

        let err = TextReader::open("vga", &profile).err().unwrap();
        assert!(matches!(err, PilotError::Configuration(_)));

        let without_chart = ReaderProfile {
            reference: None,
            ..profile
        };
        let reader = TextReader::open("vga", &without_chart).unwrap();
        assert_eq!(reader.map().get(&PixelKey::blank(12)), Some(' '));
    }

    #[test]
    fn test_profiled_reader_switches_profiles() {
        let dir = tempdir().unwrap();
        let small = CellGeometry::tight(8, 8);
        let large = CellGeometry::tight(9, 16);
        let narrow: GlyphMap = [(glyph(0, 8), 'x')].into_iter().collect();
        let readers = vec![
            TextReader::new("narrow", small, narrow, dir.path().join("a.json")),
            TextReader::new("wide", large, GlyphMap::new(), dir.path().join("b.json")),
        ];
        let mut reader =
            ProfiledReader::new(readers, "narrow", Box::new(ScriptedTrainer::new(""))).unwrap();

        let mut session = FakeSession::new();
        session.screens.push_back(render(&[glyph(0, 8)], 1, &small));
        assert_eq!(reader.read_frame(&mut session).unwrap().lines(), &["x".to_string()]);

        reader.select_profile("wide").unwrap();
        assert_eq!(reader.active(), "wide");
        session.screens.push_back(render(&[glyph(0, 8)], 1, &small));
        assert!(reader.read_frame(&mut session).unwrap_err().is_transient());

        assert!(matches!(
            reader.select_profile("cga"),
            Err(PilotError::Configuration(_))
        ));
        assert_eq!(reader.active(), "wide");
    }

    #[test]
    fn test_profiles_open_when_first_selected() {
        let dir = tempdir().unwrap();
        let profile = |map: &str, reference: Option<ReferenceFont>| ReaderProfile {
            glyph_map: dir.path().join(map),
            cell_width: 8,
            cell_height: 8,
            line_height: None,
            line_offset: 0,
            threshold: 0,
            invert: false,
            reference,
        };
        let mut config = RunConfig::default();
        config.profiles.clear();
        config
            .profiles
            .insert("plain".to_string(), profile("plain.json", None));
        config.profiles.insert(
            "charted".to_string(),
            profile(
                "charted.json",
                Some(ReferenceFont {
                    image: dir.path().join("missing.png"),
                    line_height: None,
                    line_offset: 0,
                    left_shift: 0,
                    invert: false,
                }),
            ),
        );
        config
            .profiles
            .insert("spare".to_string(), profile("spare.json", None));

        let mut reader =
            ProfiledReader::open(&config, "plain", Box::new(ScriptedTrainer::new(""))).unwrap();
        assert_eq!(reader.active(), "plain");

        let err = reader.select_profile("charted").unwrap_err();
        assert!(matches!(err, PilotError::Configuration(_)));
        assert_eq!(reader.active(), "plain");

        reader.select_profile("spare").unwrap();
        assert_eq!(reader.active(), "spare");
        reader.select_profile("plain").unwrap();
        assert_eq!(reader.active(), "plain");

        assert!(ProfiledReader::open(&config, "charted", Box::new(ScriptedTrainer::new(""))).is_err());
    }
}
