//! The glyph map and its JSON file.
//!
//! The file is a list of `[key, character code]` pairs sorted by key, so
//! that diffs between training sessions stay small and it can be edited by hand.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use super::key::PixelKey;
use crate::error::{PilotError, Result};

/// What an insertion displaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertReport {
    /// Character the key mapped to before, if it was already present.
    pub previous: Option<char>,
    /// Other keys that already map to the same character.
    pub other_keys: Vec<PixelKey>,
}

impl InsertReport {
    #[cfg(test)]
    pub fn is_collision(&self) -> bool {
        !self.other_keys.is_empty()
    }
}

/// Pixel key → character, with a reverse index for collision reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlyphMap {
    forward: BTreeMap<PixelKey, char>,
    reverse: HashMap<char, BTreeSet<PixelKey>>,
}

impl GlyphMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn get(&self, key: &PixelKey) -> Option<char> {
        self.forward.get(key).copied()
    }

    pub fn contains_key(&self, key: &PixelKey) -> bool {
        self.forward.contains_key(key)
    }

    /// Keys currently recognized as `ch`.
    pub fn keys_for(&self, ch: char) -> impl Iterator<Item = &PixelKey> {
        self.reverse.get(&ch).into_iter().flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PixelKey, char)> {
        self.forward.iter().map(|(k, &c)| (k, c))
    }

    /// Maps `key` to `ch`, reporting any other keys that already produce `ch`.
    pub fn insert(&mut self, key: PixelKey, ch: char) -> InsertReport {
        let other_keys: Vec<PixelKey> = self.keys_for(ch).filter(|k| **k != key).cloned().collect();

        let previous = self.forward.insert(key.clone(), ch);
        if let Some(old) = previous.filter(|&old| old != ch) {
            if let Some(keys) = self.reverse.get_mut(&old) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.reverse.remove(&old);
                }
            }
        }
        self.reverse.entry(ch).or_default().insert(key);

        InsertReport {
            previous,
            other_keys,
        }
    }

    /// Inserts only when the key is unknown. Returns whether it was added.
    pub fn insert_if_absent(&mut self, key: PixelKey, ch: char) -> bool {
        if self.contains_key(&key) {
            return false;
        }
        self.insert(key, ch);
        true
    }
}

impl FromIterator<(PixelKey, char)> for GlyphMap {
    fn from_iter<I: IntoIterator<Item = (PixelKey, char)>>(iter: I) -> Self {
        let mut map = GlyphMap::new();
        for (key, ch) in iter {
            map.insert(key, ch);
        }
        map
    }
}

/// Loads a glyph map; a missing file is an empty map.
///
/// Keys longer than `cell_height` are cut down to it.
pub fn load_map(path: &Path, cell_height: u32) -> Result<GlyphMap> {
    if !path.exists() {
        crate::log(&format!(
            "Glyph map {} not found, starting empty",
            path.display()
        ));
        return Ok(GlyphMap::new());
    }

    let contents = fs::read_to_string(path)?;
    let entries: Vec<(PixelKey, u32)> = serde_json::from_str(&contents)?;

    let mut map = GlyphMap::new();
    for (mut key, code) in entries {
        let ch = char::from_u32(code).ok_or_else(|| {
            PilotError::config(format!(
                "{}: {} is not a character code",
                path.display(),
                code
            ))
        })?;
        key.truncate(cell_height);
        map.insert(key, ch);
    }

    crate::log(&format!(
        "Loaded {} glyphs from {}",
        map.len(),
        path.display()
    ));
    Ok(map)
}

/// Writes the whole map, replacing the file in one rename.
pub fn save_map(map: &GlyphMap, path: &Path) -> Result<()> {
    let entries: Vec<(&PixelKey, u32)> = map.iter().map(|(k, c)| (k, c as u32)).collect();
    let json = serde_json::to_string_pretty(&entries)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(json.as_bytes())?;
    temp.write_all(b"\n")?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
