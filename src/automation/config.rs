//! Run configuration.
//!
//! Loaded once from config.json at startup and passed explicitly to every
//! component. Provides recognition profiles, media slot, menu keys and timing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PilotError, Result};
use crate::glyph::CellGeometry;
use crate::vm::ScanCode;

/// Character chart used to seed a glyph map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFont {
    /// Chart image; cell at `row * columns + col` is the character with that code
    pub image: PathBuf,
    /// Line height of the chart; defaults to the profile's cell height
    #[serde(default)]
    pub line_height: Option<u32>,
    #[serde(default)]
    pub line_offset: u32,
    /// Bits each scanline of the chart is shifted left to line up with the screen font
    #[serde(default)]
    pub left_shift: u32,
    /// Chart is drawn dark on light
    #[serde(default)]
    pub invert: bool,
}

/// Recognition settings for one host font and resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReaderProfile {
    pub glyph_map: PathBuf,
    pub cell_width: u32,
    pub cell_height: u32,
    /// Scanlines per text row on screen; defaults to the cell height
    #[serde(default)]
    pub line_height: Option<u32>,
    #[serde(default)]
    pub line_offset: u32,
    /// Luma above this is an "on" pixel
    #[serde(default)]
    pub threshold: u8,
    #[serde(default)]
    pub invert: bool,
    #[serde(default)]
    pub reference: Option<ReferenceFont>,
}

impl ReaderProfile {
    /// Grid of the captured screen.
    pub fn geometry(&self) -> CellGeometry {
        CellGeometry {
            cell_width: self.cell_width,
            cell_height: self.cell_height,
            line_height: self.line_height.unwrap_or(self.cell_height),
            line_offset: self.line_offset,
        }
    }

    /// Grid of the reference chart, if one is configured.
    pub fn reference_geometry(&self) -> Option<CellGeometry> {
        self.reference.as_ref().map(|reference| CellGeometry {
            cell_width: self.cell_width,
            cell_height: self.cell_height,
            line_height: reference.line_height.unwrap_or(self.cell_height),
            line_offset: reference.line_offset,
        })
    }

    fn resolve_paths(&mut self, base: &Path) {
        self.glyph_map = crate::paths::resolve(base, &self.glyph_map);
        if let Some(reference) = &mut self.reference {
            reference.image = crate::paths::resolve(base, &reference.image);
        }
    }
}

/// Polling intervals, all in milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Default interval between screen polls while waiting for text
    pub poll_interval_ms: u64,
    /// Pause before retrying after a failed capture
    pub transient_retry_ms: u64,
    /// Interval between polls while navigating a menu
    pub menu_poll_ms: u64,
    /// Pause after a menu poll that saw an unchanged screen without the item
    pub stall_poll_ms: u64,
    /// Pause after each key press
    pub key_delay_ms: u64,
    /// Give up after this many polls of one wait; unbounded when absent
    pub max_polls: Option<u32>,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            transient_retry_ms: 2000,
            menu_poll_ms: 500,
            stall_poll_ms: 2000,
            key_delay_ms: 100,
            max_polls: None,
        }
    }
}

impl Timing {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn transient_retry(&self) -> Duration {
        Duration::from_millis(self.transient_retry_ms)
    }

    pub fn menu_poll(&self) -> Duration {
        Duration::from_millis(self.menu_poll_ms)
    }

    pub fn stall_poll(&self) -> Duration {
        Duration::from_millis(self.stall_poll_ms)
    }

    pub fn key_delay(&self) -> Duration {
        Duration::from_millis(self.key_delay_ms)
    }
}

/// Keys and marker used to drive selection menus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuConfig {
    /// Confirms the highlighted item
    pub accept_key: ScanCode,
    /// Toggles or advances the highlighted item
    pub toggle_key: ScanCode,
    /// Character shown next to the selected item
    pub cursor: char,
}

impl Default for MenuConfig {
    fn default() -> Self {
        Self {
            accept_key: ScanCode::ENTER,
            toggle_key: ScanCode::SPACE,
            cursor: 'o',
        }
    }
}

/// Complete run configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Path to VBoxManage; the platform default when absent
    pub vboxmanage: Option<String>,
    /// Removable media slot, as `Controller-Port-Device`
    pub media_slot: String,
    pub default_profile: String,
    pub profiles: BTreeMap<String, ReaderProfile>,
    pub timing: Timing,
    pub menu: MenuConfig,
    /// Log every recognized screen
    pub echo_frames: bool,
}

fn default_profiles() -> BTreeMap<String, ReaderProfile> {
    let mut profiles = BTreeMap::new();
    // VirtualBox BIOS text mode
    profiles.insert(
        "bios".to_string(),
        ReaderProfile {
            glyph_map: PathBuf::from("ch_map_9x16.json"),
            cell_width: 9,
            cell_height: 16,
            line_height: None,
            line_offset: 0,
            threshold: 0,
            invert: false,
            reference: Some(ReferenceFont {
                image: PathBuf::from("vga9x16.png"),
                line_height: None,
                line_offset: 0,
                left_shift: 0,
                invert: false,
            }),
        },
    );
    // Guest VGA driver after the installer switches modes
    profiles.insert(
        "vga".to_string(),
        ReaderProfile {
            glyph_map: PathBuf::from("ch_map.json"),
            cell_width: 8,
            cell_height: 12,
            line_height: Some(14),
            line_offset: 0,
            threshold: 0,
            invert: false,
            reference: Some(ReferenceFont {
                image: PathBuf::from("pgcfont.png"),
                line_height: Some(16),
                line_offset: 1,
                left_shift: 1,
                invert: true,
            }),
        },
    );
    profiles
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            vboxmanage: None,
            media_slot: "Floppy-0-0".to_string(),
            default_profile: "bios".to_string(),
            profiles: default_profiles(),
            timing: Timing::default(),
            menu: MenuConfig::default(),
            echo_frames: false,
        }
    }
}

impl RunConfig {
    pub fn profile(&self, name: &str) -> Result<&ReaderProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| PilotError::config(format!("unknown recognition profile {:?}", name)))
    }

    /// Checks everything that would otherwise fail halfway through a run.
    pub fn validate(&self) -> Result<()> {
        self.profile(&self.default_profile)?;

        for (name, profile) in &self.profiles {
            let in_profile = |e: PilotError| PilotError::config(format!("profile {:?}: {}", name, e));
            profile.geometry().validate().map_err(in_profile)?;
            if let Some(geometry) = profile.reference_geometry() {
                geometry.validate().map_err(in_profile)?;
            }
            if let Some(reference) = &profile.reference {
                if reference.left_shift + profile.cell_width > 32 {
                    return Err(PilotError::config(format!(
                        "profile {:?}: left shift {} pushes a {} pixel cell past 32 bits",
                        name, reference.left_shift, profile.cell_width
                    )));
                }
            }
        }

        let timing = &self.timing;
        if timing.poll_interval_ms == 0 || timing.menu_poll_ms == 0 {
            return Err(PilotError::config("poll intervals must be positive"));
        }
        if timing.stall_poll_ms <= timing.menu_poll_ms {
            return Err(PilotError::config(format!(
                "stall_poll_ms ({}) must be longer than menu_poll_ms ({})",
                timing.stall_poll_ms, timing.menu_poll_ms
            )));
        }
        if timing.max_polls == Some(0) {
            return Err(PilotError::config("max_polls must be at least 1"));
        }

        if self.menu.accept_key == self.menu.toggle_key {
            return Err(PilotError::config("menu accept and toggle keys must differ"));
        }
        if self.media_slot.splitn(3, '-').count() != 3 {
            return Err(PilotError::config(format!(
                "media slot {:?} is not Controller-Port-Device",
                self.media_slot
            )));
        }

        Ok(())
    }

    /// Makes every relative path absolute against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        for profile in self.profiles.values_mut() {
            profile.resolve_paths(base);
        }
    }
}

/// Loads and validates the configuration at `path`.
///
/// A missing file yields the defaults. Relative paths inside the file are
/// taken relative to the directory holding it.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    crate::log(&format!("Looking for config at: {}", path.display()));

    let mut config = if path.exists() {
        let contents = fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&contents).map_err(|e| {
            PilotError::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        crate::log(&format!("Config loaded from {}", path.display()));
        config
    } else {
        crate::log(&format!(
            "{} not found. Using default config.",
            path.display()
        ));
        RunConfig::default()
    };

    let base = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    config.resolve_paths(&base);
    config.validate()?;
    Ok(config)
}
