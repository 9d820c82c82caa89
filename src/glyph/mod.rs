//! Text recognition for fixed-grid text-mode screens.
//!
//! This module provides:
//! - Monochrome conversion and cell slicing (`preprocess`)
//! - Per-cell pixel keys (`key`)
//! - The persistent glyph map (`store`)
//! - Interactive training of unknown glyphs (`trainer`)
//! - Screen reading and profile selection (`reader`)

pub mod frame;
pub mod key;
pub mod preprocess;
pub mod reader;
pub mod store;
pub mod trainer;

pub use frame::Frame;
pub use preprocess::CellGeometry;
pub use reader::{ProfiledReader, ScreenReader};
pub use trainer::ConsoleTrainer;
