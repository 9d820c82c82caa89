//! Installer automation for text-mode guests.
//!
//! This module provides:
//! - Run configuration loaded from config.json (`config`)
//! - Polling primitives that keep the automation in step with the guest (`driver`)
//! - Declarative installer scripts and their interpreter (`script`)

pub mod config;
pub mod driver;
pub mod script;
