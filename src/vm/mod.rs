//! Boundary to the virtual machine being driven.
//!
//! This module provides:
//! - The `VmSession` trait: the only primitives higher layers may use
//! - VirtualBox implementation on top of `VBoxManage` (`vboxmanage`)
//! - Scan code table and literal text encoder (`scancode`)

pub mod scancode;
pub mod vboxmanage;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::path::Path;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use scancode::{Keyboard, ScanCode};
pub use vboxmanage::VBoxManage;

/// Power state reported by the VM host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    PowerOff,
    Running,
    Paused,
    Saved,
    Aborted,
    #[serde(untagged)]
    Other(String),
}

impl VmState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "poweroff" => Self::PowerOff,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "saved" => Self::Saved,
            "aborted" => Self::Aborted,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::PowerOff => write!(f, "poweroff"),
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Saved => write!(f, "saved"),
            VmState::Aborted => write!(f, "aborted"),
            VmState::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// One named virtual machine. Every call goes to the host; nothing is cached.
///
/// `slot` is an opaque removable-media slot identifier; its addressing is the
/// implementation's concern.
pub trait VmSession {
    fn state(&mut self) -> Result<VmState>;

    fn attach_media(&mut self, slot: &str, medium: &Path) -> Result<()>;

    fn detach_media(&mut self, slot: &str) -> Result<()>;

    /// Sends raw make/break codes in one batch.
    fn inject_scan_codes(&mut self, codes: &[u8]) -> Result<()>;

    fn capture_screen(&mut self) -> Result<DynamicImage>;

    fn start(&mut self) -> Result<()>;

    fn reset(&mut self) -> Result<()>;
}
