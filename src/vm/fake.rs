//! In-memory `VmSession` that records every command, for tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use image::DynamicImage;

use super::{VmSession, VmState};
use crate::error::{PilotError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum VmEvent {
    Attach(String, PathBuf),
    Detach(String),
    Keys(Vec<u8>),
    Capture,
    Start,
    Reset,
}

#[derive(Default)]
pub struct FakeSession {
    pub state: Option<VmState>,
    pub screens: VecDeque<DynamicImage>,
    pub events: Vec<VmEvent>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            state: Some(VmState::PowerOff),
            ..Default::default()
        }
    }

    /// All injected key batches, in order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                VmEvent::Keys(codes) => Some(codes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Events other than screen captures.
    pub fn commands(&self) -> Vec<VmEvent> {
        self.events
            .iter()
            .filter(|e| **e != VmEvent::Capture)
            .cloned()
            .collect()
    }
}

impl VmSession for FakeSession {
    fn state(&mut self) -> Result<VmState> {
        self.state
            .clone()
            .ok_or_else(|| PilotError::config("no state configured"))
    }

    fn attach_media(&mut self, slot: &str, medium: &Path) -> Result<()> {
        self.events
            .push(VmEvent::Attach(slot.to_string(), medium.to_path_buf()));
        Ok(())
    }

    fn detach_media(&mut self, slot: &str) -> Result<()> {
        self.events.push(VmEvent::Detach(slot.to_string()));
        Ok(())
    }

    fn inject_scan_codes(&mut self, codes: &[u8]) -> Result<()> {
        self.events.push(VmEvent::Keys(codes.to_vec()));
        Ok(())
    }

    fn capture_screen(&mut self) -> Result<DynamicImage> {
        self.events.push(VmEvent::Capture);
        self.screens
            .pop_front()
            .ok_or_else(|| PilotError::transient("no more screens"))
    }

    fn start(&mut self) -> Result<()> {
        self.events.push(VmEvent::Start);
        self.state = Some(VmState::Running);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.events.push(VmEvent::Reset);
        Ok(())
    }
}
