//! VirtualBox session driven through the `VBoxManage` command-line tool.
//!
//! Each call runs one `VBoxManage` process and blocks until it exits.

use std::path::{Path, PathBuf};
use std::process::Command;

use image::DynamicImage;
use tempfile::NamedTempFile;

use super::{VmSession, VmState};
use crate::error::{PilotError, Result};

/// Returns the platform's usual `VBoxManage` location.
pub fn default_vboxmanage() -> PathBuf {
    if cfg!(windows) {
        let program_files = std::env::var_os("ProgramFilesW6432")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"));
        program_files.join("Oracle").join("VirtualBox").join("VBoxManage.exe")
    } else {
        PathBuf::from("VBoxManage")
    }
}

/// A named VirtualBox VM.
#[derive(Debug, Clone)]
pub struct VBoxManage {
    program: PathBuf,
    vm_name: String,
}

impl VBoxManage {
    pub fn new(program: impl Into<PathBuf>, vm_name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            vm_name: vm_name.into(),
        }
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    /// `showvminfo --machinereadable` as key/value pairs.
    pub fn info(&self) -> Result<Vec<(String, String)>> {
        let output = self.run(&["showvminfo", self.vm_name.as_str(), "--machinereadable"])?;
        read_vbox_pairs(&output)
    }

    /// Path of the medium currently in `slot`, if any.
    pub fn attached_medium(&self, slot: &str) -> Result<Option<String>> {
        let info = self.info()?;
        Ok(pairs_get(&info, slot)
            .filter(|value| *value != "emptydrive" && *value != "none")
            .map(str::to_string))
    }

    fn storage_attach(&self, slot: &str, medium: &str) -> Result<()> {
        let (controller, port, device) = split_slot(slot)?;
        self.run(&[
            "storageattach",
            self.vm_name.as_str(),
            "--storagectl",
            controller,
            "--port",
            port,
            "--device",
            device,
            "--type",
            "fdd",
            "--medium",
            medium,
        ])?;
        Ok(())
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program).args(args).output()?;

        if !output.status.success() {
            return Err(PilotError::Command {
                program: self.program.display().to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl VmSession for VBoxManage {
    fn state(&mut self) -> Result<VmState> {
        let info = self.info()?;
        let raw = pairs_get(&info, "VMState")
            .ok_or_else(|| PilotError::config(format!("no VMState reported for {}", self.vm_name)))?;
        Ok(VmState::parse(raw))
    }

    fn attach_media(&mut self, slot: &str, medium: &Path) -> Result<()> {
        if !medium.is_file() {
            return Err(PilotError::config(format!(
                "medium not found: {}",
                medium.display()
            )));
        }
        self.storage_attach(slot, &medium.to_string_lossy())
    }

    fn detach_media(&mut self, slot: &str) -> Result<()> {
        self.storage_attach(slot, "emptydrive")
    }

    fn inject_scan_codes(&mut self, codes: &[u8]) -> Result<()> {
        // keyboardputscancode without codes is a usage error
        if codes.is_empty() {
            return Ok(());
        }
        let hex: Vec<String> = codes.iter().map(|code| format!("{:02x}", code)).collect();
        let mut args = vec!["controlvm", self.vm_name.as_str(), "keyboardputscancode"];
        args.extend(hex.iter().map(String::as_str));
        self.run(&args)?;
        Ok(())
    }

    fn capture_screen(&mut self) -> Result<DynamicImage> {
        let temp = NamedTempFile::with_suffix(".png")?;
        let path = temp.path().to_string_lossy().to_string();

        self.run(&["controlvm", self.vm_name.as_str(), "screenshotpng", &path])
            .map_err(|e| PilotError::transient(format!("screenshot failed: {}", e)))?;

        image::open(temp.path())
            .map_err(|e| PilotError::transient(format!("unreadable screenshot: {}", e)))
    }

    fn start(&mut self) -> Result<()> {
        self.run(&["startvm", self.vm_name.as_str()])?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.run(&["controlvm", self.vm_name.as_str(), "reset"])?;
        Ok(())
    }
}

/// Splits a `Controller-Port-Device` slot such as `Floppy-0-0`.
fn split_slot(slot: &str) -> Result<(&str, &str, &str)> {
    let parts: Vec<&str> = slot.rsplitn(3, '-').collect();
    match parts.as_slice() {
        [device, port, controller] if !controller.is_empty() => Ok((*controller, *port, *device)),
        _ => Err(PilotError::config(format!(
            "media slot {:?} is not Controller-Port-Device",
            slot
        ))),
    }
}

/// Removes surrounding double quotes and undoes `\"` / `\\` escapes.
fn dequote(s: &str) -> String {
    match s.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => s.to_string(),
    }
}

/// Parses `--machinereadable` output into ordered key/value pairs.
pub fn read_vbox_pairs(output: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for line in output.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            PilotError::config(format!("unexpected VBoxManage output line: {:?}", line))
        })?;
        pairs.push((dequote(key), dequote(value)));
    }
    Ok(pairs)
}

pub fn pairs_get<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
