//! Installer scripts: a declarative list of steps run against the driver.
//!
//! A script is JSON: `{ "media_root": "...", "steps": [ { "kind": "wait", ... }, ... ] }`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::automation::config::RunConfig;
use crate::automation::driver::{Driver, MenuItem, Pacer, WaitOptions};
use crate::error::{PilotError, Result};
use crate::glyph::ScreenReader;
use crate::paths::resolve;
use crate::vm::{Keyboard, ScanCode, VmSession, VmState};

fn one() -> u32 {
    1
}

/// Screen text and what to do when it shows up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub target: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One script instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Wait until any of the targets is on screen
    Wait {
        targets: Vec<String>,
        interval_ms: Option<u64>,
        #[serde(default)]
        tolerate_errors: bool,
    },
    /// Wait for any case target, then run that case
    Branch {
        cases: Vec<Case>,
        interval_ms: Option<u64>,
        #[serde(default)]
        tolerate_errors: bool,
    },
    /// Keep answering case targets until `until` appears
    Respond {
        cases: Vec<Case>,
        until: String,
        interval_ms: Option<u64>,
        #[serde(default)]
        tolerate_errors: bool,
    },
    /// Pick a menu item with the toggle key
    Select {
        label: String,
        cursor: Option<char>,
        cursor_column: Option<usize>,
        prefix: Option<String>,
        suffix: Option<String>,
    },
    /// Insert a medium once the prompt appears
    SwapMedia {
        prompt: String,
        medium: PathBuf,
        interval_ms: Option<u64>,
    },
    /// Numbered prompts and media; `{n}` is replaced by first..first+count
    SwapMediaSet {
        prompt: String,
        medium: String,
        count: u32,
        #[serde(default = "one")]
        first: u32,
        interval_ms: Option<u64>,
    },
    TypeText {
        text: String,
    },
    Key {
        key: String,
        #[serde(default = "one")]
        repeat: u32,
    },
    AttachMedia {
        medium: PathBuf,
    },
    DetachMedia,
    /// Replace `to` with a writable copy of `from`
    CopyMedia {
        from: PathBuf,
        to: PathBuf,
    },
    ExpectState {
        state: VmState,
    },
    Start,
    Reset,
    Sleep {
        ms: u64,
    },
    /// Switch the recognition profile
    Profile {
        name: String,
    },
}

fn substitute(template: &str, n: u32) -> String {
    template.replace("{n}", &n.to_string())
}

impl Step {
    /// Prompt/medium pairs of a `swap_media_set`, in order.
    fn expand_set(prompt: &str, medium: &str, first: u32, count: u32) -> Vec<(String, PathBuf)> {
        (first..first.saturating_add(count))
            .map(|n| (substitute(prompt, n), PathBuf::from(substitute(medium, n))))
            .collect()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Wait { targets, .. } => write!(f, "Wait for {:?}", targets),
            Step::Branch { cases, .. } => {
                let targets: Vec<&str> = cases.iter().map(|c| c.target.as_str()).collect();
                write!(f, "Branch on {:?}", targets)
            }
            Step::Respond { until, .. } => write!(f, "Respond until {:?}", until),
            Step::Select { label, .. } => write!(f, "Select {:?}", label),
            Step::SwapMedia { prompt, medium, .. } => {
                write!(f, "Swap in {} at {:?}", medium.display(), prompt)
            }
            Step::SwapMediaSet {
                medium,
                count,
                first,
                ..
            } => write!(
                f,
                "Swap in {} for n = {}..{}",
                medium,
                first,
                first.saturating_add(*count)
            ),
            Step::TypeText { text } => write!(f, "Type {:?}", text),
            Step::Key { key, repeat } if *repeat == 1 => write!(f, "Press {}", key),
            Step::Key { key, repeat } => write!(f, "Press {} x{}", key, repeat),
            Step::AttachMedia { medium } => write!(f, "Insert {}", medium.display()),
            Step::DetachMedia => write!(f, "Eject medium"),
            Step::CopyMedia { from, to } => {
                write!(f, "Copy {} to {}", from.display(), to.display())
            }
            Step::ExpectState { state } => write!(f, "Expect VM {}", state),
            Step::Start => write!(f, "Start VM"),
            Step::Reset => write!(f, "Reset VM"),
            Step::Sleep { ms } => write!(f, "Sleep {}ms", ms),
            Step::Profile { name } => write!(f, "Use profile {}", name),
        }
    }
}

/// Where to begin a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Fresh,
    /// Skip top-level steps before this index
    ResumeFrom(usize),
}

impl RunMode {
    fn first_step(self) -> usize {
        match self {
            RunMode::Fresh => 0,
            RunMode::ResumeFrom(index) => index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallScript {
    /// Directory relative media paths are taken from
    #[serde(default)]
    pub media_root: Option<PathBuf>,
    pub steps: Vec<Step>,
}

impl InstallScript {
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PilotError::config(format!("invalid script: {}", e)))
    }

    /// Loads a script; a relative `media_root` is taken relative to the script file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| PilotError::config(format!("cannot read script {}: {}", path.display(), e)))?;
        let mut script: Self = serde_json::from_str(&contents)
            .map_err(|e| PilotError::config(format!("invalid script {}: {}", path.display(), e)))?;
        if let (Some(root), Some(dir)) = (&script.media_root, path.parent()) {
            script.media_root = Some(resolve(dir, root));
        }
        Ok(script)
    }

    /// Checks the steps from `first` on before anything is sent to the VM.
    ///
    /// Every medium read must exist unless an earlier `copy_media` produces it.
    pub fn validate(&self, first: usize, media_root: &Path, config: &RunConfig) -> Result<()> {
        let mut check = Validation {
            media_root,
            config,
            keyboard: Keyboard::us(),
            produced: HashSet::new(),
        };
        self.steps
            .iter()
            .skip(first)
            .try_for_each(|step| check.step(step))
    }
}

struct Validation<'a> {
    media_root: &'a Path,
    config: &'a RunConfig,
    keyboard: Keyboard,
    produced: HashSet<PathBuf>,
}

impl Validation<'_> {
    fn medium(&self, medium: &Path) -> Result<()> {
        let path = resolve(self.media_root, medium);
        if self.produced.contains(&path) || path.is_file() {
            Ok(())
        } else {
            Err(PilotError::config(format!("medium {} not found", path.display())))
        }
    }

    fn cases(&mut self, cases: &[Case]) -> Result<()> {
        cases
            .iter()
            .flat_map(|case| &case.steps)
            .try_for_each(|step| self.step(step))
    }

    fn step(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Wait { targets, .. } => targets_present(targets.iter().map(String::as_str)),
            Step::Branch { cases, .. } => {
                targets_present(cases.iter().map(|c| c.target.as_str()))?;
                self.cases(cases)
            }
            Step::Respond { cases, until, .. } => {
                targets_present(cases.iter().map(|c| c.target.as_str()))?;
                targets_present([until.as_str()])?;
                self.cases(cases)
            }
            Step::SwapMedia { prompt, medium, .. } => {
                targets_present([prompt.as_str()])?;
                self.medium(medium)
            }
            Step::AttachMedia { medium } => self.medium(medium),
            Step::SwapMediaSet {
                prompt,
                medium,
                count,
                first,
                ..
            } => {
                if *count == 0 || first.checked_add(*count).is_none() {
                    return Err(PilotError::config(format!(
                        "swap_media_set for {} needs 1..={} volumes starting at {}",
                        medium,
                        u32::MAX - first,
                        first
                    )));
                }
                targets_present([prompt.as_str()])?;
                Step::expand_set(prompt, medium, *first, *count)
                    .iter()
                    .try_for_each(|(_, medium)| self.medium(medium))
            }
            Step::CopyMedia { from, to } => {
                self.medium(from)?;
                self.produced.insert(resolve(self.media_root, to));
                Ok(())
            }
            Step::Key { key, .. } => parse_key(key).map(|_| ()),
            Step::TypeText { text } => self.keyboard.encode(text).map(|_| ()),
            Step::Profile { name } => {
                let profile = self.config.profile(name)?;
                match &profile.reference {
                    Some(reference) if !reference.image.is_file() => Err(PilotError::config(format!(
                        "reference image {} for profile {:?} not found",
                        reference.image.display(),
                        name
                    ))),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

/// Waiting on nothing, or on an empty string, never synchronizes with the guest.
fn targets_present<'a>(targets: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut any = false;
    for target in targets {
        if target.is_empty() {
            return Err(PilotError::config("empty text to wait for"));
        }
        any = true;
    }
    if any {
        Ok(())
    } else {
        Err(PilotError::config("nothing to wait for"))
    }
}

fn parse_key(name: &str) -> Result<ScanCode> {
    ScanCode::from_name(name).ok_or_else(|| PilotError::config(format!("unknown key {:?}", name)))
}

/// Replaces `to` with a writable copy of `from`.
pub fn copy_media(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        let mut permissions = fs::metadata(to)?.permissions();
        permissions.set_readonly(false);
        fs::set_permissions(to, permissions)?;
        fs::remove_file(to)?;
    }
    fs::copy(from, to)?;
    let mut permissions = fs::metadata(to)?.permissions();
    permissions.set_readonly(false);
    fs::set_permissions(to, permissions)?;
    Ok(())
}

/// Runs a script against a VM.
pub struct Interpreter<'d, V, R, P> {
    driver: &'d mut Driver<V, R, P>,
    media_root: PathBuf,
}

impl<'d, V: VmSession, R: ScreenReader, P: Pacer> Interpreter<'d, V, R, P> {
    pub fn new(driver: &'d mut Driver<V, R, P>, media_root: PathBuf) -> Self {
        Self { driver, media_root }
    }

    /// Validates, then executes the script's top-level steps from `mode` on.
    pub fn run(&mut self, script: &InstallScript, mode: RunMode) -> Result<()> {
        let total = script.steps.len();
        let first = mode.first_step();
        if first > 0 && first >= total {
            return Err(PilotError::config(format!(
                "cannot resume from step {}: script has {} steps",
                first, total
            )));
        }

        script.validate(first, &self.media_root, self.driver.config())?;
        if first > 0 {
            crate::log(&format!("Resuming at step {}/{}", first + 1, total));
        }

        for (i, step) in script.steps.iter().enumerate().skip(first) {
            crate::log(&format!("Step {}/{}: {}", i + 1, total, step));
            self.execute(step)?;
        }

        crate::log("Script complete");
        Ok(())
    }

    fn run_case(&mut self, case: &Case) -> Result<()> {
        for step in &case.steps {
            crate::log(&format!("  {}", step));
            self.execute(step)?;
        }
        Ok(())
    }

    fn execute(&mut self, step: &Step) -> Result<()> {
        let media = |path: &Path| resolve(&self.media_root, path);
        let wait_options = |interval_ms: &Option<u64>, tolerate: bool| WaitOptions {
            interval: interval_ms.map(Duration::from_millis),
            tolerate_transient: tolerate,
        };

        match step {
            Step::Wait {
                targets,
                interval_ms,
                tolerate_errors,
            } => {
                let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
                self.driver
                    .wait_for_text(&targets, wait_options(interval_ms, *tolerate_errors))?;
                Ok(())
            }

            Step::Branch {
                cases,
                interval_ms,
                tolerate_errors,
            } => {
                let targets: Vec<&str> = cases.iter().map(|c| c.target.as_str()).collect();
                let found = self
                    .driver
                    .wait_for_text(&targets, wait_options(interval_ms, *tolerate_errors))?;
                match cases.iter().find(|c| c.target == found) {
                    Some(case) => self.run_case(case),
                    None => Ok(()),
                }
            }

            Step::Respond {
                cases,
                until,
                interval_ms,
                tolerate_errors,
            } => {
                let mut targets: Vec<&str> = cases.iter().map(|c| c.target.as_str()).collect();
                targets.push(until);
                loop {
                    let found = self
                        .driver
                        .wait_for_text(&targets, wait_options(interval_ms, *tolerate_errors))?;
                    if found == until.as_str() {
                        return Ok(());
                    }
                    if let Some(case) = cases.iter().find(|c| c.target == found) {
                        self.run_case(case)?;
                    }
                }
            }

            Step::Select {
                label,
                cursor,
                cursor_column,
                prefix,
                suffix,
            } => {
                let mut item = MenuItem::new(label).with_affixes(
                    prefix.as_deref().unwrap_or(" "),
                    suffix.as_deref().unwrap_or(" "),
                );
                if let Some(cursor) = cursor {
                    item = item.with_cursor(*cursor);
                }
                if let Some(column) = cursor_column {
                    item = item.at_column(*column);
                }
                self.driver.select_menu_item(&item)
            }

            Step::SwapMedia {
                prompt,
                medium,
                interval_ms,
            } => {
                let medium = media(medium);
                self.driver
                    .swap_media_on_prompt(prompt, &medium, interval_ms.map(Duration::from_millis))
            }

            Step::SwapMediaSet {
                prompt,
                medium,
                count,
                first,
                interval_ms,
            } => {
                for (prompt, medium) in Step::expand_set(prompt, medium, *first, *count) {
                    let medium = media(&medium);
                    self.driver.swap_media_on_prompt(
                        &prompt,
                        &medium,
                        interval_ms.map(Duration::from_millis),
                    )?;
                }
                Ok(())
            }

            Step::TypeText { text } => self.driver.type_text(text),

            Step::Key { key, repeat } => {
                let key = parse_key(key)?;
                self.driver.press_key(key, *repeat)
            }

            Step::AttachMedia { medium } => {
                let medium = media(medium);
                if !medium.is_file() {
                    return Err(PilotError::config(format!(
                        "medium {} not found",
                        medium.display()
                    )));
                }
                self.driver.attach_media(&medium)
            }

            Step::DetachMedia => self.driver.detach_media(),

            Step::CopyMedia { from, to } => copy_media(&media(from), &media(to)),

            Step::ExpectState { state } => self.driver.expect_state(state),

            Step::Start => self.driver.start(),

            Step::Reset => self.driver.reset(),

            Step::Sleep { ms } => {
                self.driver.sleep(Duration::from_millis(*ms));
                Ok(())
            }

            Step::Profile { name } => self.driver.select_profile(name),
        }
    }
}
