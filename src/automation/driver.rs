//! Synchronization primitives between the automation and the guest screen.
//!
//! Every primitive polls the recognized screen, sleeps a fixed interval
//! between polls and gives up with `Desynchronized` once `max_polls` is hit.

use std::path::Path;
use std::time::Duration;

use crate::automation::config::RunConfig;
use crate::error::{PilotError, Result};
use crate::glyph::{Frame, ScreenReader};
use crate::vm::{Keyboard, ScanCode, VmSession, VmState};

/// Blocks between polls.
pub trait Pacer {
    fn sleep(&mut self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// How to wait for text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// Poll interval; the configured default when `None`
    pub interval: Option<Duration>,
    /// Keep polling through transient capture failures
    pub tolerate_transient: bool,
}

impl WaitOptions {
    #[cfg(test)]
    pub fn every(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            tolerate_transient: false,
        }
    }

    #[cfg(test)]
    pub fn tolerating_transient(mut self) -> Self {
        self.tolerate_transient = true;
        self
    }
}

/// A menu entry selected by toggling until the cursor marker is next to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuItem<'a> {
    pub label: &'a str,
    /// Cursor marker; the configured one when `None`
    pub cursor: Option<char>,
    /// Fixed column the marker appears in, counted in characters
    pub cursor_column: Option<usize>,
    pub prefix: &'a str,
    pub suffix: &'a str,
}

impl<'a> MenuItem<'a> {
    pub fn new(label: &'a str) -> Self {
        Self {
            label,
            cursor: None,
            cursor_column: None,
            prefix: " ",
            suffix: " ",
        }
    }

    pub fn at_column(mut self, column: usize) -> Self {
        self.cursor_column = Some(column);
        self
    }

    pub fn with_cursor(mut self, cursor: char) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_affixes(mut self, prefix: &'a str, suffix: &'a str) -> Self {
        self.prefix = prefix;
        self.suffix = suffix;
        self
    }

    fn text(&self) -> String {
        format!("{}{}{}", self.prefix, self.label, self.suffix)
    }
}

/// True if the marker shows `text` on `line` as the highlighted item.
fn is_selected(line: &str, text: &str, cursor: char, column: Option<usize>) -> bool {
    match column {
        Some(column) => line.chars().nth(column) == Some(cursor),
        None => line
            .find(text)
            .is_some_and(|pos| line[..pos].contains(cursor)),
    }
}

/// Drives one VM through its screen and keyboard.
pub struct Driver<V, R, P = ThreadPacer> {
    session: V,
    reader: R,
    pacer: P,
    config: RunConfig,
    keyboard: Keyboard,
}

impl<V: VmSession, R: ScreenReader, P: Pacer> Driver<V, R, P> {
    pub fn new(session: V, reader: R, pacer: P, config: RunConfig) -> Self {
        Self {
            session,
            reader,
            pacer,
            config,
            keyboard: Keyboard::us(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn session(&self) -> &V {
        &self.session
    }

    #[cfg(test)]
    pub fn reader(&self) -> &R {
        &self.reader
    }

    #[cfg(test)]
    pub fn pacer(&self) -> &P {
        &self.pacer
    }

    /// Captures and recognizes the current screen.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let frame = self.reader.read_frame(&mut self.session)?;
        if self.config.echo_frames {
            for line in frame.lines() {
                crate::log(&format!("| {}", line));
            }
        }
        Ok(frame)
    }

    pub fn select_profile(&mut self, name: &str) -> Result<()> {
        self.reader.select_profile(name)
    }

    pub fn sleep(&mut self, duration: Duration) {
        self.pacer.sleep(duration);
    }

    fn check_poll_bound(&self, polls: u32, expected: impl FnOnce() -> String) -> Result<()> {
        match self.config.timing.max_polls {
            Some(max) if polls >= max => Err(PilotError::Desynchronized {
                expected: expected(),
                polls,
            }),
            _ => Ok(()),
        }
    }

    /// Polls until one of `targets` is on screen and returns it.
    ///
    /// Lines are scanned top to bottom; within a line the earlier target wins.
    pub fn wait_for_text<'t>(&mut self, targets: &[&'t str], options: WaitOptions) -> Result<&'t str> {
        let interval = options.interval.unwrap_or(self.config.timing.poll_interval());
        let mut polls = 0;

        loop {
            let frame = match self.read_frame() {
                Ok(frame) => frame,
                Err(e) if options.tolerate_transient && e.is_transient() => {
                    crate::log(&format!("Warning: {}; retrying", e));
                    self.pacer.sleep(self.config.timing.transient_retry());
                    continue;
                }
                Err(e) => return Err(e),
            };
            polls += 1;

            if let Some(found) = frame.find_first(targets) {
                crate::log(&format!("Found {:?}", found));
                return Ok(found);
            }

            self.check_poll_bound(polls, || format!("{:?}", targets))?;
            crate::log(&format!("Waiting for {:?}", targets));
            self.pacer.sleep(interval);
        }
    }

    /// Moves the menu cursor onto `item` with the toggle key, then accepts it.
    pub fn select_menu_item(&mut self, item: &MenuItem<'_>) -> Result<()> {
        let text = item.text();
        let cursor = item.cursor.unwrap_or(self.config.menu.cursor);
        let mut previous: Option<Frame> = None;
        let mut toggled = false;
        let mut polls = 0;

        loop {
            let frame = self.read_frame()?;
            polls += 1;
            let unchanged = previous.as_ref() == Some(&frame);
            let line = frame.lines().iter().find(|line| line.contains(&text));

            match line {
                Some(_) if unchanged && toggled => {
                    // Screen has not caught up with the last toggle
                    crate::log("Menu not refreshed yet, retrying");
                    self.pacer.sleep(self.config.timing.menu_poll());
                }
                Some(line) if is_selected(line, &text, cursor, item.cursor_column) => {
                    crate::log(&format!("Selecting {:?}", item.label));
                    self.press_key(self.config.menu.accept_key, 1)?;
                    return Ok(());
                }
                Some(_) => {
                    self.press_key(self.config.menu.toggle_key, 1)?;
                    toggled = true;
                }
                None => {
                    toggled = false;
                    crate::log(&format!("Waiting for menu item {:?}", text));
                    let pause = if unchanged {
                        self.config.timing.stall_poll()
                    } else {
                        self.config.timing.menu_poll()
                    };
                    self.pacer.sleep(pause);
                }
            }

            self.check_poll_bound(polls, || format!("menu item {:?}", text))?;
            previous = Some(frame);
        }
    }

    /// Waits for `prompt`, inserts `medium` into the media slot and presses the accept key.
    pub fn swap_media_on_prompt(&mut self, prompt: &str, medium: &Path, interval: Option<Duration>) -> Result<()> {
        if !medium.is_file() {
            return Err(PilotError::config(format!(
                "medium {} not found",
                medium.display()
            )));
        }
        let options = WaitOptions {
            interval,
            tolerate_transient: false,
        };
        self.wait_for_text(&[prompt], options)?;
        self.attach_media(medium)?;
        self.press_key(self.config.menu.accept_key, 1)
    }

    /// Types `text` as one batch of scan codes.
    pub fn type_text(&mut self, text: &str) -> Result<()> {
        let codes = self.keyboard.encode(text)?;
        if codes.is_empty() {
            return Ok(());
        }
        self.session.inject_scan_codes(&codes)?;
        self.pacer.sleep(self.config.timing.key_delay());
        Ok(())
    }

    /// Presses and releases `key` `repeat` times.
    pub fn press_key(&mut self, key: ScanCode, repeat: u32) -> Result<()> {
        for _ in 0..repeat {
            self.session.inject_scan_codes(&key.stroke())?;
            self.pacer.sleep(self.config.timing.key_delay());
        }
        Ok(())
    }

    pub fn attach_media(&mut self, medium: &Path) -> Result<()> {
        crate::log(&format!(
            "Inserting {} into {}",
            medium.display(),
            self.config.media_slot
        ));
        self.session.attach_media(&self.config.media_slot, medium)
    }

    pub fn detach_media(&mut self) -> Result<()> {
        crate::log(&format!("Ejecting {}", self.config.media_slot));
        self.session.detach_media(&self.config.media_slot)
    }

    pub fn expect_state(&mut self, expected: &VmState) -> Result<()> {
        let actual = self.session.state()?;
        if actual != *expected {
            return Err(PilotError::config(format!(
                "VM is {} but must be {}",
                actual, expected
            )));
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        crate::log("Starting VM");
        self.session.start()
    }

    pub fn reset(&mut self) -> Result<()> {
        crate::log("Resetting VM");
        self.session.reset()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Records sleeps instead of sleeping.
    #[derive(Debug, Default)]
    pub struct RecordingPacer {
        pub sleeps: Vec<Duration>,
    }

    impl Pacer for RecordingPacer {
        fn sleep(&mut self, duration: Duration) {
            self.sleeps.push(duration);
        }
    }

    /// Hands out prepared frames; fails transiently once they run out.
    #[derive(Default)]
    pub struct ScriptedScreens {
        pub frames: VecDeque<Result<Frame>>,
        pub profiles: Vec<String>,
    }

    impl ScriptedScreens {
        pub fn new(frames: Vec<Vec<&str>>) -> Self {
            Self {
                frames: frames.into_iter().map(|f| Ok(Frame::from(f))).collect(),
                profiles: Vec::new(),
            }
        }
    }

    impl ScreenReader for ScriptedScreens {
        fn read_frame(&mut self, session: &mut dyn VmSession) -> Result<Frame> {
            // Keep the capture visible in the session's event log
            let _ = session.capture_screen();
            self.frames
                .pop_front()
                .unwrap_or_else(|| Err(PilotError::transient("no more frames")))
        }

        fn select_profile(&mut self, name: &str) -> Result<()> {
            self.profiles.push(name.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingPacer, ScriptedScreens};
    use super::*;
    use crate::vm::fake::{FakeSession, VmEvent};
    use tempfile::NamedTempFile;

    type TestDriver = Driver<FakeSession, ScriptedScreens, RecordingPacer>;

    fn driver(frames: Vec<Vec<&str>>) -> TestDriver {
        Driver::new(
            FakeSession::new(),
            ScriptedScreens::new(frames),
            RecordingPacer::default(),
            RunConfig::default(),
        )
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_wait_returns_first_target_by_line_then_target_order() {
        let mut d = driver(vec![
            vec!["booting"],
            vec!["Select a method of installation", "Would you like to add any other bad sectors"],
        ]);

        let found = d
            .wait_for_text(&["Would you like to add", "Select a method"], WaitOptions::every(ms(5000)))
            .unwrap();

        assert_eq!(found, "Select a method");
        assert_eq!(d.pacer().sleeps, vec![ms(5000)]);
    }

    #[test]
    fn test_wait_uses_configured_interval_by_default() {
        let mut d = driver(vec![vec![""], vec![""], vec!["login:"]]);
        d.wait_for_text(&["login:"], WaitOptions::default()).unwrap();
        assert_eq!(d.pacer().sleeps, vec![ms(2000), ms(2000)]);
    }

    #[test]
    fn test_wait_propagates_transient_error_unless_tolerated() {
        let mut d = driver(vec![]);
        d.reader.frames.push_back(Err(PilotError::transient("mode switch")));
        let err = d.wait_for_text(&["x"], WaitOptions::default()).unwrap_err();
        assert!(err.is_transient());

        let mut d = driver(vec![]);
        d.reader.frames.push_back(Err(PilotError::transient("mode switch")));
        d.reader.frames.push_back(Err(PilotError::transient("mode switch")));
        d.reader.frames.push_back(Ok(Frame::from(vec!["SYSTEM INSTALLATION"])));
        let found = d
            .wait_for_text(&["SYSTEM INSTALLATION"], WaitOptions::default().tolerating_transient())
            .unwrap();
        assert_eq!(found, "SYSTEM INSTALLATION");
        assert_eq!(d.pacer().sleeps, vec![ms(2000), ms(2000)]);
    }

    #[test]
    fn test_wait_never_retries_configuration_errors() {
        let mut d = driver(vec![]);
        d.reader.frames.push_back(Err(PilotError::config("bad geometry")));
        let err = d
            .wait_for_text(&["x"], WaitOptions::default().tolerating_transient())
            .unwrap_err();
        assert!(matches!(err, PilotError::Configuration(_)));
    }

    #[test]
    fn test_wait_gives_up_after_max_polls() {
        let mut d = driver(vec![vec!["a"], vec!["b"], vec!["c"], vec!["done"]]);
        d.config.timing.max_polls = Some(3);

        let err = d.wait_for_text(&["done"], WaitOptions::default()).unwrap_err();
        match err {
            PilotError::Desynchronized { expected, polls } => {
                assert_eq!(polls, 3);
                assert!(expected.contains("done"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_transient_retries_do_not_count_as_polls() {
        let mut d = driver(vec![]);
        d.config.timing.max_polls = Some(1);
        d.reader.frames.push_back(Err(PilotError::transient("mode switch")));
        d.reader.frames.push_back(Ok(Frame::from(vec!["ready"])));

        let found = d
            .wait_for_text(&["ready"], WaitOptions::default().tolerating_transient())
            .unwrap();
        assert_eq!(found, "ready");
    }

    #[test]
    fn test_menu_toggles_once_per_misaligned_poll_then_accepts() {
        let mut d = driver(vec![
            vec!["  o Install and Customize AIX ", "    Maintenance "],
            vec!["    Install and Customize AIX ", "  o Maintenance "],
            vec!["  o Install and Customize AIX ", "    Maintenance "],
        ]);

        d.select_menu_item(&MenuItem::new("Maintenance")).unwrap();

        assert_eq!(d.session().keys(), vec![vec![0x39, 0xb9], vec![0x1c, 0x9c]]);
        // Only key delays, no poll sleeps
        assert_eq!(d.pacer().sleeps, vec![ms(100), ms(100)]);
    }

    #[test]
    fn test_menu_waits_for_refresh_after_toggle() {
        let unselected = vec!["    Normal console login. ", "  o Other "];
        let mut d = driver(vec![
            unselected.clone(),
            unselected.clone(),
            unselected,
            vec!["  o Normal console login. ", "    Other "],
        ]);

        d.select_menu_item(&MenuItem::new("Normal console login.")).unwrap();

        // One toggle for the first stale screen, none while it stays stale
        assert_eq!(d.session().keys(), vec![vec![0x39, 0xb9], vec![0x1c, 0x9c]]);
        assert_eq!(d.pacer().sleeps, vec![ms(100), ms(500), ms(500), ms(100)]);
    }

    #[test]
    fn test_menu_stall_sleeps_longer_than_menu_poll() {
        let mut d = driver(vec![
            vec!["please wait"],
            vec!["please wait"],
            vec!["  o Continue Installation. "],
        ]);

        d.select_menu_item(&MenuItem::new("Continue Installation.")).unwrap();

        let sleeps = &d.pacer().sleeps;
        assert_eq!(sleeps[0], ms(500));
        assert!(sleeps[1] > sleeps[0]);
        assert_eq!(sleeps[1], ms(2000));
        assert_eq!(d.session().keys(), vec![vec![0x1c, 0x9c]]);
    }

    #[test]
    fn test_menu_fixed_cursor_column() {
        let line_unselected = "                      /u ";
        let line_selected = "                    o /u ";
        let mut d = driver(vec![vec![line_unselected], vec![line_selected]]);

        d.select_menu_item(&MenuItem::new("/u").at_column(20)).unwrap();

        assert_eq!(d.session().keys(), vec![vec![0x39, 0xb9], vec![0x1c, 0x9c]]);
    }

    #[test]
    fn test_is_selected_marker_must_precede_item() {
        assert!(is_selected("  o Yes  No ", " Yes ", 'o', None));
        assert!(!is_selected("    Yes  o No ", " Yes ", 'o', None));
        assert!(is_selected("    Yes  o No ", " Yes ", 'o', Some(9)));
        assert!(!is_selected("short", " Yes ", 'o', Some(40)));
    }

    #[test]
    fn test_menu_gives_up_after_max_polls() {
        let mut d = driver(vec![vec!["a"], vec!["b"]]);
        d.config.timing.max_polls = Some(2);
        let err = d.select_menu_item(&MenuItem::new("End Installation")).unwrap_err();
        assert!(matches!(err, PilotError::Desynchronized { polls: 2, .. }));
    }

    #[test]
    fn test_swap_media_attaches_before_pressing_enter() {
        let medium = NamedTempFile::new().unwrap();
        let mut d = driver(vec![vec!["Please mount volume 1 on /dev/fd0"]]);

        d.swap_media_on_prompt("Please mount volume 1", medium.path(), Some(ms(5000)))
            .unwrap();

        assert_eq!(
            d.session().commands(),
            vec![
                VmEvent::Attach("Floppy-0-0".to_string(), medium.path().to_path_buf()),
                VmEvent::Keys(vec![0x1c, 0x9c]),
            ]
        );
    }

    #[test]
    fn test_swap_media_checks_medium_first() {
        let mut d = driver(vec![vec!["Insert diskette"]]);
        let err = d
            .swap_media_on_prompt("Insert diskette", Path::new("/nonexistent/disk.img"), None)
            .unwrap_err();
        assert!(matches!(err, PilotError::Configuration(_)));
        assert!(d.session().events.is_empty());
    }

    #[test]
    fn test_type_text_is_one_batch() {
        let mut d = driver(vec![]);
        d.type_text("ls\n").unwrap();
        assert_eq!(
            d.session().keys(),
            vec![vec![0x26, 0xa6, 0x1f, 0x9f, 0x1c, 0x9c]]
        );
    }

    #[test]
    fn test_type_empty_text_sends_nothing() {
        let mut d = driver(vec![]);
        d.type_text("").unwrap();
        assert!(d.session().events.is_empty());
        assert!(d.pacer().sleeps.is_empty());
    }

    #[test]
    fn test_type_text_rejects_unmapped_character_without_sending() {
        let mut d = driver(vec![]);
        assert!(d.type_text("caf\u{e9}").is_err());
        assert!(d.session().keys().is_empty());
    }

    #[test]
    fn test_press_key_repeats_with_delay() {
        let mut d = driver(vec![]);
        d.press_key(ScanCode::DOWN, 3).unwrap();
        assert_eq!(d.session().keys().len(), 3);
        assert_eq!(d.pacer().sleeps, vec![ms(100); 3]);
    }

    #[test]
    fn test_expect_state() {
        let mut d = driver(vec![]);
        d.expect_state(&VmState::PowerOff).unwrap();
        d.start().unwrap();
        assert!(d.expect_state(&VmState::PowerOff).is_err());
    }
}
