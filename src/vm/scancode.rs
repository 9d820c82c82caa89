//! PC/AT set 1 scan codes and the literal-text encoder.
//!
//! A key press is the "make" code (`0x00..0x80`), its release the matching
//! "break" code (`make + 0x80`). For details see
//! <https://www.win.tue.nl/~aeb/linux/kbd/scancodes-1.html>.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PilotError, Result};

const BREAK_BIT: u8 = 0x80;

/// A key-down scan code in `0x00..0x80`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ScanCode(u8);

impl ScanCode {
    pub const ENTER: ScanCode = ScanCode(0x1c);
    pub const SPACE: ScanCode = ScanCode(0x39);
    pub const LEFT_SHIFT: ScanCode = ScanCode(0x2a);
    pub const UP: ScanCode = ScanCode(0x48);
    pub const DOWN: ScanCode = ScanCode(0x50);
    pub const LEFT: ScanCode = ScanCode(0x4b);
    pub const RIGHT: ScanCode = ScanCode(0x4d);
    // keypad 9 / keypad 3
    pub const PAGE_UP: ScanCode = ScanCode(0x49);
    pub const PAGE_DOWN: ScanCode = ScanCode(0x51);
    pub const N: ScanCode = ScanCode(0x31);
    pub const Y: ScanCode = ScanCode(0x15);

    const F_BASE: u8 = 0x3a;

    /// Returns `None` for values with the break bit set.
    pub fn new(value: u8) -> Option<Self> {
        (value < BREAK_BIT).then_some(Self(value))
    }

    /// Function key `F1`..`F10`. F11/F12 live elsewhere in set 1.
    pub fn function(n: u8) -> Option<Self> {
        match n {
            1..=10 => Some(Self(Self::F_BASE + n)),
            11 => Some(Self(0x57)),
            12 => Some(Self(0x58)),
            _ => None,
        }
    }

    /// Looks up a key by name (`Enter`, `Down`, `F3`, ...) or by hex value (`0x1c`).
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "enter" | "return" => Some(Self::ENTER),
            "space" => Some(Self::SPACE),
            "shift" => Some(Self::LEFT_SHIFT),
            "up" => Some(Self::UP),
            "down" => Some(Self::DOWN),
            "left" => Some(Self::LEFT),
            "right" => Some(Self::RIGHT),
            "pageup" | "page_up" => Some(Self::PAGE_UP),
            "pagedown" | "page_down" => Some(Self::PAGE_DOWN),
            "n" => Some(Self::N),
            "y" => Some(Self::Y),
            _ => {
                if let Some(hex) = lower.strip_prefix("0x") {
                    return u8::from_str_radix(hex, 16).ok().and_then(Self::new);
                }
                lower
                    .strip_prefix('f')
                    .and_then(|n| n.parse::<u8>().ok())
                    .and_then(Self::function)
            }
        }
    }

    pub fn make(self) -> u8 {
        self.0
    }

    pub fn break_code(self) -> u8 {
        self.0 | BREAK_BIT
    }

    /// Press followed by release.
    pub fn stroke(self) -> [u8; 2] {
        [self.make(), self.break_code()]
    }
}

impl TryFrom<u8> for ScanCode {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("scan code {:#04x} is not below 0x80", value))
    }
}

impl From<ScanCode> for u8 {
    fn from(code: ScanCode) -> u8 {
        code.0
    }
}

impl fmt::Display for ScanCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Character → (key, needs shift) table for a US keyboard.
#[derive(Debug, Clone)]
pub struct Keyboard {
    keys: HashMap<char, (ScanCode, bool)>,
}

impl Keyboard {
    /// Builds the table from the physical key rows.
    pub fn us() -> Self {
        // Runs of physically adjacent keys and the scan code of the first one.
        const ROWS: [(&str, u8); 7] = [
            ("qwertyuiop[]", 0x10),
            ("asdfghjkl;'`", 0x1e),
            ("\\", 0x2b),
            ("zxcvbnm,./", 0x2c),
            ("1234567890-=", 0x02),
            ("\n", 0x1c),
            (" ", 0x39),
        ];
        const NUMBER_ROW_SHIFTED: &str = "!@#$%^&*()_+";

        let mut keys = HashMap::new();
        for (row, first) in ROWS {
            for (i, ch) in row.chars().enumerate() {
                let code = ScanCode(first + i as u8);
                keys.insert(ch, (code, false));

                let shifted = if first == 0x02 {
                    NUMBER_ROW_SHIFTED.chars().nth(i)
                } else {
                    shifted_punctuation(ch).or_else(|| ch.to_uppercase().next())
                };
                if let Some(upper) = shifted.filter(|&upper| upper != ch) {
                    keys.insert(upper, (code, true));
                }
            }
        }
        Self { keys }
    }

    pub fn lookup(&self, ch: char) -> Option<(ScanCode, bool)> {
        self.keys.get(&ch).copied()
    }

    /// Encodes `text` as make/break codes, toggling shift only at case
    /// boundaries and always leaving it released.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(text.len() * 2 + 2);
        let mut shift_held = false;

        for ch in text.chars() {
            let (code, shift) = self.lookup(ch).ok_or_else(|| {
                PilotError::config(format!("no scan code for character {:?} in {:?}", ch, text))
            })?;
            if shift != shift_held {
                out.push(if shift {
                    ScanCode::LEFT_SHIFT.make()
                } else {
                    ScanCode::LEFT_SHIFT.break_code()
                });
                shift_held = shift;
            }
            out.extend(code.stroke());
        }

        if shift_held {
            out.push(ScanCode::LEFT_SHIFT.break_code());
        }
        Ok(out)
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::us()
    }
}

fn shifted_punctuation(ch: char) -> Option<char> {
    Some(match ch {
        '[' => '{',
        ']' => '}',
        ';' => ':',
        '\\' => '|',
        ',' => '<',
        '.' => '>',
        '/' => '?',
        '\'' => '"',
        '`' => '~',
        _ => return None,
    })
}
