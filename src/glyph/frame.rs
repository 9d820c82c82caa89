use std::fmt;

/// Text recognized from one screen capture, one string per grid row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    lines: Vec<String>,
}

impl Frame {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// First target present on screen.
    ///
    /// Lines are scanned top to bottom; within a line, targets are tried in
    /// the order given.
    pub fn find_first<'t>(&self, targets: &[&'t str]) -> Option<&'t str> {
        self.lines
            .iter()
            .find_map(|line| targets.iter().copied().find(|t| line.contains(t)))
    }
}

impl From<Vec<&str>> for Frame {
    fn from(lines: Vec<&str>) -> Self {
        Self::new(lines.into_iter().map(str::to_string).collect())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}
