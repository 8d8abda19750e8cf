const DEFAULT_SCROLLBACK_LINES: usize = 10000;

/// Headless terminal state for one PTY session, backed by the vt100 emulator.
pub struct Screen {
    parser: vt100::Parser,
}

impl Screen {
    #[must_use]
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows.max(1), cols.max(1), DEFAULT_SCROLLBACK_LINES),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.parser.process(data);
    }

    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.parser.set_size(rows.max(1), cols.max(1));
    }

    /// (rows, cols)
    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        self.parser.screen().size()
    }

    /// Visible grid top-to-bottom, trailing blanks trimmed per row and trailing empty rows dropped.
    #[must_use]
    pub fn render(&self) -> String {
        let screen = self.parser.screen();
        let (_, cols) = screen.size();

        // vt100 handles alternate screen internally; rows() is whatever is displayed now.
        let mut rows: Vec<String> = screen
            .rows(0, cols)
            .map(|row| row.trim_end().to_string())
            .collect();
        while rows.last().is_some_and(String::is_empty) {
            rows.pop();
        }
        rows.join("\n")
    }

    #[must_use]
    pub fn cursor_position(&self) -> (usize, usize) {
        let (row, col) = self.parser.screen().cursor_position();
        (row as usize, col as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen() -> Screen {
        Screen::new(24, 80)
    }

    #[test]
    fn test_push_simple_text() {
        let mut s = screen();
        s.push(b"hello world");
        assert_eq!(s.render(), "hello world");
    }

    #[test]
    fn test_cursor_position() {
        let mut s = screen();
        s.push(b"hello\r\nworld");
        assert_eq!(s.cursor_position(), (1, 5));
    }

    #[test]
    fn test_strips_ansi_escapes() {
        let mut s = screen();
        s.push(b"\x1b[31mred text\x1b[0m");
        let content = s.render();
        assert!(content.contains("red text"));
        assert!(!content.contains("[31m"));
    }

    #[test]
    fn test_clear_screen_hides_prior_output() {
        let mut s = screen();
        for i in 1..=40 {
            s.push(format!("history line {i}\r\n").as_bytes());
        }
        s.push(b"\x1b[2J\x1b[HX");
        assert_eq!(s.render(), "X");
    }

    #[test]
    fn test_partial_line_overwrite() {
        let mut s = screen();
        s.push(b"progress 10%\rprogress 99%");
        assert_eq!(s.render(), "progress 99%");
    }

    /// Entering the alternate screen (vim, agent TUIs) shows only the alternate content.
    #[test]
    fn test_alternate_screen_isolation() {
        let mut s = screen();
        s.push(b"$ ls -la\r\nfile1.txt\r\n");
        s.push(b"\x1b[?1049h");
        s.push(b"TUI application interface");

        let in_alt = s.render();
        assert!(in_alt.contains("TUI application interface"));
        assert!(!in_alt.contains("$ ls -la"));

        s.push(b"\x1b[?1049l");
        let back = s.render();
        assert!(back.contains("$ ls -la"));
        assert!(back.contains("file1.txt"));
    }

    #[test]
    fn test_resize_changes_grid() {
        let mut s = screen();
        s.resize(10, 40);
        assert_eq!(s.size(), (10, 40));
        s.push(b"0123456789012345678901234567890123456789abc");
        let rendered = s.render();
        assert_eq!(rendered.lines().next(), Some("0123456789012345678901234567890123456789"));
        assert_eq!(rendered.lines().nth(1), Some("abc"));
    }
}
