// File: src/source.rs
//
// Source text bookkeeping for diagnostics: maps byte offsets to line
// numbers and hands out the text of a line for error excerpts.

use std::path::PathBuf;

/// A half-open byte range into the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span { start: self.start.min(other.start), end: self.end.max(other.end) }
    }
}

/// The source text of one compilation unit together with the filename
/// shown in diagnostics and the directory imports resolve against.
///
/// `line_starts` holds the byte offset of the first character of every
/// line, in ascending order. The scanner fills it in as it goes; lines
/// are numbered from 0.
#[derive(Debug, Clone)]
pub struct SourceMap {
    pub source: String,
    pub filename: String,
    pub directory: PathBuf,
    pub line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: String, filename: String, directory: PathBuf) -> Self {
        SourceMap { source, filename, directory, line_starts: Vec::new() }
    }

    /// Line containing the given byte offset.
    pub fn line_of(&self, offset: usize) -> usize {
        match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(insertion) => insertion.saturating_sub(1),
        }
    }

    /// Text of line `line` without the trailing newline.
    pub fn line_text(&self, line: usize) -> &str {
        let start = self.line_starts.get(line).copied().unwrap_or(0);
        let end = self
            .line_starts
            .get(line + 1)
            .map(|&next| next.saturating_sub(1))
            .unwrap_or(self.source.len());
        self.source.get(start..end).unwrap_or("").trim_end_matches('\r')
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(src: &str) -> SourceMap {
        let mut m = SourceMap::new(src.to_string(), "<test>".into(), PathBuf::from("."));
        m.line_starts.push(0);
        for (i, b) in src.bytes().enumerate() {
            if b == b'\n' {
                m.line_starts.push(i + 1);
            }
        }
        m
    }

    #[test]
    fn line_of_finds_the_surrounding_line() {
        let m = map("one\ntwo\nthree\n");
        assert_eq!(m.line_of(0), 0);
        assert_eq!(m.line_of(3), 0);
        assert_eq!(m.line_of(4), 1);
        assert_eq!(m.line_of(8), 2);
    }

    #[test]
    fn line_text_strips_the_newline() {
        let m = map("one\ntwo\nthree");
        assert_eq!(m.line_text(0), "one");
        assert_eq!(m.line_text(1), "two");
        assert_eq!(m.line_text(2), "three");
    }
}
