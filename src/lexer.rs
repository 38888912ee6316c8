// File: src/lexer.rs
//
// Lexer for the Vesper programming language.
// Produces a token stream with absolute byte offsets from UTF-8 source,
// recording line starts into the source map as it goes. Lexing errors
// are reported through the error reporter and surface as `Error`
// tokens so the parser can keep going.

use crate::errors::Reporter;
use crate::source::{SourceMap, Span};
use once_cell::sync::Lazy;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Literals
    Int,
    Float,
    Str,
    Identifier,

    // Operators
    Plus,
    PlusPlus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusEquals,
    PlusPlusEquals,
    MinusEquals,
    StarEquals,
    SlashEquals,
    PercentEquals,
    Equals,
    EqualsEquals,
    NotEquals,
    Less,
    LessEquals,
    More,
    MoreEquals,
    Arrow,
    ThinArrow,
    LeftArrow,
    Pipe,
    PipePipe,

    // Symbols
    Semicolon,
    Colon,
    Comma,
    Dot,
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,

    // Keywords
    Fn,
    Ret,
    If,
    Elif,
    Else,
    Loop,
    While,
    For,
    In,
    Break,
    Continue,
    Class,
    Impl,
    Try,
    Catch,
    Finally,
    Throw,
    Match,
    Use,
    Null,
    True,
    False,
    And,
    Or,
    Not,

    // Special
    Error,
    Eof,
}

/// A token with its byte range. Literal payloads are decoded during
/// scanning so the parser never re-reads source text.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub int_value: i64,
    pub float_value: f64,
    /// Identifier text, or the unescaped contents of a string literal.
    pub text: String,
    /// Code-point length of a string literal.
    pub char_len: usize,
}

impl Token {
    fn new(kind: TokenKind, span: Span) -> Self {
        Token { kind, span, int_value: 0, float_value: 0.0, text: String::new(), char_len: 0 }
    }
}

static KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    HashMap::from([
        ("fn", TokenKind::Fn),
        ("ret", TokenKind::Ret),
        ("if", TokenKind::If),
        ("elif", TokenKind::Elif),
        ("else", TokenKind::Else),
        ("loop", TokenKind::Loop),
        ("while", TokenKind::While),
        ("for", TokenKind::For),
        ("in", TokenKind::In),
        ("break", TokenKind::Break),
        ("continue", TokenKind::Continue),
        ("class", TokenKind::Class),
        ("impl", TokenKind::Impl),
        ("try", TokenKind::Try),
        ("catch", TokenKind::Catch),
        ("finally", TokenKind::Finally),
        ("throw", TokenKind::Throw),
        ("match", TokenKind::Match),
        ("use", TokenKind::Use),
        ("null", TokenKind::Null),
        ("true", TokenKind::True),
        ("false", TokenKind::False),
        ("and", TokenKind::And),
        ("or", TokenKind::Or),
        ("not", TokenKind::Not),
    ])
});

pub struct Lexer<'a> {
    source: &'a [u8],
    current: usize,
    token_start: usize,
    had_error: bool,
}

pub struct LexResult {
    pub had_error: bool,
    pub tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer { source: source.as_bytes(), current: 0, token_start: 0, had_error: false }
    }

    /// Scan the whole input, completing `map.line_starts` on the way.
    pub fn scan(mut self, map: &mut SourceMap, reporter: &mut dyn Reporter) -> LexResult {
        map.line_starts.clear();
        map.line_starts.push(0);

        let mut tokens = Vec::new();
        while !self.is_at_end() {
            self.skip_whitespace(map);
            if self.is_at_end() {
                break;
            }
            tokens.push(self.token(map, reporter));
        }
        tokens.push(Token::new(TokenKind::Eof, Span::new(self.current, self.current)));

        LexResult { had_error: self.had_error, tokens }
    }

    fn token(&mut self, map: &mut SourceMap, reporter: &mut dyn Reporter) -> Token {
        let c = self.peek();
        self.advance();

        match c {
            b'+' => {
                if self.match_byte(b'+') {
                    if self.match_byte(b'=') {
                        self.make_token(TokenKind::PlusPlusEquals)
                    } else {
                        self.make_token(TokenKind::PlusPlus)
                    }
                } else if self.match_byte(b'=') {
                    self.make_token(TokenKind::PlusEquals)
                } else {
                    self.make_token(TokenKind::Plus)
                }
            }
            b'-' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::MinusEquals)
                } else if self.match_byte(b'>') {
                    self.make_token(TokenKind::ThinArrow)
                } else {
                    self.make_token(TokenKind::Minus)
                }
            }
            b'*' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::StarEquals)
                } else {
                    self.make_token(TokenKind::Star)
                }
            }
            b'/' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::SlashEquals)
                } else {
                    self.make_token(TokenKind::Slash)
                }
            }
            b'%' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::PercentEquals)
                } else {
                    self.make_token(TokenKind::Percent)
                }
            }
            b'=' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::EqualsEquals)
                } else if self.match_byte(b'>') {
                    self.make_token(TokenKind::Arrow)
                } else {
                    self.make_token(TokenKind::Equals)
                }
            }
            b'!' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::NotEquals)
                } else {
                    self.error_token(map, reporter, "illegal character; use 'not' for negation")
                }
            }
            b'<' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::LessEquals)
                } else if self.match_byte(b'-') {
                    self.make_token(TokenKind::LeftArrow)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            b'>' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::MoreEquals)
                } else {
                    self.make_token(TokenKind::More)
                }
            }
            b'|' => {
                if self.match_byte(b'|') {
                    self.make_token(TokenKind::PipePipe)
                } else {
                    self.make_token(TokenKind::Pipe)
                }
            }
            b';' => self.make_token(TokenKind::Semicolon),
            b':' => self.make_token(TokenKind::Colon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b'[' => self.make_token(TokenKind::LeftBracket),
            b']' => self.make_token(TokenKind::RightBracket),
            b'"' => self.string(map, reporter),
            _ => {
                if is_digit(c) {
                    self.number()
                } else if is_identifier_start(c) {
                    self.keyword_or_identifier()
                } else {
                    self.error_token(map, reporter, "illegal character")
                }
            }
        }
    }

    fn number(&mut self) -> Token {
        while !self.is_at_end() && is_digit(self.peek()) {
            self.advance();
        }

        let mut is_float = false;
        if !self.is_at_end() && self.peek() == b'.' && is_digit(self.peek_next()) {
            is_float = true;
            self.advance();
            while !self.is_at_end() && is_digit(self.peek()) {
                self.advance();
            }
        }

        let text = std::str::from_utf8(&self.source[self.token_start..self.current])
            .unwrap_or("0");
        if is_float {
            let mut token = self.make_token(TokenKind::Float);
            token.float_value = text.parse().unwrap_or(0.0);
            token
        } else {
            let mut token = self.make_token(TokenKind::Int);
            token.int_value = text.parse().unwrap_or(0);
            token
        }
    }

    fn keyword_or_identifier(&mut self) -> Token {
        while !self.is_at_end() && is_identifier_char(self.peek()) {
            self.advance();
        }

        let text = std::str::from_utf8(&self.source[self.token_start..self.current])
            .unwrap_or("");
        match KEYWORDS.get(text) {
            Some(&kind) => self.make_token(kind),
            None => {
                let text = text.to_string();
                let mut token = self.make_token(TokenKind::Identifier);
                token.text = text;
                token
            }
        }
    }

    fn string(&mut self, map: &mut SourceMap, reporter: &mut dyn Reporter) -> Token {
        let mut text = String::new();
        loop {
            if self.is_at_end() {
                return self.error_token(map, reporter, "unterminated string");
            }
            let c = self.peek();
            self.advance();
            match c {
                b'"' => break,
                b'\n' => {
                    map.line_starts.push(self.current);
                    text.push('\n');
                }
                b'\\' => {
                    if self.is_at_end() {
                        return self.error_token(map, reporter, "unterminated string");
                    }
                    let escape = self.peek();
                    self.advance();
                    match escape {
                        b'"' => text.push('"'),
                        b'\\' => text.push('\\'),
                        b'/' => text.push('/'),
                        b'b' => text.push('\u{0008}'),
                        b'f' => text.push('\u{000C}'),
                        b'n' => text.push('\n'),
                        b'r' => text.push('\r'),
                        b't' => text.push('\t'),
                        b'u' => match self.unicode_escape() {
                            Some(ch) => text.push(ch),
                            None => {
                                return self.error_token(map, reporter, "invalid \\u escape");
                            }
                        },
                        _ => return self.error_token(map, reporter, "invalid escape sequence"),
                    }
                }
                _ if c < 0x80 => text.push(c as char),
                _ => {
                    // First byte of a multi-byte UTF-8 sequence; take the
                    // continuation bytes along with it.
                    let start = self.current - 1;
                    let mut end = self.current;
                    while end < self.source.len() && (self.source[end] & 0b1100_0000) == 0b1000_0000
                    {
                        end += 1;
                    }
                    match std::str::from_utf8(&self.source[start..end]) {
                        Ok(s) => text.push_str(s),
                        Err(_) => return self.error_token(map, reporter, "invalid UTF-8 in string"),
                    }
                    self.current = end;
                }
            }
        }

        let mut token = self.make_token(TokenKind::Str);
        token.char_len = text.chars().count();
        token.text = text;
        token
    }

    /// Four hex digits after `\u`, transcoded to UTF-8.
    fn unicode_escape(&mut self) -> Option<char> {
        if self.current + 4 > self.source.len() {
            return None;
        }
        let digits = std::str::from_utf8(&self.source[self.current..self.current + 4]).ok()?;
        let code = u32::from_str_radix(digits, 16).ok()?;
        self.current += 4;
        char::from_u32(code)
    }

    fn skip_whitespace(&mut self, map: &mut SourceMap) {
        while !self.is_at_end() {
            match self.peek() {
                b' ' | b'\t' | b'\r' | b'\x0c' => self.advance(),
                b'\n' => {
                    self.advance();
                    map.line_starts.push(self.current);
                }
                b'/' if self.peek_next() == b'/' => {
                    while !self.is_at_end() && self.peek() != b'\n' {
                        self.advance();
                    }
                }
                _ => {
                    self.token_start = self.current;
                    return;
                }
            }
        }
        self.token_start = self.current;
    }

    fn make_token(&mut self, kind: TokenKind) -> Token {
        let token = Token::new(kind, Span::new(self.token_start, self.current));
        self.token_start = self.current;
        token
    }

    fn error_token(
        &mut self,
        map: &SourceMap,
        reporter: &mut dyn Reporter,
        message: &str,
    ) -> Token {
        self.had_error = true;
        let token = self.make_token(TokenKind::Error);
        reporter.scanner_error(map, token.span, message);
        token
    }

    fn peek(&self) -> u8 {
        self.source.get(self.current).copied().unwrap_or(0)
    }

    fn peek_next(&self) -> u8 {
        self.source.get(self.current + 1).copied().unwrap_or(0)
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.current += 1;
        }
    }

    fn match_byte(&mut self, c: u8) -> bool {
        if !self.is_at_end() && self.peek() == c {
            self.current += 1;
            return true;
        }
        false
    }
}

fn is_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

fn is_identifier_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$'
}

fn is_identifier_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// Convenience wrapper used by the driver and tests.
pub fn tokenize(source: &str, map: &mut SourceMap, reporter: &mut dyn Reporter) -> LexResult {
    Lexer::new(source).scan(map, reporter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CollectingReporter;
    use std::path::PathBuf;

    fn scan(src: &str) -> (Vec<Token>, bool) {
        let mut map = SourceMap::new(src.to_string(), "<test>".into(), PathBuf::from("."));
        let mut reporter = CollectingReporter::default();
        let result = tokenize(src, &mut map, &mut reporter);
        (result.tokens, result.had_error)
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        scan(src).0.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_compound_operators() {
        assert_eq!(
            kinds("+ ++ += ++= -> => <- == != <= >="),
            vec![
                TokenKind::Plus,
                TokenKind::PlusPlus,
                TokenKind::PlusEquals,
                TokenKind::PlusPlusEquals,
                TokenKind::ThinArrow,
                TokenKind::Arrow,
                TokenKind::LeftArrow,
                TokenKind::EqualsEquals,
                TokenKind::NotEquals,
                TokenKind::LessEquals,
                TokenKind::MoreEquals,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_keywords_and_identifiers() {
        let (tokens, _) = scan("fn foo ret elif $init");
        assert_eq!(tokens[0].kind, TokenKind::Fn);
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].text, "foo");
        assert_eq!(tokens[2].kind, TokenKind::Ret);
        assert_eq!(tokens[3].kind, TokenKind::Elif);
        assert_eq!(tokens[4].kind, TokenKind::Identifier);
        assert_eq!(tokens[4].text, "$init");
    }

    #[test]
    fn scans_numbers() {
        let (tokens, _) = scan("42 3.5 7.");
        assert_eq!(tokens[0].kind, TokenKind::Int);
        assert_eq!(tokens[0].int_value, 42);
        assert_eq!(tokens[1].kind, TokenKind::Float);
        assert_eq!(tokens[1].float_value, 3.5);
        // "7." is an int followed by a dot.
        assert_eq!(tokens[2].kind, TokenKind::Int);
        assert_eq!(tokens[3].kind, TokenKind::Dot);
    }

    #[test]
    fn scans_string_escapes() {
        let (tokens, had_error) = scan(r#""a\n\tA""#);
        assert!(!had_error);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, "a\n\tA");
        assert_eq!(tokens[0].char_len, 4);
    }

    #[test]
    fn unicode_escape_transcodes_to_utf8() {
        let (tokens, had_error) = scan(r#""\u00e9""#);
        assert!(!had_error);
        assert_eq!(tokens[0].text, "\u{e9}");
        assert_eq!(tokens[0].char_len, 1);
    }

    #[test]
    fn multibyte_source_characters_pass_through() {
        let (tokens, had_error) = scan("\"héllo\"");
        assert!(!had_error);
        assert_eq!(tokens[0].text, "héllo");
        assert_eq!(tokens[0].char_len, 5);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let (tokens, had_error) = scan("\"abc");
        assert!(had_error);
        assert_eq!(tokens[0].kind, TokenKind::Error);
    }

    #[test]
    fn records_line_starts() {
        let src = "a\nb\nc";
        let mut map = SourceMap::new(src.to_string(), "<test>".into(), PathBuf::from("."));
        let mut reporter = CollectingReporter::default();
        tokenize(src, &mut map, &mut reporter);
        assert_eq!(map.line_starts, vec![0, 2, 4]);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(kinds("1 // comment\n2"), vec![TokenKind::Int, TokenKind::Int, TokenKind::Eof]);
    }

    #[test]
    fn spans_are_byte_offsets() {
        let (tokens, _) = scan("ab cd");
        assert_eq!(tokens[0].span, Span::new(0, 2));
        assert_eq!(tokens[1].span, Span::new(3, 5));
    }
}
