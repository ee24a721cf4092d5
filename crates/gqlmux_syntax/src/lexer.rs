//! Lexer for GraphQL executable documents.

use crate::token::{Token, TokenKind};
use gqlmux_core::{diagnostics::codes, Span};

/// Error attached to the most recent [`TokenKind::Error`] token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub code: &'static str,
    pub message: String,
}

/// A lexer for GraphQL source text.
pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: u32,
    error: Option<LexError>,
}

impl<'a> Lexer<'a> {
    /// Creates a new lexer.
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            error: None,
        }
    }

    /// Returns the current position.
    #[inline]
    pub fn pos(&self) -> u32 {
        self.pos
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos as usize).copied()
    }

    #[inline]
    fn peek_at(&self, offset: u32) -> Option<u8> {
        self.bytes.get((self.pos + offset) as usize).copied()
    }

    #[inline]
    fn advance(&mut self) {
        self.pos += 1;
    }

    #[inline]
    fn advance_by(&mut self, n: u32) {
        self.pos += n;
    }

    /// Takes the error recorded for the last `Error` token.
    pub fn take_error(&mut self) -> Option<LexError> {
        self.error.take()
    }

    fn fail(&mut self, code: &'static str, message: impl Into<String>) -> TokenKind {
        self.error = Some(LexError {
            code,
            message: message.into(),
        });
        TokenKind::Error
    }

    /// Scans the next token.
    pub fn next_token(&mut self) -> Token {
        self.skip_ignored();

        let start = self.pos;

        let Some(c) = self.peek() else {
            return Token::new(TokenKind::Eof, Span::new(start, start));
        };

        let kind = match c {
            b'{' => self.single(TokenKind::LBrace),
            b'}' => self.single(TokenKind::RBrace),
            b'(' => self.single(TokenKind::LParen),
            b')' => self.single(TokenKind::RParen),
            b'[' => self.single(TokenKind::LBracket),
            b']' => self.single(TokenKind::RBracket),
            b':' => self.single(TokenKind::Colon),
            b'=' => self.single(TokenKind::Eq),
            b'|' => self.single(TokenKind::Pipe),
            b'&' => self.single(TokenKind::Amp),
            b'@' => self.single(TokenKind::At),
            b'!' => self.single(TokenKind::Bang),
            b'$' => self.single(TokenKind::Dollar),
            b'.' => {
                if self.peek_at(1) == Some(b'.') && self.peek_at(2) == Some(b'.') {
                    self.advance_by(3);
                    TokenKind::Spread
                } else {
                    self.advance();
                    self.fail(codes::INVALID_CHARACTER, "Unexpected \".\", did you mean \"...\"?")
                }
            }

            b'"' => self.scan_string(),

            b'-' | b'0'..=b'9' => self.scan_number(),

            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.scan_name(),

            _ => {
                let ch = self.source[self.pos as usize..].chars().next().unwrap_or('\u{FFFD}');
                #[allow(clippy::cast_possible_truncation)]
                let width = ch.len_utf8() as u32;
                self.advance_by(width);
                self.fail(
                    codes::INVALID_CHARACTER,
                    format!("Unexpected character: {}.", describe_char(ch)),
                )
            }
        };

        Token::new(kind, Span::new(start, self.pos))
    }

    #[inline]
    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    /// Skips whitespace, line terminators, commas, comments and the BOM.
    fn skip_ignored(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n' | b',') => self.advance(),
                Some(b'#') => {
                    let rest = &self.bytes[self.pos as usize..];
                    #[allow(clippy::cast_possible_truncation)]
                    let skip = memchr::memchr2(b'\n', b'\r', rest).unwrap_or(rest.len()) as u32;
                    self.advance_by(skip);
                }
                Some(0xEF) if self.peek_at(1) == Some(0xBB) && self.peek_at(2) == Some(0xBF) => {
                    self.advance_by(3);
                }
                _ => break,
            }
        }
    }

    fn scan_name(&mut self) -> TokenKind {
        let start = self.pos as usize;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.advance();
            } else {
                break;
            }
        }
        let text = &self.source[start..self.pos as usize];
        TokenKind::from_keyword(text).unwrap_or(TokenKind::Name)
    }

    fn eat_digits(&mut self) -> usize {
        let mut count = 0;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            count += 1;
        }
        count
    }

    fn scan_number(&mut self) -> TokenKind {
        let mut is_float = false;

        if self.peek() == Some(b'-') {
            self.advance();
        }

        if self.peek() == Some(b'0') {
            self.advance();
            if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return self.fail(codes::INVALID_NUMBER, "Invalid number, unexpected digit after 0.");
            }
        } else if self.eat_digits() == 0 {
            return self.fail(codes::INVALID_NUMBER, "Invalid number, expected digit.");
        }

        if self.peek() == Some(b'.') {
            is_float = true;
            self.advance();
            if self.eat_digits() == 0 {
                return self.fail(codes::INVALID_NUMBER, "Invalid number, expected digit.");
            }
        }

        if let Some(b'e' | b'E') = self.peek() {
            is_float = true;
            self.advance();
            if let Some(b'+' | b'-') = self.peek() {
                self.advance();
            }
            if self.eat_digits() == 0 {
                return self.fail(codes::INVALID_NUMBER, "Invalid number, expected digit.");
            }
        }

        if self
            .peek()
            .is_some_and(|c| c == b'.' || c == b'_' || c.is_ascii_alphabetic())
        {
            return self.fail(codes::INVALID_NUMBER, "Invalid number, expected digit.");
        }

        if is_float {
            TokenKind::FloatLiteral
        } else {
            TokenKind::IntLiteral
        }
    }

    fn scan_string(&mut self) -> TokenKind {
        self.advance();

        if self.peek() == Some(b'"') && self.peek_at(1) == Some(b'"') {
            self.advance_by(2);
            return self.scan_block_string();
        }

        loop {
            match self.peek() {
                None | Some(b'\n' | b'\r') => {
                    return self.fail(codes::UNTERMINATED_STRING, "Unterminated string.");
                }
                Some(b'"') => {
                    self.advance();
                    return TokenKind::StringLiteral;
                }
                Some(b'\\') => {
                    self.advance();
                    if self.peek().is_some() {
                        self.advance();
                    }
                }
                _ => self.advance(),
            }
        }
    }

    fn scan_block_string(&mut self) -> TokenKind {
        loop {
            match self.peek() {
                None => {
                    return self.fail(codes::UNTERMINATED_STRING, "Unterminated string.");
                }
                Some(b'"') if self.peek_at(1) == Some(b'"') && self.peek_at(2) == Some(b'"') => {
                    self.advance_by(3);
                    return TokenKind::BlockStringLiteral;
                }
                Some(b'\\')
                    if self.peek_at(1) == Some(b'"')
                        && self.peek_at(2) == Some(b'"')
                        && self.peek_at(3) == Some(b'"') =>
                {
                    self.advance_by(4);
                }
                _ => self.advance(),
            }
        }
    }

    /// Gets the text at the given span.
    pub fn span_text(&self, span: Span) -> &'a str {
        span.slice(self.source).unwrap_or("")
    }
}

fn describe_char(ch: char) -> String {
    if ch.is_ascii_graphic() {
        format!("\"{ch}\"")
    } else {
        format!("U+{:04X}", ch as u32)
    }
}

/// Tokenizes the entire source.
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();

    loop {
        let token = lexer.next_token();
        let is_eof = token.is_eof();
        tokens.push(token);
        if is_eof {
            break;
        }
    }

    tokens
}

/// Decodes the raw text of a quoted string token, quotes included.
pub fn string_value(raw: &str) -> Result<String, String> {
    let inner = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('b') => out.push('\u{0008}'),
            Some('f') => out.push('\u{000C}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('u') => {
                let high = read_hex4(&mut chars)?;
                let code = if (0xD800..0xDC00).contains(&high) {
                    let rest = chars.as_str();
                    if let Some(tail) = rest.strip_prefix("\\u") {
                        let mut tail_chars = tail.chars();
                        let low = read_hex4(&mut tail_chars)?;
                        if !(0xDC00..0xE000).contains(&low) {
                            return Err(format!("Invalid Unicode escape sequence: \"\\u{low:04X}\"."));
                        }
                        chars = tail_chars;
                        0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00)
                    } else {
                        return Err(format!("Invalid Unicode escape sequence: \"\\u{high:04X}\"."));
                    }
                } else {
                    high
                };
                let ch = char::from_u32(code)
                    .ok_or_else(|| format!("Invalid Unicode escape sequence: \"\\u{code:04X}\"."))?;
                out.push(ch);
            }
            Some(other) => {
                return Err(format!("Invalid character escape sequence: \"\\{other}\"."));
            }
            None => return Err("Invalid character escape sequence: \"\\\".".to_string()),
        }
    }
    Ok(out)
}

fn read_hex4(chars: &mut std::str::Chars<'_>) -> Result<u32, String> {
    let digits: String = chars.by_ref().take(4).collect();
    if digits.len() != 4 {
        return Err(format!("Invalid Unicode escape sequence: \"\\u{digits}\"."));
    }
    u32::from_str_radix(&digits, 16)
        .map_err(|_| format!("Invalid Unicode escape sequence: \"\\u{digits}\"."))
}

/// Decodes the raw text of a block string token: strips the triple quotes,
/// removes the common indentation and the leading and trailing blank lines.
pub fn block_string_value(raw: &str) -> String {
    let inner = raw
        .strip_prefix("\"\"\"")
        .and_then(|s| s.strip_suffix("\"\"\""))
        .unwrap_or(raw)
        .replace("\\\"\"\"", "\"\"\"");

    let lines: Vec<&str> = inner
        .split("\r\n")
        .flat_map(|l| l.split(['\n', '\r']))
        .collect();

    let common_indent = lines
        .iter()
        .skip(1)
        .filter_map(|line| {
            let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
            (indent < line.len()).then_some(indent)
        })
        .min()
        .unwrap_or(0);

    let mut dedented: Vec<&str> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            if i == 0 {
                *line
            } else if line.len() >= common_indent {
                &line[common_indent..]
            } else {
                line.trim_start_matches([' ', '\t'])
            }
        })
        .collect();

    let is_blank = |line: &&str| line.trim_matches([' ', '\t']).is_empty();
    while dedented.first().is_some_and(is_blank) {
        dedented.remove(0);
    }
    while dedented.last().is_some_and(is_blank) {
        dedented.pop();
    }

    dedented.join("\n")
}
