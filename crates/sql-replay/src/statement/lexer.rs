//! Minimal SQL tokenizer shared by fingerprinting and bind rendering.
//!
//! Only distinguishes what both consumers care about: literals, quoted
//! identifiers, comments, bind markers and everything else. It is not a
//! parser and never fails; unterminated literals run to end of input.

/// A lexical token borrowed from the statement text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token<'a> {
    /// A run of whitespace.
    Space(&'a str),
    /// `-- ...` or `/* ... */`.
    Comment(&'a str),
    /// Quoted string literal, including quotes and any `N`/`E`/`X`/`B` prefix.
    Str(&'a str),
    /// Quoted identifier: `"x"`, `` `x` `` or `[x]`.
    QuotedIdent(&'a str),
    /// Keyword or bare identifier.
    Word(&'a str),
    /// Numeric literal.
    Number(&'a str),
    /// Bind placeholder.
    Bind(BindMarker<'a>),
    /// Any other punctuation.
    Symbol(&'a str),
}

/// A bind placeholder in one of the supported styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BindMarker<'a> {
    /// Marker text as written (`?`, `$2`, `:name`, `@P1`).
    pub text: &'a str,
    /// Explicit 1-based position when the marker carries one.
    pub position: Option<usize>,
}

impl<'a> Token<'a> {
    /// The source text the token covers.
    pub(crate) fn text(&self) -> &'a str {
        match *self {
            Token::Bind(marker) => marker.text,
            Token::Space(text)
            | Token::Comment(text)
            | Token::Str(text)
            | Token::QuotedIdent(text)
            | Token::Word(text)
            | Token::Number(text)
            | Token::Symbol(text) => text,
        }
    }
}

/// Tokenize a statement; only a doubled quote escapes inside literals.
pub(crate) fn tokenize(sql: &str) -> Vec<Token<'_>> {
    tokenize_with(sql, false)
}

/// Tokenize a statement. With `backslash_escapes`, a backslash escapes the
/// next byte inside `'...'` and `"..."` (MySQL default mode, PostgreSQL
/// `E'...'` strings).
pub(crate) fn tokenize_with(sql: &str, backslash_escapes: bool) -> Vec<Token<'_>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();

        if c.is_ascii_whitespace() {
            let end = scan_while(bytes, i, |b| b.is_ascii_whitespace());
            tokens.push(Token::Space(&sql[i..end]));
            i = end;
            continue;
        }

        if c == b'-' && next == Some(b'-') {
            let end = find_byte(bytes, i, b'\n').unwrap_or(bytes.len());
            tokens.push(Token::Comment(&sql[i..end]));
            i = end;
            continue;
        }

        if c == b'/' && next == Some(b'*') {
            let end = find_seq(bytes, i + 2, b"*/").map(|p| p + 2).unwrap_or(bytes.len());
            tokens.push(Token::Comment(&sql[i..end]));
            i = end;
            continue;
        }

        if matches!(c, b'N' | b'n' | b'E' | b'e' | b'X' | b'x' | b'B' | b'b')
            && next == Some(b'\'')
            && !prev_is_word(bytes, i)
        {
            let end = scan_quoted(bytes, i + 1, b'\'', backslash_escapes);
            tokens.push(Token::Str(&sql[i..end]));
            i = end;
            continue;
        }

        match c {
            b'\'' => {
                let end = scan_quoted(bytes, i, b'\'', backslash_escapes);
                tokens.push(Token::Str(&sql[i..end]));
                i = end;
            }
            b'"' | b'`' => {
                let end = scan_quoted(bytes, i, c, backslash_escapes && c == b'"');
                tokens.push(Token::QuotedIdent(&sql[i..end]));
                i = end;
            }
            b'[' => {
                let end = find_byte(bytes, i + 1, b']').map(|p| p + 1).unwrap_or(bytes.len());
                tokens.push(Token::QuotedIdent(&sql[i..end]));
                i = end;
            }
            b'?' => {
                tokens.push(Token::Bind(BindMarker {
                    text: &sql[i..i + 1],
                    position: None,
                }));
                i += 1;
            }
            b'$' if next.is_some_and(|n| n.is_ascii_digit()) => {
                let end = scan_while(bytes, i + 1, |b| b.is_ascii_digit());
                tokens.push(Token::Bind(BindMarker {
                    text: &sql[i..end],
                    position: sql[i + 1..end].parse().ok(),
                }));
                i = end;
            }
            b':' if next == Some(b':') => {
                tokens.push(Token::Symbol(&sql[i..i + 2]));
                i += 2;
            }
            b':' if next.is_some_and(|n| n.is_ascii_digit()) => {
                let end = scan_while(bytes, i + 1, |b| b.is_ascii_digit());
                tokens.push(Token::Bind(BindMarker {
                    text: &sql[i..end],
                    position: sql[i + 1..end].parse().ok(),
                }));
                i = end;
            }
            b':' if next.is_some_and(is_word_start) => {
                let end = scan_while(bytes, i + 1, is_word_byte);
                tokens.push(Token::Bind(BindMarker {
                    text: &sql[i..end],
                    position: None,
                }));
                i = end;
            }
            b'@' if next == Some(b'@') => {
                // @@ROWCOUNT and friends are system functions, not binds.
                let end = scan_while(bytes, i + 2, is_word_byte);
                tokens.push(Token::Word(&sql[i..end]));
                i = end;
            }
            b'@' if next.is_some_and(is_word_start) => {
                let end = scan_while(bytes, i + 1, is_word_byte);
                let name = &sql[i + 1..end];
                let position = name
                    .strip_prefix(['P', 'p'])
                    .and_then(|digits| digits.parse().ok());
                tokens.push(Token::Bind(BindMarker {
                    text: &sql[i..end],
                    position,
                }));
                i = end;
            }
            _ if c.is_ascii_digit() || (c == b'.' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let end = scan_number(bytes, i);
                tokens.push(Token::Number(&sql[i..end]));
                i = end;
            }
            _ if is_word_start(c) => {
                let end = scan_while(bytes, i, is_word_byte);
                tokens.push(Token::Word(&sql[i..end]));
                i = end;
            }
            _ => {
                let width = sql[i..].chars().next().map(char::len_utf8).unwrap_or(1);
                tokens.push(Token::Symbol(&sql[i..i + width]));
                i += width;
            }
        }
    }

    tokens
}

/// The statement without its trailing terminator, or `None` when anything
/// but whitespace or comments follows the first top-level `;`. The check
/// runs under both literal escaping conventions, so text that one of them
/// would read as two statements is refused.
pub(crate) fn single_statement(sql: &str) -> Option<&str> {
    let mut end = sql.len();
    for backslash_escapes in [false, true] {
        let mut offset = 0;
        let mut terminator = None;
        for token in tokenize_with(sql, backslash_escapes) {
            match token {
                Token::Symbol(";") => {
                    terminator.get_or_insert(offset);
                }
                Token::Space(_) | Token::Comment(_) => {}
                _ if terminator.is_some() => return None,
                _ => {}
            }
            offset += token.text().len();
        }
        if !backslash_escapes {
            end = terminator.unwrap_or(sql.len());
        }
    }
    Some(sql[..end].trim())
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'$' | b'#') || b >= 0x80
}

fn prev_is_word(bytes: &[u8], i: usize) -> bool {
    i > 0 && is_word_byte(bytes[i - 1])
}

fn scan_while(bytes: &[u8], start: usize, pred: impl Fn(u8) -> bool) -> usize {
    let mut i = start;
    while i < bytes.len() && pred(bytes[i]) {
        i += 1;
    }
    i
}

/// Scan a quoted run starting at the opening quote; doubled quotes escape,
/// and so does a backslash when `backslash` is set.
fn scan_quoted(bytes: &[u8], start: usize, quote: u8, backslash: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if backslash && bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn scan_number(bytes: &[u8], start: usize) -> usize {
    let mut i = scan_while(bytes, start, |b| b.is_ascii_digit());
    if bytes.get(i) == Some(&b'.') {
        i = scan_while(bytes, i + 1, |b| b.is_ascii_digit());
    }
    if matches!(bytes.get(i), Some(b'e') | Some(b'E')) {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'+') | Some(b'-')) {
            j += 1;
        }
        if bytes.get(j).is_some_and(|b| b.is_ascii_digit()) {
            i = scan_while(bytes, j, |b| b.is_ascii_digit());
        }
    }
    i
}

fn find_byte(bytes: &[u8], start: usize, needle: u8) -> Option<usize> {
    bytes[start.min(bytes.len())..]
        .iter()
        .position(|&b| b == needle)
        .map(|p| p + start)
}

fn find_seq(bytes: &[u8], start: usize, needle: &[u8]) -> Option<usize> {
    if start >= bytes.len() {
        return None;
    }
    bytes[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + start)
}
