//! Decoder for the device's printed literal representation.
//!
//! The prompt answers an expression by printing the value's literal source
//! form.  This module parses that fixed grammar back into a [`Literal`]:
//!
//! ```text
//! value   := int | bool | none | string | bytes | sequence
//! int     := '-'? digit+
//! bool    := 'True' | 'False'
//! none    := 'None'
//! string  := quoted          (single or double quotes, backslash escapes)
//! bytes   := 'b' quoted
//! sequence:= '[' items ']' | '(' items ')'
//! ```
//!
//! It is a recursive-descent parser over trusted data, never an
//! interpreter: anything outside the grammar is a decode error.
//!
//! The reverse direction lives here too: [`quote_str`] and [`quote_bytes`]
//! render values as device-side literals safe to embed in a command line.

use crate::errors::{SyncError, SyncResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A decoded remote value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Int(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    None,
    /// Either `[...]` or `(...)` — element order is preserved, the bracket
    /// style is not.
    List(Vec<Literal>),
}

impl Literal {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Literal::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Literal::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Literal]> {
        match self {
            Literal::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Literal::Bool(true))
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse one literal, requiring that nothing but whitespace follows it.
pub fn parse(text: &str) -> SyncResult<Literal> {
    let mut p = Parser {
        bytes: text.as_bytes(),
        pos: 0,
    };
    p.skip_ws();
    let value = p.value()?;
    p.skip_ws();
    if p.pos != p.bytes.len() {
        return Err(p.fail("trailing data after literal"));
    }
    Ok(value)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn fail(&self, what: &str) -> SyncError {
        SyncError::BadLiteral(format!("{what} at offset {}", self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.bytes[self.pos..].starts_with(word.as_bytes()) {
            self.pos += word.len();
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> SyncResult<Literal> {
        match self.peek() {
            Some(b'-') | Some(b'0'..=b'9') => self.int(),
            Some(b'\'') | Some(b'"') => {
                let raw = self.quoted()?;
                let s = String::from_utf8(raw).map_err(|_| self.fail("invalid utf-8 in string"))?;
                Ok(Literal::Str(s))
            }
            Some(b'b') if matches!(self.bytes.get(self.pos + 1), Some(b'\'' | b'"')) => {
                self.pos += 1;
                Ok(Literal::Bytes(self.quoted()?))
            }
            Some(b'T') if self.eat_word("True") => Ok(Literal::Bool(true)),
            Some(b'F') if self.eat_word("False") => Ok(Literal::Bool(false)),
            Some(b'N') if self.eat_word("None") => Ok(Literal::None),
            Some(b'[') => self.sequence(b'[', b']'),
            Some(b'(') => self.sequence(b'(', b')'),
            _ => Err(self.fail("expected a literal")),
        }
    }

    fn int(&mut self) -> SyncResult<Literal> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|digits| digits.parse::<i64>().ok())
            .map(Literal::Int)
            .ok_or_else(|| self.fail("invalid integer"))
    }

    /// Parse a quoted run (the opening quote is the next byte) and decode
    /// its backslash escapes into raw bytes.
    fn quoted(&mut self) -> SyncResult<Vec<u8>> {
        let quote = self.bump().ok_or_else(|| self.fail("expected quote"))?;
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.fail("unterminated string")),
                Some(b) if b == quote => return Ok(out),
                Some(b'\\') => {
                    let esc = self.bump().ok_or_else(|| self.fail("dangling escape"))?;
                    match esc {
                        b'\\' => out.push(b'\\'),
                        b'\'' => out.push(b'\''),
                        b'"' => out.push(b'"'),
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'0' => out.push(0),
                        b'x' => {
                            let hi = self.hex_digit()?;
                            let lo = self.hex_digit()?;
                            out.push(hi * 16 + lo);
                        }
                        _ => return Err(self.fail("unknown escape")),
                    }
                }
                Some(b) => out.push(b),
            }
        }
    }

    fn hex_digit(&mut self) -> SyncResult<u8> {
        let b = self.bump().ok_or_else(|| self.fail("truncated \\x escape"))?;
        match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => Err(self.fail("invalid hex digit")),
        }
    }

    fn sequence(&mut self, open: u8, close: u8) -> SyncResult<Literal> {
        debug_assert_eq!(self.peek(), Some(open));
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(Literal::List(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(c) if c == close => {}
                _ => return Err(self.fail("expected ',' or closing bracket")),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

/// Render a string as a single-quoted device literal.
pub fn quote_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for b in s.bytes() {
        push_escaped(&mut out, b);
    }
    out.push('\'');
    out
}

/// Render a byte slice as a single-quoted device bytes literal (`b'...'`).
pub fn quote_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b'");
    for &b in data {
        push_escaped(&mut out, b);
    }
    out.push('\'');
    out
}

fn push_escaped(out: &mut String, b: u8) {
    match b {
        b'\\' => out.push_str("\\\\"),
        b'\'' => out.push_str("\\'"),
        b'\n' => out.push_str("\\n"),
        b'\r' => out.push_str("\\r"),
        b'\t' => out.push_str("\\t"),
        0x20..=0x7e => out.push(b as char),
        _ => out.push_str(&format!("\\x{b:02x}")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- scalars -------------------------------------------------------------

    #[test]
    fn parse_int() {
        assert_eq!(parse("42").unwrap(), Literal::Int(42));
        assert_eq!(parse("-7").unwrap(), Literal::Int(-7));
        assert_eq!(parse("0").unwrap(), Literal::Int(0));
    }

    #[test]
    fn parse_bool_and_none() {
        assert_eq!(parse("True").unwrap(), Literal::Bool(true));
        assert_eq!(parse("False").unwrap(), Literal::Bool(false));
        assert_eq!(parse("None").unwrap(), Literal::None);
    }

    #[test]
    fn parse_single_and_double_quoted_strings() {
        assert_eq!(parse("'boot.py'").unwrap(), Literal::Str("boot.py".into()));
        assert_eq!(parse("\"main.py\"").unwrap(), Literal::Str("main.py".into()));
    }

    #[test]
    fn parse_string_escapes() {
        assert_eq!(
            parse(r"'a\'b\\c\n'").unwrap(),
            Literal::Str("a'b\\c\n".into())
        );
        assert_eq!(parse(r"'\x41\x42'").unwrap(), Literal::Str("AB".into()));
    }

    #[test]
    fn parse_bytes_literal() {
        assert_eq!(parse("b''").unwrap(), Literal::Bytes(vec![]));
        assert_eq!(
            parse(r"b'ab\x00\xff'").unwrap(),
            Literal::Bytes(vec![b'a', b'b', 0x00, 0xff])
        );
    }

    // -- sequences -----------------------------------------------------------

    #[test]
    fn parse_list_of_names() {
        assert_eq!(
            parse("['boot.py', 'lib', 'main.py']").unwrap(),
            Literal::List(vec![
                Literal::Str("boot.py".into()),
                Literal::Str("lib".into()),
                Literal::Str("main.py".into()),
            ])
        );
    }

    #[test]
    fn parse_empty_sequences() {
        assert_eq!(parse("[]").unwrap(), Literal::List(vec![]));
        assert_eq!(parse("()").unwrap(), Literal::List(vec![]));
    }

    #[test]
    fn parse_stat_tuple() {
        let lit = parse("(32768, 0, 0, 0, 0, 0, 1024, 0, 0, 0)").unwrap();
        let items = lit.as_list().unwrap();
        assert_eq!(items.len(), 10);
        assert_eq!(items[0], Literal::Int(32768));
        assert_eq!(items[6], Literal::Int(1024));
    }

    #[test]
    fn parse_trailing_comma_tuple() {
        assert_eq!(
            parse("(1,)").unwrap(),
            Literal::List(vec![Literal::Int(1)])
        );
    }

    #[test]
    fn parse_nested_sequences() {
        assert_eq!(
            parse("[(1, 'a'), [True, None]]").unwrap(),
            Literal::List(vec![
                Literal::List(vec![Literal::Int(1), Literal::Str("a".into())]),
                Literal::List(vec![Literal::Bool(true), Literal::None]),
            ])
        );
    }

    #[test]
    fn parse_surrounding_whitespace() {
        assert_eq!(parse("  [ 1 , 2 ]\r\n").unwrap().as_list().unwrap().len(), 2);
    }

    // -- rejections ----------------------------------------------------------

    #[test]
    fn reject_trailing_garbage() {
        assert!(parse("42 x").is_err());
    }

    #[test]
    fn reject_unterminated_string() {
        assert!(parse("'abc").is_err());
    }

    #[test]
    fn reject_identifiers() {
        assert!(parse("os").is_err());
        assert!(parse("Trueish").is_err());
    }

    #[test]
    fn reject_unknown_escape() {
        assert!(parse(r"'\q'").is_err());
    }

    #[test]
    fn reject_missing_comma() {
        assert!(parse("[1 2]").is_err());
    }

    // -- encoders ------------------------------------------------------------

    #[test]
    fn quote_str_plain_path() {
        assert_eq!(quote_str("/www/index.html"), "'/www/index.html'");
    }

    #[test]
    fn quote_str_escapes_quote_and_backslash() {
        assert_eq!(quote_str("a'b\\c"), r"'a\'b\\c'");
    }

    #[test]
    fn quote_bytes_escapes_non_printable() {
        assert_eq!(quote_bytes(b"a\x00\xff'"), r"b'a\x00\xff\''");
    }

    #[test]
    fn quoted_bytes_round_trip() {
        let data: Vec<u8> = (0u8..=255).collect();
        let encoded = quote_bytes(&data);
        assert_eq!(parse(&encoded).unwrap(), Literal::Bytes(data));
    }

    #[test]
    fn quoted_str_round_trip() {
        let s = "odd 'name'\twith\nnoise\\";
        assert_eq!(parse(&quote_str(s)).unwrap(), Literal::Str(s.into()));
    }
}
