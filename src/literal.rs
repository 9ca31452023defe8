//! A parser for Python literal expressions.
//!
//! Accepts what `ast.literal_eval` accepts: numbers (with a single unary sign and
//! `real ± imaginary` complex sums), strings and bytes, `True`/`False`/`None`,
//! lists, tuples, sets, dicts and `set()`. Nothing is evaluated. Numbers keep
//! their source text so they can be echoed back without reformatting.

use std::fmt;

use thiserror::Error;

const MAX_DEPTH: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Source text of the number, including its sign if one was written.
    Number(String),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    None,
    List(Vec<Literal>),
    Tuple(Vec<Literal>),
    Set(Vec<Literal>),
    Dict(Vec<(Literal, Literal)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiteralError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("invalid number literal at offset {offset}")]
    InvalidNumber { offset: usize },
    #[error("malformed expression at offset {offset}")]
    Malformed { offset: usize },
    #[error("invalid escape sequence at offset {offset}")]
    InvalidEscape { offset: usize },
    #[error("unterminated string starting at offset {offset}")]
    UnterminatedString { offset: usize },
    #[error("non-ASCII character in bytes literal at offset {offset}")]
    NonAsciiBytes { offset: usize },
    #[error("cannot mix bytes and str literals at offset {offset}")]
    MixedStringKinds { offset: usize },
    #[error("unknown name {name:?} at offset {offset}")]
    UnknownName { name: String, offset: usize },
    #[error("unhashable {kind} at offset {offset}")]
    Unhashable { kind: &'static str, offset: usize },
    #[error("source contains a null byte")]
    NullByte,
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
    #[error("trailing input at offset {offset}")]
    TrailingInput { offset: usize },
    #[error("unexpected indent at offset {offset}")]
    UnexpectedIndent { offset: usize },
}

pub type Result<T> = std::result::Result<T, LiteralError>;

/// Parses `source` as a single literal expression.
pub fn parse(source: &str) -> Result<Literal> {
    if source.contains('\0') {
        return Err(LiteralError::NullByte);
    }
    let mut parser = Parser::new(source);
    parser.skip_blank()?;
    let first = parser.parse_expr()?;
    parser.skip_trivia();
    let value = if parser.peek() == Some(',') {
        parser.parse_bare_tuple(first)?
    } else {
        first
    };
    parser.skip_blank()?;
    match parser.peek() {
        None => Ok(value),
        Some(_) => Err(LiteralError::TrailingInput {
            offset: parser.offset(),
        }),
    }
}

enum StrPiece {
    Text(String),
    Bytes(Vec<u8>),
}

struct Parser<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    /// Bracket depth. Newlines only separate tokens inside brackets.
    nesting: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().collect(),
            pos: 0,
            nesting: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).map(|(_, c)| *c)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(i, _)| *i)
            .unwrap_or(self.src.len())
    }

    fn unexpected(&self) -> LiteralError {
        match self.peek() {
            Some(found) => LiteralError::UnexpectedChar {
                found,
                offset: self.offset(),
            },
            None => LiteralError::UnexpectedEof,
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    /// Skips spaces, comments and line continuations; newlines too when inside brackets.
    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\x0c' => self.pos += 1,
                '\n' | '\r' if self.nesting > 0 => self.pos += 1,
                '#' => {
                    while !matches!(self.peek(), None | Some('\n') | Some('\r')) {
                        self.pos += 1;
                    }
                }
                '\\' if matches!(self.peek_at(1), Some('\n') | Some('\r')) => {
                    self.pos += 2;
                    if self.chars[self.pos - 1].1 == '\r' && self.peek() == Some('\n') {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    /// Skips whitespace, comments and blank lines around the whole expression.
    /// Only the first line may be indented.
    fn skip_blank(&mut self) -> Result<()> {
        loop {
            self.skip_trivia();
            match self.peek() {
                Some('\n') | Some('\r') => {
                    self.pos += 1;
                    let line_start = self.pos;
                    while matches!(self.peek(), Some(' ' | '\t' | '\x0c')) {
                        self.pos += 1;
                    }
                    if self.pos > line_start
                        && !matches!(self.peek(), None | Some('\n' | '\r' | '#'))
                    {
                        return Err(LiteralError::UnexpectedIndent {
                            offset: self.offset(),
                        });
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.nesting += 1;
        if self.nesting > MAX_DEPTH {
            return Err(LiteralError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn at_number_start(&self) -> bool {
        match self.peek() {
            Some(c) if c.is_ascii_digit() => true,
            Some('.') => self.peek_at(1).is_some_and(|c| c.is_ascii_digit()),
            _ => false,
        }
    }

    /// Number text is the source slice, sign and any inner spacing included.
    fn parse_expr(&mut self) -> Result<Literal> {
        let start = self.offset();
        let left_imag = match self.peek() {
            Some('+' | '-') => {
                self.pos += 1;
                self.skip_trivia();
                if !self.at_number_start() {
                    return Err(LiteralError::Malformed {
                        offset: self.offset(),
                    });
                }
                self.parse_number()?
            }
            _ if self.at_number_start() => self.parse_number()?,
            _ => return self.parse_atom(),
        };
        let left_end = self.offset();
        if left_imag {
            return Ok(Literal::Number(self.src[start..left_end].to_string()));
        }
        // real +/- imaginary
        let save = self.pos;
        self.skip_trivia();
        if matches!(self.peek(), Some('+' | '-')) {
            self.pos += 1;
            self.skip_trivia();
            let offset = self.offset();
            if !self.at_number_start() {
                return Err(LiteralError::Malformed { offset });
            }
            if !self.parse_number()? {
                return Err(LiteralError::Malformed { offset });
            }
            return Ok(Literal::Number(self.src[start..self.offset()].to_string()));
        }
        self.pos = save;
        Ok(Literal::Number(self.src[start..left_end].to_string()))
    }

    fn scan_digits(&mut self, is_digit: impl Fn(char) -> bool) -> Result<()> {
        let offset = self.offset();
        if !self.peek().is_some_and(&is_digit) {
            return Err(LiteralError::InvalidNumber { offset });
        }
        self.pos += 1;
        loop {
            match self.peek() {
                Some('_') => {
                    self.pos += 1;
                    if !self.peek().is_some_and(&is_digit) {
                        return Err(LiteralError::InvalidNumber { offset });
                    }
                }
                Some(c) if is_digit(c) => self.pos += 1,
                _ => return Ok(()),
            }
        }
    }

    /// Scans one number token and reports whether it is imaginary.
    fn parse_number(&mut self) -> Result<bool> {
        let offset = self.offset();
        let mut imag = false;
        let radix_digit: Option<fn(char) -> bool> = match (self.peek(), self.peek_at(1)) {
            (Some('0'), Some('x' | 'X')) => Some(is_hex_digit),
            (Some('0'), Some('o' | 'O')) => Some(is_oct_digit),
            (Some('0'), Some('b' | 'B')) => Some(is_bin_digit),
            _ => None,
        };
        if let Some(is_digit) = radix_digit {
            self.pos += 2;
            // an underscore may follow the prefix
            if self.peek() == Some('_') {
                self.pos += 1;
            }
            self.scan_digits(is_digit)?;
        } else {
            let int_start = self.pos;
            let has_int = self.peek().is_some_and(|c| c.is_ascii_digit());
            if has_int {
                self.scan_digits(|c| c.is_ascii_digit())?;
            }
            let int_text: String = self.chars[int_start..self.pos].iter().map(|(_, c)| c).collect();
            let mut is_float = false;
            if self.peek() == Some('.') {
                self.pos += 1;
                is_float = true;
                if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.scan_digits(|c| c.is_ascii_digit())?;
                }
            }
            if matches!(self.peek(), Some('e' | 'E')) {
                self.pos += 1;
                if matches!(self.peek(), Some('+' | '-')) {
                    self.pos += 1;
                }
                self.scan_digits(|c| c.is_ascii_digit())?;
                is_float = true;
            }
            if matches!(self.peek(), Some('j' | 'J')) {
                self.pos += 1;
                imag = true;
            } else if !is_float
                && int_text.starts_with('0')
                && int_text.chars().any(|c| c != '0' && c != '_')
            {
                // 0123 is not a valid decimal integer
                return Err(LiteralError::InvalidNumber { offset });
            }
        }
        if self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            return Err(LiteralError::InvalidNumber { offset });
        }
        Ok(imag)
    }

    fn parse_atom(&mut self) -> Result<Literal> {
        let offset = self.offset();
        match self.peek() {
            Some('[') => {
                self.pos += 1;
                self.enter()?;
                let items = self.parse_sequence(']')?;
                self.nesting -= 1;
                Ok(Literal::List(items))
            }
            Some('(') => self.parse_paren(),
            Some('{') => self.parse_brace(),
            Some('\'' | '"') => self.parse_strings(),
            Some(c) if c.is_alphabetic() || c == '_' => {
                if self.string_prefix_len().is_some() {
                    return self.parse_strings();
                }
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
                    self.pos += 1;
                }
                let name: String = self.chars[start..self.pos].iter().map(|(_, c)| c).collect();
                match name.as_str() {
                    "True" => Ok(Literal::Bool(true)),
                    "False" => Ok(Literal::Bool(false)),
                    "None" => Ok(Literal::None),
                    "set" => {
                        self.skip_trivia();
                        self.expect('(')?;
                        self.enter()?;
                        self.skip_trivia();
                        self.expect(')')?;
                        self.nesting -= 1;
                        Ok(Literal::Set(Vec::new()))
                    }
                    _ => Err(LiteralError::UnknownName { name, offset }),
                }
            }
            _ => Err(self.unexpected()),
        }
    }

    /// Items up to and including `close`; the opening bracket is already consumed.
    fn parse_sequence(&mut self, close: char) -> Result<Vec<Literal>> {
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.parse_expr()?);
            self.skip_trivia();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(c) if c == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => return Err(self.unexpected()),
            }
        }
    }

    fn parse_paren(&mut self) -> Result<Literal> {
        self.pos += 1;
        self.enter()?;
        self.skip_trivia();
        let value = if self.peek() == Some(')') {
            self.pos += 1;
            Literal::Tuple(Vec::new())
        } else {
            let first = self.parse_expr()?;
            self.skip_trivia();
            match self.peek() {
                Some(')') => {
                    self.pos += 1;
                    first
                }
                Some(',') => {
                    self.pos += 1;
                    let mut items = vec![first];
                    items.extend(self.parse_sequence(')')?);
                    Literal::Tuple(items)
                }
                _ => return Err(self.unexpected()),
            }
        };
        self.nesting -= 1;
        Ok(value)
    }

    fn parse_brace(&mut self) -> Result<Literal> {
        self.pos += 1;
        self.enter()?;
        self.skip_trivia();
        if self.peek() == Some('}') {
            self.pos += 1;
            self.nesting -= 1;
            return Ok(Literal::Dict(Vec::new()));
        }
        let first_offset = self.offset();
        let first = self.parse_expr()?;
        self.skip_trivia();
        let value = if self.peek() == Some(':') {
            self.pos += 1;
            self.skip_trivia();
            let mut entries: Vec<(Literal, Literal)> = Vec::new();
            let mut key = (first, first_offset);
            loop {
                check_hashable(&key.0, key.1)?;
                let value = self.parse_expr()?;
                // a repeated key keeps its first position and takes the last value
                match entries.iter().position(|(k, _)| *k == key.0) {
                    Some(i) => entries[i].1 = value,
                    None => entries.push((key.0, value)),
                }
                self.skip_trivia();
                match self.peek() {
                    Some(',') => {
                        self.pos += 1;
                        self.skip_trivia();
                        if self.peek() == Some('}') {
                            self.pos += 1;
                            break;
                        }
                    }
                    Some('}') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.unexpected()),
                }
                let offset = self.offset();
                let next_key = self.parse_expr()?;
                self.skip_trivia();
                self.expect(':')?;
                self.skip_trivia();
                key = (next_key, offset);
            }
            Literal::Dict(entries)
        } else {
            check_hashable(&first, first_offset)?;
            let mut items = vec![first];
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                    for item in self.parse_sequence('}')? {
                        check_hashable(&item, first_offset)?;
                        if !items.contains(&item) {
                            items.push(item);
                        }
                    }
                }
                Some('}') => self.pos += 1,
                _ => return Err(self.unexpected()),
            }
            Literal::Set(items)
        };
        self.nesting -= 1;
        Ok(value)
    }

    /// `1, 2` without brackets. `first` and the pending comma are at the top level.
    fn parse_bare_tuple(&mut self, first: Literal) -> Result<Literal> {
        let mut items = vec![first];
        while self.peek() == Some(',') {
            self.pos += 1;
            self.skip_trivia();
            if matches!(self.peek(), None | Some('\n') | Some('\r')) {
                break;
            }
            items.push(self.parse_expr()?);
            self.skip_trivia();
        }
        Ok(Literal::Tuple(items))
    }

    /// Number of prefix characters if a string literal starts here.
    fn string_prefix_len(&self) -> Option<usize> {
        let mut n = 0;
        while n < 2 && self.peek_at(n).is_some_and(|c| "rRbBuU".contains(c)) {
            n += 1;
        }
        if !matches!(self.peek_at(n), Some('\'' | '"')) {
            return None;
        }
        let prefix: String = (0..n)
            .filter_map(|i| self.peek_at(i))
            .map(|c| c.to_ascii_lowercase())
            .collect();
        matches!(prefix.as_str(), "" | "r" | "u" | "b" | "br" | "rb").then_some(n)
    }

    /// One string literal followed by any adjacent ones.
    fn parse_strings(&mut self) -> Result<Literal> {
        let mut acc = self.parse_one_string()?;
        loop {
            let save = self.pos;
            self.skip_trivia();
            if self.string_prefix_len().is_none() {
                self.pos = save;
                break;
            }
            let offset = self.offset();
            acc = match (acc, self.parse_one_string()?) {
                (StrPiece::Text(mut a), StrPiece::Text(b)) => {
                    a.push_str(&b);
                    StrPiece::Text(a)
                }
                (StrPiece::Bytes(mut a), StrPiece::Bytes(b)) => {
                    a.extend(b);
                    StrPiece::Bytes(a)
                }
                _ => return Err(LiteralError::MixedStringKinds { offset }),
            };
        }
        Ok(match acc {
            StrPiece::Text(s) => Literal::Str(s),
            StrPiece::Bytes(b) => Literal::Bytes(b),
        })
    }

    fn parse_one_string(&mut self) -> Result<StrPiece> {
        let start_offset = self.offset();
        let n = self.string_prefix_len().ok_or_else(|| self.unexpected())?;
        let prefix: String = (0..n)
            .filter_map(|i| self.peek_at(i))
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let raw = prefix.contains('r');
        let is_bytes = prefix.contains('b');
        self.pos += n;
        let quote = self.bump().ok_or(LiteralError::UnexpectedEof)?;
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.pos += 2;
        }
        let unterminated = LiteralError::UnterminatedString {
            offset: start_offset,
        };
        let mut text = String::new();
        let mut bytes = Vec::new();
        loop {
            let offset = self.offset();
            let c = self.bump().ok_or_else(|| unterminated.clone())?;
            if c == quote {
                if !triple {
                    break;
                }
                if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                    self.pos += 2;
                    break;
                }
            }
            if (c == '\n' || c == '\r') && !triple {
                return Err(unterminated);
            }
            if c == '\\' {
                let next = self.bump().ok_or_else(|| unterminated.clone())?;
                if raw {
                    push_char(&mut text, &mut bytes, is_bytes, '\\', offset)?;
                    push_char(&mut text, &mut bytes, is_bytes, next, offset)?;
                    continue;
                }
                self.parse_escape(next, is_bytes, offset, &mut text, &mut bytes)?;
                continue;
            }
            push_char(&mut text, &mut bytes, is_bytes, c, offset)?;
        }
        Ok(if is_bytes {
            StrPiece::Bytes(bytes)
        } else {
            StrPiece::Text(text)
        })
    }

    fn take_hex(&mut self, count: usize, offset: usize) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            let digit = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or(LiteralError::InvalidEscape { offset })?;
            self.pos += 1;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    fn parse_escape(
        &mut self,
        next: char,
        is_bytes: bool,
        offset: usize,
        text: &mut String,
        bytes: &mut Vec<u8>,
    ) -> Result<()> {
        let simple = match next {
            '\n' => return Ok(()),
            '\r' => {
                if self.peek() == Some('\n') {
                    self.pos += 1;
                }
                return Ok(());
            }
            '\\' | '\'' | '"' => Some(next),
            'a' => Some('\x07'),
            'b' => Some('\x08'),
            'f' => Some('\x0c'),
            'n' => Some('\n'),
            'r' => Some('\r'),
            't' => Some('\t'),
            'v' => Some('\x0b'),
            _ => None,
        };
        if let Some(c) = simple {
            return push_char(text, bytes, is_bytes, c, offset);
        }
        let code = match next {
            '0'..='7' => {
                let mut value = next.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match self.peek().and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            self.pos += 1;
                        }
                        None => break,
                    }
                }
                value
            }
            'x' => self.take_hex(2, offset)?,
            'u' if !is_bytes => self.take_hex(4, offset)?,
            'U' if !is_bytes => self.take_hex(8, offset)?,
            // TODO: resolve \N{...} once a unicode name table is available
            'N' if !is_bytes => return Err(LiteralError::InvalidEscape { offset }),
            _ => {
                // unknown escapes are kept verbatim
                push_char(text, bytes, is_bytes, '\\', offset)?;
                return push_char(text, bytes, is_bytes, next, offset);
            }
        };
        if is_bytes {
            let byte = u8::try_from(code).map_err(|_| LiteralError::InvalidEscape { offset })?;
            bytes.push(byte);
        } else {
            text.push(char::from_u32(code).ok_or(LiteralError::InvalidEscape { offset })?);
        }
        Ok(())
    }
}

fn is_hex_digit(c: char) -> bool {
    c.is_ascii_hexdigit()
}

fn is_oct_digit(c: char) -> bool {
    ('0'..='7').contains(&c)
}

fn is_bin_digit(c: char) -> bool {
    c == '0' || c == '1'
}

fn push_char(
    text: &mut String,
    bytes: &mut Vec<u8>,
    is_bytes: bool,
    c: char,
    offset: usize,
) -> Result<()> {
    if is_bytes {
        if !c.is_ascii() {
            return Err(LiteralError::NonAsciiBytes { offset });
        }
        bytes.push(c as u8);
    } else {
        text.push(c);
    }
    Ok(())
}

fn check_hashable(value: &Literal, offset: usize) -> Result<()> {
    match value {
        Literal::List(_) => Err(LiteralError::Unhashable {
            kind: "list",
            offset,
        }),
        Literal::Dict(_) => Err(LiteralError::Unhashable {
            kind: "dict",
            offset,
        }),
        Literal::Set(_) => Err(LiteralError::Unhashable { kind: "set", offset }),
        Literal::Tuple(items) => items.iter().try_for_each(|item| check_hashable(item, offset)),
        _ => Ok(()),
    }
}

fn repr_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {
                let code = c as u32;
                if code <= 0xff {
                    out.push_str(&format!("\\x{code:02x}"));
                } else if code <= 0xffff {
                    out.push_str(&format!("\\u{code:04x}"));
                } else {
                    out.push_str(&format!("\\U{code:08x}"));
                }
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn repr_bytes(b: &[u8]) -> String {
    let quote = if b.contains(&b'\'') && !b.contains(&b'"') {
        b'"'
    } else {
        b'\''
    };
    let mut out = String::from("b");
    out.push(quote as char);
    for &byte in b {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b if b == quote => {
                out.push('\\');
                out.push(b as char);
            }
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\x{byte:02x}")),
        }
    }
    out.push(quote as char);
    out
}

fn join_repr<'b>(items: impl Iterator<Item = &'b Literal>) -> String {
    items.map(Literal::repr).collect::<Vec<_>>().join(", ")
}

impl Literal {
    /// Python `repr()` rendering; numbers keep their source text.
    pub fn repr(&self) -> String {
        match self {
            Literal::Number(text) => text.clone(),
            Literal::Str(s) => repr_str(s),
            Literal::Bytes(b) => repr_bytes(b),
            Literal::Bool(true) => "True".to_string(),
            Literal::Bool(false) => "False".to_string(),
            Literal::None => "None".to_string(),
            Literal::List(items) => format!("[{}]", join_repr(items.iter())),
            Literal::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()),
            Literal::Tuple(items) => format!("({})", join_repr(items.iter())),
            Literal::Set(items) if items.is_empty() => "set()".to_string(),
            Literal::Set(items) => format!("{{{}}}", join_repr(items.iter())),
            Literal::Dict(entries) => {
                let body = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{body}}}")
            }
        }
    }
}

/// Python `str()` rendering: strings print bare, everything else as `repr`.
impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => f.write_str(s),
            other => f.write_str(&other.repr()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(text: &str) -> Literal {
        Literal::Number(text.to_string())
    }

    #[test]
    fn coordinate_list() -> Result<()> {
        assert_eq!(parse("[0.42, 0.81]")?, Literal::List(vec![num("0.42"), num("0.81")]));
        assert_eq!(parse("  [0.1,0.2]\n")?, Literal::List(vec![num("0.1"), num("0.2")]));
        Ok(())
    }

    #[test]
    fn numbers_keep_source_text() -> Result<()> {
        assert_eq!(parse("1_000")?, num("1_000"));
        assert_eq!(parse("0x_1F")?, num("0x_1F"));
        assert_eq!(parse("1.5e-3")?, num("1.5e-3"));
        assert_eq!(parse(".5")?, num(".5"));
        assert_eq!(parse("5.")?, num("5."));
        assert_eq!(parse("007.5")?, num("007.5"));
        assert_eq!(parse("000")?, num("000"));
        assert_eq!(parse("3j")?, num("3j"));
        assert_eq!(parse("-0.5")?, num("-0.5"));
        assert_eq!(parse("- 2")?, num("- 2"));
        assert_eq!(parse("1 + 2j")?, num("1 + 2j"));
        assert_eq!(
            parse("[- 0.5, 0.2]")?,
            Literal::List(vec![num("- 0.5"), num("0.2")])
        );
        assert_eq!(parse("-1.5-0.5J")?, num("-1.5-0.5J"));
        Ok(())
    }

    #[test]
    fn malformed_numbers() {
        for src in ["0123", "1__0", "1_", "1e", "0x", "0b2", "1abc", "1.__class__", "--1", "-True", "1 + 2", "2j + 1"] {
            assert!(parse(src).is_err(), "{src} should not parse");
        }
    }

    #[test]
    fn strings_and_escapes() -> Result<()> {
        assert_eq!(parse(r"'a\nb'")?, Literal::Str("a\nb".to_string()));
        assert_eq!(parse(r"r'a\nb'")?, Literal::Str("a\\nb".to_string()));
        assert_eq!(parse(r#""\x41é\101""#)?, Literal::Str("AéA".to_string()));
        assert_eq!(parse(r"'\d'")?, Literal::Str("\\d".to_string()));
        assert_eq!(parse("'a' \"b\"")?, Literal::Str("ab".to_string()));
        assert_eq!(parse("'''x\ny'''")?, Literal::Str("x\ny".to_string()));
        assert_eq!(parse(r"b'\xff' B'a'")?, Literal::Bytes(vec![0xff, b'a']));
        Ok(())
    }

    #[test]
    fn bad_strings() {
        assert!(matches!(
            parse("'abc"),
            Err(LiteralError::UnterminatedString { offset: 0 })
        ));
        assert!(parse("'a\nb'").is_err());
        assert!(matches!(
            parse("'a' b'b'"),
            Err(LiteralError::MixedStringKinds { .. })
        ));
        assert!(parse("b'é'").is_err());
        assert!(parse("f'x'").is_err());
        assert!(parse(r"'\x4'").is_err());
    }

    #[test]
    fn containers() -> Result<()> {
        assert_eq!(parse("()")?, Literal::Tuple(vec![]));
        assert_eq!(parse("(1)")?, num("1"));
        assert_eq!(parse("(1,)")?, Literal::Tuple(vec![num("1")]));
        assert_eq!(parse("1, 2")?, Literal::Tuple(vec![num("1"), num("2")]));
        assert_eq!(parse("{}")?, Literal::Dict(vec![]));
        assert_eq!(parse("set()")?, Literal::Set(vec![]));
        assert_eq!(parse("{1, 2, 1,}")?, Literal::Set(vec![num("1"), num("2")]));
        assert_eq!(
            parse("{'a': 1, 'a': [2]}")?,
            Literal::Dict(vec![(
                Literal::Str("a".to_string()),
                Literal::List(vec![num("2")])
            )])
        );
        assert_eq!(
            parse("[True, None, [],]")?,
            Literal::List(vec![Literal::Bool(true), Literal::None, Literal::List(vec![])])
        );
        Ok(())
    }

    #[test]
    fn rejects_non_literals() {
        for src in ["", "click here", "[1, 2", "[1 2]", "{[1]: 2}", "{(1, [2])}", "[*a]", "x[0]", "print(1)", "[0.4, 0.8] extra", "{1: 2, 3}"] {
            assert!(parse(src).is_err(), "{src:?} should not parse");
        }
        assert_eq!(parse("a\0"), Err(LiteralError::NullByte));
    }

    #[test]
    fn newlines_only_inside_brackets() -> Result<()> {
        assert_eq!(
            parse("[1, # first\n 2]")?,
            Literal::List(vec![num("1"), num("2")])
        );
        assert!(parse("1\n2").is_err());
        assert_eq!(parse("# lead\n\n[1] # tail\n")?, Literal::List(vec![num("1")]));
        Ok(())
    }

    #[test]
    fn only_the_first_line_may_be_indented() -> Result<()> {
        assert_eq!(parse("  [0.1, 0.2]")?, Literal::List(vec![num("0.1"), num("0.2")]));
        assert_eq!(
            parse("\n  [0.1, 0.2]"),
            Err(LiteralError::UnexpectedIndent { offset: 3 })
        );
        assert!(parse("# lead\n\t[1]").is_err());
        assert_eq!(parse("\n  \n[1]\n  # tail\n  ")?, Literal::List(vec![num("1")]));
        Ok(())
    }

    #[test]
    fn nesting_limit() -> Result<()> {
        let ok = format!("{}{}", "[".repeat(50), "]".repeat(50));
        assert!(parse(&ok).is_ok());
        let deep = format!("{}{}", "[".repeat(MAX_DEPTH + 1), "]".repeat(MAX_DEPTH + 1));
        assert_eq!(parse(&deep), Err(LiteralError::TooDeep(MAX_DEPTH)));
        Ok(())
    }

    #[test]
    fn python_style_rendering() -> Result<()> {
        assert_eq!(parse("[1, 'a', (2,), {}]")?.repr(), "[1, 'a', (2,), {}]");
        assert_eq!(parse("\"it's\"")?.repr(), "\"it's\"");
        assert_eq!(parse(r"'tab\there'")?.repr(), r"'tab\there'");
        assert_eq!(parse(r"b'\x00a'")?.repr(), r"b'\x00a'");
        assert_eq!(parse("{1: None}")?.repr(), "{1: None}");
        assert_eq!(parse("'bare'")?.to_string(), "bare");
        assert_eq!(parse("set()")?.to_string(), "set()");
        Ok(())
    }
}
