//! Structured-field parsing (RFC 8941 subset).
//!
//! The three signature fields (`Signature-Input`, `Signature`,
//! `Signature-Agent`) are RFC 8941 dictionaries. This module implements the
//! subset the verifier needs: dictionaries, inner lists, strings, tokens,
//! byte sequences, integers, booleans, and parameters — with member ordering
//! preserved so labels can be iterated deterministically.
//!
//! Each dictionary member additionally retains the raw source slice of its
//! value. The signature-base builder re-emits that slice verbatim on the
//! `@signature-params` line, so the verifier covers exactly the bytes the
//! signer serialized rather than a canonical re-rendering.

use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;

/// Structured-field parse failure. Surfaces as `invalid_structured_field`
/// in the verdict taxonomy.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid structured field at byte {position}: {message}")]
pub struct ParseError {
    /// Byte offset where parsing stopped.
    pub position: usize,
    /// What went wrong.
    pub message: String,
}

impl ParseError {
    fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// A bare item (RFC 8941 §3.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// `"…"` with backslash escapes
    String(String),
    /// Unquoted token (also covers bare URLs in legacy fields)
    Token(String),
    /// `:base64:` framed byte sequence
    ByteSequence(Vec<u8>),
    /// Signed integer
    Integer(i64),
    /// `?0` / `?1`
    Boolean(bool),
}

impl Item {
    /// String content of a string or token item.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value, if this is an integer item.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Decoded bytes, if this is a byte sequence.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::ByteSequence(b) => Some(b),
            _ => None,
        }
    }
}

/// Ordered parameter list attached to an item, inner list, or member
/// (RFC 8941 §3.1.2). Keys are lowercase; a key without a value is `?1`.
pub type Parameters = Vec<(String, Item)>;

/// Look up a parameter by key.
#[must_use]
pub fn param<'a>(params: &'a Parameters, key: &str) -> Option<&'a Item> {
    params.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// The value of a dictionary member: a single item or an inner list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberValue {
    /// A single bare item
    Item(Item),
    /// `(…)` inner list of items, each with its own parameters
    InnerList(Vec<(Item, Parameters)>),
}

/// One dictionary member: value, member-level parameters, and the raw
/// source slice covering both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Parsed value
    pub value: MemberValue,
    /// Member-level parameters
    pub params: Parameters,
    /// Exact source bytes of `value` plus `params`
    pub raw: String,
}

/// An RFC 8941 dictionary with member order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    /// Members in wire order
    pub members: Vec<(String, Member)>,
}

impl Dictionary {
    /// Parse a dictionary field value.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when delimiters are unbalanced, byte-sequence
    /// framing is malformed, or any member fails to parse.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let mut parser = Parser::new(input);
        let dict = parser.dictionary()?;
        parser.skip_ows();
        if !parser.at_end() {
            return Err(ParseError::new(parser.pos, "trailing characters"));
        }
        Ok(dict)
    }

    /// Look up a member by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Member> {
        self.members.iter().find(|(k, _)| k == key).map(|(_, m)| m)
    }

    /// First member, if any.
    #[must_use]
    pub fn first(&self) -> Option<(&str, &Member)> {
        self.members.first().map(|(k, m)| (k.as_str(), m))
    }
}

// ── Parser ───────────────────────────────────────────────────────────────────

struct Parser<'a> {
    input: &'a [u8],
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            input: src.as_bytes(),
            src,
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, b: u8) -> Result<(), ParseError> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ParseError::new(
                self.pos,
                format!("expected '{}'", char::from(b)),
            ))
        }
    }

    /// Optional whitespace (SP and HTAB — permissive between tokens).
    fn skip_ows(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    /// Spaces only (inside inner lists).
    fn skip_sp(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn dictionary(&mut self) -> Result<Dictionary, ParseError> {
        let mut members = Vec::new();
        self.skip_ows();
        if self.at_end() {
            return Ok(Dictionary { members });
        }

        loop {
            let key = self.key()?;
            let member = if self.peek() == Some(b'=') {
                self.pos += 1;
                let start = self.pos;
                let value = self.member_value()?;
                let params = self.parameters()?;
                Member {
                    value,
                    params,
                    raw: self.src[start..self.pos].to_string(),
                }
            } else {
                // Bare key means boolean true, parameters still allowed
                let start = self.pos;
                let params = self.parameters()?;
                Member {
                    value: MemberValue::Item(Item::Boolean(true)),
                    params,
                    raw: self.src[start..self.pos].to_string(),
                }
            };
            members.push((key, member));

            self.skip_ows();
            if self.at_end() {
                break;
            }
            self.expect(b',')?;
            self.skip_ows();
            if self.at_end() {
                return Err(ParseError::new(self.pos, "trailing comma"));
            }
        }

        Ok(Dictionary { members })
    }

    fn member_value(&mut self) -> Result<MemberValue, ParseError> {
        if self.peek() == Some(b'(') {
            Ok(MemberValue::InnerList(self.inner_list()?))
        } else {
            Ok(MemberValue::Item(self.bare_item()?))
        }
    }

    fn inner_list(&mut self) -> Result<Vec<(Item, Parameters)>, ParseError> {
        self.expect(b'(')?;
        let mut items = Vec::new();
        loop {
            self.skip_sp();
            if self.peek() == Some(b')') {
                self.pos += 1;
                return Ok(items);
            }
            if self.at_end() {
                return Err(ParseError::new(self.pos, "unterminated inner list"));
            }
            let item = self.bare_item()?;
            let params = self.parameters()?;
            items.push((item, params));
            match self.peek() {
                Some(b' ' | b')') => {}
                _ => {
                    return Err(ParseError::new(
                        self.pos,
                        "inner-list items must be separated by spaces",
                    ));
                }
            }
        }
    }

    fn parameters(&mut self) -> Result<Parameters, ParseError> {
        let mut params = Vec::new();
        while self.peek() == Some(b';') {
            self.pos += 1;
            self.skip_sp();
            let key = self.key()?;
            let value = if self.peek() == Some(b'=') {
                self.pos += 1;
                self.bare_item()?
            } else {
                Item::Boolean(true)
            };
            params.push((key, value));
        }
        Ok(params)
    }

    fn key(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        match self.peek() {
            Some(b'a'..=b'z' | b'*') => self.pos += 1,
            _ => return Err(ParseError::new(self.pos, "invalid key start")),
        }
        while matches!(
            self.peek(),
            Some(b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'.' | b'*')
        ) {
            self.pos += 1;
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn bare_item(&mut self) -> Result<Item, ParseError> {
        match self.peek() {
            Some(b'"') => self.string(),
            Some(b':') => self.byte_sequence(),
            Some(b'?') => self.boolean(),
            Some(b'-' | b'0'..=b'9') => self.integer(),
            Some(b'A'..=b'Z' | b'a'..=b'z' | b'*') => self.token(),
            _ => Err(ParseError::new(self.pos, "expected bare item")),
        }
    }

    fn string(&mut self) -> Result<Item, ParseError> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(b'"') => return Ok(Item::String(out)),
                Some(b'\\') => match self.bump() {
                    Some(c @ (b'"' | b'\\')) => out.push(char::from(c)),
                    _ => return Err(ParseError::new(self.pos, "invalid string escape")),
                },
                Some(c @ 0x20..=0x7E) => out.push(char::from(c)),
                Some(_) => {
                    return Err(ParseError::new(self.pos, "non-printable byte in string"));
                }
                None => return Err(ParseError::new(self.pos, "unterminated string")),
            }
        }
    }

    fn byte_sequence(&mut self) -> Result<Item, ParseError> {
        self.expect(b':')?;
        let start = self.pos;
        // RFC 8941 mandates standard base64; URL-safe output from deployed
        // signers is tolerated, so '-' and '_' are accepted here too.
        while matches!(
            self.peek(),
            Some(b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/' | b'=' | b'-' | b'_')
        ) {
            self.pos += 1;
        }
        let encoded = &self.src[start..self.pos];
        if self.peek() != Some(b':') {
            return Err(ParseError::new(self.pos, "unterminated byte sequence"));
        }
        self.pos += 1;
        let decoded = decode_base64_lenient(encoded)
            .ok_or_else(|| ParseError::new(start, "invalid base64 in byte sequence"))?;
        Ok(Item::ByteSequence(decoded))
    }

    fn boolean(&mut self) -> Result<Item, ParseError> {
        self.expect(b'?')?;
        match self.bump() {
            Some(b'0') => Ok(Item::Boolean(false)),
            Some(b'1') => Ok(Item::Boolean(true)),
            _ => Err(ParseError::new(self.pos, "boolean must be ?0 or ?1")),
        }
    }

    fn integer(&mut self) -> Result<Item, ParseError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(ParseError::new(self.pos, "expected digit"));
        }
        if self.peek() == Some(b'.') {
            return Err(ParseError::new(self.pos, "decimals are not supported"));
        }
        self.src[start..self.pos]
            .parse::<i64>()
            .map(Item::Integer)
            .map_err(|_| ParseError::new(start, "integer out of range"))
    }

    fn token(&mut self) -> Result<Item, ParseError> {
        let start = self.pos;
        // First character already validated by bare_item dispatch
        self.pos += 1;
        while let Some(c) = self.peek() {
            let is_tchar = matches!(
                c,
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9'
                    | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+'
                    | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
                    | b':' | b'/'
            );
            if !is_tchar {
                break;
            }
            self.pos += 1;
        }
        Ok(Item::Token(self.src[start..self.pos].to_string()))
    }
}

/// Decode base64 accepting the standard and URL-safe alphabets, with or
/// without padding.
fn decode_base64_lenient(encoded: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};

    STANDARD
        .decode(encoded)
        .or_else(|_| STANDARD_NO_PAD.decode(encoded))
        .or_else(|_| URL_SAFE.decode(encoded))
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
        .ok()
}

// ── Canonical serialization ──────────────────────────────────────────────────

/// Serialize a bare item canonically (RFC 8941 §4.1).
#[must_use]
pub fn serialize_item(item: &Item) -> String {
    match item {
        Item::String(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('"');
            for c in s.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
            out
        }
        Item::Token(t) => t.clone(),
        Item::ByteSequence(b) => format!(":{}:", STANDARD.encode(b)),
        Item::Integer(i) => i.to_string(),
        Item::Boolean(true) => "?1".to_string(),
        Item::Boolean(false) => "?0".to_string(),
    }
}

/// Serialize a parameter list canonically, including the leading `;`s.
#[must_use]
pub fn serialize_params(params: &Parameters) -> String {
    let mut out = String::new();
    for (key, value) in params {
        out.push(';');
        out.push_str(key);
        if *value != Item::Boolean(true) {
            out.push('=');
            out.push_str(&serialize_item(value));
        }
    }
    out
}

/// Serialize a member value (item or inner list) with its parameters.
#[must_use]
pub fn serialize_member(member: &Member) -> String {
    let mut out = match &member.value {
        MemberValue::Item(item) => serialize_item(item),
        MemberValue::InnerList(items) => {
            let inner = items
                .iter()
                .map(|(item, params)| format!("{}{}", serialize_item(item), serialize_params(params)))
                .collect::<Vec<_>>()
                .join(" ");
            format!("({inner})")
        }
    };
    out.push_str(&serialize_params(&member.params));
    out
}
