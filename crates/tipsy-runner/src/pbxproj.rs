//! Reader and writer for the ASCII property list dialect of `project.pbxproj`.
//!
//! Supports dictionaries, arrays, quoted and bare strings, `<hex>` data and both
//! comment styles. Comments are dropped on read; Xcode regenerates them.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

pub type Dict = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Array(Vec<Value>),
    Dict(Dict),
    Data(Vec<u8>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("plist parse error at line {line}: {message}")]
pub struct PlistError {
    pub line: usize,
    pub message: String,
}

pub fn parse(text: &str) -> Result<Value, PlistError> {
    let mut parser = Parser {
        chars: text.chars().collect(),
        pos: 0,
        line: 1,
    };
    let value = parser.parse_value()?;
    parser.skip_trivia()?;
    if parser.pos < parser.chars.len() {
        return Err(parser.error("trailing content after root value"));
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Parser {
    fn error(&self, message: impl Into<String>) -> PlistError {
        PlistError {
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn expect(&mut self, want: char) -> Result<(), PlistError> {
        self.skip_trivia()?;
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", want, c))),
            None => Err(self.error(format!("expected '{}', found end of input", want))),
        }
    }

    fn skip_trivia(&mut self) -> Result<(), PlistError> {
        loop {
            match (self.peek(), self.chars.get(self.pos + 1).copied()) {
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                (Some('/'), Some('*')) => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(self.error("unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn parse_value(&mut self) -> Result<Value, PlistError> {
        self.skip_trivia()?;
        match self.peek() {
            Some('{') => self.parse_dict(),
            Some('(') => self.parse_array(),
            Some('<') => self.parse_data(),
            Some('"') | Some('\'') => self.parse_quoted().map(Value::String),
            Some(c) if is_bare_char(c) => Ok(Value::String(self.parse_bare())),
            Some(c) => Err(self.error(format!("unexpected character '{}'", c))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_dict(&mut self) -> Result<Value, PlistError> {
        self.expect('{')?;
        let mut dict = Dict::new();
        loop {
            self.skip_trivia()?;
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Value::Dict(dict));
            }
            let key = match self.parse_value()? {
                Value::String(k) => k,
                _ => return Err(self.error("dictionary keys must be strings")),
            };
            self.expect('=')?;
            let value = self.parse_value()?;
            self.expect(';')?;
            dict.insert(key, value);
        }
    }

    fn parse_array(&mut self) -> Result<Value, PlistError> {
        self.expect('(')?;
        let mut items = Vec::new();
        loop {
            self.skip_trivia()?;
            if self.peek() == Some(')') {
                self.bump();
                return Ok(Value::Array(items));
            }
            items.push(self.parse_value()?);
            self.skip_trivia()?;
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(')') => {}
                _ => return Err(self.error("expected ',' or ')' in array")),
            }
        }
    }

    fn parse_data(&mut self) -> Result<Value, PlistError> {
        self.expect('<')?;
        let mut hex_digits = String::new();
        loop {
            match self.bump() {
                Some('>') => break,
                Some(c) if c.is_ascii_hexdigit() => hex_digits.push(c),
                Some(c) if c.is_whitespace() => {}
                Some(c) => return Err(self.error(format!("invalid data character '{}'", c))),
                None => return Err(self.error("unterminated data")),
            }
        }
        hex::decode(&hex_digits)
            .map(Value::Data)
            .map_err(|e| self.error(format!("invalid data: {}", e)))
    }

    fn parse_quoted(&mut self) -> Result<String, PlistError> {
        let quote = self.bump().ok_or_else(|| self.error("expected quote"))?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let escaped = self.bump().ok_or_else(|| self.error("unterminated escape"))?;
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'U' => {
                            let mut code = String::new();
                            for _ in 0..4 {
                                code.push(self.bump().ok_or_else(|| self.error("short \\U escape"))?);
                            }
                            let ch = u32::from_str_radix(&code, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| self.error(format!("bad \\U escape '{}'", code)))?;
                            out.push(ch);
                        }
                        other => out.push(other),
                    }
                }
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn parse_bare(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if !is_bare_char(c) {
                break;
            }
            out.push(c);
            self.bump();
        }
        out
    }
}

fn is_bare_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_$+/:.-".contains(c)
}

/// Serializes a root value with the UTF-8 marker Xcode expects.
pub fn write(root: &Value) -> String {
    let mut out = String::from("// !$*UTF8*$!\n");
    write_value(&mut out, root, 0);
    out.push('\n');
    out
}

fn write_value(out: &mut String, value: &Value, depth: usize) {
    match value {
        Value::String(s) => out.push_str(&quote(s)),
        Value::Data(bytes) => {
            out.push('<');
            out.push_str(&hex::encode(bytes));
            out.push('>');
        }
        Value::Array(items) => {
            out.push_str("(\n");
            for item in items {
                indent(out, depth + 1);
                write_value(out, item, depth + 1);
                out.push_str(",\n");
            }
            indent(out, depth);
            out.push(')');
        }
        Value::Dict(dict) => {
            out.push_str("{\n");
            // `isa` leads each object, matching Xcode's layout.
            let ordered = dict
                .get_key_value("isa")
                .into_iter()
                .chain(dict.iter().filter(|(k, _)| k.as_str() != "isa"));
            for (key, item) in ordered {
                indent(out, depth + 1);
                let _ = write!(out, "{} = ", quote(key));
                write_value(out, item, depth + 1);
                out.push_str(";\n");
            }
            indent(out, depth);
            out.push('}');
        }
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}

fn quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "_./".contains(c)) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}
