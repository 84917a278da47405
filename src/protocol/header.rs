//! Parsers for the fixed-grammar lines of a response.
//!
//! - start-of-header: `&<code> <field> <field> ...`
//! - column header:   `% v1,\tv2,\t... # <name>`
//! - result row:      `[ v1,\tv2,\t...\t]`
use std::{fmt, str::SplitWhitespace};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at pos {pos} in: \"{line}\"")]
pub struct ParseError {
    pub message: String,
    pub pos: usize,
    pub line: String,
}

impl ParseError {
    fn new(message: impl Into<String>, pos: usize, line: &str) -> Self {
        Self {
            message: message.into(),
            pos,
            line: line.to_string(),
        }
    }
}

/// Decoded start-of-header line; selects the response variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOfHeader {
    /// `&0`, only valid while preparing a statement.
    Parse,
    /// `&1 id tuples columns rows` or `&5 ...` for a prepared statement.
    Table {
        id: i64,
        tuple_count: usize,
        column_count: usize,
        row_count: usize,
        prepared: bool,
    },
    /// `&2 count last_id`
    Update { count: i64, last_id: Option<String> },
    /// `&3`
    Schema,
    /// `&4 t|f`
    Transaction { auto_commit: bool },
    /// `&6 id columns rows offset`
    Block {
        id: i64,
        column_count: usize,
        row_count: usize,
        offset: usize,
    },
}

struct Fields<'a> {
    line: &'a str,
    iter: SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn next_str(&mut self) -> Result<&'a str, ParseError> {
        self.iter
            .next()
            .ok_or_else(|| ParseError::new("unexpected end of header", self.line.len(), self.line))
    }

    fn next_int<T: std::str::FromStr>(&mut self) -> Result<T, ParseError> {
        let field = self.next_str()?;
        field.parse().map_err(|_| {
            let pos = field.as_ptr() as usize - self.line.as_ptr() as usize;
            ParseError::new(format!("expected an integer, found '{field}'"), pos, self.line)
        })
    }
}

impl StartOfHeader {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let bytes = line.as_bytes();
        if bytes.first() != Some(&b'&') {
            return Err(ParseError::new("start of header expected", 0, line));
        }
        let code = bytes
            .get(1)
            .ok_or_else(|| ParseError::new("missing header code", 1, line))?;

        let mut fields = Fields {
            line,
            iter: line.get(2..).unwrap_or_default().split_whitespace(),
        };

        let header = match code {
            b'0' => StartOfHeader::Parse,
            b'1' | b'5' => StartOfHeader::Table {
                id: fields.next_int()?,
                tuple_count: fields.next_int()?,
                column_count: fields.next_int()?,
                row_count: fields.next_int()?,
                prepared: *code == b'5',
            },
            b'2' => {
                let count = fields.next_int()?;
                let last_id = fields.next_str().ok().filter(|id| *id != "-1");
                StartOfHeader::Update {
                    count,
                    last_id: last_id.map(str::to_string),
                }
            }
            b'3' => StartOfHeader::Schema,
            b'4' => StartOfHeader::Transaction {
                auto_commit: fields.next_str()? == "t",
            },
            b'6' => StartOfHeader::Block {
                id: fields.next_int()?,
                column_count: fields.next_int()?,
                row_count: fields.next_int()?,
                offset: fields.next_int()?,
            },
            other => {
                return Err(ParseError::new(
                    format!("unknown header type '{}'", *other as char),
                    1,
                    line,
                ));
            }
        };

        Ok(header)
    }
}

/// Which column property a `%` header line describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderField {
    Name,
    Type,
    Table,
    Length,
    Other(String),
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderField::Name => write!(f, "name"),
            HeaderField::Type => write!(f, "type"),
            HeaderField::Table => write!(f, "table_name"),
            HeaderField::Length => write!(f, "length"),
            HeaderField::Other(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLine {
    pub field: HeaderField,
    pub values: Vec<String>,
}

impl HeaderLine {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        if !line.starts_with('%') {
            return Err(ParseError::new("header line expected", 0, line));
        }
        let sep = line
            .rfind(" # ")
            .ok_or_else(|| ParseError::new("missing header name", line.len(), line))?;

        let field = match line[sep + 3..].trim() {
            "name" => HeaderField::Name,
            "type" => HeaderField::Type,
            "table_name" => HeaderField::Table,
            "length" => HeaderField::Length,
            other => HeaderField::Other(other.to_string()),
        };
        let values = line[1..sep]
            .trim_start()
            .split(",\t")
            .map(|v| v.trim().to_string())
            .collect();

        Ok(Self { field, values })
    }

    /// Values as integers, for the `length` header.
    pub fn int_values(&self, line: &str) -> Result<Vec<usize>, ParseError> {
        self.values
            .iter()
            .map(|v| {
                v.parse()
                    .map_err(|_| ParseError::new(format!("expected an integer, found '{v}'"), 0, line))
            })
            .collect()
    }
}

/// Splits a result row into its fields. Quoted values are unescaped and a
/// bare `NULL` becomes `None`.
pub fn parse_tuple(line: &str) -> Result<Vec<Option<String>>, ParseError> {
    let body = line
        .strip_prefix('[')
        .and_then(|l| l.strip_suffix(']'))
        .ok_or_else(|| ParseError::new("result row expected", 0, line))?;
    let body = body.strip_prefix(' ').unwrap_or(body);
    let body = body.strip_suffix('\t').unwrap_or(body);

    let mut values = Vec::new();
    let mut chars = body.char_indices().peekable();
    let base = body.as_ptr() as usize - line.as_ptr() as usize;

    loop {
        if chars.peek().map(|(_, c)| *c) == Some('"') {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some((_, '"')) => break,
                    Some((_, '\\')) => match chars.next() {
                        Some((_, 'n')) => value.push('\n'),
                        Some((_, 't')) => value.push('\t'),
                        Some((_, 'r')) => value.push('\r'),
                        Some((_, c)) => value.push(c),
                        None => return Err(ParseError::new("dangling escape", line.len(), line)),
                    },
                    Some((_, c)) => value.push(c),
                    None => return Err(ParseError::new("unterminated string", line.len(), line)),
                }
            }
            values.push(Some(value));
        } else {
            let start = chars.peek().map(|(i, _)| *i).unwrap_or(body.len());
            let end = body[start..].find(",\t").map(|i| start + i).unwrap_or(body.len());
            while chars.peek().is_some_and(|(i, _)| *i < end) {
                chars.next();
            }
            let raw = &body[start..end];
            values.push(if raw == "NULL" { None } else { Some(raw.to_string()) });
        }

        match chars.next() {
            None => break,
            Some((i, ',')) if body[i..].starts_with(",\t") => {
                chars.next();
            }
            Some((i, c)) => {
                return Err(ParseError::new(
                    format!("unexpected '{c}' after value"),
                    base + i,
                    line,
                ));
            }
        }
    }

    Ok(values)
}
