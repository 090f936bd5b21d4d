//! Comma-separated text codec for store files.
//!
//! Fields containing a delimiter, quote, CR or LF are wrapped in double quotes
//! with inner quotes doubled. Records end with `\n`; `\r\n` is accepted on read.

use std::borrow::Cow;

const BOM: char = '\u{feff}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DecodedRecord {
    /// 1-based line the record starts on.
    pub line: usize,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DecodeError {
    pub line: usize,
    pub message: String,
}

fn quote(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\r', '\n']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

pub(crate) fn push_record<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    let fields: Vec<&str> = fields.into_iter().collect();
    // A lone empty field would otherwise be a blank line, which decode skips.
    if let [only] = fields.as_slice() {
        if only.is_empty() {
            out.push_str("\"\"\n");
            return;
        }
    }

    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&quote(field));
    }
    out.push('\n');
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    FieldStart,
    Unquoted,
    Quoted,
    QuoteClosed,
}

pub(crate) fn decode(content: &str) -> Result<Vec<DecodedRecord>, DecodeError> {
    let content = content.strip_prefix(BOM).unwrap_or(content);

    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut state = State::FieldStart;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        match state {
            State::FieldStart | State::Unquoted | State::QuoteClosed => match ch {
                '"' if state == State::FieldStart => state = State::Quoted,
                ',' => {
                    record.push(std::mem::take(&mut field));
                    state = State::FieldStart;
                }
                '\r' | '\n' => {
                    if ch == '\r' && chars.peek() == Some(&'\n') {
                        let _ = chars.next();
                    }
                    let blank_line =
                        record.is_empty() && field.is_empty() && state == State::FieldStart;
                    if !blank_line {
                        record.push(std::mem::take(&mut field));
                        records.push(DecodedRecord {
                            line: record_line,
                            fields: std::mem::take(&mut record),
                        });
                    }
                    line += 1;
                    record_line = line;
                    state = State::FieldStart;
                }
                '"' => {
                    return Err(DecodeError {
                        line,
                        message: "unexpected quote inside unquoted field".to_string(),
                    })
                }
                _ if state == State::QuoteClosed => {
                    return Err(DecodeError {
                        line,
                        message: format!("unexpected {ch:?} after closing quote"),
                    })
                }
                _ => {
                    field.push(ch);
                    state = State::Unquoted;
                }
            },
            State::Quoted => match ch {
                '"' if chars.peek() == Some(&'"') => {
                    let _ = chars.next();
                    field.push('"');
                }
                '"' => state = State::QuoteClosed,
                _ => {
                    if ch == '\n' {
                        line += 1;
                    }
                    field.push(ch);
                }
            },
        }
    }

    if state == State::Quoted {
        return Err(DecodeError {
            line: record_line,
            message: "unterminated quoted field".to_string(),
        });
    }

    if !(record.is_empty() && field.is_empty() && state == State::FieldStart) {
        record.push(field);
        records.push(DecodedRecord {
            line: record_line,
            fields: record,
        });
    }

    Ok(records)
}
