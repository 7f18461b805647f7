//! Multipart header fields
//!
//! Header lines, Content-Disposition parameters and the filename escape
//! codec. Header names are matched case-insensitively but surfaced with
//! the casing they arrived with.

use crate::error::{Error, Result};

/// Case-insensitive header map preserving every received header.
#[derive(Debug, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&mut self, name: String, value: String) {
        self.entries.push((name, value));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Splits one header line into name and value. The line must carry a `:`.
pub(crate) fn split_header_line(line: &str) -> Result<(String, String)> {
    let colon = line
        .find(':')
        .ok_or_else(|| Error::BadHeader(format!("header line without a colon: {:?}", line)))?;
    let name = line[..colon].trim();
    if name.is_empty() {
        return Err(Error::BadHeader(format!("empty header name: {:?}", line)));
    }
    Ok((name.to_string(), line[colon + 1..].trim().to_string()))
}

/// Extracts the `boundary` parameter from a Content-Type value.
///
/// The parameter name is matched case-insensitively and the value may be
/// quoted; it runs until a `"`, `;` or `=`.
pub(crate) fn boundary_param(content_type: &str) -> Option<&str> {
    let bytes = content_type.as_bytes();
    let mut i = 0;
    while i + 9 <= bytes.len() {
        if bytes[i..i + 9].eq_ignore_ascii_case(b"boundary=") {
            let mut start = i + 9;
            if bytes.get(start) == Some(&b'"') {
                start += 1;
            }
            let mut end = start;
            while end < bytes.len() && !matches!(bytes[end], b'"' | b';' | b'=') {
                end += 1;
            }
            if end > start {
                return Some(&content_type[start..end]);
            }
            return None;
        }
        i += 1;
    }
    None
}

/// Content-Disposition `name` and `filename` parameters.
///
/// The value must introduce itself as `form-data`; both parameters are
/// optional here, their combination is checked by the pipeline.
pub(crate) fn parse_disposition(value: &str) -> Result<(Option<String>, Option<String>)> {
    let mut params = split_params(value);
    let kind = params
        .next()
        .map(|p| p.trim())
        .unwrap_or_default();
    if !kind.eq_ignore_ascii_case("form-data") {
        return Err(Error::BadHeader(format!(
            "Content-Disposition is not form-data: {:?}",
            value
        )));
    }
    let mut name = None;
    let mut filename = None;
    for param in params {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let raw = raw.trim();
        let raw = raw
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .unwrap_or(raw);
        match key.trim() {
            k if k.eq_ignore_ascii_case("name") => name = Some(decode_name(raw)),
            k if k.eq_ignore_ascii_case("filename") => filename = Some(decode_name(raw)),
            _ => {}
        }
    }
    Ok((name, filename))
}

/// Splits `a; b="x;y"; c` on semicolons, honouring double quotes.
fn split_params(value: &str) -> impl Iterator<Item = &str> {
    let mut rest = value;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let mut quoted = false;
        let mut cut = rest.len();
        for (i, b) in rest.bytes().enumerate() {
            match b {
                b'"' => quoted = !quoted,
                b';' if !quoted => {
                    cut = i;
                    break;
                }
                _ => {}
            }
        }
        let (head, tail) = rest.split_at(cut);
        rest = tail.strip_prefix(';').unwrap_or(tail);
        Some(head.trim())
    })
}

/// Escapes a part name or filename for the wire: backslash, double quote
/// and newline are the only characters that would break the quoted-string
/// framing, everything else passes through literally.
pub(crate) fn encode_name(name: &str, out: &mut String) {
    for c in name.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("%22"),
            '\n' => out.push_str("%0A"),
            c => out.push(c),
        }
    }
}

/// Inverse of [`encode_name`], additionally tolerant of the backslash
/// escapes other producers emit: `\uXXXX`, `\xXX`, `\b`, `\f`, `\n`,
/// `\r`, `\t`, and any `%XX` percent escape.
pub(crate) fn decode_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '%' => match hex_escape(&mut chars, 2) {
                Some(v) => out.push(char::from(v as u8)),
                None => out.push('%'),
            },
            '\\' => match chars.next() {
                Some('u') => match hex_escape(&mut chars, 4) {
                    Some(v) => out.push(char::from_u32(v).unwrap_or(char::REPLACEMENT_CHARACTER)),
                    None => out.push_str("\\u"),
                },
                Some('x') => match hex_escape(&mut chars, 2) {
                    Some(v) => out.push(char::from(v as u8)),
                    None => out.push_str("\\x"),
                },
                Some('b') => out.push('\u{8}'),
                Some('f') => out.push('\u{c}'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(c) => out.push(c),
                None => out.push('\\'),
            },
            c => out.push(c),
        }
    }
    out
}

/// Reads exactly `digits` hex digits, consuming nothing unless all of
/// them are present.
fn hex_escape(chars: &mut std::iter::Peekable<std::str::Chars>, digits: usize) -> Option<u32> {
    let mut probe = chars.clone();
    let mut value = 0u32;
    for _ in 0..digits {
        let d = probe.next()?.to_digit(16)?;
        value = value * 16 + d;
    }
    *chars = probe;
    Some(value)
}
