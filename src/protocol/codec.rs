//! String codecs for envelope payloads
//!
//! Three small formats travel inside payload strings:
//!
//! - status broadcasts: `key1:=value1;key2:=value2`
//! - task/job descriptors: `<tag>|key:=value|key:=value` with `\|` and
//!   `\\` escapes for literal separators inside values
//! - kill orders: `<task_id>|<relay_count>`

use crate::error::{Error, Result};

/// Field separator for descriptors and kill payloads
pub const SEP: char = '|';

/// Key/value joiner inside status and descriptor pairs
const KV: &str = ":=";

/// Pair separator in status payloads
const STATUS_SEP: char = ';';

/// Recognized status keys
pub const STATUS_KEY_JOBTIME: &str = "jobtime";
pub const STATUS_KEY_ACTIVITY: &str = "activity";
pub const STATUS_KEY_PEERS: &str = "peers";

// ─────────────────────────────────────────────────────────────────
// Status broadcasts
// ─────────────────────────────────────────────────────────────────

/// Format a status payload: `key1:=value1;key2:=value2`
pub fn encode_status(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}{}{}", k, KV, v))
        .collect::<Vec<_>>()
        .join(&STATUS_SEP.to_string())
}

/// Parse a status payload into key/value pairs.
///
/// Unrecognized keys are kept; pairs without `:=` are skipped.
pub fn decode_status(payload: &str) -> Vec<(String, String)> {
    payload
        .split(STATUS_SEP)
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            pair.split_once(KV)
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Look up a single status key
pub fn status_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

// ─────────────────────────────────────────────────────────────────
// Separator escaping
// ─────────────────────────────────────────────────────────────────

/// Escape literal separators and backslashes inside a descriptor field
pub fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            c if c == SEP => {
                out.push('\\');
                out.push(SEP);
            }
            c => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape_field`]
pub fn unescape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split on unescaped separators
fn split_fields(payload: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for c in payload.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == SEP {
            fields.push(current.clone());
            current.clear();
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    fields.push(current);
    fields
}

// ─────────────────────────────────────────────────────────────────
// Task/job descriptors
// ─────────────────────────────────────────────────────────────────

/// Encode a descriptor: `<tag>|key:=value|key:=value`
pub fn encode_descriptor(tag: &str, pairs: &[(String, String)]) -> String {
    let mut out = escape_field(tag);
    for (k, v) in pairs {
        out.push(SEP);
        out.push_str(&escape_field(k));
        out.push_str(KV);
        out.push_str(&escape_field(v));
    }
    out
}

/// Decode a descriptor into its tag and key/value pairs
pub fn decode_descriptor(payload: &str) -> Result<(String, Vec<(String, String)>)> {
    let fields = split_fields(payload);
    let mut iter = fields.into_iter();

    let tag = iter
        .next()
        .map(|f| unescape_field(&f))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::descriptor("empty descriptor"))?;

    let mut pairs = Vec::new();
    for field in iter {
        if field.is_empty() {
            continue;
        }
        let (k, v) = field
            .split_once(KV)
            .ok_or_else(|| Error::descriptor(format!("field without ':=': {field}")))?;
        pairs.push((unescape_field(k), unescape_field(v)));
    }

    Ok((tag, pairs))
}

// ─────────────────────────────────────────────────────────────────
// Kill orders
// ─────────────────────────────────────────────────────────────────

/// Encode a kill payload: `<task_id>|<relay_count>`
pub fn encode_kill(task_id: &str, relay_count: u32) -> String {
    format!("{}{}{}", escape_field(task_id), SEP, relay_count)
}

/// Decode a kill payload
pub fn decode_kill(payload: &str) -> Result<(String, u32)> {
    let fields = split_fields(payload);
    if fields.len() != 2 {
        return Err(Error::malformed(format!("bad kill payload: {payload}")));
    }

    let task_id = unescape_field(&fields[0]);
    let relay_count: u32 = fields[1]
        .parse()
        .map_err(|_| Error::malformed(format!("bad relay count: {}", fields[1])))?;

    Ok((task_id, relay_count))
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
