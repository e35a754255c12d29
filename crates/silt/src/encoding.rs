//! Bulk-load text encoding
//!
//! Everything a row goes through between upstream JSON and the target's
//! COPY-from-STDIN stream lives here: the text format itself (delimiter
//! `|`, NULL as empty, CSV quote `"`, escape `\`) and the upstream type
//! decoders for values Debezium ships in its binary encodings.
//!
//! The encoding is stable: re-encoding the same logical value yields
//! byte-identical output, which is what lets merged tasks use encoded keys
//! as map keys.

use crate::error::{Result, SiltError};
use crate::table::ColumnType;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, NaiveDate};

/// Field delimiter of the COPY text format.
pub const FIELD_DELIMITER: char = '|';

/// Quote character for text fields.
pub const QUOTE: char = '"';

/// Escape character inside quoted fields.
pub const ESCAPE: char = '\\';

/// Assemble one COPY line from already-decoded field values.
///
/// `None` encodes NULL (empty field). The line carries its trailing
/// newline so encoded keys and tuples can be streamed as-is.
pub fn encode_line(fields: &[Option<String>]) -> String {
    let mut line = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i != 0 {
            line.push(FIELD_DELIMITER);
        }
        if let Some(value) = field {
            line.push_str(value);
        }
    }
    line.push('\n');
    line
}

/// Quote and escape a text value for a CSV-mode COPY field.
///
/// NUL bytes are dropped: the target's text types cannot store them.
pub fn quote_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push(QUOTE);
    for c in value.chars() {
        match c {
            '\0' => continue,
            QUOTE | ESCAPE => {
                out.push(ESCAPE);
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push(QUOTE);
    out
}

/// Escape raw bytes into the bulk-load bytea text form.
///
/// Printable ASCII passes through; a backslash needs one doubling for the
/// bytea parser and another for the COPY escape, hence four on the wire.
/// Everything else becomes a `\\ooo` octal escape.
pub fn escape_binary(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        if b == b'\\' {
            out.push_str("\\\\\\\\");
        } else if !(0x20..=0x7e).contains(&b) {
            out.push_str(&format!("\\\\{:03o}", b));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Decode a base64 big-endian two's-complement integer scaled by
/// `scale` decimal digits, the upstream encoding for NUMERIC columns.
pub fn decode_numeric(data: &str, scale: i32) -> Result<String> {
    let bytes = BASE64
        .decode(data)
        .map_err(|e| SiltError::transform(format!("invalid numeric encoding {data:?}: {e}")))?;
    if bytes.len() > 16 {
        return Err(SiltError::transform(format!(
            "numeric value wider than 128 bits ({} bytes)",
            bytes.len()
        )));
    }
    let mut buf = [if bytes.first().is_some_and(|b| b & 0x80 != 0) {
        0xFF
    } else {
        0x00
    }; 16];
    buf[16 - bytes.len()..].copy_from_slice(&bytes);
    let unscaled = i128::from_be_bytes(buf);
    Ok(format_scaled(unscaled, scale))
}

fn format_scaled(unscaled: i128, scale: i32) -> String {
    if scale <= 0 {
        let mut out = unscaled.to_string();
        out.extend(std::iter::repeat('0').take(-scale as usize));
        return out;
    }
    let scale = scale as usize;
    let sign = if unscaled < 0 { "-" } else { "" };
    let mut digits = unscaled.unsigned_abs().to_string();
    if digits.len() <= scale {
        let mut padded = "0".repeat(scale - digits.len() + 1);
        padded.push_str(&digits);
        digits = padded;
    }
    let split = digits.len() - scale;
    format!("{sign}{}.{}", &digits[..split], &digits[split..])
}

/// Decode an epoch-based TIME/TIMESTAMP value into the target's textual
/// format.
///
/// Upstream sends milliseconds since epoch; values that already carry a
/// zone marker are forwarded untouched.
pub fn decode_time(data: &str, ty: ColumnType) -> Result<String> {
    if data.contains('Z') || !data.chars().all(|c| c.is_ascii_digit() || c == '-') {
        return Ok(data.to_string());
    }
    let (secs, fraction) = data.split_at(data.len().saturating_sub(3));
    let secs: i64 = if secs.is_empty() {
        0
    } else {
        secs.parse()
            .map_err(|e| SiltError::transform(format!("invalid epoch value {data:?}: {e}")))?
    };
    let ts = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| SiltError::transform(format!("epoch value {data:?} out of range")))?;
    let formatted = match ty {
        ColumnType::Time => ts.format("%H:%M:%S"),
        _ => ts.format("%Y-%m-%d %H:%M:%S"),
    };
    Ok(format!("{formatted}.{fraction:0>3}"))
}

/// Decode a DATE value sent as integer days since 1970-01-01.
pub fn decode_date(data: &str) -> Result<String> {
    let days: i64 = data
        .parse()
        .map_err(|e| SiltError::transform(format!("invalid date value {data:?}: {e}")))?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date is valid");
    let date = Duration::try_days(days)
        .and_then(|d| epoch.checked_add_signed(d))
        .ok_or_else(|| SiltError::transform(format!("date value {data:?} out of range")))?;
    Ok(date.format("%Y-%m-%d").to_string())
}

/// Decode a bit string from its base64 little-endian byte encoding,
/// right-trimmed to the declared precision.
pub fn decode_bit(data: &str, precision: usize) -> Result<String> {
    match data {
        "true" => return Ok("1".to_string()),
        "false" => return Ok("0".to_string()),
        _ => {}
    }
    let mut bytes = BASE64
        .decode(data)
        .map_err(|e| SiltError::transform(format!("invalid bit encoding {data:?}: {e}")))?;
    bytes.reverse();
    let bits: String = bytes.iter().map(|b| format!("{b:08b}")).collect();
    let start = bits.len().saturating_sub(precision.max(1));
    Ok(bits[start..].to_string())
}

/// Decode base64-encoded binary data.
pub fn decode_binary(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| SiltError::transform(format!("invalid binary encoding {data:?}: {e}")))
}
