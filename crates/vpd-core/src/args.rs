//! Checks applied to user supplied pairs before they reach a container.
use std::fs;
use std::path::Path;

use crate::container::Container;
use crate::entry::Pad;
use crate::error::{Result, VpdError};

const SERIAL_NUMBER_KEYS: [&[u8]; 2] = [b"serial_number", b"mlb_serial_number"];

/// Key names are limited to `[A-Za-z0-9_.]`.
pub fn check_key_name(key: &[u8]) -> Result<()> {
    match key
        .iter()
        .find(|&&c| !(c.is_ascii_alphanumeric() || c == b'_' || c == b'.'))
    {
        Some(&c) => Err(VpdError::Invalid(format!(
            "VPD key name does not allow char [{}]",
            c as char
        ))),
        None => Ok(()),
    }
}

/// Key check plus the serial-number value rules: non-empty `[A-Za-z0-9-]`,
/// not starting or ending with `-`.
pub fn check_key_value(key: &[u8], value: &[u8]) -> Result<()> {
    check_key_name(key)?;
    if !SERIAL_NUMBER_KEYS.contains(&key) {
        return Ok(());
    }
    if let Some(&c) = value
        .iter()
        .find(|&&c| !(c.is_ascii_alphanumeric() || c == b'-'))
    {
        return Err(VpdError::Invalid(format!(
            "serial number does not allow char [{}]",
            c as char
        )));
    }
    match (value.first(), value.last()) {
        (None, _) => Err(VpdError::Invalid("serial number cannot be empty".into())),
        (Some(b'-'), _) => Err(VpdError::Invalid("serial number cannot start with [-]".into())),
        (_, Some(b'-')) => Err(VpdError::Invalid("serial number cannot end with [-]".into())),
        _ => Ok(()),
    }
}

/// Splits `key=value` at the first `=`. A missing `=` yields an empty value.
pub fn split_assignment(arg: &str) -> Result<(&str, &str)> {
    if arg.is_empty() || arg.starts_with('=') {
        return Err(VpdError::Syntax(format!("the string [{arg}] cannot be parsed")));
    }
    Ok(arg.split_once('=').unwrap_or((arg, "")))
}

/// Reads a base64 text file, dropping CR/LF. Any other non-base64 character
/// is rejected.
pub fn read_base64_file(path: &Path) -> Result<Vec<u8>> {
    let raw = fs::read(path).map_err(|e| VpdError::io("reading value file", path, e))?;
    let mut out = Vec::with_capacity(raw.len());
    for (i, &c) in raw.iter().enumerate() {
        if c == b'\n' || c == b'\r' {
            continue;
        }
        if !(c.is_ascii_alphanumeric() || c == b'+' || c == b'/' || c == b'=') {
            return Err(VpdError::Syntax(format!(
                "file {} is not in base64 format ({} at {i})",
                path.display(),
                c as char
            )));
        }
        out.push(c);
    }
    Ok(out)
}

/// Parses a `-s key=value` (or `-S key=file`) argument into `target`.
pub fn add_assignment(target: &mut Container, arg: &str, from_file: bool, pad: Pad) -> Result<()> {
    let (key, value) = split_assignment(arg)?;
    let value = if from_file && arg.contains('=') {
        read_base64_file(Path::new(value))?
    } else {
        value.as_bytes().to_vec()
    };
    check_key_value(key.as_bytes(), &value)?;
    target.set(key.as_bytes(), &value, pad);
    Ok(())
}
