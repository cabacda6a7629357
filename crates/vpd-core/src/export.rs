use std::fmt::Write as _;
use std::path::Path;

use crate::container::{Container, Pair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// `"key"="value"` lines.
    #[default]
    KeyValue,
    /// `-s "key"="value" \` lines that can be pasted back onto a command line.
    ShellParameter,
    /// `key=value\0` records.
    NullTerminated,
    /// One JSON object, keys in container order.
    Json,
}

/// Comment block printed before `--sh` output.
pub const SHELL_COMMENT: &str = "#\n\
# Prepend 'vpd -O' before this text to always reset VPD content.\n\
# Append more -s at end to set additional key/values.\n\
# Or an empty line followed by other commands.\n\
#\n";

fn text(b: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(b)
}

pub fn export_pair(pair: &Pair, format: ExportFormat, out: &mut String) {
    let key = text(&pair.key);
    let value = text(pair.display_value());
    match format {
        ExportFormat::KeyValue => {
            let _ = writeln!(out, "\"{key}\"=\"{value}\"");
        }
        ExportFormat::ShellParameter => {
            let _ = writeln!(out, "    -s \"{key}\"=\"{value}\" \\");
        }
        ExportFormat::NullTerminated => {
            let _ = write!(out, "{key}={value}\0");
        }
        ExportFormat::Json => {
            let _ = write!(out, "{}", serde_json::json!({ key: value }));
        }
    }
}

/// Renders every pair of `c`. Read only.
pub fn export_container(c: &Container, format: ExportFormat) -> String {
    if format == ExportFormat::Json {
        let map: serde_json::Map<String, serde_json::Value> = c
            .iter()
            .map(|p| {
                (
                    text(&p.key).into_owned(),
                    serde_json::Value::String(text(p.display_value()).into_owned()),
                )
            })
            .collect();
        let mut s = serde_json::to_string_pretty(&serde_json::Value::Object(map))
            .unwrap_or_else(|_| "{}".to_string());
        s.push('\n');
        return s;
    }
    let mut out = String::new();
    for p in c.iter() {
        export_pair(p, format, &mut out);
    }
    out
}

/// Header for `--sh` output: the comment block, then the command prefix that
/// re-applies the listing to the same partition (and file, if any).
pub fn shell_preamble(program: &str, region: &str, file: Option<&Path>) -> String {
    let mut out = String::from(SHELL_COMMENT);
    let _ = writeln!(out, "{program} -i {region} \\");
    if let Some(f) = file {
        let _ = writeln!(out, "    -f {} \\", f.display());
    }
    out
}
