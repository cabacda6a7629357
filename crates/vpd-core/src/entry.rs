// Tag-length-value entry codec: [tag][len key][key][len value][value]
use crate::error::{Result, VpdError};
use crate::reader::Reader;
use crate::varint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    Terminator = 0x00,
    String = 0x01,
    Info = 0xFE,
    ImplicitTerminator = 0xFF,
}

impl EntryType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(EntryType::Terminator),
            0x01 => Some(EntryType::String),
            0xFE => Some(EntryType::Info),
            0xFF => Some(EntryType::ImplicitTerminator),
            _ => None,
        }
    }

    pub fn is_end(tag: u8) -> bool {
        matches!(
            Self::from_tag(tag),
            Some(EntryType::Terminator | EntryType::ImplicitTerminator)
        )
    }
}

/// Target stored length of a value field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pad {
    /// Store exactly the value bytes.
    #[default]
    AsLongAs,
    /// Zero-fill the value up to this many bytes. Never truncates.
    Len(u32),
}

impl Pad {
    /// Negative lengths select [`Pad::AsLongAs`], matching the `-p` option.
    pub fn from_arg(n: i64) -> Self {
        if n < 0 {
            Pad::AsLongAs
        } else {
            Pad::Len(n.min(varint::MAX_LEN as i64) as u32)
        }
    }

    pub fn stored_len(self, value_len: usize) -> usize {
        match self {
            Pad::Len(n) if n as usize > value_len => n as usize,
            _ => value_len,
        }
    }
}

/// Result of decoding one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<'a> {
    Pair { key: &'a [u8], value: &'a [u8] },
    /// Info header entry (magic + declared size); carries no user data.
    Info { key: &'a [u8], value: &'a [u8] },
    End,
}

fn overflow(what: &str, capacity: usize) -> VpdError {
    VpdError::Overflow(format!("{what} exceeds buffer capacity {capacity}"))
}

/// Appends one String entry to `out`, keeping `out.len() <= capacity`.
///
/// `out` is unchanged when the entry does not fit.
pub fn encode_string(
    key: &[u8],
    value: &[u8],
    pad: Pad,
    capacity: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    let mut room = capacity
        .checked_sub(out.len())
        .ok_or_else(|| overflow("existing output", capacity))?;
    let mut buf = Vec::new();

    if room < 1 {
        return Err(overflow("entry tag", capacity));
    }
    buf.push(EntryType::String as u8);
    room -= 1;

    let key_len = varint::encode_len(key.len() as i64, room)?;
    room -= key_len.len();
    buf.extend_from_slice(&key_len);
    if room < key.len() {
        return Err(overflow("key", capacity));
    }
    buf.extend_from_slice(key);
    room -= key.len();

    let stored = pad.stored_len(value.len());
    let value_len = varint::encode_len(stored as i64, room)?;
    room -= value_len.len();
    buf.extend_from_slice(&value_len);
    if room < stored {
        return Err(overflow("value", capacity));
    }
    buf.extend_from_slice(value);
    buf.resize(buf.len() + (stored - value.len()), 0);

    out.extend_from_slice(&buf);
    Ok(())
}

/// Appends a Terminator tag.
pub fn encode_terminator(capacity: usize, out: &mut Vec<u8>) -> Result<()> {
    if out.len() >= capacity {
        return Err(overflow("terminator", capacity));
    }
    out.push(EntryType::Terminator as u8);
    Ok(())
}

/// Decodes the entry at `cursor`, never reading at or past `max_len`.
///
/// Returns the entry and the number of bytes consumed. Terminator tags decode
/// to [`Decoded::End`]; that is not an error.
pub fn decode(buf: &[u8], max_len: usize, cursor: usize) -> Result<(Decoded<'_>, usize)> {
    let data = &buf[..max_len.min(buf.len())];
    let mut r = Reader::at(data, cursor);
    let tag = r.read_u8()?;
    let ty = EntryType::from_tag(tag)
        .ok_or_else(|| VpdError::Decode(format!("unknown entry tag {tag:#04x} at {cursor:#x}")))?;
    match ty {
        EntryType::Terminator | EntryType::ImplicitTerminator => Ok((Decoded::End, 1)),
        EntryType::String | EntryType::Info => {
            let key_len = r.read_len()?;
            let key = r.read_slice(key_len).map_err(|_| {
                VpdError::Decode(format!("key of {key_len} byte(s) truncated at {cursor:#x}"))
            })?;
            let value_len = r.read_len()?;
            let value = r.read_slice(value_len).map_err(|_| {
                VpdError::Decode(format!(
                    "value of {value_len} byte(s) truncated at {cursor:#x}"
                ))
            })?;
            let consumed = r.pos() - cursor;
            let entry = if ty == EntryType::String {
                Decoded::Pair { key, value }
            } else {
                Decoded::Info { key, value }
            };
            Ok((entry, consumed))
        }
    }
}
