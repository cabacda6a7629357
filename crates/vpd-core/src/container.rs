//! Insertion-ordered key/value container for VPD 2.0 pairs.
//!
//! Keys are unique. A new key is appended at the end; `set` on an existing key
//! replaces value and padding in place, so the encoded order only changes on
//! delete (the remaining pairs keep their relative order) or append.

use tracing::debug;

use crate::entry::{self, Decoded, EntryType, Pad};
use crate::error::{Result, VpdError};
use crate::export::{self, ExportFormat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub pad: Pad,
}

impl Pair {
    pub fn stored_len(&self) -> usize {
        self.pad.stored_len(self.value.len())
    }

    /// Value as shown to users: stored bytes cut at the first NUL.
    pub fn display_value(&self) -> &[u8] {
        let end = self
            .value
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.value.len());
        &self.value[..end]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pairs: Vec<Pair>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &Pair> {
        self.pairs.iter()
    }
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.pairs.iter().map(|p| p.key.as_slice())
    }

    fn position(&self, key: &[u8]) -> Option<usize> {
        self.pairs.iter().position(|p| p.key == key)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8], pad: Pad) {
        match self.position(key) {
            Some(i) => {
                let p = &mut self.pairs[i];
                p.value = value.to_vec();
                p.pad = pad;
            }
            None => self.pairs.push(Pair {
                key: key.to_vec(),
                value: value.to_vec(),
                pad,
            }),
        }
    }

    pub fn find(&self, key: &[u8]) -> Result<&Pair> {
        self.position(key)
            .map(|i| &self.pairs[i])
            .ok_or_else(|| not_found(key))
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.position(key).is_some()
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let i = self.position(key).ok_or_else(|| not_found(key))?;
        self.pairs.remove(i);
        Ok(())
    }

    /// Encodes all pairs in order; the output never exceeds `capacity` bytes.
    /// No terminator is appended.
    pub fn encode(&self, capacity: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(capacity, &mut out)?;
        Ok(out)
    }

    /// Appends the encoded pairs to `out`, keeping `out.len() <= capacity`.
    pub fn encode_into(&self, capacity: usize, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        for p in &self.pairs {
            if let Err(e) = entry::encode_string(&p.key, &p.value, p.pad, capacity, out) {
                out.truncate(start);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Decodes entries starting at `cursor` and `set`s every pair, stopping at
    /// an end-of-stream tag or at `max_len`. Returns the cursor position after
    /// the last decoded entry (the terminator is not consumed).
    pub fn decode_into(&mut self, buf: &[u8], max_len: usize, cursor: usize) -> Result<usize> {
        let limit = max_len.min(buf.len());
        let mut pos = cursor;
        while pos < limit && !EntryType::is_end(buf[pos]) {
            let (decoded, consumed) = entry::decode(buf, limit, pos)?;
            match decoded {
                Decoded::Pair { key, value } => self.set(key, value, Pad::AsLongAs),
                Decoded::Info { value, .. } => {
                    debug!(at = pos, len = value.len(), "skipping info entry");
                }
                Decoded::End => break,
            }
            pos += consumed;
        }
        Ok(pos)
    }

    /// Applies `set` for every pair of `other`, in `other`'s order.
    pub fn merge(&mut self, other: &Container) {
        for p in &other.pairs {
            self.set(&p.key, &p.value, p.pad);
        }
    }

    /// Deletes every key of `other`.
    ///
    /// All keys are checked before anything is removed: if one is missing the
    /// container is left untouched and `NotFound` names the first missing key.
    pub fn subtract(&mut self, other: &Container) -> Result<usize> {
        if let Some(missing) = other.keys().find(|k| !self.contains(k)) {
            return Err(not_found(missing));
        }
        let before = self.pairs.len();
        self.pairs.retain(|p| !other.contains(&p.key));
        Ok(before - self.pairs.len())
    }

    pub fn export(&self, format: ExportFormat) -> String {
        export::export_container(self, format)
    }
}

fn not_found(key: &[u8]) -> VpdError {
    VpdError::NotFound(format!("key '{}'", String::from_utf8_lossy(key)))
}
