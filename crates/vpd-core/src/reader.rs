// Bounds-checked little-endian reader shared by the stream, table and FMAP parsers.
use crate::error::{Result, VpdError};
use crate::varint;

#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }
    pub fn pos(&self) -> usize {
        self.pos
    }
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn eof(&self, want: usize) -> VpdError {
        VpdError::Decode(format!(
            "need {want} byte(s) at {:#x}, only {} left",
            self.pos,
            self.remaining()
        ))
    }

    pub fn peek_u8(&self) -> Result<u8> {
        self.data.get(self.pos).copied().ok_or_else(|| self.eof(1))
    }
    pub fn read_u8(&mut self) -> Result<u8> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }
    pub fn read_u16(&mut self) -> Result<u16> {
        let s = self.read_slice(2)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }
    pub fn read_u32(&mut self) -> Result<u32> {
        let s = self.read_slice(4)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }
    pub fn read_u64(&mut self) -> Result<u64> {
        let s = self.read_slice(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(s);
        Ok(u64::from_le_bytes(b))
    }
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let s = self.read_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(s);
        Ok(out)
    }
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(self.eof(len));
        }
        let s = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_slice(len).map(|_| ())
    }

    /// Variable-length stream length field, see [`varint::decode_len`].
    pub fn read_len(&mut self) -> Result<usize> {
        let rest = self.data.get(self.pos..).unwrap_or_default();
        let (len, consumed) = varint::decode_len(rest, rest.len())?;
        self.pos += consumed;
        Ok(len as usize)
    }

    /// NUL-terminated string; the terminator is consumed but not returned.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let rest = self.data.get(self.pos..).unwrap_or_default();
        let n = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| VpdError::Decode(format!("unterminated string at {:#x}", self.pos)))?;
        let s = &rest[..n];
        self.pos += n + 1;
        Ok(s)
    }
}
