use uuid::Uuid;

use crate::error::{Result, VpdError};
use crate::smbios::{
    BLOB_POINTER_LEN, EPS_LEN, Eps, INFO_LEN, INFO_MAGIC, PayloadKind, SPD_OFFSET,
    STRUCT_HEADER_LEN, TYPE_BLOB_POINTER, TYPE_END, VPD2_OFFSET,
};

pub const VENDOR: &str = "Google";
pub const SPD_DESCRIPTION: &str = "Google SPD";
pub const VPD2_DESCRIPTION: &str = "Google VPD 2.0";

/// Scratch space reserved for EPS + tables; everything must fit below the SPD.
pub const TABLE_CAPACITY: usize = SPD_OFFSET as usize;

/// 8-bit zero-sum checksum: `sum(buf) + checksum == 0 (mod 256)`.
pub fn zero8_checksum(buf: &[u8]) -> u8 {
    0u8.wrapping_sub(buf.iter().fold(0u8, |a, &b| a.wrapping_add(b)))
}

struct Writer {
    out: Vec<u8>,
    structures: u16,
}

impl Writer {
    fn new() -> Self {
        Self {
            out: Vec::with_capacity(128),
            structures: 0,
        }
    }
    fn push(&mut self, b: u8) {
        self.out.push(b);
    }
    fn write_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn write_u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn write_cstr(&mut self, s: &str) {
        self.out.extend_from_slice(s.as_bytes());
        self.push(0);
    }

    fn header(&mut self, ty: u8, length: u8, handle: u16) {
        self.push(ty);
        self.push(length);
        self.write_u16(handle);
        self.structures += 1;
    }

    /// Type 241 with vendor and description strings; no variant string.
    fn blob_pointer(
        &mut self,
        handle: u16,
        uuid: Uuid,
        offset: u32,
        size: u32,
        description: &str,
    ) {
        self.header(
            TYPE_BLOB_POINTER,
            (STRUCT_HEADER_LEN + BLOB_POINTER_LEN) as u8,
            handle,
        );
        self.push(1); // struct major
        self.push(0); // struct minor
        self.push(1); // vendor string index
        self.push(2); // description string index
        self.push(2); // blob major
        self.push(0); // blob minor
        self.push(0); // variant string index
        self.out.extend_from_slice(&[0u8; 5]);
        self.out.extend_from_slice(uuid.as_bytes());
        self.write_u32(offset);
        self.write_u32(size);
        self.write_cstr(VENDOR);
        self.write_cstr(description);
        self.push(0);
    }

    fn end_of_table(&mut self, handle: u16) {
        self.header(TYPE_END, STRUCT_HEADER_LEN as u8, handle);
        self.push(0);
        self.push(0);
    }
}

/// Builds a fresh EPS for a structure table that directly follows it.
pub fn build_eps(table_length: u16, table_entry_count: u16, eps_base: u32) -> Eps {
    let mut eps = Eps {
        entry_length: EPS_LEN as u8,
        major_ver: 2,
        minor_ver: 6,
        table_length,
        table_address: eps_base.wrapping_add(EPS_LEN as u32),
        table_entry_count,
        bcd_revision: 0x26,
        ..Eps::default()
    };
    let bytes = eps.to_bytes();
    eps.ieps_checksum = zero8_checksum(&bytes[16..]);
    let bytes = eps.to_bytes();
    eps.checksum = zero8_checksum(&bytes);
    eps
}

/// EPS followed by the structure table for an SPD blob of `spd_len` bytes and
/// a VPD 2.0 blob of `blob_len` bytes (Info header included), addressed from
/// `eps_base`. Fails with `Overflow` beyond `capacity` bytes.
pub fn build_eps_and_tables(
    eps_base: u32,
    spd_len: u32,
    blob_len: u32,
    capacity: usize,
) -> Result<Vec<u8>> {
    let mut w = Writer::new();
    w.blob_pointer(
        0,
        PayloadKind::Spd.uuid(),
        eps_base.wrapping_add(SPD_OFFSET),
        spd_len,
        SPD_DESCRIPTION,
    );
    // Readers expect the pointer past the Info header.
    w.blob_pointer(
        1,
        PayloadKind::Vpd2.uuid(),
        eps_base.wrapping_add(VPD2_OFFSET + INFO_LEN as u32),
        blob_len,
        VPD2_DESCRIPTION,
    );
    w.end_of_table(2);

    let table_len = u16::try_from(w.out.len())
        .map_err(|_| VpdError::Overflow("structure table too large".into()))?;
    let eps = build_eps(table_len, w.structures, eps_base);
    let total = EPS_LEN + w.out.len();
    if total > capacity {
        return Err(VpdError::Overflow(format!(
            "EPS and tables need {total} bytes, {capacity} available"
        )));
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&eps.to_bytes());
    out.extend_from_slice(&w.out);
    Ok(out)
}

/// Info header declaring a stream of `size` bytes.
pub fn info_header(size: u32) -> [u8; INFO_LEN] {
    let mut b = [0u8; INFO_LEN];
    b[..INFO_MAGIC.len()].copy_from_slice(INFO_MAGIC);
    b[INFO_MAGIC.len()..].copy_from_slice(&size.to_le_bytes());
    b
}
