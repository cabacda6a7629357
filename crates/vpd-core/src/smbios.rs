//! SMBIOS-style wrapper table around the VPD data.
//!
//! A partition holds an SMBIOS 2.x entry point structure (EPS) at a 16-byte
//! aligned offset, immediately followed by a chain of type 241 "binary blob
//! pointer" structures and a type 127 end marker. Each blob pointer names a
//! payload by UUID and gives its absolute (ROM) address and size.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::container::Container;
use crate::entry::Pad;
use crate::error::{Result, VpdError};
use crate::reader::Reader;

pub const EPS_ANCHOR: &[u8; 4] = b"_SM_";
pub const IEPS_ANCHOR: &[u8; 5] = b"_DMI_";
pub const EPS_LEN: usize = 0x1F;
pub const EPS_ALIGN: usize = 16;

pub const TYPE_BLOB_POINTER: u8 = 241;
pub const TYPE_END: u8 = 127;
pub const STRUCT_HEADER_LEN: usize = 4;
pub const BLOB_POINTER_LEN: usize = 36;

/// Payload offsets relative to the partition start.
pub const SPD_OFFSET: u32 = 0x400;
pub const VPD2_OFFSET: u32 = 0x600;
/// Largest SPD blob (DDR3).
pub const SPD_DEFAULT_LEN: u32 = 256;

/// Info header placed in front of an embedded VPD 2.0 stream. It is itself a
/// well-formed Info entry: tag, key length 9, key `\x01gVpdInfo`, value length
/// 4, followed by the u32 stream size.
pub const INFO_MAGIC: &[u8; 12] = b"\xfe\x09\x01gVpdInfo\x04";
pub const INFO_LEN: usize = 16;

/// Chains longer than this are treated as corrupt.
pub const MAX_RECORDS: usize = 65536;

pub const SPD_UUID: Uuid = Uuid::from_u128(0x75f4926b_9e43_4b32_8979_eb20c0eda76a);
pub const VPD2_UUID: Uuid = Uuid::from_u128(0x0a7c23d3_8a27_4252_99bf_7868a2e26b61);
pub const VPD12_UUID: Uuid = Uuid::from_u128(0x08f8a2b0_15fd_4aad_9e77_8a4a2e5a1dc1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Raw memory SPD blob, carried through unparsed.
    Spd,
    /// VPD 2.0 TLV stream.
    Vpd2,
    /// Legacy VPD 1.2 fixed record (read only).
    Vpd12,
}

impl PayloadKind {
    pub fn from_uuid(u: &Uuid) -> Option<Self> {
        [PayloadKind::Spd, PayloadKind::Vpd2, PayloadKind::Vpd12]
            .into_iter()
            .find(|k| k.uuid() == *u)
    }
    pub fn uuid(self) -> Uuid {
        match self {
            PayloadKind::Spd => SPD_UUID,
            PayloadKind::Vpd2 => VPD2_UUID,
            PayloadKind::Vpd12 => VPD12_UUID,
        }
    }
}

/// SMBIOS 2.x entry point structure (31 bytes, little endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Eps {
    pub checksum: u8,
    pub entry_length: u8,
    pub major_ver: u8,
    pub minor_ver: u8,
    pub max_size: u16,
    pub entry_rev: u8,
    pub format_area: [u8; 5],
    pub ieps_checksum: u8,
    pub table_length: u16,
    pub table_address: u32,
    pub table_entry_count: u16,
    pub bcd_revision: u8,
}

impl Eps {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let anchor: [u8; 4] = r.read_array()?;
        if &anchor != EPS_ANCHOR {
            return Err(VpdError::Decode("SMBIOS signature is not matched".into()));
        }
        let checksum = r.read_u8()?;
        let entry_length = r.read_u8()?;
        let major_ver = r.read_u8()?;
        let minor_ver = r.read_u8()?;
        let max_size = r.read_u16()?;
        let entry_rev = r.read_u8()?;
        let format_area = r.read_array()?;
        let _ieps_anchor: [u8; 5] = r.read_array()?;
        Ok(Eps {
            checksum,
            entry_length,
            major_ver,
            minor_ver,
            max_size,
            entry_rev,
            format_area,
            ieps_checksum: r.read_u8()?,
            table_length: r.read_u16()?,
            table_address: r.read_u32()?,
            table_entry_count: r.read_u16()?,
            bcd_revision: r.read_u8()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; EPS_LEN] {
        let mut b = [0u8; EPS_LEN];
        b[0..4].copy_from_slice(EPS_ANCHOR);
        b[4] = self.checksum;
        b[5] = self.entry_length;
        b[6] = self.major_ver;
        b[7] = self.minor_ver;
        b[8..10].copy_from_slice(&self.max_size.to_le_bytes());
        b[10] = self.entry_rev;
        b[11..16].copy_from_slice(&self.format_area);
        b[16..21].copy_from_slice(IEPS_ANCHOR);
        b[21] = self.ieps_checksum;
        b[22..24].copy_from_slice(&self.table_length.to_le_bytes());
        b[24..28].copy_from_slice(&self.table_address.to_le_bytes());
        b[28..30].copy_from_slice(&self.table_entry_count.to_le_bytes());
        b[30] = self.bcd_revision;
        b
    }

    /// Both the entry and intermediate checksums sum to zero.
    pub fn checksums_valid(&self) -> bool {
        let b = self.to_bytes();
        let sum = |s: &[u8]| s.iter().fold(0u8, |a, &x| a.wrapping_add(x));
        sum(&b) == 0 && sum(&b[16..]) == 0
    }
}

/// One type 241 record as found in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobPointer {
    pub handle: u16,
    pub uuid: Uuid,
    /// Absolute (ROM) address of the payload.
    pub offset: u32,
    pub size: u32,
}

/// SPD bytes found in the table, with their partition-local offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdBlob {
    pub offset: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    /// Partition-local offset of the EPS.
    pub eps_offset: usize,
    pub eps: Eps,
    pub records: Vec<BlobPointer>,
    pub spd: Option<SpdBlob>,
    pub has_vpd2: bool,
    pub has_vpd12: bool,
}

impl TableInfo {
    /// ROM address that blob pointer offsets are relative to, as implied by
    /// the EPS. Saving with this base keeps the offsets stable.
    pub fn implied_base(&self) -> Option<u32> {
        self.eps.table_address.checked_sub(EPS_LEN as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableScan {
    /// Partition is blank (all 0xFF); valid and empty.
    Erased,
    Found(TableInfo),
}

/// Offset of the first EPS signature at a 16-byte aligned position.
pub fn find_eps(part: &[u8]) -> Option<usize> {
    (0..part.len())
        .step_by(EPS_ALIGN)
        .find(|&i| part[i..].starts_with(EPS_ANCHOR))
}

/// Locates and validates the wrapper table in `part`, decoding VPD payloads
/// into `container`.
pub fn walk(part: &[u8], container: &mut Container) -> Result<TableScan> {
    if part.len() < EPS_LEN {
        return Err(VpdError::Decode(format!(
            "partition of {} bytes is too small for an EPS",
            part.len()
        )));
    }
    let Some(eps_offset) = find_eps(part) else {
        if part.iter().all(|&b| b == 0xFF) {
            warn!("VPD partition not formatted, treating as empty");
            return Ok(TableScan::Erased);
        }
        return Err(VpdError::Decode(
            "SMBIOS signature is not matched; use --overwrite to re-format".into(),
        ));
    };
    let eps = Eps::parse(part.get(eps_offset..).unwrap_or_default())?;
    if !eps.checksums_valid() {
        warn!(eps_offset, "EPS checksum mismatch");
    }
    debug!(
        eps_offset,
        table_address = eps.table_address,
        entries = eps.table_entry_count,
        "found EPS"
    );
    let base = eps.table_address.checked_sub(EPS_LEN as u32).ok_or_else(|| {
        VpdError::Decode(format!(
            "EPS table address {:#x} is below the EPS size",
            eps.table_address
        ))
    })?;

    let mut info = TableInfo {
        eps_offset,
        eps,
        records: Vec::new(),
        spd: None,
        has_vpd2: false,
        has_vpd12: false,
    };
    let mut r = Reader::at(part, eps_offset + eps.entry_length as usize);
    let mut expected: usize = 0;
    loop {
        let header_at = r.pos();
        let ty = r.read_u8()?;
        let length = r.read_u8()? as usize;
        let handle = r.read_u16()?;
        if ty == TYPE_END {
            break;
        }
        if expected >= MAX_RECORDS {
            return Err(VpdError::Decode("too many handles, terminate parsing".into()));
        }
        if ty != TYPE_BLOB_POINTER {
            return Err(VpdError::Decode(format!(
                "only binary blob pointer ({TYPE_BLOB_POINTER}) is supported, \
                 but handle {handle} is type {ty}"
            )));
        }
        if handle as usize != expected {
            return Err(VpdError::Decode(format!(
                "the handle value must be {expected}, but is {handle}; \
                 use --overwrite to re-format"
            )));
        }
        if length < STRUCT_HEADER_LEN + BLOB_POINTER_LEN {
            return Err(VpdError::Decode(format!(
                "type 241 structure length {length} too short at {header_at:#x}"
            )));
        }
        let record = read_blob_pointer(&mut r, handle)?;
        r = Reader::at(part, header_at + length);
        skip_string_set(&mut r)?;

        let index = record
            .offset
            .checked_sub(base)
            .map(|i| i as usize)
            .filter(|&i| i < part.len())
            .ok_or_else(|| {
                VpdError::Decode(format!(
                    "the table offset looks suspicious: offset={:#x} base={base:#x} len={:#x}",
                    record.offset,
                    part.len()
                ))
            })?;
        dispatch(part, &record, index, container, &mut info)?;
        info.records.push(record);
        expected += 1;
    }
    Ok(TableScan::Found(info))
}

fn read_blob_pointer(r: &mut Reader<'_>, handle: u16) -> Result<BlobPointer> {
    // struct major/minor, vendor/description string indexes, major/minor,
    // variant index, 5 reserved bytes.
    r.skip(12)?;
    let uuid = Uuid::from_bytes(r.read_array()?);
    let offset = r.read_u32()?;
    let size = r.read_u32()?;
    Ok(BlobPointer {
        handle,
        uuid,
        offset,
        size,
    })
}

/// Skips the string set after a formatted area, up to and including the
/// double NUL.
fn skip_string_set(r: &mut Reader<'_>) -> Result<()> {
    if r.peek_u8()? == 0 {
        r.skip(2)?;
        return Ok(());
    }
    while !r.read_cstr()?.is_empty() {}
    Ok(())
}

fn dispatch(
    part: &[u8],
    record: &BlobPointer,
    index: usize,
    container: &mut Container,
    info: &mut TableInfo,
) -> Result<()> {
    let kind = PayloadKind::from_uuid(&record.uuid).ok_or_else(|| {
        VpdError::Decode(format!("un-supported UUID: {}", record.uuid.hyphenated()))
    })?;
    debug!(handle = record.handle, ?kind, index, size = record.size, "blob pointer");
    match kind {
        PayloadKind::Spd => {
            let data = index
                .checked_add(record.size as usize)
                .and_then(|end| part.get(index..end))
                .ok_or_else(|| {
                    VpdError::Decode(format!(
                        "SPD offset in blob pointer is not correct: spd={index:#x} len={:#x} partition={:#x}",
                        record.size,
                        part.len()
                    ))
                })?;
            info.spd = Some(SpdBlob {
                offset: index,
                data: data.to_vec(),
            });
        }
        PayloadKind::Vpd2 => {
            container.decode_into(part, part.len(), index)?;
            info.has_vpd2 = true;
        }
        PayloadKind::Vpd12 => {
            let raw = part.get(index..index + LEGACY_RECORD_LEN).ok_or_else(|| {
                VpdError::Decode(format!("VPD 1.2 record at {index:#x} is truncated"))
            })?;
            decode_legacy_record(raw, container);
            info.has_vpd12 = true;
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum FieldKind {
    Text,
    Hex,
}

/// VPD 1.2 record layout: (key, length, rendering), in on-disk order.
const LEGACY_FIELDS: [(&str, usize, FieldKind); 8] = [
    ("Product_SN", 0x20, FieldKind::Text),
    ("SKU", 0x10, FieldKind::Text),
    ("UUID", 0x10, FieldKind::Hex),
    ("MotherBoard_SN", 0x10, FieldKind::Text),
    ("IMEI", 0x10, FieldKind::Text),
    ("SSD_SN", 0x10, FieldKind::Text),
    ("Memory_SN", 0x10, FieldKind::Text),
    ("WLAN_MAC", 0x06, FieldKind::Hex),
];

pub const LEGACY_RECORD_LEN: usize = 0x86;

/// Flattens a VPD 1.2 record into named pairs. Fields past the end of `raw`
/// are skipped.
pub fn decode_legacy_record(raw: &[u8], container: &mut Container) {
    let mut at = 0;
    for (key, len, kind) in LEGACY_FIELDS {
        let Some(field) = raw.get(at..at + len) else {
            break;
        };
        let value = match kind {
            FieldKind::Text => {
                let end = field.iter().position(|&b| b == 0).unwrap_or(len);
                field[..end].to_vec()
            }
            FieldKind::Hex => field
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":")
                .into_bytes(),
        };
        container.set(key.as_bytes(), &value, Pad::AsLongAs);
        at += len;
    }
}
