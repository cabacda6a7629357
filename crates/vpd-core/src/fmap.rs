//! Partition lookup through the flash map (FMAP) embedded in firmware images.
//!
//! FMAP header (56 bytes): `__FMAP__`, ver_major, ver_minor, base u64,
//! size u32, name[32], nareas u16. Each area (42 bytes): offset u32, size u32,
//! name[32], flags u16. All little endian.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Result, VpdError};
use crate::reader::Reader;

pub const FMAP_SIGNATURE: &[u8; 8] = b"__FMAP__";
pub const FMAP_VER_MAJOR: u8 = 1;
pub const FMAP_HEADER_LEN: usize = 56;
pub const FMAP_AREA_LEN: usize = 42;
const FMAP_NAME_LEN: usize = 32;

/// The two partitions a VPD can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    RoVpd,
    RwVpd,
}

impl Region {
    pub fn as_str(self) -> &'static str {
        match self {
            Region::RoVpd => "RO_VPD",
            Region::RwVpd => "RW_VPD",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = VpdError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RO_VPD" => Ok(Region::RoVpd),
            "RW_VPD" => Ok(Region::RwVpd),
            other => Err(VpdError::Invalid(format!(
                "invalid VPD partition name: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmapArea {
    pub offset: u32,
    pub size: u32,
    pub name: String,
    pub flags: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fmap {
    pub base: u64,
    pub size: u32,
    pub name: String,
    pub areas: Vec<FmapArea>,
}

fn fixed_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl Fmap {
    /// Offset of the first FMAP header with a supported major version.
    pub fn find(image: &[u8]) -> Option<usize> {
        let mut from = 0;
        while let Some(rel) = image
            .get(from..)?
            .windows(FMAP_SIGNATURE.len())
            .position(|w| w == FMAP_SIGNATURE)
        {
            let at = from + rel;
            if image.get(at + 8) == Some(&FMAP_VER_MAJOR) {
                return Some(at);
            }
            from = at + 1;
        }
        None
    }

    pub fn parse(image: &[u8], at: usize) -> Result<Self> {
        let mut r = Reader::at(image, at);
        let sig: [u8; 8] = r
            .read_array()
            .map_err(|_| VpdError::Decode(format!("bad FMAP at {at:#x}")))?;
        if &sig != FMAP_SIGNATURE {
            return Err(VpdError::Decode(format!("no FMAP signature at {at:#x}")));
        }
        let bad = |e: VpdError| VpdError::Decode(format!("bad FMAP at {at:#x}: {e}"));
        let _ver_major = r.read_u8().map_err(bad)?;
        let _ver_minor = r.read_u8().map_err(bad)?;
        let base = r.read_u64().map_err(bad)?;
        let size = r.read_u32().map_err(bad)?;
        let name = fixed_name(r.read_slice(FMAP_NAME_LEN).map_err(bad)?);
        let nareas = r.read_u16().map_err(bad)?;
        let mut areas = Vec::with_capacity(nareas as usize);
        for _ in 0..nareas {
            areas.push(FmapArea {
                offset: r.read_u32().map_err(bad)?,
                size: r.read_u32().map_err(bad)?,
                name: fixed_name(r.read_slice(FMAP_NAME_LEN).map_err(bad)?),
                flags: r.read_u16().map_err(bad)?,
            });
        }
        Ok(Fmap {
            base,
            size,
            name,
            areas,
        })
    }

    pub fn area(&self, name: &str) -> Option<&FmapArea> {
        self.areas.iter().find(|a| a.name == name)
    }

    /// Serializes the map; used to build test images and by tooling that
    /// needs a minimal directory.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FMAP_HEADER_LEN + self.areas.len() * FMAP_AREA_LEN);
        out.extend_from_slice(FMAP_SIGNATURE);
        out.push(FMAP_VER_MAJOR);
        out.push(1);
        out.extend_from_slice(&self.base.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        push_name(&mut out, &self.name);
        out.extend_from_slice(&(self.areas.len() as u16).to_le_bytes());
        for a in &self.areas {
            out.extend_from_slice(&a.offset.to_le_bytes());
            out.extend_from_slice(&a.size.to_le_bytes());
            push_name(&mut out, &a.name);
            out.extend_from_slice(&a.flags.to_le_bytes());
        }
        out
    }
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    let mut raw = [0u8; FMAP_NAME_LEN];
    let n = name.len().min(FMAP_NAME_LEN - 1);
    raw[..n].copy_from_slice(&name.as_bytes()[..n]);
    out.extend_from_slice(&raw);
}

/// Resolves a named region inside an image.
pub trait DirectoryLookup {
    /// `Ok(None)` when the image carries no directory at all; `NotFound` when
    /// the directory exists but lacks `name`.
    fn find_region(&self, image: &[u8], name: &str) -> Result<Option<(u32, u32)>>;
}

/// [`DirectoryLookup`] backed by an FMAP scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct FmapLookup;

impl DirectoryLookup for FmapLookup {
    fn find_region(&self, image: &[u8], name: &str) -> Result<Option<(u32, u32)>> {
        let Some(at) = Fmap::find(image) else {
            return Ok(None);
        };
        let fmap = Fmap::parse(image, at)?;
        debug!(at, areas = fmap.areas.len(), "found FMAP");
        let area = fmap
            .area(name)
            .ok_or_else(|| VpdError::NotFound(format!("partition [{name}] not in FMAP")))?;
        Ok(Some((area.offset, area.size)))
    }
}

/// Where the VPD partition sits inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpdPartition {
    pub offset: u32,
    pub size: u32,
    /// Resolved from a directory; saves patch the image in place.
    pub pre_existing: bool,
}

impl VpdPartition {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..self.offset as usize + self.size as usize
    }
}

/// Finds `region` in `image`, falling back to the whole image when there is
/// no directory.
pub fn locate(
    image: &[u8],
    region: Region,
    lookup: &dyn DirectoryLookup,
) -> Result<VpdPartition> {
    match lookup.find_region(image, region.as_str())? {
        Some((offset, size)) => {
            let end = offset as u64 + size as u64;
            if end > image.len() as u64 {
                return Err(VpdError::Decode(format!(
                    "partition [{region}] {offset:#x}+{size:#x} exceeds image of {:#x} bytes",
                    image.len()
                )));
            }
            Ok(VpdPartition {
                offset,
                size,
                pre_existing: true,
            })
        }
        None => {
            let size = u32::try_from(image.len())
                .map_err(|_| VpdError::Invalid(format!("image of {} bytes too large", image.len())))?;
            Ok(VpdPartition {
                offset: 0,
                size,
                pre_existing: false,
            })
        }
    }
}
