//! Load/edit/save pipeline over one firmware image.
//!
//! A [`Session`] owns everything one invocation needs: the loaded image, the
//! located partition, the SPD passthrough bytes and the working container.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::container::Container;
use crate::entry::{self, Pad};
use crate::error::{Result, VpdError};
use crate::export::ExportFormat;
use crate::flash::Flash;
use crate::fmap::{self, DirectoryLookup, FmapLookup, Region, VpdPartition};
use crate::smbios::{self, INFO_LEN, SPD_DEFAULT_LEN, SPD_OFFSET, SpdBlob, TableScan, VPD2_OFFSET};
use crate::smbios_write::{self, info_header};

/// Upper bound for an encoded VPD 2.0 blob (Info header included).
pub const STREAM_CAPACITY: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Partition wrapped in EPS + structure table.
    #[default]
    Structured,
    /// Bare VPD 2.0 stream without any headers; read only.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadOptions {
    pub region: Region,
    pub mode: Mode,
    /// Skip parsing the existing content; the next save re-formats.
    pub overwrite: bool,
    /// ROM address of the partition start, overriding every other source.
    pub eps_base: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    File(PathBuf),
    Flash,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Session {
    opts: LoadOptions,
    origin: Origin,
    image: Vec<u8>,
    partition: VpdPartition,
    eps_base: Option<u32>,
    eps_offset: usize,
    spd: Option<SpdBlob>,
    pairs: Container,
    legacy_record: bool,
}

impl Session {
    /// Loads from a file. In structured mode a missing file is an empty image
    /// that the next save creates; a raw stream must exist. `flash` is only
    /// used to probe the chip for the partition base when the file carries no
    /// directory.
    pub fn load_file(
        path: &Path,
        opts: LoadOptions,
        flash: Option<&mut dyn Flash>,
    ) -> Result<Self> {
        let image = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound && opts.mode == Mode::Structured => {
                warn!(path = %path.display(), "cannot load file, starting empty");
                Vec::new()
            }
            Err(e) => return Err(VpdError::io("reading image", path, e)),
        };
        let mut s = Self::from_image(image, opts, flash, &FmapLookup)?;
        s.origin = Origin::File(path.to_path_buf());
        Ok(s)
    }

    /// Loads from the flash chip: the named region first, the whole chip if
    /// that fails. Each read is attempted once.
    pub fn load_flash(flash: &mut dyn Flash, opts: LoadOptions) -> Result<Self> {
        let image = match flash.read_partial(opts.region) {
            Ok(image) => image,
            Err(e) => {
                warn!("partial flash read failed ({e}), trying full read");
                flash.read_full()?
            }
        };
        let mut s = Self::from_image(image, opts, None, &FmapLookup)?;
        s.origin = Origin::Flash;
        Ok(s)
    }

    pub fn from_image(
        image: Vec<u8>,
        opts: LoadOptions,
        flash: Option<&mut dyn Flash>,
        lookup: &dyn DirectoryLookup,
    ) -> Result<Self> {
        let mut s = Session {
            opts,
            origin: Origin::Memory,
            partition: VpdPartition {
                offset: 0,
                size: image.len() as u32,
                pre_existing: false,
            },
            image,
            eps_base: opts.eps_base,
            eps_offset: 0,
            spd: None,
            pairs: Container::new(),
            legacy_record: false,
        };
        if opts.mode == Mode::Raw {
            let len = s.image.len();
            s.pairs.decode_into(&s.image, len, 0)?;
            return Ok(s);
        }

        s.partition = fmap::locate(&s.image, opts.region, lookup)?;
        if s.partition.pre_existing {
            s.eps_base.get_or_insert(s.partition.offset);
        } else if s.eps_base.is_none() {
            if let Some(flash) = flash {
                s.probe_flash(flash, lookup);
            }
        }
        debug!(partition = ?s.partition, eps_base = ?s.eps_base, "located VPD partition");

        if opts.overwrite || s.image.is_empty() {
            return Ok(s);
        }
        let part = &s.image[s.partition.range()];
        match smbios::walk(part, &mut s.pairs)? {
            TableScan::Erased => {}
            TableScan::Found(table) => {
                if s.eps_base.is_none() {
                    s.eps_base = table.implied_base();
                }
                s.eps_offset = table.eps_offset;
                s.spd = table.spd;
                s.legacy_record = table.has_vpd12;
            }
        }
        Ok(s)
    }

    /// Reads the whole chip to learn where the partition lives in ROM.
    fn probe_flash(&mut self, flash: &mut dyn Flash, lookup: &dyn DirectoryLookup) {
        let found = flash.read_full().and_then(|chip| {
            fmap::locate(&chip, self.opts.region, lookup)
                .map(|p| p.pre_existing.then_some(p))
        });
        match found {
            Ok(Some(p)) => {
                self.eps_base = Some(p.offset);
                self.partition.size = p.size.min(self.partition.size);
            }
            Ok(None) => warn!("no FMAP in full flash image, cannot get EPS base"),
            Err(e) => warn!("cannot read full flash for EPS base: {e}"),
        }
    }

    pub fn region(&self) -> Region {
        self.opts.region
    }
    pub fn partition(&self) -> VpdPartition {
        self.partition
    }
    pub fn eps_base(&self) -> Option<u32> {
        self.eps_base
    }
    pub fn spd(&self) -> Option<&SpdBlob> {
        self.spd.as_ref()
    }
    pub fn has_legacy_record(&self) -> bool {
        self.legacy_record
    }
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn pairs(&self) -> &Container {
        &self.pairs
    }

    pub fn set(&mut self, key: &[u8], value: &[u8], pad: Pad) {
        self.pairs.set(key, value, pad);
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.pairs.delete(key)
    }

    /// Merges `set`, then removes every key in `delete`. Either all edits
    /// apply or none do. Returns whether anything changed.
    pub fn apply_edits(&mut self, set: &Container, delete: &Container) -> Result<bool> {
        let mut next = self.pairs.clone();
        next.merge(set);
        let removed = next.subtract(delete)?;
        self.pairs = next;
        Ok(!set.is_empty() || removed > 0)
    }

    pub fn value_of(&self, key: &[u8]) -> Result<&[u8]> {
        self.pairs.find(key).map(|p| p.display_value())
    }

    pub fn export(&self, format: ExportFormat) -> String {
        self.pairs.export(format)
    }

    /// Info header + encoded pairs + terminator.
    pub fn encode_blob(&self) -> Result<Vec<u8>> {
        let capacity = if self.partition.pre_existing {
            (self.partition.size as usize)
                .saturating_sub(VPD2_OFFSET as usize)
                .min(STREAM_CAPACITY)
        } else {
            STREAM_CAPACITY
        };
        let mut blob = info_header(0).to_vec();
        if blob.len() > capacity {
            return Err(VpdError::Overflow("no room for the VPD 2.0 info header".into()));
        }
        self.pairs.encode_into(capacity, &mut blob)?;
        entry::encode_terminator(capacity, &mut blob)?;
        let size = (blob.len() - INFO_LEN) as u32;
        blob[..INFO_LEN].copy_from_slice(&info_header(size));
        Ok(blob)
    }

    fn check_writable(&self) -> Result<u32> {
        if self.opts.mode == Mode::Raw {
            return Err(VpdError::UnsupportedFormat(
                "changing a raw VPD blob is not supported".into(),
            ));
        }
        if self.legacy_record {
            return Err(VpdError::UnsupportedFormat(
                "writing VPD 1.2 is not supported".into(),
            ));
        }
        self.eps_base.ok_or_else(|| {
            VpdError::Invalid(
                "cannot determine EPS base; ensure a valid FMAP or pass --eps-base".into(),
            )
        })
    }

    /// New partition bytes: the existing partition patched in place when it
    /// came from a directory, a fresh buffer otherwise.
    pub fn build_partition(&self) -> Result<Vec<u8>> {
        let eps_base = self.check_writable()?;
        let blob = self.encode_blob()?;
        let spd_len = self
            .spd
            .as_ref()
            .map(|s| s.data.len() as u32)
            .unwrap_or(SPD_DEFAULT_LEN);
        let table_room = (SPD_OFFSET as usize).saturating_sub(self.eps_offset);
        let tables = smbios_write::build_eps_and_tables(
            eps_base,
            spd_len,
            blob.len() as u32,
            table_room.min(smbios_write::TABLE_CAPACITY),
        )?;
        if let Some(spd) = &self.spd {
            if spd.data.len() > (VPD2_OFFSET - SPD_OFFSET) as usize {
                return Err(VpdError::Overflow(format!(
                    "SPD of {} bytes overlaps the VPD 2.0 area",
                    spd.data.len()
                )));
            }
        }

        let blob_end = VPD2_OFFSET as usize + blob.len();
        let mut part = if self.partition.pre_existing {
            let part = self.image[self.partition.range()].to_vec();
            if blob_end > part.len() {
                return Err(VpdError::Overflow(format!(
                    "VPD data needs {blob_end:#x} bytes, partition has {:#x}",
                    part.len()
                )));
            }
            part
        } else {
            vec![0u8; blob_end]
        };
        let eps_at = self.eps_offset;
        part[eps_at..eps_at + tables.len()].copy_from_slice(&tables);
        if let Some(spd) = &self.spd {
            let at = SPD_OFFSET as usize;
            part[at..at + spd.data.len()].copy_from_slice(&spd.data);
        }
        part[VPD2_OFFSET as usize..blob_end].copy_from_slice(&blob);
        Ok(part)
    }

    /// Bytes of the file a save produces: the whole image with the partition
    /// replaced, or the bare partition when there was no directory.
    pub fn build_file(&self) -> Result<Vec<u8>> {
        let part = self.build_partition()?;
        if !self.partition.pre_existing {
            return Ok(part);
        }
        let mut image = self.image.clone();
        image[self.partition.range()].copy_from_slice(&part);
        Ok(image)
    }

    /// Writes to `path` through a temporary file in the same directory, so a
    /// failed save leaves any existing file untouched.
    pub fn save_file(&self, path: &Path) -> Result<()> {
        let data = self.build_file()?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| VpdError::io("creating temporary file", dir, e))?;
        tmp.write_all(&data)
            .map_err(|e| VpdError::io("writing image", tmp.path().to_path_buf(), e))?;
        tmp.persist(path)
            .map_err(|e| VpdError::io("replacing image", path, e.error))?;
        info!(path = %path.display(), bytes = data.len(), "saved VPD");
        Ok(())
    }

    /// Writes the partition back to the chip.
    pub fn save_flash(&self, flash: &mut dyn Flash) -> Result<()> {
        let part = self.build_partition()?;
        flash.write_partial(self.opts.region, &part)?;
        info!(region = %self.opts.region, bytes = part.len(), "wrote VPD to flash");
        Ok(())
    }

    /// Saves back to wherever the session was loaded from.
    pub fn save(&self, flash: Option<&mut dyn Flash>) -> Result<()> {
        match (&self.origin, flash) {
            (Origin::File(path), _) => self.save_file(path),
            (Origin::Flash, Some(flash)) => self.save_flash(flash),
            (Origin::Flash, None) => Err(VpdError::Invalid("no flash device to write to".into())),
            (Origin::Memory, _) => Err(VpdError::Invalid(
                "session has no save target; use save_file".into(),
            )),
        }
    }
}
