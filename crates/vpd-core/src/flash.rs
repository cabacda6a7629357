//! Access to the physical flash device.
//!
//! The orchestrator only sees the [`Flash`] trait. [`Flashrom`] implements it
//! by running the external `flashrom` tool against staging files.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tempfile::TempPath;
use tracing::debug;

use crate::error::{Result, VpdError};
use crate::fmap::Region;

pub trait Flash {
    /// Reads the whole flash chip.
    fn read_full(&mut self) -> Result<Vec<u8>>;

    /// Reads the directory and `region` only. The returned buffer is a
    /// full-chip sized image with everything else left blank.
    fn read_partial(&mut self, region: Region) -> Result<Vec<u8>>;

    /// Writes `partition` (exactly the region's bytes) back to `region`.
    fn write_partial(&mut self, region: Region, partition: &[u8]) -> Result<()>;
}

/// Temporary files created during one invocation. Every file is removed
/// exactly once, when the area is dropped.
#[derive(Debug, Default)]
pub struct StagingArea {
    files: Vec<TempPath>,
}

impl StagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix("vpd.flashrom.")
            .tempfile()
            .map_err(|e| VpdError::io("creating temporary file", std::env::temp_dir(), e))?;
        let path = file.into_temp_path();
        let owned = path.to_path_buf();
        self.files.push(path);
        Ok(owned)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashromConfig {
    pub program: PathBuf,
    /// Value of flashrom's `-p` option.
    pub programmer: String,
}

impl Default for FlashromConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("flashrom"),
            programmer: "internal".to_string(),
        }
    }
}

/// [`Flash`] backed by the external `flashrom` tool.
#[derive(Debug)]
pub struct Flashrom {
    config: FlashromConfig,
    staging: StagingArea,
    /// Last full-chip image read; flashrom wants one for region writes.
    image: Option<PathBuf>,
}

impl Flashrom {
    pub fn new(config: FlashromConfig) -> Self {
        Self {
            config,
            staging: StagingArea::new(),
            image: None,
        }
    }

    fn run(&self, args: &[String]) -> std::result::Result<(), String> {
        debug!(program = %self.config.program.display(), ?args, "running flashrom");
        let status = Command::new(&self.config.program)
            .arg("-p")
            .arg(&self.config.programmer)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| format!("cannot run {}: {e}", self.config.program.display()))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("{} exited with {status}", self.config.program.display()))
        }
    }

    fn read_back(path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| VpdError::io("reading flashrom output", path, e))
    }
}

fn region_arg(region: Region, file: &Path) -> String {
    format!("{}:{}", region.as_str(), file.display())
}

impl Flash for Flashrom {
    fn read_full(&mut self) -> Result<Vec<u8>> {
        let full = self.staging.create()?;
        self.run(&["-r".into(), full.display().to_string()])
            .map_err(VpdError::FlashRead)?;
        let data = Self::read_back(&full)?;
        self.image = Some(full);
        Ok(data)
    }

    fn read_partial(&mut self, region: Region) -> Result<Vec<u8>> {
        let part = self.staging.create()?;
        let full = self.staging.create()?;
        self.run(&[
            "-i".into(),
            "FMAP".into(),
            "-i".into(),
            region_arg(region, &part),
            "-r".into(),
            full.display().to_string(),
        ])
        .map_err(VpdError::FlashRead)?;
        let data = Self::read_back(&full)?;
        self.image = Some(full);
        Ok(data)
    }

    fn write_partial(&mut self, region: Region, partition: &[u8]) -> Result<()> {
        let part = self.staging.create()?;
        fs::write(&part, partition).map_err(|e| VpdError::io("staging partition", &part, e))?;
        let full = match &self.image {
            Some(p) => p.clone(),
            None => self.staging.create()?,
        };
        self.run(&[
            "-i".into(),
            region_arg(region, &part),
            "-w".into(),
            full.display().to_string(),
            "--noverify-all".into(),
        ])
        .map_err(VpdError::FlashWrite)
    }
}
