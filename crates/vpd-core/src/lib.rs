//! vpd-core: binary format engine for Vital Product Data in firmware images
//!
//! Layers, leaves first:
//! - varint / entry: the length codec and the TLV entry codec
//! - container: insertion-ordered key/value pairs, bulk encode/decode, export
//! - fmap: locating the VPD partition inside a full image
//! - smbios / smbios_write: walking and rebuilding the EPS + blob pointer table
//! - session: the load → edit → save pipeline, with flash access behind a trait
//!
pub mod args;
pub mod container;
pub mod entry;
pub mod error;
pub mod export;
pub mod flash;
pub mod fmap;
pub mod reader;
pub mod session;
pub mod smbios;
pub mod smbios_write;
pub mod varint;

pub use container::{Container, Pair};
pub use entry::Pad;
pub use error::{Result, VpdError};
pub use export::ExportFormat;
pub use flash::{Flash, Flashrom, FlashromConfig, StagingArea};
pub use fmap::{Region, VpdPartition};
pub use session::{LoadOptions, Mode, Session};
