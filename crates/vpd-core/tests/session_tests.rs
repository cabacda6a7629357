use vpd_core::fmap::{DirectoryLookup, Fmap, FmapArea, FmapLookup};
use vpd_core::smbios::{self, PayloadKind, TableScan, LEGACY_RECORD_LEN};
use vpd_core::smbios_write::{build_eps, info_header};
use vpd_core::{
    Container, Flash, LoadOptions, Mode, Pad, Region, Result, Session, VpdError,
};

const IMAGE_LEN: usize = 0x10000;
const VPD_AT: u32 = 0x4000;
const VPD_LEN: u32 = 0x4000;

/// Blank (erased) image with an FMAP at 0 describing RO_VPD and RW_VPD.
fn fmap_image(ro: (u32, u32)) -> Vec<u8> {
    let fmap = Fmap {
        base: 0,
        size: IMAGE_LEN as u32,
        name: "FLASH".into(),
        areas: vec![
            FmapArea {
                offset: 0,
                size: 0x1000,
                name: "FMAP".into(),
                flags: 0,
            },
            FmapArea {
                offset: ro.0,
                size: ro.1,
                name: "RO_VPD".into(),
                flags: 0,
            },
            FmapArea {
                offset: 0x8000,
                size: 0x4000,
                name: "RW_VPD".into(),
                flags: 0,
            },
        ],
    };
    let mut image = vec![0xFF; IMAGE_LEN];
    let raw = fmap.to_bytes();
    image[..raw.len()].copy_from_slice(&raw);
    image
}

fn with_base(eps_base: u32) -> LoadOptions {
    LoadOptions {
        eps_base: Some(eps_base),
        ..LoadOptions::default()
    }
}

/// Fresh partition (no directory) holding `pairs`, tables addressed from 0.
fn fresh_partition(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut s = Session::from_image(Vec::new(), with_base(0), None, &FmapLookup).unwrap();
    for (k, v) in pairs {
        s.set(k.as_bytes(), v.as_bytes(), Pad::AsLongAs);
    }
    s.build_partition().unwrap()
}

fn walk(part: &[u8]) -> Result<(TableScan, Container)> {
    let mut c = Container::new();
    let scan = smbios::walk(part, &mut c)?;
    Ok((scan, c))
}

// Offsets inside a fresh partition: EPS at 0, first record at 31 (40 bytes +
// "Google\0Google SPD\0\0"), second record at 90.
const SPD_RECORD_UUID_AT: usize = 31 + 4 + 12;
const VPD_RECORD_AT: usize = 90;
const VPD_RECORD_OFFSET_AT: usize = VPD_RECORD_AT + 4 + 12 + 16;

fn blob_record(handle: u16, kind: PayloadKind, offset: u32, size: u32) -> Vec<u8> {
    let mut r = vec![241, 40];
    r.extend_from_slice(&handle.to_le_bytes());
    r.extend_from_slice(&[0u8; 12]);
    r.extend_from_slice(kind.uuid().as_bytes());
    r.extend_from_slice(&offset.to_le_bytes());
    r.extend_from_slice(&size.to_le_bytes());
    r.extend_from_slice(&[0, 0]);
    r
}

#[test]
fn fresh_partition_layout() {
    let part = fresh_partition(&[("KEY", "VALUE")]);
    assert_eq!(&part[..4], b"_SM_");
    assert_eq!(part.len(), 0x600 + 16 + 12);
    assert_eq!(part[0x600..0x610], info_header(12));
    assert_eq!(
        &part[0x610..],
        &[0x01, 0x03, b'K', b'E', b'Y', 0x05, b'V', b'A', b'L', b'U', b'E', 0x00]
    );

    let (scan, c) = walk(&part).unwrap();
    let TableScan::Found(info) = scan else {
        panic!("expected a table");
    };
    assert!(info.eps.checksums_valid());
    assert_eq!(info.eps_offset, 0);
    assert_eq!(info.records.len(), 2);
    assert_eq!(info.records[0].offset, 0x400);
    assert_eq!(info.records[1].offset, 0x610);
    assert!(info.has_vpd2);
    assert_eq!(info.spd.as_ref().map(|s| s.data.len()), Some(256));
    assert_eq!(c.find(b"KEY").unwrap().value, b"VALUE");
}

#[test]
fn empty_container_still_writes_terminator() {
    let part = fresh_partition(&[]);
    assert_eq!(part[0x600..0x610], info_header(1));
    assert_eq!(&part[0x610..], &[0x00]);
    let (_, c) = walk(&part).unwrap();
    assert!(c.is_empty());
}

#[test]
fn walker_rejects_handle_gap() {
    let mut part = fresh_partition(&[("KEY", "VALUE")]);
    part[VPD_RECORD_AT + 2] = 2;
    assert!(matches!(walk(&part), Err(VpdError::Decode(m)) if m.contains("handle")));
}

#[test]
fn walker_rejects_foreign_structure_type() {
    let mut part = fresh_partition(&[("KEY", "VALUE")]);
    part[VPD_RECORD_AT] = 1;
    assert!(matches!(walk(&part), Err(VpdError::Decode(_))));
}

#[test]
fn walker_rejects_unknown_uuid() {
    let mut part = fresh_partition(&[("KEY", "VALUE")]);
    part[SPD_RECORD_UUID_AT] ^= 0x55;
    assert!(matches!(walk(&part), Err(VpdError::Decode(m)) if m.contains("UUID")));
}

#[test]
fn walker_rejects_offset_outside_partition() {
    let mut part = fresh_partition(&[("KEY", "VALUE")]);
    part[VPD_RECORD_OFFSET_AT..VPD_RECORD_OFFSET_AT + 4]
        .copy_from_slice(&0x0010_0000u32.to_le_bytes());
    assert!(matches!(walk(&part), Err(VpdError::Decode(_))));
}

#[test]
fn walker_blank_and_garbage_partitions() {
    assert!(matches!(walk(&[0xFF; 0x1000]).unwrap().0, TableScan::Erased));
    assert!(matches!(walk(&[0x00; 0x1000]), Err(VpdError::Decode(_))));
    assert!(matches!(walk(&[0xFF; 16]), Err(VpdError::Decode(_))));
}

#[test]
fn walker_stops_runaway_chain() {
    let mut part = build_eps(0, 0, 0).to_bytes().to_vec();
    for handle in 0..=65536u32 {
        part.extend(blob_record(handle as u16, PayloadKind::Spd, 0, 0));
    }
    part.extend_from_slice(&[127, 4, 0, 0, 0, 0]);
    assert!(matches!(walk(&part), Err(VpdError::Decode(m)) if m.contains("too many")));
}

#[test]
fn legacy_record_is_read_only() {
    let mut part = vec![0u8; 0x400];
    part[..31].copy_from_slice(&build_eps(0, 1, 0).to_bytes());
    let mut table = blob_record(0, PayloadKind::Vpd12, 0x100, LEGACY_RECORD_LEN as u32);
    table.extend_from_slice(&[127, 4, 1, 0, 0, 0]);
    part[31..31 + table.len()].copy_from_slice(&table);

    let rec = &mut part[0x100..0x100 + LEGACY_RECORD_LEN];
    rec[..5].copy_from_slice(b"SN123");
    rec[0x20..0x24].copy_from_slice(b"SKU1");
    for (i, b) in rec[0x30..0x40].iter_mut().enumerate() {
        *b = i as u8;
    }
    rec[0x80..0x86].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0xab]);

    let s = Session::from_image(part, LoadOptions::default(), None, &FmapLookup).unwrap();
    assert!(s.has_legacy_record());
    assert_eq!(s.value_of(b"Product_SN").unwrap(), b"SN123");
    assert_eq!(s.value_of(b"SKU").unwrap(), b"SKU1");
    assert_eq!(
        s.value_of(b"UUID").unwrap(),
        b"00:01:02:03:04:05:06:07:08:09:0a:0b:0c:0d:0e:0f"
    );
    assert_eq!(s.value_of(b"WLAN_MAC").unwrap(), b"00:11:22:33:44:ab");
    assert_eq!(s.value_of(b"IMEI").unwrap(), b"");
    assert!(matches!(
        s.build_partition(),
        Err(VpdError::UnsupportedFormat(_))
    ));
}

#[test]
fn spd_bytes_survive_a_save() {
    let mut part = fresh_partition(&[("KEY", "VALUE")]);
    for (i, b) in part[0x400..0x500].iter_mut().enumerate() {
        *b = i as u8;
    }
    let mut s = Session::from_image(part.clone(), LoadOptions::default(), None, &FmapLookup)
        .unwrap();
    assert_eq!(s.spd().map(|spd| spd.offset), Some(0x400));
    s.set(b"NEW", b"1", Pad::AsLongAs);
    let out = s.build_partition().unwrap();
    assert_eq!(out[0x400..0x500], part[0x400..0x500]);
}

#[test]
fn base_comes_from_table_when_nothing_else_says() {
    let mut s = Session::from_image(Vec::new(), with_base(0x1000), None, &FmapLookup).unwrap();
    s.set(b"KEY", b"VALUE", Pad::AsLongAs);
    let part = s.build_partition().unwrap();

    let s = Session::from_image(part, LoadOptions::default(), None, &FmapLookup).unwrap();
    assert_eq!(s.eps_base(), Some(0x1000));
    assert_eq!(s.value_of(b"KEY").unwrap(), b"VALUE");
    assert!(s.build_partition().is_ok());
}

#[test]
fn no_base_cannot_save() {
    let mut s =
        Session::from_image(Vec::new(), LoadOptions::default(), None, &FmapLookup).unwrap();
    s.set(b"KEY", b"VALUE", Pad::AsLongAs);
    assert!(matches!(s.build_partition(), Err(VpdError::Invalid(_))));
}

#[test]
fn fmap_image_round_trip_keeps_rest_of_image() {
    let image = fmap_image((VPD_AT, VPD_LEN));
    let mut s = Session::from_image(image.clone(), LoadOptions::default(), None, &FmapLookup)
        .unwrap();
    let p = s.partition();
    assert!(p.pre_existing);
    assert_eq!((p.offset, p.size), (VPD_AT, VPD_LEN));
    assert_eq!(s.eps_base(), Some(VPD_AT));
    assert!(s.pairs().is_empty());

    s.set(b"KEY", b"VALUE", Pad::Len(8));
    let out = s.build_file().unwrap();
    assert_eq!(out.len(), image.len());
    assert_eq!(out[..VPD_AT as usize], image[..VPD_AT as usize]);
    assert_eq!(out[(VPD_AT + VPD_LEN) as usize..], image[(VPD_AT + VPD_LEN) as usize..]);
    // untouched gap between the tables and the SPD area stays erased
    assert_eq!(out[VPD_AT as usize + 0x200], 0xFF);

    let s = Session::from_image(out, LoadOptions::default(), None, &FmapLookup).unwrap();
    assert_eq!(s.value_of(b"KEY").unwrap(), b"VALUE");
    assert_eq!(s.pairs().find(b"KEY").unwrap().value, b"VALUE\0\0\0");
}

#[test]
fn rw_region_is_selected_by_name() {
    let image = fmap_image((VPD_AT, VPD_LEN));
    let opts = LoadOptions {
        region: Region::RwVpd,
        ..LoadOptions::default()
    };
    let s = Session::from_image(image, opts, None, &FmapLookup).unwrap();
    assert_eq!(s.partition().offset, 0x8000);
    assert_eq!(s.eps_base(), Some(0x8000));
}

#[test]
fn directory_without_region_or_out_of_bounds() {
    let mut image = fmap_image((VPD_AT, VPD_LEN));
    // rename RO_VPD so only RW_VPD is left
    let at = 56 + 42 + 8;
    image[at..at + 6].copy_from_slice(b"XX_VPD");
    assert!(matches!(
        Session::from_image(image, LoadOptions::default(), None, &FmapLookup),
        Err(VpdError::NotFound(_))
    ));

    let image = fmap_image((0xF000, 0x4000));
    assert!(matches!(
        Session::from_image(image, LoadOptions::default(), None, &FmapLookup),
        Err(VpdError::Decode(_))
    ));
}

struct FixedRegion(u32, u32);

impl DirectoryLookup for FixedRegion {
    fn find_region(&self, _image: &[u8], _name: &str) -> Result<Option<(u32, u32)>> {
        Ok(Some((self.0, self.1)))
    }
}

#[test]
fn custom_directory_lookup() {
    let image = vec![0xFF; 0x3000];
    let mut s =
        Session::from_image(image, LoadOptions::default(), None, &FixedRegion(0x1000, 0x1000))
            .unwrap();
    assert_eq!(s.eps_base(), Some(0x1000));
    s.set(b"KEY", b"VALUE", Pad::AsLongAs);
    let out = s.build_file().unwrap();
    assert_eq!(&out[0x1000..0x1004], b"_SM_");
    assert!(out[..0x1000].iter().all(|&b| b == 0xFF));
}

#[test]
fn partition_too_small_for_blob() {
    let image = fmap_image((VPD_AT, 0x600));
    let mut s = Session::from_image(image, LoadOptions::default(), None, &FmapLookup).unwrap();
    s.set(b"KEY", b"VALUE", Pad::AsLongAs);
    assert!(matches!(s.build_file(), Err(VpdError::Overflow(_))));
}

#[test]
fn overwrite_skips_existing_content() {
    let part = fresh_partition(&[("KEY", "VALUE")]);
    let opts = LoadOptions {
        overwrite: true,
        eps_base: Some(0),
        ..LoadOptions::default()
    };
    let s = Session::from_image(part, opts, None, &FmapLookup).unwrap();
    assert!(s.pairs().is_empty());
}

#[test]
fn raw_stream_is_read_only() {
    let mut c = Container::new();
    c.set(b"A", b"1", Pad::AsLongAs);
    c.set(b"B", b"2", Pad::AsLongAs);
    let mut raw = c.encode(64).unwrap();
    raw.push(0x00);
    let opts = LoadOptions {
        mode: Mode::Raw,
        ..LoadOptions::default()
    };
    let s = Session::from_image(raw, opts, None, &FmapLookup).unwrap();
    assert_eq!(s.pairs(), &c);
    assert!(matches!(
        s.build_partition(),
        Err(VpdError::UnsupportedFormat(_))
    ));
}

#[test]
fn apply_edits_is_atomic() {
    let part = fresh_partition(&[("KEY", "VALUE")]);
    let mut s = Session::from_image(part, LoadOptions::default(), None, &FmapLookup).unwrap();

    let mut set = Container::new();
    set.set(b"X", b"1", Pad::AsLongAs);
    let mut del = Container::new();
    del.set(b"MISSING", b"", Pad::Len(0));
    assert!(matches!(s.apply_edits(&set, &del), Err(VpdError::NotFound(_))));
    assert!(!s.pairs().contains(b"X"));
    assert_eq!(s.pairs().len(), 1);

    let mut del = Container::new();
    del.set(b"KEY", b"", Pad::Len(0));
    assert!(s.apply_edits(&set, &del).unwrap());
    let keys: Vec<&[u8]> = s.pairs().keys().collect();
    assert_eq!(keys, [b"X" as &[u8]]);

    assert!(!s.apply_edits(&Container::new(), &Container::new()).unwrap());
}

#[test]
fn save_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bios.bin");
    std::fs::write(&path, fmap_image((VPD_AT, VPD_LEN))).unwrap();

    let mut s = Session::load_file(&path, LoadOptions::default(), None).unwrap();
    s.set(b"serial_number", b"ABC-123", Pad::AsLongAs);
    s.save(None).unwrap();

    let data = std::fs::read(&path).unwrap();
    assert_eq!(data.len(), IMAGE_LEN);
    let s = Session::load_file(&path, LoadOptions::default(), None).unwrap();
    assert_eq!(s.value_of(b"serial_number").unwrap(), b"ABC-123");
}

#[test]
fn missing_file_starts_empty_and_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vpd.bin");

    let mut s = Session::load_file(&path, with_base(0), None).unwrap();
    assert!(s.pairs().is_empty());
    s.set(b"KEY", b"VALUE", Pad::AsLongAs);
    s.save(None).unwrap();

    assert_eq!(std::fs::read(&path).unwrap().len(), 0x600 + 16 + 12);
    let s = Session::load_file(&path, LoadOptions::default(), None).unwrap();
    assert_eq!(s.value_of(b"KEY").unwrap(), b"VALUE");
}

#[test]
fn missing_raw_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.bin");
    let opts = LoadOptions {
        mode: Mode::Raw,
        ..LoadOptions::default()
    };
    let err = Session::load_file(&path, opts, None).unwrap_err();
    assert!(matches!(err, VpdError::SystemIo { .. }));
    assert_eq!(err.exit_code(), 7);
}

#[test]
fn failed_save_leaves_file_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small.bin");
    let image = fmap_image((VPD_AT, 0x600));
    std::fs::write(&path, &image).unwrap();

    let mut s = Session::load_file(&path, LoadOptions::default(), None).unwrap();
    s.set(b"KEY", b"VALUE", Pad::AsLongAs);
    assert!(s.save(None).is_err());
    assert_eq!(std::fs::read(&path).unwrap(), image);
}

#[test]
fn memory_session_has_no_save_target() {
    let s = Session::from_image(Vec::new(), with_base(0), None, &FmapLookup).unwrap();
    assert!(matches!(s.save(None), Err(VpdError::Invalid(_))));
}

/// In-memory chip.
struct FakeFlash {
    chip: Vec<u8>,
    partial_fails: bool,
    full_reads: usize,
    written: Option<(Region, Vec<u8>)>,
}

impl FakeFlash {
    fn new(chip: Vec<u8>) -> Self {
        Self {
            chip,
            partial_fails: false,
            full_reads: 0,
            written: None,
        }
    }
}

impl Flash for FakeFlash {
    fn read_full(&mut self) -> Result<Vec<u8>> {
        self.full_reads += 1;
        Ok(self.chip.clone())
    }

    fn read_partial(&mut self, _region: Region) -> Result<Vec<u8>> {
        if self.partial_fails {
            return Err(VpdError::FlashRead("region read not supported".into()));
        }
        Ok(self.chip.clone())
    }

    fn write_partial(&mut self, region: Region, partition: &[u8]) -> Result<()> {
        self.written = Some((region, partition.to_vec()));
        Ok(())
    }
}

#[test]
fn flash_load_falls_back_to_full_read() {
    let mut flash = FakeFlash::new(fmap_image((VPD_AT, VPD_LEN)));
    flash.partial_fails = true;
    let s = Session::load_flash(&mut flash, LoadOptions::default()).unwrap();
    assert_eq!(flash.full_reads, 1);
    assert_eq!(s.eps_base(), Some(VPD_AT));
}

#[test]
fn flash_save_writes_the_partition() {
    let mut flash = FakeFlash::new(fmap_image((VPD_AT, VPD_LEN)));
    let mut s = Session::load_flash(&mut flash, LoadOptions::default()).unwrap();
    assert_eq!(flash.full_reads, 0);
    s.set(b"KEY", b"VALUE", Pad::AsLongAs);
    s.save(Some(&mut flash as &mut dyn Flash)).unwrap();

    let (region, part) = flash.written.take().unwrap();
    assert_eq!(region, Region::RoVpd);
    assert_eq!(part.len(), VPD_LEN as usize);
    let (_, c) = walk(&part).unwrap();
    assert_eq!(c.find(b"KEY").unwrap().value, b"VALUE");
}

#[test]
fn file_without_directory_probes_flash_for_base() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vpd.bin");
    std::fs::write(&path, vec![0xFF; VPD_LEN as usize]).unwrap();

    let mut flash = FakeFlash::new(fmap_image((VPD_AT, VPD_LEN)));
    let s = Session::load_file(&path, LoadOptions::default(), Some(&mut flash as &mut dyn Flash))
        .unwrap();
    assert_eq!(flash.full_reads, 1);
    assert_eq!(s.eps_base(), Some(VPD_AT));
    assert!(!s.partition().pre_existing);

    // an explicit base wins and the chip is left alone
    let mut flash = FakeFlash::new(fmap_image((VPD_AT, VPD_LEN)));
    let s = Session::load_file(&path, with_base(0x20), Some(&mut flash as &mut dyn Flash)).unwrap();
    assert_eq!(flash.full_reads, 0);
    assert_eq!(s.eps_base(), Some(0x20));
}
