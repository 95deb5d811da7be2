use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tempfile::{TempDir, tempdir};

use crate::{
    FsStatError,
    checksum::{get_crc32_iso_hdlc, get_exfatcsum},
    filesystem::*,
    image::{Image, ImageType},
    util::{Endianness, to_hex},
    volume::{PartFlags, VolumeSystem, VsType},
};

fn sparse_file(dir: &TempDir, name: &str, size: u64) -> PathBuf {
    let path = dir.path().join(name);
    File::create(&path).unwrap().set_len(size).unwrap();
    path
}

fn write_at(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
}

fn le16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

fn le32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn le64(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

fn be16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_be_bytes());
}

fn be32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_be_bytes());
}

fn utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

const HFS_FS_ID: [u8; 8] = [0xff, 0x83, 0xfb, 0xdc, 0xb8, 0x63, 0xd7, 0xd8];

fn hfs_header(block_size: u32, total_blocks: u32, next_catalog_id: u32) -> Vec<u8> {
    let mut vh = vec![0u8; 512];
    vh[0..2].copy_from_slice(b"H+");
    be16(&mut vh, 2, 4);
    be32(&mut vh, 32, 12);
    be32(&mut vh, 36, 3);
    be32(&mut vh, 40, block_size);
    be32(&mut vh, 44, total_blocks);
    be32(&mut vh, 64, next_catalog_id);
    vh[80 + 24..80 + 32].copy_from_slice(&HFS_FS_ID);
    vh
}

const APM_HFS_BLOCKS: u64 = 5004 * 4096 / 512;

fn apm_entry(count: u32, start: u32, len: u32, name: &str, part_type: &str) -> Vec<u8> {
    let mut entry = vec![0u8; 512];
    entry[0..2].copy_from_slice(b"PM");
    be32(&mut entry, 4, count);
    be32(&mut entry, 8, start);
    be32(&mut entry, 12, len);
    entry[16..16 + name.len()].copy_from_slice(name.as_bytes());
    entry[48..48 + part_type.len()].copy_from_slice(part_type.as_bytes());
    entry
}

/// Apple partition map with an HFS+ volume at block 64. `second` adds
/// another allocated partition right after it.
fn apm_image(dir: &TempDir, name: &str, second: bool) -> PathBuf {
    let extra = if second { 64 } else { 0 };
    let total = 64 + APM_HFS_BLOCKS + extra;
    let path = sparse_file(dir, name, total * 512);

    let mut ddm = vec![0u8; 512];
    ddm[0..2].copy_from_slice(b"ER");
    be16(&mut ddm, 2, 512);
    be32(&mut ddm, 4, total as u32);
    write_at(&path, 0, &ddm);

    let count = if second { 4 } else { 3 };
    let mut entries = vec![
        apm_entry(count, 1, 62, "Apple", "Apple_partition_map"),
        apm_entry(count, 63, 1, "Extra", "Apple_Free"),
        apm_entry(count, 64, APM_HFS_BLOCKS as u32, "disk image", "Apple_HFS"),
    ];
    if second {
        entries.push(apm_entry(
            count,
            (64 + APM_HFS_BLOCKS) as u32,
            extra as u32,
            "second",
            "Apple_HFS",
        ));
    }
    for (i, entry) in entries.iter().enumerate() {
        write_at(&path, (1 + i as u64) * 512, entry);
    }

    write_at(&path, 32768 + 1024, &hfs_header(4096, 5004, 45));
    path
}

#[test]
fn type_print_test() {
    let listing = type_print();

    assert!(listing.starts_with("Supported file system types:\n"));
    assert!(listing.contains("\tfat (FAT (Auto Detection))\n"));
    assert!(listing.contains("\text (ExtX (Auto Detection))\n"));
    assert!(listing.contains("\thfs (HFS+)\n"));
    assert_eq!(listing.lines().count(), FS_TYPES.len() + 1);

    let images = crate::image::type_print();
    assert!(images.contains("\traw (Single or split raw file (dd))\n"));
}

#[test]
fn fs_type_name_test() {
    assert_eq!(FsType::HFS.name(), "hfs");
    assert_eq!(FsType::EXT4.name(), "ext4");
    assert_eq!(FsType::FAT_DETECT.name(), "fat");
    assert_eq!(FsType::HFS.comment(), "HFS+");
    assert_eq!(FsType::from_short_name("ext4"), Some(FsType::EXT4));
    assert_eq!(FsType::from_short_name("FAT"), Some(FsType::FAT_DETECT));
    assert_eq!(FsType::from_short_name("zfs"), None);
    assert_eq!(FsType::HFS.bits(), 4096);
}

#[test]
fn source_selector_test() {
    assert_eq!("image".parse::<SourceSelector>().unwrap(), SourceSelector::Image);
    assert_eq!("volume".parse::<SourceSelector>().unwrap(), SourceSelector::Volume);
    assert_eq!(
        "part:3".parse::<SourceSelector>().unwrap(),
        SourceSelector::Partition(3)
    );

    for bad in ["disk", "part:", "part:x", "", "Image"] {
        assert!(matches!(
            bad.parse::<SourceSelector>(),
            Err(FsStatError::InvalidSource(s)) if s == bad
        ));
    }
}

#[test]
fn image_open_errors_test() {
    let dir = tempdir().unwrap();

    let empty: [&Path; 0] = [];
    assert!(matches!(Image::open(empty), Err(FsStatError::NoSegments)));

    let missing = dir.path().join("missing.dd");
    assert!(matches!(
        Image::open([&missing]),
        Err(FsStatError::SegmentOpen { path, .. }) if path == missing
    ));
}

#[test]
fn hfs_whole_image_test() {
    let dir = tempdir().unwrap();
    let path = sparse_file(&dir, "hfs.dd", 5004 * 4096);
    write_at(&path, 1024, &hfs_header(4096, 5004, 45));

    let image = Image::open([&path]).unwrap();
    assert_eq!(image.image_type(), ImageType::Raw);
    assert_eq!(image.sector_size(), 512);

    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();

    assert!(fs.is_found());
    assert_eq!(fs.ftype(), Some(FsType::HFS));
    assert_eq!(fs.description(), Some("hfs"));
    assert_eq!(fs.system_name(), Some("hfs"));
    assert_eq!(fs.data_unit_name(), Some("Allocation Block"));
    assert_eq!(fs.offset(), Some(0));
    assert_eq!(fs.block_count(), Some(5004));
    assert_eq!(fs.block_size(), Some(4096));
    assert_eq!(fs.fs_id(), Some(String::from("ff83fbdcb863d7d8")));
    assert_eq!(fs.label(), None);
    assert!(matches!(fs.parent(), FsSource::Image(_)));
}

#[test]
fn hfs_partition_attributes_test() {
    let dir = tempdir().unwrap();
    let path = apm_image(&dir, "apm.dd", false);

    let image = Image::open([&path]).unwrap();
    let vs = VolumeSystem::scan(&image).unwrap();

    assert!(vs.is_found());
    assert_eq!(vs.vs_type(), Some(VsType::Mac));
    assert_eq!(vs.description(), Some("Mac Partition Map"));
    assert_eq!(vs.block_size(), Some(512));
    assert_eq!(vs.endian(), Some(Endianness::Big));
    assert_eq!(vs.offset(), Some(0));
    assert_eq!(vs.partition_count(), 4);

    let parts = vs.parts();
    assert_eq!(parts[0].description(), "Unallocated");
    assert_eq!(parts[0].flags(), PartFlags::UNALLOC);
    assert_eq!(parts[1].description(), "Apple_partition_map");
    assert_eq!(parts[1].flags(), PartFlags::META);
    assert_eq!(parts[2].description(), "Apple_Free");
    assert_eq!(parts[2].flags(), PartFlags::UNALLOC);
    assert_eq!(parts[3].description(), "Apple_HFS");
    assert_eq!(parts[3].start(), 32768);
    assert_eq!(parts[3].len(), APM_HFS_BLOCKS * 512);
    assert_eq!(parts[3].slot(), Some(2));

    let part = vs.part(3).unwrap();
    let fs = FileSystem::open(part, FsOptions::default()).unwrap();

    assert_eq!(fs.block_count(), Some(5004));
    assert_eq!(fs.block_size(), Some(4096));
    assert_eq!(fs.dev_bsize(), Some(4096));
    assert_eq!(fs.endian().map(|e| e.code()), Some(2));
    assert_eq!(fs.first_block(), Some(0));
    assert_eq!(fs.last_block(), Some(5003));
    assert_eq!(fs.last_block_act(), Some(5003));
    assert_eq!(fs.first_inum(), Some(2));
    assert_eq!(fs.root_inum(), Some(2));
    assert_eq!(fs.last_inum(), Some(44));
    assert_eq!(fs.inum_count(), Some(45));
    assert_eq!(fs.journ_inum(), Some(0));
    assert_eq!(fs.flags().map(|f| f.bits()), Some(0));
    assert_eq!(fs.fs_id().as_deref(), Some("ff83fbdcb863d7d8"));
    assert_eq!(fs.fs_id_used(), Some(16));
    assert_eq!(fs.ftype().map(|t| t.bits()), Some(4096));
    assert_eq!(fs.tag(), Some(269488144));
    assert_eq!(fs.offset(), Some(32768));
    assert_eq!(fs.data_unit_name(), Some("Allocation Block"));

    match fs.parent() {
        FsSource::Partition(p) => assert_eq!(p.index(), 3),
        other => panic!("unexpected parent {other:?}"),
    }
}

#[test]
fn volume_source_test() {
    let dir = tempdir().unwrap();

    let single = Image::open([apm_image(&dir, "single.dd", false)]).unwrap();
    let vs = VolumeSystem::scan(&single).unwrap();
    let fs = FileSystem::open(&vs, FsOptions::default()).unwrap();

    assert!(fs.is_found());
    assert_eq!(fs.offset(), Some(32768));
    assert_eq!(fs.last_inum(), Some(44));

    let double = Image::open([apm_image(&dir, "double.dd", true)]).unwrap();
    let vs = VolumeSystem::scan(&double).unwrap();
    let fs = FileSystem::open(&vs, FsOptions::default()).unwrap();

    assert_eq!(
        fs.state(),
        &FsState::Ambiguous {
            candidates: vec![3, 4]
        }
    );
    assert!(!fs.is_found());
    assert_eq!(fs.block_count(), None);
    assert_eq!(fs.tag(), None);
    assert_eq!(fs.block_pre_size(), None);
}

#[test]
fn partitioned_image_not_found_test() {
    let dir = tempdir().unwrap();
    let image = Image::open([apm_image(&dir, "apm.dd", false)]).unwrap();

    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();

    assert_eq!(fs.state(), &FsState::NotFound);
    assert_eq!(fs.block_count(), None);
    assert_eq!(fs.fs_id(), None);
    assert_eq!(fs.description(), None);

    let mut report = Vec::new();
    fs.write_report(&mut report).unwrap();
    assert_eq!(String::from_utf8(report).unwrap(), "No file system found\n");
}

#[test]
fn selector_resolve_test() {
    let dir = tempdir().unwrap();
    let image = Image::open([apm_image(&dir, "apm.dd", false)]).unwrap();
    let vs = VolumeSystem::scan(&image).unwrap();

    let source = SourceSelector::Partition(3).resolve(&image, Some(&vs)).unwrap();
    let fs = FileSystem::open(source, FsOptions::default()).unwrap();
    assert_eq!(fs.offset(), Some(32768));

    assert!(matches!(
        SourceSelector::Partition(99).resolve(&image, Some(&vs)),
        Err(FsStatError::InvalidSource(_))
    ));
    assert!(matches!(
        SourceSelector::Volume.resolve(&image, None),
        Err(FsStatError::InvalidSource(_))
    ));
    assert!(matches!(
        SourceSelector::Image.resolve(&image, None),
        Ok(FsSource::Image(_))
    ));
}

#[test]
fn split_image_test() {
    let dir = tempdir().unwrap();

    let mut bytes = vec![0u8; 64 * 4096];
    for (i, byte) in bytes.iter_mut().enumerate().skip(4096) {
        *byte = (i % 251) as u8;
    }
    bytes[1024..1536].copy_from_slice(&hfs_header(4096, 64, 100));

    let single = dir.path().join("single.dd");
    std::fs::write(&single, &bytes).unwrap();
    std::fs::write(dir.path().join("split.001"), &bytes[..100000]).unwrap();
    std::fs::write(dir.path().join("split.002"), &bytes[100000..200000]).unwrap();
    std::fs::write(dir.path().join("split.003"), &bytes[200000..]).unwrap();

    let pattern = dir.path().join("split.0*");
    let split = Image::open_glob(pattern.to_str().unwrap()).unwrap();
    let whole = Image::open([&single]).unwrap();

    assert!(split.is_split());
    assert_eq!(split.segment_count(), 3);
    assert_eq!(split.size(), whole.size());
    assert_eq!(
        split.read_vec_at(99990, 20).unwrap(),
        bytes[99990..100010].to_vec()
    );

    let mut past_end = [0u8; 16];
    assert_eq!(
        split.read_exact_at(split.size() - 8, &mut past_end).unwrap_err().kind(),
        ErrorKind::UnexpectedEof
    );

    let a = FileSystem::open(&split, FsOptions::default()).unwrap();
    let b = FileSystem::open(&whole, FsOptions::default()).unwrap();

    assert!(a.is_found());
    assert_eq!(a.state(), b.state());
    assert_eq!(a.block_count(), Some(64));
    assert_eq!(a.last_inum(), Some(99));
}

#[test]
fn hfs_wrapper_test() {
    let dir = tempdir().unwrap();
    let path = sparse_file(&dir, "wrapper.dd", 8192 + 16 * 4096);

    let mut mdb = vec![0u8; 512];
    mdb[0..2].copy_from_slice(b"BD");
    be32(&mut mdb, 0x14, 4096);
    be16(&mut mdb, 0x1C, 8);
    mdb[0x7C..0x7E].copy_from_slice(b"H+");
    be16(&mut mdb, 0x7E, 1);
    be16(&mut mdb, 0x80, 16);
    write_at(&path, 1024, &mdb);
    write_at(&path, 8192 + 1024, &hfs_header(4096, 16, 30));

    let image = Image::open([&path]).unwrap();
    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();

    assert_eq!(fs.ftype(), Some(FsType::HFS));
    assert_eq!(fs.offset(), Some(8192));
    assert_eq!(fs.block_count(), Some(16));
    assert_eq!(fs.last_inum(), Some(29));
}

#[test]
fn type_flag_test() {
    let dir = tempdir().unwrap();
    let path = sparse_file(&dir, "hfs.dd", 5004 * 4096);
    write_at(&path, 1024, &hfs_header(4096, 5004, 45));
    let image = Image::open([&path]).unwrap();

    let auto = FileSystem::open(&image, FsOptions::default()).unwrap();
    let zero = FileSystem::open(&image, FsOptions { type_flag: 0 }).unwrap();
    assert_eq!(auto.state(), zero.state());

    let forced = FileSystem::open(&image, FsOptions::with_type(FsType::HFS)).unwrap();
    assert_eq!(forced.state(), auto.state());

    let wrong = FileSystem::open(&image, FsOptions::with_type(FsType::EXT_DETECT)).unwrap();
    assert_eq!(wrong.state(), &FsState::NotFound);

    assert!(matches!(
        FileSystem::open(&image, FsOptions { type_flag: 0x10 }),
        Err(FsStatError::InvalidTypeFlag(0x10))
    ));
}

#[test]
fn capabilities_test() {
    let dir = tempdir().unwrap();
    let path = sparse_file(&dir, "hfs.dd", 5004 * 4096);
    write_at(&path, 1024, &hfs_header(4096, 5004, 45));
    let image = Image::open([&path]).unwrap();

    let linked = FileSystem::open(&image, FsOptions::default()).unwrap();
    assert_eq!(linked.capabilities(), Capabilities::linked());
    assert_eq!(
        linked.supports(GatedAttr::BlockPreSize),
        cfg!(feature = "block-pre-post")
    );
    assert_eq!(
        linked.block_post_size().is_some(),
        cfg!(feature = "block-pre-post")
    );

    let bare =
        FileSystem::open_with_capabilities((&image).into(), FsOptions::default(), Capabilities::empty())
            .unwrap();
    assert!(!bare.supports(GatedAttr::BlockPreSize));
    assert_eq!(bare.block_pre_size(), None);
    assert_eq!(bare.block_post_size(), None);
    assert_eq!(bare.is_orphan_hunting(), None);
    assert_eq!(bare.block_count(), Some(5004));

    let full =
        FileSystem::open_with_capabilities((&image).into(), FsOptions::default(), Capabilities::all())
            .unwrap();
    assert!(full.supports(GatedAttr::IsOrphanHunting));
    assert_eq!(full.block_pre_size(), Some(0));
    assert_eq!(full.block_post_size(), Some(0));
    assert_eq!(full.is_orphan_hunting(), Some(false));
}

#[test]
fn report_test() {
    let dir = tempdir().unwrap();
    let path = sparse_file(&dir, "hfs.dd", 5004 * 4096);
    write_at(&path, 1024, &hfs_header(4096, 5004, 45));
    let image = Image::open([&path]).unwrap();
    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();

    let mut out = Vec::new();
    fs.write_report(&mut out).unwrap();
    let report = String::from_utf8(out).unwrap();

    assert!(report.contains("File System Type: HFS+\n"));
    assert!(report.contains("Volume ID: ff83fbdcb863d7d8\n"));
    assert!(report.contains("Endian: Big Endian\n"));
    assert!(report.contains("Range: 2 - 44\n"));
    assert!(report.contains("Allocation Block Range: 0 - 5003\n"));
    assert!(report.contains("Allocation Block Size: 4096\n"));
    assert!(!report.contains("Journal Inode"));
}

fn fat16_image(dir: &TempDir) -> PathBuf {
    let path = sparse_file(dir, "fat16.dd", 32768 * 512);

    let mut bs = vec![0u8; 512];
    bs[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    bs[3..11].copy_from_slice(b"MSDOS5.0");
    le16(&mut bs, 11, 512);
    bs[13] = 4;
    le16(&mut bs, 14, 4);
    bs[16] = 2;
    le16(&mut bs, 17, 512);
    le16(&mut bs, 19, 32768);
    bs[21] = 0xF8;
    le16(&mut bs, 22, 32);
    le16(&mut bs, 24, 32);
    le16(&mut bs, 26, 2);
    bs[36] = 0x80;
    bs[38] = 0x29;
    bs[39..43].copy_from_slice(&[0x12, 0x34, 0x56, 0x78]);
    bs[43..54].copy_from_slice(b"NO NAME    ");
    bs[54..62].copy_from_slice(b"FAT16   ");
    bs[510] = 0x55;
    bs[511] = 0xAA;
    write_at(&path, 0, &bs);

    let mut label = vec![0u8; 32];
    label[0..11].copy_from_slice(b"TESTFAT16  ");
    label[11] = 0x08;
    write_at(&path, (4 + 64) * 512, &label);

    path
}

#[test]
fn fat16_attributes_test() {
    let dir = tempdir().unwrap();
    let image = Image::open([fat16_image(&dir)]).unwrap();

    let vs = VolumeSystem::scan(&image).unwrap();
    assert!(!vs.is_found());
    assert_eq!(vs.partition_count(), 0);

    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();

    assert_eq!(fs.ftype(), Some(FsType::FAT16));
    assert_eq!(fs.description(), Some("fat16"));
    assert_eq!(fs.data_unit_name(), Some("Sector"));
    assert_eq!(fs.block_size(), Some(512));
    assert_eq!(fs.block_count(), Some(32768));
    assert_eq!(fs.last_block_act(), Some(32767));
    assert_eq!(fs.first_inum(), Some(2));
    assert_eq!(fs.root_inum(), Some(2));
    assert_eq!(fs.last_inum(), Some(523206));
    assert_eq!(fs.inum_count(), Some(523205));
    assert_eq!(fs.endian(), Some(Endianness::Little));
    assert_eq!(fs.fs_id().as_deref(), Some("12345678"));
    assert_eq!(fs.fs_id_used(), Some(8));
    assert_eq!(fs.label(), Some("TESTFAT16"));

    let family = FileSystem::open(&image, FsOptions::with_type(FsType::FAT_DETECT)).unwrap();
    assert_eq!(family.ftype(), Some(FsType::FAT16));

    let fat32 = FileSystem::open(&image, FsOptions::with_type(FsType::FAT32)).unwrap();
    assert_eq!(fat32.state(), &FsState::NotFound);
}

fn ext_superblock(compat: u32, incompat: u32, ro_compat: u32, inode_size: u16) -> Vec<u8> {
    let mut sb = vec![0u8; 1024];
    le32(&mut sb, 0x00, 2048);
    le32(&mut sb, 0x04, 8192);
    le32(&mut sb, 0x18, 0);
    sb[0x38] = 0x53;
    sb[0x39] = 0xEF;
    le32(&mut sb, 0x4C, 1);
    le16(&mut sb, 0x58, inode_size);
    le32(&mut sb, 0x5C, compat);
    le32(&mut sb, 0x60, incompat);
    le32(&mut sb, 0x64, ro_compat);
    sb[0x68..0x78].copy_from_slice(&[
        0x6b, 0x5e, 0x22, 0x01, 0x3c, 0x44, 0x4e, 0x2a, 0x9b, 0x10, 0x77, 0x0f, 0xd2, 0x35, 0x8c,
        0x41,
    ]);
    sb[0x78..0x78 + 7].copy_from_slice(b"exttest");
    le32(&mut sb, 0xE0, 8);
    sb
}

fn ext_image(dir: &TempDir, name: &str, sb: &[u8]) -> Image {
    let path = sparse_file(dir, name, 8192 * 1024);
    write_at(&path, 1024, sb);
    Image::open([&path]).unwrap()
}

#[test]
fn ext4_attributes_test() {
    let dir = tempdir().unwrap();
    /* journal, filetype + extents, bad metadata checksum */
    let image = ext_image(&dir, "ext4.dd", &ext_superblock(0x4, 0x42, 0x400, 256));

    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();

    assert_eq!(fs.ftype(), Some(FsType::EXT4));
    assert_eq!(fs.description(), Some("ext4"));
    assert_eq!(fs.data_unit_name(), Some("Fragment"));
    assert_eq!(fs.block_size(), Some(1024));
    assert_eq!(fs.block_count(), Some(8192));
    assert_eq!(fs.last_block(), Some(8191));
    assert_eq!(fs.dev_bsize(), Some(512));
    assert_eq!(fs.first_inum(), Some(1));
    assert_eq!(fs.root_inum(), Some(2));
    assert_eq!(fs.inum_count(), Some(2049));
    assert_eq!(fs.last_inum(), Some(2049));
    assert_eq!(fs.journ_inum(), Some(8));
    assert_eq!(fs.flags(), Some(FsFlags::HAVE_NANOSEC));
    assert_eq!(fs.fs_id().as_deref(), Some("6b5e22013c444e2a9b10770fd2358c41"));
    assert_eq!(fs.fs_id_used(), Some(32));
    assert_eq!(fs.label(), Some("exttest"));
}

#[test]
fn ext2_ext3_attributes_test() {
    let dir = tempdir().unwrap();

    let ext3 = ext_image(&dir, "ext3.dd", &ext_superblock(0x4, 0x2, 0, 128));
    let fs = FileSystem::open(&ext3, FsOptions::default()).unwrap();
    assert_eq!(fs.ftype(), Some(FsType::EXT3));
    assert_eq!(fs.journ_inum(), Some(8));
    assert_eq!(fs.flags(), Some(FsFlags::empty()));

    let ext2 = ext_image(&dir, "ext2.dd", &ext_superblock(0, 0x2, 0, 128));
    let fs = FileSystem::open(&ext2, FsOptions::default()).unwrap();
    assert_eq!(fs.ftype(), Some(FsType::EXT2));
    assert_eq!(fs.journ_inum(), Some(0));

    let forced = FileSystem::open(&ext2, FsOptions::with_type(FsType::EXT4)).unwrap();
    assert_eq!(forced.state(), &FsState::NotFound);
}

fn ntfs_boot_sector(sectors: u64, mft_cluster: u64) -> Vec<u8> {
    let mut bs = vec![0u8; 512];
    bs[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
    bs[3..11].copy_from_slice(b"NTFS    ");
    le16(&mut bs, 11, 512);
    bs[13] = 8;
    bs[21] = 0xF8;
    le64(&mut bs, 0x28, sectors);
    le64(&mut bs, 0x30, mft_cluster);
    le64(&mut bs, 0x38, 8);
    bs[0x40] = 0xF6;
    bs[0x44] = 1;
    bs[0x48..0x50].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    bs[510] = 0x55;
    bs[511] = 0xAA;
    bs
}

#[test]
fn ntfs_attributes_test() {
    let dir = tempdir().unwrap();
    let path = sparse_file(&dir, "ntfs.dd", 16384 * 512);
    write_at(&path, 0, &ntfs_boot_sector(16384, 4));

    let record_header = |rec: &mut Vec<u8>| {
        rec[0..4].copy_from_slice(b"FILE");
        le16(rec, 4, 0x30);
        le16(rec, 6, 3);
        le16(rec, 0x14, 0x38);
        le32(rec, 0x1C, 1024);
    };

    /* $MFT: non-resident $DATA of 64 records */
    let mut mft = vec![0u8; 1024];
    record_header(&mut mft);
    le32(&mut mft, 0x38, 0x80);
    le32(&mut mft, 0x38 + 4, 0x48);
    mft[0x38 + 8] = 1;
    le64(&mut mft, 0x38 + 0x30, 64 * 1024);
    le32(&mut mft, 0x38 + 0x48, 0xFFFF_FFFF);
    write_at(&path, 4 * 4096, &mft);

    /* $Volume: resident volume name */
    let name = utf16le("TESTNTFS");
    let mut volume = vec![0u8; 1024];
    record_header(&mut volume);
    le32(&mut volume, 0x38, 0x60);
    le32(&mut volume, 0x38 + 4, 0x18 + name.len() as u32);
    le32(&mut volume, 0x38 + 0x10, name.len() as u32);
    le16(&mut volume, 0x38 + 0x14, 0x18);
    volume[0x38 + 0x18..0x38 + 0x18 + name.len()].copy_from_slice(&name);
    le32(&mut volume, 0x38 + 0x18 + name.len(), 0xFFFF_FFFF);
    write_at(&path, 4 * 4096 + 3 * 1024, &volume);

    let image = Image::open([&path]).unwrap();
    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();

    assert_eq!(fs.ftype(), Some(FsType::NTFS));
    assert_eq!(fs.data_unit_name(), Some("Cluster"));
    assert_eq!(fs.block_size(), Some(4096));
    assert_eq!(fs.block_count(), Some(2048));
    assert_eq!(fs.dev_bsize(), Some(512));
    assert_eq!(fs.first_inum(), Some(0));
    assert_eq!(fs.root_inum(), Some(5));
    assert_eq!(fs.last_inum(), Some(64));
    assert_eq!(fs.inum_count(), Some(65));
    assert_eq!(fs.flags(), Some(FsFlags::HAVE_SEQ));
    assert_eq!(fs.fs_id().as_deref(), Some("0102030405060708"));
    assert_eq!(fs.label(), Some("TESTNTFS"));

    let vs = VolumeSystem::scan(&image).unwrap();
    assert!(!vs.is_found());
}

#[test]
fn ntfs_mft_offset_overflow_test() {
    let dir = tempdir().unwrap();
    let path = sparse_file(&dir, "ntfs_huge.dd", 2048 * 512);
    write_at(&path, 0, &ntfs_boot_sector(u64::MAX, 1 << 60));

    let image = Image::open([&path]).unwrap();
    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();
    assert_eq!(fs.state(), &FsState::NotFound);

    let forced = FileSystem::open(&image, FsOptions::with_type(FsType::NTFS)).unwrap();
    assert_eq!(forced.state(), &FsState::NotFound);
}

#[test]
fn exfat_attributes_test() {
    let dir = tempdir().unwrap();
    let path = sparse_file(&dir, "exfat.dd", 8256 * 512);

    let mut boot = vec![0u8; 12 * 512];
    boot[0..3].copy_from_slice(&[0xEB, 0x76, 0x90]);
    boot[3..11].copy_from_slice(b"EXFAT   ");
    le64(&mut boot, 72, 8256);
    le32(&mut boot, 80, 128);
    le32(&mut boot, 84, 128);
    le32(&mut boot, 88, 256);
    le32(&mut boot, 92, 1000);
    le32(&mut boot, 96, 2);
    boot[100..104].copy_from_slice(&[0xAB, 0xCD, 0x12, 0x34]);
    boot[105] = 1;
    boot[108] = 9;
    boot[109] = 3;
    boot[110] = 1;
    boot[111] = 0x80;
    boot[510] = 0x55;
    boot[511] = 0xAA;

    let checksum = get_exfatcsum(&boot[..11 * 512], 512);
    for off in (11 * 512..12 * 512).step_by(4) {
        le32(&mut boot, off, checksum);
    }
    write_at(&path, 0, &boot);

    let mut label = vec![0u8; 32];
    label[0] = 0x83;
    label[1] = 4;
    label[2..10].copy_from_slice(&utf16le("TEST"));
    write_at(&path, 256 * 512, &label);

    let image = Image::open([&path]).unwrap();
    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();

    assert_eq!(fs.ftype(), Some(FsType::EXFAT));
    assert_eq!(fs.description(), Some("exfat"));
    assert_eq!(fs.block_size(), Some(512));
    assert_eq!(fs.block_count(), Some(8256));
    assert_eq!(fs.last_inum(), Some(128006));
    assert_eq!(fs.inum_count(), Some(128005));
    assert_eq!(fs.fs_id().as_deref(), Some("abcd1234"));
    assert_eq!(fs.label(), Some("TEST"));

    /* a broken boot region checksum rejects the volume */
    write_at(&path, 11 * 512, &[0u8; 4]);
    let image = Image::open([&path]).unwrap();
    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();
    assert_eq!(fs.state(), &FsState::NotFound);
}

fn mbr_entry(table: &mut [u8], slot: usize, sys_ind: u8, start: u32, len: u32) {
    let off = 446 + slot * 16;
    table[off + 4] = sys_ind;
    le32(table, off + 8, start);
    le32(table, off + 12, len);
}

#[test]
fn dos_extended_test() {
    let dir = tempdir().unwrap();
    let path = sparse_file(&dir, "dos.dd", 1024 * 512);

    let mut mbr = vec![0u8; 512];
    mbr_entry(&mut mbr, 0, 0x83, 63, 100);
    mbr_entry(&mut mbr, 1, 0x05, 200, 600);
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    write_at(&path, 0, &mbr);

    let mut ebr1 = vec![0u8; 512];
    mbr_entry(&mut ebr1, 0, 0x83, 63, 100);
    mbr_entry(&mut ebr1, 1, 0x05, 200, 200);
    ebr1[510] = 0x55;
    ebr1[511] = 0xAA;
    write_at(&path, 200 * 512, &ebr1);

    let mut ebr2 = vec![0u8; 512];
    mbr_entry(&mut ebr2, 0, 0x82, 63, 100);
    ebr2[510] = 0x55;
    ebr2[511] = 0xAA;
    write_at(&path, 400 * 512, &ebr2);

    let image = Image::open([&path]).unwrap();
    let vs = VolumeSystem::scan(&image).unwrap();

    assert_eq!(vs.vs_type(), Some(VsType::Dos));
    assert_eq!(vs.description(), Some("DOS Partition Table"));
    assert_eq!(vs.partition_count(), 12);

    let parts = vs.parts();
    assert_eq!(parts[0].description(), "Primary Table (#0)");
    assert_eq!(parts[0].flags(), PartFlags::META);
    assert_eq!(parts[2].description(), "Linux (0x83)");
    assert_eq!(parts[2].block_start(), 63);
    assert_eq!(parts[4].description(), "Extended Table (#1)");
    assert_eq!(parts[6].block_start(), 263);
    assert_eq!(parts[8].description(), "Extended Table (#2)");
    assert_eq!(parts[10].description(), "Linux Swap / Solaris x86 (0x82)");
    assert_eq!(parts[10].start(), 463 * 512);
    assert_eq!(parts[11].description(), "Unallocated");
    assert_eq!(parts[11].block_len(), 1024 - 563);

    let alloc: Vec<usize> = vs.allocated().map(|p| p.index()).collect();
    assert_eq!(alloc, vec![2, 6, 10]);

    let fs = FileSystem::open(&vs, FsOptions::default()).unwrap();
    assert_eq!(
        fs.state(),
        &FsState::Ambiguous {
            candidates: vec![2, 6, 10]
        }
    );

    let swap = FileSystem::open(vs.part(10).unwrap(), FsOptions::with_type(FsType::SWAP)).unwrap();
    assert_eq!(swap.ftype(), Some(FsType::SWAP));
    assert_eq!(swap.data_unit_name(), Some("Page"));
    assert_eq!(swap.block_size(), Some(4096));
    assert_eq!(swap.block_count(), Some(12));
    assert_eq!(swap.offset(), Some(463 * 512));
    assert_eq!(swap.inum_count(), Some(0));
    assert_eq!(swap.endian(), Some(Endianness::Unknown));

    let raw = FileSystem::open(vs.part(10).unwrap(), FsOptions::with_type(FsType::RAW)).unwrap();
    assert_eq!(raw.ftype(), Some(FsType::RAW));
    assert_eq!(raw.data_unit_name(), Some("Sector"));
    assert_eq!(raw.block_size(), Some(512));
    assert_eq!(raw.block_count(), Some(100));
    assert_eq!(raw.fs_id_used(), Some(0));

    let auto = FileSystem::open(vs.part(10).unwrap(), FsOptions::default()).unwrap();
    assert_eq!(auto.state(), &FsState::NotFound);
}

fn gpt_image(dir: &TempDir, corrupt: bool, entries_lba: u64) -> PathBuf {
    let path = sparse_file(dir, "gpt.dd", 2048 * 512);

    let mut pmbr = vec![0u8; 512];
    mbr_entry(&mut pmbr, 0, 0xEE, 1, 2047);
    pmbr[510] = 0x55;
    pmbr[511] = 0xAA;
    write_at(&path, 0, &pmbr);

    let mut entries = vec![0u8; 128 * 128];
    let entry = &mut entries[..128];
    entry[0..16].copy_from_slice(&[
        0xaf, 0x3d, 0xc6, 0x0f, 0x83, 0x84, 0x72, 0x47, 0x8e, 0x79, 0x3d, 0x69, 0xd8, 0x47, 0x7d,
        0xe4,
    ]);
    entry[16] = 0x42;
    le64(entry, 32, 34);
    le64(entry, 40, 1000);
    let name = utf16le("Linux data");
    entry[56..56 + name.len()].copy_from_slice(&name);
    write_at(&path, 2 * 512, &entries);

    let mut header = vec![0u8; 92];
    header[0..8].copy_from_slice(b"EFI PART");
    le32(&mut header, 8, 0x0001_0000);
    le32(&mut header, 12, 92);
    le64(&mut header, 24, 1);
    le64(&mut header, 32, 2047);
    le64(&mut header, 40, 34);
    le64(&mut header, 48, 2014);
    le64(&mut header, 72, entries_lba);
    le32(&mut header, 80, 128);
    le32(&mut header, 84, 128);
    le32(&mut header, 88, get_crc32_iso_hdlc(&entries));
    let crc = get_crc32_iso_hdlc(&header);
    le32(&mut header, 16, crc);
    if corrupt {
        le64(&mut header, 48, 2000);
    }
    write_at(&path, 512, &header);

    /* ext2 inside the partition */
    let mut sb = ext_superblock(0, 0x2, 0, 128);
    le32(&mut sb, 0x04, 400);
    write_at(&path, 34 * 512 + 1024, &sb);

    path
}

#[test]
fn gpt_test() {
    let dir = tempdir().unwrap();
    let image = Image::open([gpt_image(&dir, false, 2)]).unwrap();
    let vs = VolumeSystem::scan(&image).unwrap();

    assert_eq!(vs.vs_type(), Some(VsType::Gpt));
    assert_eq!(vs.endian(), Some(Endianness::Little));
    assert_eq!(vs.partition_count(), 5);

    let parts = vs.parts();
    assert_eq!(parts[0].description(), "Safety Table");
    assert_eq!(parts[1].description(), "GPT Header");
    assert_eq!(parts[2].description(), "Partition Table");
    assert_eq!(parts[2].block_len(), 32);
    assert_eq!(parts[3].description(), "Linux data");
    assert_eq!(parts[3].flags(), PartFlags::ALLOC);
    assert_eq!(parts[3].block_len(), 967);
    assert_eq!(parts[4].description(), "Unallocated");
    assert_eq!(parts[4].block_start(), 1001);

    let fs = FileSystem::open(&vs, FsOptions::default()).unwrap();
    assert_eq!(fs.ftype(), Some(FsType::EXT2));
    assert_eq!(fs.offset(), Some(34 * 512));
    assert_eq!(fs.block_count(), Some(400));
    assert_eq!(fs.last_block_act(), Some(399));
}

#[test]
fn gpt_bad_crc_test() {
    let dir = tempdir().unwrap();
    let image = Image::open([gpt_image(&dir, true, 2)]).unwrap();
    let vs = VolumeSystem::scan(&image).unwrap();

    assert!(!vs.is_found());
    assert_eq!(vs.vs_type(), None);
    assert_eq!(vs.partition_count(), 0);

    let fs = FileSystem::open(&vs, FsOptions::default()).unwrap();
    assert_eq!(fs.state(), &FsState::NotFound);
}

#[test]
fn gpt_entries_lba_out_of_range_test() {
    let dir = tempdir().unwrap();
    let image = Image::open([gpt_image(&dir, false, 1 << 60)]).unwrap();
    let vs = VolumeSystem::scan(&image).unwrap();

    assert!(!vs.is_found());
    assert_eq!(vs.partition_count(), 0);
}

#[test]
fn split_volume_test() {
    let dir = tempdir().unwrap();
    let single = apm_image(&dir, "apm.dd", false);

    let bytes = std::fs::read(&single).unwrap();
    std::fs::write(dir.path().join("apm.001"), &bytes[..10_000_000]).unwrap();
    std::fs::write(dir.path().join("apm.002"), &bytes[10_000_000..15_000_001]).unwrap();
    std::fs::write(dir.path().join("apm.003"), &bytes[15_000_001..]).unwrap();

    let pattern = dir.path().join("apm.0*");
    let split = Image::open_glob(pattern.to_str().unwrap()).unwrap();
    let whole = Image::open([&single]).unwrap();
    assert_eq!(split.segment_count(), 3);
    let names: Vec<_> = split
        .segments()
        .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["apm.001", "apm.002", "apm.003"]);

    let split_vs = VolumeSystem::scan(&split).unwrap();
    let whole_vs = VolumeSystem::scan(&whole).unwrap();

    assert_eq!(split_vs.vs_type(), whole_vs.vs_type());
    assert_eq!(split_vs.parts(), whole_vs.parts());

    let a = FileSystem::open(&split_vs, FsOptions::default()).unwrap();
    let b = FileSystem::open(&whole_vs, FsOptions::default()).unwrap();

    assert!(a.is_found());
    assert_eq!(a.state(), b.state());
    assert_eq!(a.offset(), Some(32768));
    assert_eq!(a.fs_id().as_deref(), Some("ff83fbdcb863d7d8"));
}

#[test]
fn fat12_attributes_test() {
    let dir = tempdir().unwrap();
    let path = sparse_file(&dir, "fat12.dd", 2880 * 512);

    let mut bs = vec![0u8; 512];
    bs[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    bs[3..11].copy_from_slice(b"MSDOS5.0");
    le16(&mut bs, 11, 512);
    bs[13] = 1;
    le16(&mut bs, 14, 1);
    bs[16] = 2;
    le16(&mut bs, 17, 224);
    le16(&mut bs, 19, 2880);
    bs[21] = 0xF0;
    le16(&mut bs, 22, 9);
    bs[38] = 0x29;
    bs[39..43].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    bs[43..54].copy_from_slice(b"NO NAME    ");
    bs[54..62].copy_from_slice(b"FAT12   ");
    bs[510] = 0x55;
    bs[511] = 0xAA;
    write_at(&path, 0, &bs);

    let mut label = vec![0u8; 32];
    label[0..11].copy_from_slice(b"FLOPPY     ");
    label[11] = 0x08;
    write_at(&path, (1 + 18) * 512, &label);

    let image = Image::open([&path]).unwrap();
    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();

    assert_eq!(fs.ftype(), Some(FsType::FAT12));
    assert_eq!(fs.description(), Some("fat12"));
    assert_eq!(fs.block_count(), Some(2880));
    assert_eq!(fs.last_inum(), Some(45782));
    assert_eq!(fs.inum_count(), Some(45781));
    assert_eq!(fs.fs_id().as_deref(), Some("deadbeef"));
    assert_eq!(fs.label(), Some("FLOPPY"));
}

const FAT32_DATA_SECT: u64 = 32 + 2 * 600;

/// FAT32 volume whose root directory chain starts at cluster 2.
/// `fat` holds the FAT entries for clusters 2 and 3.
fn fat32_image(dir: &TempDir, name: &str, fat: [u32; 2]) -> PathBuf {
    let path = sparse_file(dir, name, 70000 * 512);

    let mut bs = vec![0u8; 512];
    bs[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
    bs[3..11].copy_from_slice(b"MSWIN4.1");
    le16(&mut bs, 11, 512);
    bs[13] = 1;
    le16(&mut bs, 14, 32);
    bs[16] = 2;
    bs[21] = 0xF8;
    le32(&mut bs, 32, 70000);
    le32(&mut bs, 36, 600);
    le32(&mut bs, 44, 2);
    le16(&mut bs, 48, 1);
    le16(&mut bs, 50, 6);
    bs[64] = 0x80;
    bs[66] = 0x29;
    bs[67..71].copy_from_slice(&[0x0A, 0x1B, 0x2C, 0x3D]);
    bs[71..82].copy_from_slice(b"NO NAME    ");
    bs[82..90].copy_from_slice(b"FAT32   ");
    bs[510] = 0x55;
    bs[511] = 0xAA;
    write_at(&path, 0, &bs);

    let mut fsinfo = vec![0u8; 512];
    fsinfo[0..4].copy_from_slice(b"RRaA");
    fsinfo[484..488].copy_from_slice(b"rrAa");
    le32(&mut fsinfo, 488, 1000);
    le32(&mut fsinfo, 492, 4);
    fsinfo[510] = 0x55;
    fsinfo[511] = 0xAA;
    write_at(&path, 512, &fsinfo);

    let mut entries = vec![0u8; 16];
    le32(&mut entries, 0, 0x0FFF_FFF8);
    le32(&mut entries, 4, 0x0FFF_FFFF);
    le32(&mut entries, 8, fat[0]);
    le32(&mut entries, 12, fat[1]);
    write_at(&path, 32 * 512, &entries);

    path
}

#[test]
fn fat32_attributes_test() {
    let dir = tempdir().unwrap();
    /* root directory spans clusters 2 -> 3, the label sits in cluster 3 */
    let path = fat32_image(&dir, "fat32.dd", [3, 0x0FFF_FFFF]);

    let mut label = vec![0u8; 32];
    label[0..11].copy_from_slice(b"FAT32TEST  ");
    label[11] = 0x08;
    write_at(&path, (FAT32_DATA_SECT + 1) * 512, &label);

    let image = Image::open([&path]).unwrap();
    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();

    assert_eq!(fs.ftype(), Some(FsType::FAT32));
    assert_eq!(fs.description(), Some("fat32"));
    assert_eq!(fs.block_size(), Some(512));
    assert_eq!(fs.block_count(), Some(70000));
    assert_eq!(fs.last_inum(), Some(1100294));
    assert_eq!(fs.inum_count(), Some(1100293));
    assert_eq!(fs.fs_id().as_deref(), Some("0a1b2c3d"));
    assert_eq!(fs.label(), Some("FAT32TEST"));

    let forced = FileSystem::open(&image, FsOptions::with_type(FsType::FAT16)).unwrap();
    assert_eq!(forced.state(), &FsState::NotFound);
}

#[test]
fn fat32_cyclic_root_chain_test() {
    let dir = tempdir().unwrap();
    let path = fat32_image(&dir, "fat32_loop.dd", [3, 2]);

    let image = Image::open([&path]).unwrap();
    let fs = FileSystem::open(&image, FsOptions::default()).unwrap();

    assert_eq!(fs.ftype(), Some(FsType::FAT32));
    assert_eq!(fs.label(), None);
    assert_eq!(fs.fs_id().as_deref(), Some("0a1b2c3d"));
}

#[test]
fn to_hex_test() {
    assert_eq!(to_hex(&[]), "");
    assert_eq!(to_hex(&[0x00, 0x0a, 0xff, 0x10]), "000aff10");
}
