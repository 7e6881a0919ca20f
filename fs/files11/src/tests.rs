// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use chrono::NaiveDate;
use dskview_ds::MemStorage;
use dskview_fs::{radix50, NonInteractive};

use super::*;
use crate::{ods1, ods2};

fn sector_mut(image: &mut [u8], lba: usize) -> &mut [u8] {
    &mut image[lba * SECTOR_SIZE..(lba + 1) * SECTOR_SIZE]
}

fn set_checksum(sector: &mut [u8]) {
    let mut sum = 0u16;
    for i in 0..255 {
        sum = sum.wrapping_add(u16::from_le_bytes([sector[i * 2], sector[i * 2 + 1]]));
    }
    sector[510..512].copy_from_slice(&sum.to_le_bytes());
}

fn pack_r50(chars: &[u8]) -> u16 {
    let mut word = 0u16;
    for i in 0..3 {
        let c = chars.get(i).copied().unwrap_or(b' ');
        word = word * 40 + radix50::encode_char(c as char).unwrap();
    }
    word
}

/// Three name words, one extension word, one version word.
fn r50_name(name: &str, ext: &str, version: u16) -> [u16; 5] {
    let padded = format!("{name:<9}");
    let bytes = padded.as_bytes();
    [
        pack_r50(&bytes[0..3]),
        pack_r50(&bytes[3..6]),
        pack_r50(&bytes[6..9]),
        pack_r50(format!("{ext:<3}").as_bytes()),
        version,
    ]
}

mod ods1_images {
    use super::*;

    pub const BITMAP_LBA: usize = 6;
    pub const HEADER_BASE: usize = 7; // BITMAP_LBA + 1 bitmap sector

    pub fn header(
        image: &mut [u8],
        index: usize,
        fnum: u16,
        name: &str,
        ext: &str,
        is_dir: bool,
        run: (u32, u8),
    ) {
        let sector = sector_mut(image, HEADER_BASE + index);
        sector[0] = 20; // identification area at byte 40
        sector[1] = 50; // map area at byte 100
        sector[2..4].copy_from_slice(&fnum.to_le_bytes());
        if is_dir {
            sector[13] = 0x20;
        }
        for (i, word) in r50_name(name, ext, 1).iter().enumerate() {
            sector[40 + i * 2..42 + i * 2].copy_from_slice(&word.to_le_bytes());
        }
        sector[65..78].copy_from_slice(b"15JUN94133742"); // creation, ident+25
        let map = &mut sector[100..];
        map[6] = 1; // count size
        map[7] = 3; // lbn size
        map[8] = 2; // map words in use
        let (lbn, count) = run;
        map[10] = (lbn >> 16) as u8;
        map[11] = count - 1;
        map[12..14].copy_from_slice(&(lbn as u16).to_le_bytes());
        set_checksum(sector);
    }

    pub fn dir_record(image: &mut [u8], lba: usize, index: usize, fnum: u16, name: &str, ext: &str) {
        let offset = lba * SECTOR_SIZE + index * 16;
        image[offset..offset + 2].copy_from_slice(&fnum.to_le_bytes());
        for (i, word) in r50_name(name, ext, 1).iter().enumerate() {
            image[offset + 6 + i * 2..offset + 8 + i * 2].copy_from_slice(&word.to_le_bytes());
        }
    }

    pub fn build() -> Vec<u8> {
        let mut image = vec![0u8; 32 * SECTOR_SIZE];
        let home = sector_mut(&mut image, 1);
        home[0..2].copy_from_slice(&1u16.to_le_bytes()); // bitmap sectors
        home[4..6].copy_from_slice(&(BITMAP_LBA as u16).to_le_bytes());
        home[6..8].copy_from_slice(&8u16.to_le_bytes()); // max files
        home[8..10].copy_from_slice(&1u16.to_le_bytes()); // sectors per cluster
        home[496..508].copy_from_slice(b"DECFILE11A  ");

        header(&mut image, 0, 2, "BITMAP", "SYS", false, (16, 2));
        header(&mut image, 1, 4, "000000", "DIR", true, (20, 1));
        header(&mut image, 2, 5, "HELLO", "TXT", false, (21, 1));
        header(&mut image, 3, 6, "SUB", "DIR", true, (22, 1));

        // MFD: the system files stay hidden, HELLO.TXT and SUB.DIR show.
        dir_record(&mut image, 20, 0, 4, "000000", "DIR");
        dir_record(&mut image, 20, 1, 5, "HELLO", "TXT");
        dir_record(&mut image, 20, 2, 6, "SUB", "DIR");
        // SUB.DIR links the same file again.
        dir_record(&mut image, 22, 0, 5, "HELLO", "TXT");

        let data = sector_mut(&mut image, 21);
        data[..11].copy_from_slice(b"HELLO WORLD");
        // Bitmap: first block is the storage control block, then ten free
        // cluster bits.
        let bitmap = sector_mut(&mut image, 17);
        bitmap[0..4].copy_from_slice(&0x3FFu32.to_le_bytes());
        image
    }
}

#[test]
fn ods1_lists_the_mfd_with_system_files_hidden() {
    let volume = Files11Volume::open(MemStorage::new(ods1_images::build()), StructureLevel::Ods1)
        .unwrap();
    let names: Vec<_> = volume.files().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["HELLO.TXT", "SUB.DIR"]);
    assert_eq!(volume.files()[0].file_number(), Some(5));
    assert!(volume.files()[1].is_directory);
    assert_eq!(volume.files()[0].length, 512);
    assert_eq!(
        volume.files()[0].created,
        NaiveDate::from_ymd_opt(1994, 6, 15).unwrap().and_hms_opt(13, 37, 42)
    );
}

#[test]
fn ods1_copies_file_contents() {
    let mut volume =
        Files11Volume::open(MemStorage::new(ods1_images::build()), StructureLevel::Ods1).unwrap();
    let mut output = Vec::new();
    volume
        .copy_file_to("HELLO.TXT", &mut output, &mut NonInteractive)
        .unwrap();
    assert_eq!(output.len(), 512);
    assert_eq!(&output[..11], b"HELLO WORLD");
}

#[test]
fn ods1_navigates_directories_with_a_stack() {
    let mut volume =
        Files11Volume::open(MemStorage::new(ods1_images::build()), StructureLevel::Ods1).unwrap();
    volume.change_directory("SUB.DIR").unwrap();
    assert_eq!(volume.current_dir_name(), "SUB.DIR");
    let names: Vec<_> = volume.files().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["HELLO.TXT"]);

    volume.change_directory("..").unwrap();
    assert_eq!(volume.current_dir_name(), "/");
    assert_eq!(volume.files().len(), 2);

    volume.change_directory("SUB.DIR").unwrap();
    volume.change_directory("/").unwrap();
    assert_eq!(volume.current_dir_name(), "/");
    assert_eq!(volume.files().len(), 2);
}

#[test]
fn ods1_free_space_comes_from_the_bitmap_file() {
    let mut volume =
        Files11Volume::open(MemStorage::new(ods1_images::build()), StructureLevel::Ods1).unwrap();
    assert_eq!(volume.free_space().unwrap(), 10 * 512);
}

#[test]
fn ods1_is_read_only() {
    let mut volume =
        Files11Volume::open(MemStorage::new(ods1_images::build()), StructureLevel::Ods1).unwrap();
    assert!(matches!(
        volume.add_file("NEW.TXT", 0, &mut std::io::empty(), None),
        Err(Error::NotSupported)
    ));
    assert!(matches!(volume.remove_file("HELLO.TXT"), Err(Error::NotSupported)));
    assert!(matches!(volume.make_directory("X"), Err(Error::NotSupported)));
}

#[test]
fn ods1_skips_headers_with_bad_checksums() {
    let mut image = ods1_images::build();
    // Corrupt the HELLO.TXT header; its directory link dangles and is
    // dropped from the listing.
    image[(ods1_images::HEADER_BASE + 2) * SECTOR_SIZE + 40] ^= 0xFF;
    let volume = Files11Volume::open(MemStorage::new(image), StructureLevel::Ods1).unwrap();
    let names: Vec<_> = volume.files().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["SUB.DIR"]);
}

#[test]
fn ods1_probe_needs_the_identification_string() {
    let image = ods1_images::build();
    assert_eq!(ods1::probe(&image), 2);
    let mut with_nop = image.clone();
    with_nop[0..2].copy_from_slice(&0o240u16.to_le_bytes());
    assert_eq!(ods1::probe(&with_nop), 3);
    assert_eq!(ods1::probe(&vec![0u8; 4096]), 0);
}

#[test]
fn ods1_retrieval_pointer_sizes_must_be_even() {
    let mut header = [0u8; SECTOR_SIZE];
    header[1] = 50;
    header[100 + 6] = 2; // count size
    header[100 + 7] = 3; // lbn size; 2 + 3 is odd
    header[100 + 8] = 2;
    assert!(matches!(ods1::file_sectors(&header), Err(Error::DiskCorrupt)));
}

#[test]
fn ods1_datetime_parses_both_centuries() {
    assert_eq!(
        ods1::parse_datetime(b"01JAN94120000"),
        NaiveDate::from_ymd_opt(1994, 1, 1).unwrap().and_hms_opt(12, 0, 0)
    );
    assert_eq!(
        ods1::parse_datetime(b"31DEC05235959"),
        NaiveDate::from_ymd_opt(2005, 12, 31).unwrap().and_hms_opt(23, 59, 59)
    );
    assert_eq!(ods1::parse_datetime(b"XXJAN94120000"), None);
}

mod ods2_images {
    use super::*;

    pub const HEADER_BASE: usize = 12; // bitmap LBA 10 + 2 bitmap sectors

    pub fn header(
        image: &mut [u8],
        index: usize,
        fnum: u16,
        name: &str,
        is_dir: bool,
        run: (u32, u8),
    ) {
        let sector = sector_mut(image, HEADER_BASE + index);
        sector[0] = 40; // identification area at byte 80
        sector[1] = 100; // map area at byte 200
        sector[7] = 2; // structure level major
        sector[8..10].copy_from_slice(&fnum.to_le_bytes());
        if is_dir {
            sector[52..56].copy_from_slice(&(1u32 << 13).to_le_bytes());
        }
        let padded = format!("{name:<20}");
        sector[80..100].copy_from_slice(&padded.as_bytes()[..20]);
        for byte in &mut sector[134..200] {
            *byte = b' ';
        }
        sector[58] = 2; // map words in use
        let (lbn, count) = run;
        let low: u16 = 0x4000 | (count as u16 - 1) | (((lbn >> 16) as u16 & 0x3F) << 8);
        sector[200..202].copy_from_slice(&low.to_le_bytes());
        sector[202..204].copy_from_slice(&(lbn as u16).to_le_bytes());
        set_checksum(sector);
    }

    pub fn build() -> Vec<u8> {
        let mut image = vec![0u8; 48 * SECTOR_SIZE];
        let home = sector_mut(&mut image, 1);
        home[0..4].copy_from_slice(&1u32.to_le_bytes()); // home LBN
        home[4..8].copy_from_slice(&1u32.to_le_bytes()); // alternate home LBN
        home[13] = 2; // structure level major
        home[14..16].copy_from_slice(&1u16.to_le_bytes()); // cluster factor
        home[24..28].copy_from_slice(&10u32.to_le_bytes()); // bitmap LBA
        home[28..32].copy_from_slice(&16u32.to_le_bytes()); // max files
        home[32..34].copy_from_slice(&2u16.to_le_bytes()); // bitmap sectors
        home[496..508].copy_from_slice(b"DECFILE11B  ");

        header(&mut image, 3, 4, "000000.DIR;1", true, (30, 1));
        header(&mut image, 4, 50, "README.TXT;1", false, (40, 1));
        header(&mut image, 5, 51, "README.TXT;3", false, (41, 1));

        // One MFD record, name "README", versions 3 and 1.
        let mfd = sector_mut(&mut image, 30);
        mfd[0..2].copy_from_slice(&26u16.to_le_bytes()); // record length
        mfd[5] = 6; // name length
        mfd[6..12].copy_from_slice(b"README");
        mfd[12..14].copy_from_slice(&3u16.to_le_bytes());
        mfd[14] = 51;
        mfd[20..22].copy_from_slice(&1u16.to_le_bytes());
        mfd[22] = 50;

        sector_mut(&mut image, 40)[..11].copy_from_slice(b"VERSION ONE");
        sector_mut(&mut image, 41)[..13].copy_from_slice(b"VERSION THREE");
        image
    }
}

#[test]
fn ods2_lists_each_version_with_a_suffix() {
    let mut volume =
        Files11Volume::open(MemStorage::new(ods2_images::build()), StructureLevel::Ods2).unwrap();
    let names: Vec<_> = volume.files().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["README;3", "README"]);
    assert_eq!(volume.files()[0].file_number(), Some(51));
    assert_eq!(volume.files()[1].file_number(), Some(50));
    assert_eq!(
        volume.files()[0].alternate_name.as_deref(),
        Some("README.TXT;3")
    );

    let mut output = Vec::new();
    volume
        .copy_file_to("README;3", &mut output, &mut NonInteractive)
        .unwrap();
    assert_eq!(&output[..13], b"VERSION THREE");
    output.clear();
    volume
        .copy_file_to("README", &mut output, &mut NonInteractive)
        .unwrap();
    assert_eq!(&output[..11], b"VERSION ONE");
}

#[test]
fn ods2_requires_structure_level_two() {
    let mut image = ods2_images::build();
    image[SECTOR_SIZE + 13] = 3;
    assert!(matches!(
        Files11Volume::open(MemStorage::new(image.clone()), StructureLevel::Ods2),
        Err(Error::NotSupported)
    ));
    assert_eq!(ods2::probe(&image), 0);
}

#[test]
fn ods2_probe_checks_the_home_block() {
    let image = ods2_images::build();
    assert_eq!(ods2::probe(&image), 2);
    assert_eq!(ods1::probe(&image), 0);
}

#[test]
fn ods2_retrieval_pointer_formats() {
    let mut header = [0u8; SECTOR_SIZE];
    header[1] = 100; // map at byte 200
    header[58] = 5; // ten bytes of map in use

    // Format 2: 14-bit count, 32-bit LBN; then format 1.
    let format2: u16 = (2 << 14) | 2; // three sectors
    header[200..202].copy_from_slice(&format2.to_le_bytes());
    header[202..206].copy_from_slice(&0x12345u32.to_le_bytes());
    let format1: u16 = 1 << 14; // one sector
    header[206..208].copy_from_slice(&format1.to_le_bytes());
    header[208..210].copy_from_slice(&7u16.to_le_bytes());
    assert_eq!(
        ods2::file_sectors(&header).unwrap(),
        vec![0x12345, 0x12346, 0x12347, 7]
    );

    // Format 0 is placement control and unsupported.
    header[200..202].copy_from_slice(&0u16.to_le_bytes());
    assert!(matches!(ods2::file_sectors(&header), Err(Error::NotSupported)));
}

#[test]
fn ods2_datetime_counts_from_the_modified_julian_epoch() {
    let one_day = 864_000_000_000u64;
    assert_eq!(
        ods2::parse_datetime(&one_day.to_le_bytes()),
        NaiveDate::from_ymd_opt(1858, 11, 18).unwrap().and_hms_opt(0, 0, 0)
    );
    assert_eq!(ods2::parse_datetime(&0u64.to_le_bytes()), None);
}

#[test]
fn unrecognized_image_matches_neither_probe() {
    let blank = vec![0u8; 4096];
    assert_eq!(ods1::probe(&blank), 0);
    assert_eq!(ods2::probe(&blank), 0);
}
