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

//! Probe dispatch across every registered driver, plus mount-level
//! end-to-end checks against in-memory images.

use dskview::registry;
use dskview_ds::MemStorage;
use dskview_fs::{Error, NonInteractive};

fn fat12_image() -> Vec<u8> {
    let mut image = vec![0u8; 64 * 512];
    image[0] = 0xEB;
    image[1] = 0x3C;
    image[2] = 0x90;
    image[11..13].copy_from_slice(&512u16.to_le_bytes());
    image[13] = 1;
    image[14..16].copy_from_slice(&1u16.to_le_bytes());
    image[16] = 2;
    image[17..19].copy_from_slice(&16u16.to_le_bytes());
    image[19..21].copy_from_slice(&64u16.to_le_bytes());
    image[21] = 0xF8;
    image[22..24].copy_from_slice(&1u16.to_le_bytes());
    image[0x36..0x3E].copy_from_slice(b"FAT12   ");
    image[510] = 0x55;
    image[511] = 0xAA;
    for fat_copy in 0..2usize {
        let offset = (1 + fat_copy) * 512;
        image[offset] = 0xF8;
        image[offset + 1] = 0xFF;
        image[offset + 2] = 0xFF;
    }
    image
}

fn andos_image() -> Vec<u8> {
    let mut image = fat12_image();
    image[4..11].copy_from_slice(b"ANDOS  ");
    image
}

fn mkdos_image() -> Vec<u8> {
    let mut image = vec![0u8; 80 * 512];
    image[0o400..0o402].copy_from_slice(&0o123456u16.to_le_bytes());
    image[0o402..0o404].copy_from_slice(&0o51414u16.to_le_bytes());
    image[0o466..0o470].copy_from_slice(&80u16.to_le_bytes());
    image[0o470..0o472].copy_from_slice(&20u16.to_le_bytes());
    image
}

fn csidos_image() -> Vec<u8> {
    let mut image = vec![0u8; 60 * 512];
    for sector in 2..=9usize {
        image[sector * 512] = sector as u8;
    }
    image[1024 + 2..1024 + 4].copy_from_slice(&60u16.to_le_bytes());
    image[1024 + 4..1024 + 6].copy_from_slice(&0o123123u16.to_le_bytes());
    image[1024 + 6..1024 + 8].copy_from_slice(&0o123123u16.to_le_bytes());
    image[1024 + 8..1024 + 10].copy_from_slice(&0o123123u16.to_le_bytes());
    image
}

fn rt11_image() -> Vec<u8> {
    let mut image = vec![0u8; 32 * 512];
    image[0..2].copy_from_slice(&0o240u16.to_le_bytes());
    image[0o31..0o31 + 9].copy_from_slice(b"\n?BOOT-U-");
    image[0o1730..0o1730 + 12].copy_from_slice(b"RT11A       ");
    image[0o1760..0o1760 + 12].copy_from_slice(b"DECRT11A    ");
    // Home block: directory starts at block 6.
    image[512 + 0o724..512 + 0o726].copy_from_slice(&6u16.to_le_bytes());
    let mut checksum = 0u16;
    for offset in (512..1022).step_by(2) {
        checksum = checksum.wrapping_add(u16::from_le_bytes([image[offset], image[offset + 1]]));
    }
    image[1022..1024].copy_from_slice(&checksum.to_le_bytes());
    // One directory segment: one file of one block, then free space.
    let segment = 6 * 512;
    image[segment..segment + 2].copy_from_slice(&1u16.to_le_bytes());
    image[segment + 4..segment + 6].copy_from_slice(&1u16.to_le_bytes());
    image[segment + 8..segment + 10].copy_from_slice(&8u16.to_le_bytes());
    let entry = segment + 10;
    image[entry..entry + 2].copy_from_slice(&0o2000u16.to_le_bytes());
    let words = dskview_fs::radix50::encode_filename("SWAP.SYS").unwrap();
    for (i, word) in words.iter().enumerate() {
        image[entry + 2 + i * 2..entry + 4 + i * 2].copy_from_slice(&word.to_le_bytes());
    }
    image[entry + 8..entry + 10].copy_from_slice(&1u16.to_le_bytes());
    image[entry + 14..entry + 16].copy_from_slice(&0o4000u16.to_le_bytes());
    image
}

fn ods1_image() -> Vec<u8> {
    let mut image = vec![0u8; 16 * 512];
    image[512..514].copy_from_slice(&1u16.to_le_bytes());
    image[512 + 496..512 + 508].copy_from_slice(b"DECFILE11A  ");
    image
}

fn ods2_image() -> Vec<u8> {
    let mut image = vec![0u8; 16 * 512];
    image[512..516].copy_from_slice(&1u32.to_le_bytes());
    image[516..520].copy_from_slice(&1u32.to_le_bytes());
    image[512 + 13] = 2;
    image[512 + 496..512 + 508].copy_from_slice(b"DECFILE11B  ");
    image
}

fn altpro_image() -> Vec<u8> {
    let mut image = vec![0u8; 64 * 512];
    let mut table = [0u8; 512];
    table[510..512].copy_from_slice(&80u16.to_le_bytes());
    table[508] = 2;
    table[506..508].copy_from_slice(&18u16.to_le_bytes());
    table[504] = 2;
    table[502..504].copy_from_slice(&0u16.to_le_bytes());
    table[500..502].copy_from_slice(&9u16.to_le_bytes());
    table[498..500].copy_from_slice(&(1u16 << 4).to_le_bytes());
    table[496..498].copy_from_slice(&9u16.to_le_bytes());
    let mut crc = 0o12701u16;
    for i in 0..2 * 2 + 4 {
        crc = crc.wrapping_add(u16::from_le_bytes([table[510 - i * 2], table[510 - i * 2 + 1]]));
    }
    table[494..496].copy_from_slice(&crc.to_le_bytes());
    for (i, &byte) in table.iter().enumerate() {
        image[7 * 512 + i] = !byte;
    }
    image
}

fn samara_image() -> Vec<u8> {
    let mut image = vec![0u8; 512];
    image[510] = 0xA5;
    image[0] = 0x5B;
    let mut body = vec![0u8; 64 * 512];
    let mut table = [0u8; 512];
    table[4] = 9;
    table[5] = 1;
    table[2..4].copy_from_slice(&18u16.to_le_bytes());
    table[6..10].copy_from_slice(&20u32.to_le_bytes());
    for (i, &byte) in table.iter().enumerate() {
        body[512 + i] = !byte;
    }
    let mut header = [0u8; 512];
    header[0..2].copy_from_slice(&2u16.to_le_bytes());
    header[2..4].copy_from_slice(&4u16.to_le_bytes());
    for (i, &byte) in header.iter().enumerate() {
        body[20 * 512 + i] = !byte;
    }
    image.extend_from_slice(&body);
    image
}

#[test]
fn each_signature_dispatches_to_its_driver() {
    let cases: [(&str, Vec<u8>); 9] = [
        ("fat", fat12_image()),
        ("andos", andos_image()),
        ("mkdos", mkdos_image()),
        ("csidos", csidos_image()),
        ("files11-ods1", ods1_image()),
        ("files11-ods2", ods2_image()),
        ("rt11", rt11_image()),
        ("hdi-altpro", altpro_image()),
        ("hdi-samara", samara_image()),
    ];
    let registry = registry::<MemStorage>();
    for (expected, image) in cases {
        let best = registry
            .best_match(&image)
            .unwrap_or_else(|| panic!("no driver claimed the {expected} image"));
        assert_eq!(best.name, expected);
    }
}

#[test]
fn unrecognized_volume_is_an_error() {
    let result = registry().mount(MemStorage::new(vec![0u8; 64 * 512]));
    assert!(matches!(result, Err(Error::UnrecognizedVolume)));
}

#[test]
fn fat_mount_end_to_end() {
    let mut volume = registry().mount(MemStorage::new(fat12_image())).unwrap();
    assert!(volume.files().is_empty());

    let contents = b"end to end".to_vec();
    volume
        .add_file("E2E.TXT", contents.len() as u64, &mut &contents[..], None)
        .unwrap();
    assert_eq!(volume.files().len(), 1);
    assert_eq!(volume.files()[0].name, "E2E.TXT");

    let mut output = Vec::new();
    volume
        .copy_file_to("E2E.TXT", &mut output, &mut NonInteractive)
        .unwrap();
    assert_eq!(output, contents);

    volume.remove_file("E2E.TXT").unwrap();
    assert!(volume.files().is_empty());
    volume.flush().unwrap();
}

#[test]
fn rt11_mount_lists_and_squeezes() {
    let mut volume = registry().mount(MemStorage::new(rt11_image())).unwrap();
    assert_eq!(volume.files().len(), 1);
    assert_eq!(volume.max_name_length(), 10);
    volume.defragment().unwrap();
    assert_eq!(volume.files().len(), 1);
}

#[test]
fn altpro_mount_exposes_partitions() {
    let mut volume = registry().mount(MemStorage::new(altpro_image())).unwrap();
    let names: Vec<_> = volume.files().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["Partition 1.dsk", "Partition 2.dsk"]);

    let mut output = Vec::new();
    volume
        .copy_file_to("Partition 1.dsk", &mut output, &mut NonInteractive)
        .unwrap();
    assert_eq!(output.len(), 9 * 512);
}
