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

//! ODS-1 (RSX-11) structure level: home block at LBA 1, a contiguous file
//! header table right after the storage bitmap, RADIX-50 names,
//! `ddMMMyyhhmmss` ASCII timestamps and byte-sized retrieval pointers.

use chrono::{NaiveDate, NaiveDateTime};
use log::debug;

use dskview_ds::DataStorage;
use dskview_fs::{radix50, DirEntry, DriverData, Error, Result};

use crate::{header_checksum_ok, Files11Volume, SECTOR_SIZE};

const MONTHS: [&[u8; 3]; 12] = [
    b"JAN", b"FEB", b"MAR", b"APR", b"MAY", b"JUN", b"JUL", b"AUG", b"SEP", b"OCT", b"NOV", b"DEC",
];

fn ascii_number(bytes: &[u8]) -> Option<u32> {
    let mut value = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value * 10 + (byte - b'0') as u32;
    }
    Some(value)
}

/// 13-byte `ddMMMyyhhmmss` timestamp; two-digit years below 70 are
/// 2000-based, the rest 1900-based.
pub fn parse_datetime(bytes: &[u8]) -> Option<NaiveDateTime> {
    if bytes.len() < 13 {
        return None;
    }
    let day = ascii_number(&bytes[0..2])?;
    let month = MONTHS
        .iter()
        .position(|month| bytes[2..5] == month[..])? as u32
        + 1;
    let mut year = ascii_number(&bytes[5..7])? as i32;
    year += if year < 70 { 2000 } else { 1900 };
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(
        ascii_number(&bytes[7..9])?,
        ascii_number(&bytes[9..11])?,
        ascii_number(&bytes[11..13])?,
    )
}

/// Three RADIX-50 name words, an extension word and a version word; a
/// version above 1 appends the `;N` suffix.
pub fn decode_name_version(bytes: &[u8]) -> Result<String> {
    let word = |i: usize| u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
    let mut name = String::new();
    for i in 0..3 {
        let chars = radix50::decode_word(word(i)).map_err(|_| Error::DiskCorrupt)?;
        name.push_str(core::str::from_utf8(&chars).unwrap());
    }
    let mut name = name.trim().to_string();
    name.push('.');
    let ext = radix50::decode_word(word(3)).map_err(|_| Error::DiskCorrupt)?;
    name.push_str(core::str::from_utf8(&ext).unwrap().trim());
    let version = word(4);
    if version > 1 {
        name.push_str(&format!(";{version}"));
    }
    Ok(name)
}

pub(crate) fn load_home_block<DS: DataStorage>(
    volume: &mut Files11Volume<DS>,
    home: &[u8; SECTOR_SIZE],
) -> Result<()> {
    let word = |offset: usize| u16::from_le_bytes([home[offset], home[offset + 1]]);
    volume.bitmap_sectors = word(0);
    volume.bitmap_lba = ((word(2) as u32) << 16) | word(4) as u32;
    volume.max_files = word(6) as u32;
    volume.sectors_per_cluster = word(8);
    Ok(())
}

fn parse_header<DS: DataStorage>(
    volume: &mut Files11Volume<DS>,
    sector: u32,
    data: &[u8; SECTOR_SIZE],
) -> Result<()> {
    let file_number = u16::from_le_bytes([data[2], data[3]]) as u32;
    if file_number == 0 {
        return Ok(());
    }
    let ident_offset = data[0] as usize * 2;
    if ident_offset + 38 > SECTOR_SIZE {
        debug!("Identification area of header {sector} out of bounds");
        return Ok(());
    }
    let ident = &data[ident_offset..];
    let characteristics = data[13];

    let mut entry = DirEntry {
        first_cluster: sector as u64,
        driver: DriverData::Files11 { file_number },
        name: decode_name_version(&ident[..10])?,
        created: parse_datetime(&ident[25..38]),
        ..DirEntry::default()
    };
    entry.is_directory = characteristics & 0x20 != 0 || entry.name.ends_with(".DIR");
    if ident[12] != 0 {
        entry.modified = parse_datetime(&ident[12..25]);
    }
    entry.length = volume.file_sectors(&entry)?.len() as u64 * SECTOR_SIZE as u64;
    entry.allocation_size = entry.length;
    volume.insert_entry(file_number, entry)
}

pub(crate) fn load_all_entries<DS: DataStorage>(volume: &mut Files11Volume<DS>) -> Result<()> {
    volume.all_entries.clear();
    for i in 0..volume.max_files {
        let sector = volume.bitmap_lba + volume.bitmap_sectors as u32 + i;
        let data = volume.read_sector(sector)?;
        if !header_checksum_ok(&data) {
            debug!("Header {sector} has a wrong checksum");
            continue;
        }
        parse_header(volume, sector, &data)?;
    }
    Ok(())
}

/// Map-area runs of `count_size`/`lbn_size` byte groups; each run covers
/// `count + 1` sequential sectors.
pub(crate) fn file_sectors(header: &[u8; SECTOR_SIZE]) -> Result<Vec<u32>> {
    let map_offset = header[1] as usize * 2;
    if map_offset + 10 > SECTOR_SIZE {
        return Err(Error::DiskCorrupt);
    }
    let map = &header[map_offset..];
    let count_size = map[6] as usize;
    let lbn_size = map[7] as usize;
    if (count_size + lbn_size) % 2 != 0
        || !(1..=2).contains(&count_size)
        || !(2..=4).contains(&lbn_size)
    {
        return Err(Error::DiskCorrupt);
    }
    let end = 10 + map[8] as usize * 2;
    if map_offset + end > SECTOR_SIZE {
        return Err(Error::DiskCorrupt);
    }
    let mut sectors = Vec::new();
    let mut offset = 10;
    while offset < end {
        if offset + (count_size + lbn_size).max(4) > map.len() {
            return Err(Error::DiskCorrupt);
        }
        let mut lbn = u16::from_le_bytes([map[offset + 2], map[offset + 3]]) as u32;
        match lbn_size {
            3 => lbn |= (map[offset] as u32) << 16,
            4 => {
                lbn = (lbn << 16)
                    | u16::from_le_bytes([map[offset + 4], map[offset + 5]]) as u32
            }
            _ => {}
        }
        let count = 1 + if count_size == 1 {
            map[offset + 1] as u32
        } else {
            u16::from_le_bytes([map[offset], map[offset + 1]]) as u32
        };
        for i in 0..count {
            sectors.push(lbn + i);
        }
        offset += count_size + lbn_size;
    }
    Ok(sectors)
}

/// 16-byte directory records: file number, sequence, then the RADIX-50
/// name/version of the link.
pub(crate) fn parse_directory<DS: DataStorage>(
    volume: &Files11Volume<DS>,
    dir_fid: u32,
    contents: &[u8],
) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for record in contents.chunks_exact(16) {
        let file_number = u16::from_le_bytes([record[0], record[1]]) as u32;
        if file_number == 0 {
            continue;
        }
        let name = match decode_name_version(&record[6..16]) {
            Ok(name) => name,
            Err(_) => {
                debug!("Undecodable directory record for file number {file_number}");
                continue;
            }
        };
        if let Some(entry) = volume.listed_entry(file_number, dir_fid, name) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// `DECFILE11A` in the home block identification field; the PDP-11 NOP in
/// the boot block adds confidence.
pub fn probe(prefix: &[u8]) -> u32 {
    if prefix.len() < 1024 {
        return 0;
    }
    let home = &prefix[512..1024];
    if &home[496..508] != b"DECFILE11A  "
        || u32::from_le_bytes(home[0..4].try_into().unwrap()) != 1
    {
        return 0;
    }
    let mut weight = 2;
    if u16::from_le_bytes([prefix[0], prefix[1]]) == 0o240 {
        weight += 1;
    }
    weight
}
