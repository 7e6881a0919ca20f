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

//! ODS-2 (VMS) structure level: 32-bit home block fields, structure level 2
//! required, ASCII header names, 64-bit timestamps counted in 100 ns units
//! since 1858-11-17, compact retrieval pointers with a 2-bit format
//! selector and variable-length directory records with per-version rows.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use log::debug;

use dskview_ds::DataStorage;
use dskview_fs::{DirEntry, DriverData, Error, Result};

use crate::{header_checksum_ok, Files11Volume, FILE_NUM_INDEX, SECTOR_SIZE};

const FCH_DIRECTORY: u32 = 1 << 13;
const FCH_MARKED_FOR_DELETE: u32 = 1 << 15;

/// 100-nanosecond intervals since the Modified Julian epoch
/// (1858-11-17 00:00:00); zero means "no timestamp".
pub fn parse_datetime(bytes: &[u8]) -> Option<NaiveDateTime> {
    let ticks = u64::from_le_bytes(bytes[..8].try_into().ok()?);
    if ticks == 0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1858, 11, 17)?.and_hms_opt(0, 0, 0)?;
    epoch.checked_add_signed(TimeDelta::microseconds((ticks / 10) as i64))
}

pub(crate) fn load_home_block<DS: DataStorage>(
    volume: &mut Files11Volume<DS>,
    home: &[u8; SECTOR_SIZE],
) -> Result<()> {
    let word = |offset: usize| u16::from_le_bytes([home[offset], home[offset + 1]]);
    let dword = |offset: usize| u32::from_le_bytes(home[offset..offset + 4].try_into().unwrap());
    let home_lbn = dword(0);
    let alternate_home_lbn = dword(4);
    if home_lbn != 1 || alternate_home_lbn == 0 {
        log::error!("Home block location words are implausible");
        return Err(Error::DiskCorrupt);
    }
    // Byte 13 is the structure-level major version.
    if home[13] != 2 {
        return Err(Error::NotSupported);
    }
    volume.sectors_per_cluster = word(14);
    volume.bitmap_lba = dword(24);
    volume.max_files = dword(28);
    volume.bitmap_sectors = word(32);
    Ok(())
}

fn ascii_trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

fn load_file_header<DS: DataStorage>(volume: &mut Files11Volume<DS>, sector: u32) -> Result<()> {
    let data = volume.read_sector(sector)?;
    let checksum = u16::from_le_bytes([data[510], data[511]]);
    let file_number = u16::from_le_bytes([data[8], data[9]]) as u32;
    let characteristics = u32::from_le_bytes(data[52..56].try_into().unwrap());
    if file_number == 0 && checksum == 0 && characteristics & FCH_MARKED_FOR_DELETE != 0 {
        return Ok(());
    }
    // Byte 7 holds the header's structure-level major version.
    if data[7] != 2 {
        return Ok(());
    }
    if !header_checksum_ok(&data) {
        debug!("Header {sector} has a wrong checksum");
        return Ok(());
    }
    if file_number == 0 {
        return Ok(());
    }
    let ident_offset = data[0] as usize * 2;
    if ident_offset + 120 > SECTOR_SIZE {
        debug!("Identification area of header {sector} out of bounds");
        return Ok(());
    }
    let ident = &data[ident_offset..];

    let mut name = ascii_trimmed(&ident[..20]);
    name.push_str(&ascii_trimmed(&ident[54..120]));
    let mut entry = DirEntry {
        first_cluster: sector as u64,
        driver: DriverData::Files11 { file_number },
        name,
        is_directory: characteristics & FCH_DIRECTORY != 0,
        created: parse_datetime(&ident[22..30]),
        modified: parse_datetime(&ident[30..38]),
        expires: parse_datetime(&ident[38..46]),
        backed_up: parse_datetime(&ident[46..54]),
        ..DirEntry::default()
    };
    entry.length = volume.file_sectors(&entry)?.len() as u64 * SECTOR_SIZE as u64;
    entry.allocation_size = entry.length;
    volume.insert_entry(file_number, entry)
}

/// The first 16 headers sit right after the storage bitmap; the rest are
/// reached through the index file's own retrieval pointers.
pub(crate) fn load_all_entries<DS: DataStorage>(volume: &mut Files11Volume<DS>) -> Result<()> {
    volume.all_entries.clear();
    let contiguous = volume.max_files.min(16);
    for i in 0..contiguous {
        load_file_header(volume, volume.bitmap_lba + volume.bitmap_sectors as u32 + i)?;
    }
    let Ok(index) = volume.entry_by_fid(FILE_NUM_INDEX) else {
        return Ok(());
    };
    let sectors = volume.file_sectors(index)?;
    let offset = 4 * volume.sectors_per_cluster as usize + volume.bitmap_sectors as usize;
    for i in contiguous..volume.max_files {
        let Some(&sector) = sectors.get(offset + i as usize) else {
            break;
        };
        load_file_header(volume, sector)?;
    }
    Ok(())
}

/// Retrieval pointers: the two high bits of the first word select the run
/// format. Format 0 (placement control) is not supported.
pub(crate) fn file_sectors(header: &[u8; SECTOR_SIZE]) -> Result<Vec<u32>> {
    let map_offset = header[1] as usize * 2;
    let end = header[58] as usize * 2;
    if map_offset + end > SECTOR_SIZE {
        return Err(Error::DiskCorrupt);
    }
    let map = &header[map_offset..];
    let word = |offset: usize| u16::from_le_bytes([map[offset], map[offset + 1]]);
    let dword = |offset: usize| u32::from_le_bytes(map[offset..offset + 4].try_into().unwrap());
    let mut sectors = Vec::new();
    let mut offset = 0;
    while offset + 2 <= end {
        let low = word(offset);
        let run_bytes = match low >> 14 {
            0 => return Err(Error::NotSupported),
            1 => 4,
            2 => 6,
            _ => 8,
        };
        if offset + run_bytes > map.len() {
            return Err(Error::DiskCorrupt);
        }
        let count;
        let lbn;
        match low >> 14 {
            1 => {
                count = (low & 0xFF) as u32 + 1;
                lbn = word(offset + 2) as u32 | ((low & 0x3F00) as u32) << 8;
            }
            2 => {
                count = (low & 0x3FFF) as u32 + 1;
                lbn = dword(offset + 2);
            }
            _ => {
                count = word(offset + 2) as u32 | ((low & 0x3FFF) as u32) << 16;
                lbn = dword(offset + 4);
            }
        }
        offset += run_bytes;
        for i in 0..count {
            sectors.push(lbn + i);
        }
    }
    Ok(sectors)
}

/// Length-prefixed records: a record length of 0xFFFF skips to the next
/// 512-byte boundary; after the counted name follow even-aligned 8-byte
/// `(version, fid, …)` rows, one listing per version with the `;N` suffix
/// for versions above 1.
pub(crate) fn parse_directory<DS: DataStorage>(
    volume: &Files11Volume<DS>,
    dir_fid: u32,
    contents: &[u8],
) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + 2 <= contents.len() {
        let size = u16::from_le_bytes([contents[offset], contents[offset + 1]]) as usize;
        if size == 0 {
            break;
        }
        if size == 0xFFFF {
            offset = (offset + SECTOR_SIZE) & !(SECTOR_SIZE - 1);
            continue;
        }
        if size % 2 != 0 || offset + 2 + size > contents.len() {
            return Err(Error::DiskCorrupt);
        }
        let record = &contents[offset..offset + 2 + size];
        if record.len() < 6 {
            return Err(Error::DiskCorrupt);
        }
        let name_length = record[5] as usize;
        if 6 + name_length > record.len() {
            return Err(Error::DiskCorrupt);
        }
        let name = ascii_trimmed(&record[6..6 + name_length]);
        let mut row = 6 + ((name_length + 1) & !1);
        while row + 8 <= record.len() {
            let version = u16::from_le_bytes([record[row], record[row + 1]]);
            let file_number = u32::from_le_bytes([
                record[row + 2],
                record[row + 3],
                record[row + 4],
                0,
            ]);
            let versioned_name = if version > 1 {
                format!("{name};{version}")
            } else {
                name.clone()
            };
            if let Some(entry) = volume.listed_entry(file_number, dir_fid, versioned_name) {
                entries.push(entry);
            }
            row += 8;
        }
        offset += 2 + size;
    }
    Ok(entries)
}

/// `DECFILE11B` in the home block identification field, home LBN 1 and
/// structure level 2.
pub fn probe(prefix: &[u8]) -> u32 {
    if prefix.len() < 1024 {
        return 0;
    }
    let home = &prefix[512..1024];
    if &home[496..508] != b"DECFILE11B  "
        || u32::from_le_bytes(home[0..4].try_into().unwrap()) != 1
        || home[13] != 2
    {
        return 0;
    }
    let mut weight = 2;
    if u16::from_le_bytes([prefix[0], prefix[1]]) == 0o240 {
        weight += 1;
    }
    weight
}
