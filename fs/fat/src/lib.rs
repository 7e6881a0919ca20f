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

use std::io::{Read, Write};

use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, error};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use dskview_ds::DataStorage;
use dskview_fs::{
    add_to_dir_entries, find_position,
    text::{split_name, TextEncoding},
    DirEntry, Error, Result, Volume, VolumeCallback, VolumeFactory,
};

pub const DIR_ENTRY_SIZE: usize = 32;
const LONG_NAME_CHARS_PER_ENTRY: usize = 13;

const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_HIDDEN: u8 = 0x02;
const ATTR_SYSTEM: u8 = 0x04;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_LONG_NAME: u8 = 0x0F;
const LAST_LONG_ENTRY: u8 = 0x40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatKind {
    Fat12,
    Fat16,
    Fat32,
}

/// Boot sector with the BIOS parameter block at offset 11.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct BootSector {
    /// 8086 jump to the bootstrap code: EB ?? 90, or E9 ?? ??.
    jmp_boot: [u8; 3],
    oem_name: [u8; 8],

    /// 512, 1024, 2048 or 4096.
    bytes_per_sector: U16,
    /// Power of two within [1, 128].
    sectors_per_cluster: u8,
    reserved_sectors: U16,
    number_of_fats: u8,
    /// Count of 32-byte root directory entries; 0 on FAT32.
    root_entries: U16,
    /// 16-bit total sector count; 0 defers to `total_sectors_32`.
    total_sectors_16: U16,
    /// 0xF8 for fixed media, 0xF0 for removable.
    media_descriptor: u8,
    /// Sectors per FAT; 0 on FAT32, which uses `sectors_per_fat_32`.
    sectors_per_fat_16: U16,

    sectors_per_track: U16,
    number_of_heads: U16,
    hidden_sectors: U32,
    total_sectors_32: U32,

    // FAT32 extension region; meaningless on FAT12/16.
    sectors_per_fat_32: U32,
    ext_flags: U16,
    fs_version: U16,
    /// First cluster of the FAT32 root directory chain.
    root_cluster: U32,
    fs_info_sector: U16,
    backup_boot_sector: U16,
    reserved: [u8; 12],

    drive_number: u8,
    reserved1: u8,
    boot_signature: u8,
    volume_id: U32,
    volume_label: [u8; 11],
    /// "FAT12   ", "FAT16   " or "FAT32   "; informational only.
    filesystem_type: [u8; 8],

    boot_code: [u8; 420],
    /// 0x55 at byte 510, 0xAA at byte 511.
    signature_word: [u8; 2],
}

/// 32-byte short-name directory entry.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawDirRecord {
    /// 8.3 name; byte 0 also carries status: 0x00 end of directory, 0xE5
    /// deleted, 0x05 an escaped leading 0xE5 (Kanji).
    name: [u8; 11],
    attr: u8,
    nt_reserved: u8,
    creation_time_tenth: u8,
    creation_time: U16,
    creation_date: U16,
    last_access_date: U16,
    /// High word of the first cluster, FAT32 only.
    first_cluster_high: U16,
    write_time: U16,
    write_date: U16,
    first_cluster_low: U16,
    file_size: U32,
}

/// 32-byte long-filename slot: 13 UCS-2 units across three fragments.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct LongNameRecord {
    /// Slot ordinal; bit 0x40 marks the last (first on disk) slot.
    ordinal: u8,
    name1: [U16; 5],
    /// Always ATTR_LONG_NAME (0x0F).
    attr: u8,
    kind: u8,
    /// Checksum of the 8.3 name in the entry this slot belongs to.
    checksum: u8,
    name2: [U16; 6],
    /// Must be 0.
    first_cluster_low: U16,
    name3: [U16; 2],
}

pub fn short_filename_checksum(short_name: &[u8]) -> u8 {
    let mut sum = 0u8;
    for &byte in &short_name[..11] {
        sum = (if sum & 1 != 0 { 0x80u8 } else { 0 })
            .wrapping_add(sum >> 1)
            .wrapping_add(byte);
    }
    sum
}

/// Decodes the date/time word pair; fields with out-of-range
/// hour/minute/second are zeroed, an undecodable date yields `None`.
pub fn decode_datetime(date: u16, time: u16) -> Option<NaiveDateTime> {
    let mut hour = (time >> 11) as u32;
    let mut minute = (time >> 5) as u32 & 0b11_1111;
    let mut second = (time as u32 & 0b1_1111) << 1;
    if hour > 23 || minute > 59 || second > 59 {
        hour = 0;
        minute = 0;
        second = 0;
    }
    decode_date(date)?.and_hms_opt(hour, minute, second)
}

pub fn decode_date(date: u16) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(
        1980 + (date >> 9) as i32,
        (date >> 5) as u32 & 0b1111,
        date as u32 & 0b1_1111,
    )
}

/// Encodes a timestamp as the FAT (date, time) word pair, clamped to the
/// representable range 1980-01-01..=2099-12-31 (2-second resolution).
pub fn encode_datetime(datetime: NaiveDateTime) -> (u16, u16) {
    let min = NaiveDate::from_ymd_opt(1980, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    let max = NaiveDate::from_ymd_opt(2099, 12, 31).unwrap().and_hms_opt(23, 59, 59).unwrap();
    let datetime = datetime.clamp(min, max);
    let date = datetime.date();
    let time = datetime.time();
    use chrono::{Datelike, Timelike};
    (
        (((date.year() - 1980) as u16) << 9) | ((date.month() as u16) << 5) | date.day() as u16,
        ((time.hour() as u16) << 11) | ((time.minute() as u16) << 5) | (time.second() as u16 / 2),
    )
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn fill_buffer(input: &mut dyn Read, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = input.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A decoded directory entry together with its on-disk 32-byte record, for
/// drivers layered on top of FAT that reuse record bytes FAT itself ignores.
pub struct RawDirEntry {
    pub entry: DirEntry,
    pub raw: [u8; DIR_ENTRY_SIZE],
}

pub struct FatVolume<DS: DataStorage> {
    ds: DS,
    encoding: TextEncoding,

    kind: FatKind,
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    number_of_fats: u8,
    root_directory_entries: u32,
    total_sectors: u64,
    sectors_per_fat: u64,
    media_descriptor: u8,
    root_cluster: u32,
    cluster_count: u64,
    min_final_cluster: u32,

    fat: Vec<u32>,

    cur_dir_cluster: u32,
    cur_dir_name: String,
    files: Vec<DirEntry>,
}

impl<DS: DataStorage> FatVolume<DS> {
    pub fn new(ds: DS) -> Result<Self> {
        Self::open(ds, TextEncoding::Oem)
    }

    pub fn open(ds: DS, encoding: TextEncoding) -> Result<Self> {
        let mut buffer = [0; 512];
        ds.read(0, &mut buffer)?;
        let boot = BootSector::read_from_bytes(&buffer).unwrap();

        let bytes_per_sector = boot.bytes_per_sector.get();
        let sectors_per_cluster = boot.sectors_per_cluster;
        if bytes_per_sector == 0 || sectors_per_cluster == 0 {
            error!("Bytes per sector and sectors per cluster shall be non-zero");
            return Err(Error::DiskCorrupt);
        }
        let total_sectors = if boot.total_sectors_16.get() != 0 {
            boot.total_sectors_16.get() as u64
        } else {
            boot.total_sectors_32.get() as u64
        };
        let sectors_per_fat = if boot.sectors_per_fat_16.get() != 0 {
            boot.sectors_per_fat_16.get() as u64
        } else {
            boot.sectors_per_fat_32.get() as u64
        };
        let root_directory_entries = boot.root_entries.get() as u32;
        let root_dir_sectors = (root_directory_entries as u64 * DIR_ENTRY_SIZE as u64
            + bytes_per_sector as u64
            - 1)
            / bytes_per_sector as u64;
        let data_sectors = total_sectors
            .saturating_sub(boot.reserved_sectors.get() as u64)
            .saturating_sub(boot.number_of_fats as u64 * sectors_per_fat)
            .saturating_sub(root_dir_sectors);
        let cluster_count = data_sectors / sectors_per_cluster as u64;
        let kind = if cluster_count < 4085 {
            FatKind::Fat12
        } else if cluster_count < 65525 {
            FatKind::Fat16
        } else {
            FatKind::Fat32
        };
        let root_cluster = match kind {
            FatKind::Fat32 => boot.root_cluster.get(),
            _ => 0,
        };

        let mut volume = Self {
            ds,
            encoding,
            kind,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors: boot.reserved_sectors.get(),
            number_of_fats: boot.number_of_fats,
            root_directory_entries,
            total_sectors,
            sectors_per_fat,
            media_descriptor: boot.media_descriptor,
            root_cluster,
            cluster_count,
            min_final_cluster: match kind {
                FatKind::Fat12 => 0xFF8,
                FatKind::Fat16 => 0xFFF8,
                FatKind::Fat32 => 0xFFF_FFF8,
            },
            fat: Vec::new(),
            cur_dir_cluster: root_cluster,
            cur_dir_name: "/".into(),
            files: Vec::new(),
        };
        volume.load_fat()?;
        volume.load_cur_dir()?;
        Ok(volume)
    }

    pub fn kind(&self) -> FatKind {
        self.kind
    }

    pub fn bytes_per_sector(&self) -> u16 {
        self.bytes_per_sector
    }

    pub fn sectors_per_cluster(&self) -> u8 {
        self.sectors_per_cluster
    }

    pub fn media_descriptor(&self) -> u8 {
        self.media_descriptor
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    pub fn fat(&self) -> &[u32] {
        &self.fat
    }

    fn bytes_per_cluster(&self) -> u32 {
        self.sectors_per_cluster as u32 * self.bytes_per_sector as u32
    }

    fn first_root_dir_sector(&self) -> u64 {
        self.reserved_sectors as u64 + self.number_of_fats as u64 * self.sectors_per_fat
    }

    fn root_dir_sectors(&self) -> u64 {
        (self.root_directory_entries as u64 * DIR_ENTRY_SIZE as u64 + self.bytes_per_sector as u64
            - 1)
            / self.bytes_per_sector as u64
    }

    pub fn data_offset(&self, cluster: u32) -> u64 {
        (self.first_root_dir_sector()
            + self.root_dir_sectors()
            + (cluster as u64 - 2) * self.sectors_per_cluster as u64)
            * self.bytes_per_sector as u64
    }

    pub fn ensure_write_mode(&mut self) {
        self.ds.make_writable();
    }

    fn load_fat(&mut self) -> Result<()> {
        let bytes_per_fat = (self.sectors_per_fat * self.bytes_per_sector as u64) as usize;
        let mut bytes = vec![0; bytes_per_fat];
        self.ds
            .read(self.reserved_sectors as u64 * self.bytes_per_sector as u64, &mut bytes)?;

        let entries = match self.kind {
            FatKind::Fat12 => bytes_per_fat * 8 / 12,
            FatKind::Fat16 => bytes_per_fat / 2,
            FatKind::Fat32 => bytes_per_fat / 4,
        };
        self.fat.clear();
        self.fat.reserve(entries);
        for i in 0..entries {
            let entry = match self.kind {
                FatKind::Fat12 => {
                    let offset = i * 3 / 2;
                    if offset + 1 >= bytes.len() {
                        break;
                    }
                    let pair = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
                    if i % 2 == 0 {
                        (pair & 0xFFF) as u32
                    } else {
                        (pair >> 4) as u32
                    }
                }
                FatKind::Fat16 => u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]) as u32,
                FatKind::Fat32 => {
                    u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap()) & 0x0FFF_FFFF
                }
            };
            self.fat.push(entry);
        }
        Ok(())
    }

    pub fn save_fats(&mut self) -> Result<()> {
        let fat_offset = self.reserved_sectors as u64 * self.bytes_per_sector as u64;
        let bytes_per_fat = (self.sectors_per_fat * self.bytes_per_sector as u64) as usize;
        let mut bytes = vec![0; bytes_per_fat];
        if self.kind == FatKind::Fat32 {
            // The high 4 bits of FAT32 entries are reserved; keep them.
            self.ds.read(fat_offset, &mut bytes)?;
        }

        for (i, &entry) in self.fat.iter().enumerate() {
            match self.kind {
                FatKind::Fat12 => {
                    let offset = i * 3 / 2;
                    if i % 2 == 0 {
                        bytes[offset] = entry as u8;
                        bytes[offset + 1] = (bytes[offset + 1] & 0xF0) | ((entry >> 8) as u8 & 0x0F);
                    } else {
                        bytes[offset] = (bytes[offset] & 0x0F) | ((entry as u8 & 0x0F) << 4);
                        bytes[offset + 1] = (entry >> 4) as u8;
                    }
                }
                FatKind::Fat16 => {
                    bytes[i * 2..i * 2 + 2].copy_from_slice(&(entry as u16).to_le_bytes())
                }
                FatKind::Fat32 => {
                    let old =
                        u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
                    let merged = (old & 0xF000_0000) | (entry & 0x0FFF_FFFF);
                    bytes[i * 4..i * 4 + 4].copy_from_slice(&merged.to_le_bytes());
                }
            }
        }

        for copy in 0..self.number_of_fats as u64 {
            self.ds.write(
                fat_offset + copy * self.sectors_per_fat * self.bytes_per_sector as u64,
                &bytes,
            )?;
        }
        Ok(())
    }

    fn next_in_chain(&self, cluster: u32) -> Result<u32> {
        self.fat
            .get(cluster as usize)
            .copied()
            .ok_or(Error::DiskCorrupt)
    }

    /// The clusters of a chain, in order, excluding the final marker.
    pub fn clusters_of(&self, first_cluster: u32) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        let mut cluster = first_cluster;
        while cluster >= 2 && cluster < self.min_final_cluster {
            clusters.push(cluster);
            if clusters.len() > self.fat.len() {
                error!("Circular cluster chain starting at {first_cluster}");
                return Err(Error::DiskCorrupt);
            }
            cluster = self.next_in_chain(cluster)?;
        }
        Ok(clusters)
    }

    fn create_chain(&mut self, clusters: &[u32]) {
        for window in clusters.windows(2) {
            self.fat[window[0] as usize] = window[1];
        }
        if let Some(&last) = clusters.last() {
            self.fat[last as usize] = self.min_final_cluster;
        }
    }

    /// Scatter-allocates enough free clusters for `count`; the chain is not
    /// linked yet.
    fn allocate(&mut self, count: u64) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        if count == 0 {
            return Ok(clusters);
        }
        let limit = self.fat.len().min(self.cluster_count as usize + 2);
        for cluster in 2..limit {
            if self.fat[cluster] == 0 {
                clusters.push(cluster as u32);
                if clusters.len() as u64 == count {
                    return Ok(clusters);
                }
            }
        }
        Err(Error::NoSpaceOnDevice)
    }

    /// Writes `length` bytes of `input` over the chain starting at
    /// `first_cluster`, truncating or extending it in place; `first_cluster`
    /// of 0 allocates from scratch. Returns the first cluster of the new
    /// contents (0 when empty). The FAT copies are not saved here.
    pub fn save_stream_contents(
        &mut self,
        input: &mut dyn Read,
        length: u64,
        first_cluster: u32,
    ) -> Result<u32> {
        let bytes_per_cluster = self.bytes_per_cluster() as u64;
        let need = length.div_ceil(bytes_per_cluster);
        let mut clusters = if first_cluster != 0 {
            let mut clusters = self.clusters_of(first_cluster)?;
            while clusters.len() as u64 > need {
                let last = clusters.pop().unwrap();
                self.fat[last as usize] = 0;
                if let Some(&new_last) = clusters.last() {
                    self.fat[new_last as usize] = self.min_final_cluster;
                }
            }
            clusters
        } else {
            Vec::new()
        };
        if (clusters.len() as u64) < need {
            let grown = self.allocate(need - clusters.len() as u64)?;
            if let Some(&last) = clusters.last() {
                self.fat[last as usize] = grown[0];
            }
            self.create_chain(&grown);
            clusters.extend_from_slice(&grown);
        }

        let mut buffer = vec![0; bytes_per_cluster as usize];
        for &cluster in &clusters {
            buffer.fill(0);
            fill_buffer(input, &mut buffer)?;
            self.ds.write(self.data_offset(cluster), &buffer)?;
        }
        Ok(clusters.first().copied().unwrap_or(0))
    }

    fn read_dir_segments(&self, cluster: u32) -> Result<Vec<(u64, Vec<u8>)>> {
        if cluster == 0 {
            let offset = self.first_root_dir_sector() * self.bytes_per_sector as u64;
            let mut bytes = vec![0; self.root_directory_entries as usize * DIR_ENTRY_SIZE];
            self.ds.read(offset, &mut bytes)?;
            Ok(vec![(offset, bytes)])
        } else {
            let bytes_per_cluster = self.bytes_per_cluster() as usize;
            self.clusters_of(cluster)?
                .into_iter()
                .map(|cluster| {
                    let offset = self.data_offset(cluster);
                    let mut bytes = vec![0; bytes_per_cluster];
                    self.ds.read(offset, &mut bytes)?;
                    Ok((offset, bytes))
                })
                .collect()
        }
    }

    fn decode_filename(&self, bytes: &[u8]) -> String {
        let (name_bytes, ext_bytes) = bytes.split_at(bytes.len() - 3);
        let name = self.encoding.decode_trimmed(name_bytes);
        let ext = self.encoding.decode_trimmed(ext_bytes);
        if ext.is_empty() {
            name
        } else {
            format!("{name}.{ext}")
        }
    }

    fn read_dir_entry(&self, entry: &mut DirEntry, record: &RawDirRecord) {
        entry.created = decode_datetime(record.write_date.get(), record.write_time.get());
        let attr = record.attr;
        entry.is_archive = attr & ATTR_ARCHIVE != 0;
        entry.hidden = attr & ATTR_HIDDEN != 0;
        entry.read_only = attr & ATTR_READ_ONLY != 0;
        entry.is_system = attr & ATTR_SYSTEM != 0;
        entry.is_volume_label = attr & ATTR_VOLUME_ID != 0;
        entry.is_directory = attr & ATTR_DIRECTORY != 0;
        entry.length = if !entry.is_directory && !entry.is_volume_label {
            record.file_size.get() as u64
        } else {
            0
        };
        entry.allocation_size = if entry.length == 0 {
            0
        } else {
            (entry.length | (self.bytes_per_cluster() as u64 - 1)) + 1
        };
        entry.first_cluster = record.first_cluster_low.get() as u64;
        if self.kind == FatKind::Fat32 {
            entry.first_cluster += (record.first_cluster_high.get() as u64) << 16;
        }
    }

    /// Reads a directory; cluster 0 is the fixed FAT12/16 root region.
    /// `with_extra` includes deleted entries, dot entries and the volume
    /// label.
    pub fn raw_dir_entries(&self, cluster: u32, with_extra: bool) -> Result<Vec<RawDirEntry>> {
        let segments = self.read_dir_segments(cluster)?;
        let mut entries = Vec::new();
        let mut long_name = String::new();
        let mut prev_ordinal = 0u8;
        let mut checksum = 0u8;
        'segments: for (segment_offset, bytes) in &segments {
            for record_index in 0..bytes.len() / DIR_ENTRY_SIZE {
                let mut raw = [0; DIR_ENTRY_SIZE];
                raw.copy_from_slice(
                    &bytes[record_index * DIR_ENTRY_SIZE..(record_index + 1) * DIR_ENTRY_SIZE],
                );
                let disk_offset = segment_offset + (record_index * DIR_ENTRY_SIZE) as u64;
                if raw[0] == 0x00 {
                    break 'segments;
                }
                let record = RawDirRecord::read_from_bytes(&raw).unwrap();
                if raw[0] == 0xE5 {
                    if with_extra {
                        let mut entry = DirEntry {
                            empty: true,
                            raw_name: raw[..11].to_vec(),
                            entry_offset: Some(disk_offset),
                            ..DirEntry::default()
                        };
                        entry.name = format!("~{}", self.decode_filename(&raw[1..11]));
                        self.read_dir_entry(&mut entry, &record);
                        entries.push(RawDirEntry { entry, raw });
                    }
                    continue;
                }

                if record.attr & 0x0F == ATTR_LONG_NAME
                    && (raw[0] & LAST_LONG_ENTRY != 0 || !long_name.is_empty())
                {
                    let long = LongNameRecord::read_from_bytes(&raw).unwrap();
                    let mut units = [0u16; LONG_NAME_CHARS_PER_ENTRY];
                    for (i, unit) in long
                        .name1
                        .iter()
                        .chain(long.name2.iter())
                        .chain(long.name3.iter())
                        .enumerate()
                    {
                        units[i] = unit.get();
                    }
                    let part = if units[12] != 0xFFFF && units[12] != 0 {
                        String::from_utf16_lossy(&units)
                    } else if let Some(nul) = units.iter().position(|&unit| unit == 0) {
                        String::from_utf16_lossy(&units[..nul])
                    } else {
                        debug!("Directory corrupted: unterminated padded long name segment");
                        long_name.clear();
                        prev_ordinal = 0;
                        continue;
                    };
                    let ordinal = long.ordinal & 0x3F;
                    if long.ordinal & LAST_LONG_ENTRY != 0 {
                        long_name = part;
                        checksum = long.checksum;
                    } else if ordinal + 1 == prev_ordinal {
                        long_name.insert_str(0, &part);
                    } else {
                        debug!("Directory corrupted: long name ordinals not consecutive");
                        long_name.clear();
                        prev_ordinal = 0;
                        continue;
                    }
                    prev_ordinal = ordinal;
                } else {
                    let mut entry = DirEntry::default();
                    entry.attrs = record.attr;
                    entry.raw_name = raw[..11].to_vec();
                    if entry.raw_name[0] == 0x05 {
                        // Kanji escape for a real leading 0xE5.
                        entry.raw_name[0] = 0xE5;
                    }
                    let short_name = self.decode_filename(&entry.raw_name);
                    if long_name.is_empty() {
                        entry.name = short_name;
                    } else if short_filename_checksum(&entry.raw_name) == checksum {
                        entry.name = std::mem::take(&mut long_name).trim().to_string();
                        entry.alternate_name = Some(short_name);
                    } else {
                        debug!("Directory corrupted: long filename checksum does not match");
                        entry.name = short_name;
                        long_name.clear();
                    }
                    prev_ordinal = 0;
                    if !with_extra && (entry.name == "." || entry.name == "..") {
                        continue;
                    }
                    entry.entry_offset = Some(disk_offset);
                    self.read_dir_entry(&mut entry, &record);
                    entries.push(RawDirEntry { entry, raw });
                }
            }
        }
        Ok(entries)
    }

    pub fn dir_entries(&self, cluster: u32, with_extra: bool) -> Result<Vec<DirEntry>> {
        Ok(self
            .raw_dir_entries(cluster, with_extra)?
            .into_iter()
            .map(|raw| raw.entry)
            .collect())
    }

    fn load_cur_dir(&mut self) -> Result<()> {
        self.files = self.dir_entries(self.cur_dir_cluster, false)?;
        self.files.retain(|entry| !entry.is_volume_label);
        Ok(())
    }

    /// Serializes one entry — any long-name slots first, then the 32-byte
    /// record — appending to `out`.
    pub fn serialize_entry(&self, out: &mut Vec<u8>, entry: &DirEntry) -> Result<()> {
        let short_name = entry.alternate_name.as_deref().unwrap_or(&entry.name);
        let mut name = [b' '; 11];
        if entry.raw_name.len() == 11 && self.decode_filename(&entry.raw_name) == short_name {
            // Keeps filenames with multiple dots or odd padding unmodified.
            name.copy_from_slice(&entry.raw_name);
        } else {
            let (base, ext) = split_name(short_name);
            let base = self.encoding.encode(base)?;
            let ext = self.encoding.encode(ext)?;
            name[..base.len().min(8)].copy_from_slice(&base[..base.len().min(8)]);
            name[8..8 + ext.len().min(3)].copy_from_slice(&ext[..ext.len().min(3)]);
        }

        if entry.alternate_name.is_some() {
            let mut units: Vec<u16> = entry.name.encode_utf16().collect();
            units.push(0);
            let slots = units.len().div_ceil(LONG_NAME_CHARS_PER_ENTRY);
            units.resize(slots * LONG_NAME_CHARS_PER_ENTRY, 0xFFFF);
            let checksum = short_filename_checksum(&name);
            for slot in (1..=slots).rev() {
                let fragment = &units[(slot - 1) * LONG_NAME_CHARS_PER_ENTRY..];
                let mut record = LongNameRecord {
                    ordinal: slot as u8 | if slot == slots { LAST_LONG_ENTRY } else { 0 },
                    name1: [U16::ZERO; 5],
                    attr: ATTR_LONG_NAME,
                    kind: 0,
                    checksum,
                    name2: [U16::ZERO; 6],
                    first_cluster_low: U16::ZERO,
                    name3: [U16::ZERO; 2],
                };
                for i in 0..5 {
                    record.name1[i] = U16::new(fragment[i]);
                }
                for i in 0..6 {
                    record.name2[i] = U16::new(fragment[5 + i]);
                }
                for i in 0..2 {
                    record.name3[i] = U16::new(fragment[11 + i]);
                }
                out.extend_from_slice(record.as_bytes());
            }
        }

        if entry.empty {
            name[0] = 0xE5;
        } else if name[0] == 0xE5 {
            name[0] = 0x05;
        }
        let (write_date, write_time) = match entry.created {
            Some(created) => {
                let (date, time) = encode_datetime(created);
                (U16::new(date), U16::new(time))
            }
            None => (U16::ZERO, U16::ZERO),
        };
        let record = RawDirRecord {
            name,
            attr: entry.attrs | if entry.is_directory { ATTR_DIRECTORY } else { 0 },
            nt_reserved: 0,
            creation_time_tenth: 0,
            creation_time: U16::ZERO,
            creation_date: U16::ZERO,
            last_access_date: U16::ZERO,
            first_cluster_high: U16::new((entry.first_cluster >> 16) as u16),
            write_time,
            write_date,
            first_cluster_low: U16::new(entry.first_cluster as u16),
            file_size: U32::new(entry.length as u32),
        };
        out.extend_from_slice(record.as_bytes());
        Ok(())
    }

    /// Writes a serialized directory back: cluster-chain directories go
    /// through the chain writer (growing it if needed), the fixed FAT12/16
    /// root region rejects growth past `root_directory_entries`.
    pub fn save_dir_stream(&mut self, mut stream: Vec<u8>) -> Result<()> {
        if self.cur_dir_cluster != 0 {
            stream.extend_from_slice(&[0; DIR_ENTRY_SIZE]);
            let length = stream.len() as u64;
            let cluster = self.cur_dir_cluster;
            self.save_stream_contents(&mut &stream[..], length, cluster)?;
        } else {
            let capacity = self.root_directory_entries as usize * DIR_ENTRY_SIZE;
            if stream.len() > capacity {
                return Err(Error::NoSpaceOnDevice);
            }
            let offset = self.first_root_dir_sector() * self.bytes_per_sector as u64;
            if stream.len() + DIR_ENTRY_SIZE <= capacity {
                stream.extend_from_slice(&[0; DIR_ENTRY_SIZE]);
            }
            self.ds.write(offset, &stream)?;
        }
        Ok(())
    }

    fn save_dir_entries(&mut self, entries: &[DirEntry]) -> Result<()> {
        let mut stream = Vec::new();
        for entry in entries {
            self.serialize_entry(&mut stream, entry)?;
        }
        self.save_dir_stream(stream)
    }

    /// Patches length and first-cluster words of the 32-byte record at
    /// `entry_offset` in place.
    pub fn patch_entry(&mut self, entry_offset: u64, length: u32, first_cluster: u32) -> Result<()> {
        self.ds.write(entry_offset + 28, &length.to_le_bytes())?;
        self.ds
            .write(entry_offset + 26, &(first_cluster as u16).to_le_bytes())?;
        if self.kind == FatKind::Fat32 {
            self.ds
                .write(entry_offset + 20, &((first_cluster >> 16) as u16).to_le_bytes())?;
        }
        Ok(())
    }

    /// Marks the record deleted, zeroes its cluster words and releases the
    /// chain; rewrites the FAT copies.
    pub fn remove_entry(&mut self, entry_offset: u64, first_cluster: u32) -> Result<()> {
        let mut cluster = first_cluster;
        while cluster >= 2 && cluster < self.min_final_cluster {
            let next = self.next_in_chain(cluster)?;
            self.fat[cluster as usize] = 0;
            cluster = next;
        }

        self.ds.write(entry_offset, &[0xE5])?;
        self.ds.write(entry_offset + 20, &[0, 0])?;
        self.ds.write(entry_offset + 26, &[0, 0])?;
        self.save_fats()
    }

    /// Copies a cluster chain out, failing `DiskCorrupt` on a chain that
    /// ends before `length` bytes or runs past them.
    pub fn copy_chain_to(&mut self, entry: &DirEntry, output: &mut dyn Write) -> Result<()> {
        let mut cluster = entry.first_cluster as u32;
        if cluster == 0 {
            return Ok(());
        }
        let bytes_per_cluster = self.bytes_per_cluster() as usize;
        let mut buffer = vec![0; bytes_per_cluster];
        let mut remaining = entry.length as i64;
        while remaining > 0 {
            if cluster < 2 || cluster >= self.min_final_cluster {
                error!("Cluster chain ends before the file does");
                return Err(Error::DiskCorrupt);
            }
            self.ds.read(self.data_offset(cluster), &mut buffer)?;
            output.write_all(&buffer[..(remaining as usize).min(bytes_per_cluster)])?;
            cluster = self.next_in_chain(cluster)?;
            remaining -= bytes_per_cluster as i64;
        }
        if cluster < self.min_final_cluster {
            error!("Cluster chain does not terminate at the file length");
            return Err(Error::DiskCorrupt);
        }
        Ok(())
    }

    pub fn free_space_bytes(&self) -> u64 {
        let limit = self.fat.len().min(self.cluster_count as usize + 2);
        let free = self.fat[2.min(self.fat.len())..limit]
            .iter()
            .filter(|&&entry| entry == 0)
            .count();
        free as u64 * self.bytes_per_cluster() as u64
    }

    fn modify_file_impl(
        &mut self,
        name: &str,
        length: u64,
        input: &mut dyn Read,
        created: Option<NaiveDateTime>,
    ) -> Result<()> {
        self.ensure_write_mode();
        if let Some(position) = find_position(&self.files, name, false) {
            if self.files[position].is_directory {
                return Err(Error::IsADirectory);
            }
            let first_cluster = self.files[position].first_cluster as u32;
            let entry_offset = self.files[position].entry_offset.ok_or(Error::DiskCorrupt)?;
            let new_first = self.save_stream_contents(input, length, first_cluster)?;
            self.patch_entry(entry_offset, length as u32, new_first)?;
        } else {
            let mut entry = DirEntry {
                created: Some(created.unwrap_or_else(now)),
                name: name.to_uppercase(),
                length,
                ..DirEntry::default()
            };
            entry.first_cluster = self.save_stream_contents(input, length, 0)? as u64;
            let mut entries = self.dir_entries(self.cur_dir_cluster, true)?;
            add_to_dir_entries(&mut entries, entry);
            self.save_dir_entries(&entries)?;
        }
        self.save_fats()?;
        self.load_cur_dir()
    }
}

impl<DS: DataStorage> Volume for FatVolume<DS> {
    fn files(&self) -> &[DirEntry] {
        &self.files
    }

    fn current_dir_name(&self) -> &str {
        &self.cur_dir_name
    }

    fn max_name_length(&self) -> usize {
        255
    }

    fn free_space(&mut self) -> Result<u64> {
        Ok(self.free_space_bytes())
    }

    fn change_directory(&mut self, name: &str) -> Result<()> {
        match name {
            "/" => {
                self.cur_dir_cluster = self.root_cluster;
                self.cur_dir_name = "/".into();
            }
            ".." => {
                if self.cur_dir_cluster != self.root_cluster {
                    let parent = self
                        .dir_entries(self.cur_dir_cluster, true)?
                        .into_iter()
                        .find(|entry| entry.name == "..");
                    match parent {
                        // A dot-dot cluster of 0 refers to the root on every
                        // FAT kind.
                        Some(entry) if entry.first_cluster != 0 => {
                            self.cur_dir_cluster = entry.first_cluster as u32
                        }
                        _ => self.cur_dir_cluster = self.root_cluster,
                    }
                    self.cur_dir_name = if self.cur_dir_cluster == self.root_cluster {
                        "/".into()
                    } else {
                        "..".into()
                    };
                }
            }
            _ => {
                let entry = self.get_entry(name)?;
                if !entry.is_directory {
                    return Err(Error::InvalidArgument);
                }
                let first_cluster = entry.first_cluster as u32;
                self.cur_dir_cluster = first_cluster;
                self.cur_dir_name = name.into();
            }
        }
        self.load_cur_dir()
    }

    fn copy_file_to(
        &mut self,
        name: &str,
        output: &mut dyn Write,
        _callback: &mut dyn VolumeCallback,
    ) -> Result<()> {
        let entry = self.get_entry(name)?.clone();
        self.copy_chain_to(&entry, output)
    }

    fn add_file(
        &mut self,
        name: &str,
        length: u64,
        input: &mut dyn Read,
        created: Option<NaiveDateTime>,
    ) -> Result<()> {
        if find_position(&self.files, name, false).is_some() {
            return Err(Error::FileExists);
        }
        self.modify_file_impl(name, length, input, created)
    }

    fn modify_file(
        &mut self,
        name: &str,
        length: u64,
        input: &mut dyn Read,
        created: Option<NaiveDateTime>,
    ) -> Result<()> {
        self.modify_file_impl(name, length, input, created)
    }

    fn remove_file(&mut self, name: &str) -> Result<()> {
        self.ensure_write_mode();
        let entry = self.get_entry(name)?.clone();
        if entry.is_directory
            && !self.dir_entries(entry.first_cluster as u32, false)?.is_empty()
        {
            return Err(Error::DirectoryNotEmpty);
        }
        let entry_offset = entry.entry_offset.ok_or(Error::DiskCorrupt)?;
        self.remove_entry(entry_offset, entry.first_cluster as u32)?;
        self.load_cur_dir()
    }

    fn make_directory(&mut self, name: &str) -> Result<()> {
        self.ensure_write_mode();
        if find_position(&self.files, name, false).is_some() {
            return Err(Error::FileExists);
        }
        let entry = DirEntry {
            created: Some(now()),
            is_directory: true,
            name: name.into(),
            ..DirEntry::default()
        };
        let mut entries = self.dir_entries(self.cur_dir_cluster, true)?;
        add_to_dir_entries(&mut entries, entry);
        self.save_dir_entries(&entries)?;
        self.load_cur_dir()
    }

    fn flush(&mut self) -> Result<()> {
        self.ds.flush()
    }
}

/// Weighted signature check over the boot sector: plausible jump opcode,
/// media byte, 0xAA55 signature and the informational FAT string. A sector
/// size outside {512, 1024, 2048, 4096} rejects outright.
pub fn probe(prefix: &[u8]) -> u32 {
    if prefix.len() < 512 {
        return 0;
    }
    let mut weight = 0;
    if (prefix[0] == 0xEB && prefix[2] == 0x90) || prefix[0] == 0xE9 {
        weight += 1;
    }
    let sector_size = u16::from_le_bytes([prefix[11], prefix[12]]);
    if !matches!(sector_size, 512 | 1024 | 2048 | 4096) {
        return 0;
    }
    if prefix[0x15] >= 0xF0 {
        weight += 1;
    }
    if u16::from_le_bytes([prefix[510], prefix[511]]) == 0xAA55 {
        weight += 2;
    }
    if matches!(&prefix[0x36..0x3E], b"FAT12   " | b"FAT16   " | b"FAT32   ") {
        weight += 3;
    }
    if weight >= 3 {
        weight
    } else {
        0
    }
}

pub fn factory<DS: DataStorage + 'static>() -> VolumeFactory<DS> {
    VolumeFactory {
        name: "fat",
        probe,
        open: |ds| Ok(Box::new(FatVolume::new(ds)?)),
    }
}
