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

//! MK-DOS: a flat table of 24-byte entries at byte offset 0o500, at most
//! 172 of them. A directory is an entry whose name starts with 0x7F; ids
//! are positional (n-th directory in table order). Volume metadata words at
//! 0o30 hold the live entry count and the used-sector total.

use std::io::{Read, Write};

use chrono::NaiveDateTime;

use dskview_ds::DataStorage;
use dskview_fs::{
    add_to_dir_entries, find_position, text::TextEncoding, DirEntry, DriverData, Error, Result,
    Volume, VolumeCallback, VolumeFactory,
};

use crate::{
    allocate_dir_id, emit_bin_header, find_contiguous_gap, resolve_change_directory,
    strip_bin_header, take_input, DirPosition,
};

const SECTOR_SIZE: usize = 512;
const DIR_OFFSET: u64 = 0o500;
const ENTRY_SIZE: usize = 24;
const MAX_DIR_ENTRIES: usize = 172;
const ROOT_DIR_ID: u8 = 0;
const MAX_DIR_ID: u8 = 0xC8;
/// First byte of a directory's name field.
const DIR_NAME_MARK: u8 = 0x7F;

const STATUS_NORMAL: u8 = 0;
const STATUS_READ_ONLY: u8 = 1;
const STATUS_LOGICAL_DISK: u8 = 2;
const STATUS_BAD: u8 = 0x80;
const STATUS_DELETED: u8 = 0xFF;

pub struct MkdosVolume<DS: DataStorage> {
    ds: DS,
    files: Vec<DirEntry>,
    position: DirPosition,

    dir_entry_count: u16,
    total_used_sectors: u16,
    total_sectors: u16,
    first_data_sector: u16,
}

impl<DS: DataStorage> MkdosVolume<DS> {
    pub fn new(ds: DS) -> Result<Self> {
        let mut header = [0; SECTOR_SIZE];
        ds.read(0, &mut header)?;
        let word = |offset: usize| u16::from_le_bytes([header[offset], header[offset + 1]]);
        let mut volume = Self {
            ds,
            files: Vec::new(),
            position: DirPosition::root(ROOT_DIR_ID),
            dir_entry_count: word(0o30),
            total_used_sectors: word(0o32),
            total_sectors: word(0o466),
            first_data_sector: word(0o470),
        };
        volume.reload()?;
        Ok(volume)
    }

    fn dir_entries(&self, dir_id: u8, with_extra: bool) -> Result<Vec<DirEntry>> {
        let mut table = vec![0; MAX_DIR_ENTRIES * ENTRY_SIZE];
        self.ds.read(DIR_OFFSET, &mut table)?;
        let mut entries = Vec::new();
        let mut next_dir_id = 0u8;
        let mut live = 0u16;
        for i in 0..MAX_DIR_ENTRIES {
            if live >= self.dir_entry_count {
                break;
            }
            let record = &table[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE];
            let status = record[0];
            let is_directory = record[2] == DIR_NAME_MARK;
            // Directory ids are positional: the n-th directory mark in the
            // table is directory n.
            let own_id = if is_directory {
                next_dir_id = next_dir_id.wrapping_add(1);
                next_dir_id
            } else {
                0
            };
            match status {
                STATUS_DELETED => continue,
                STATUS_LOGICAL_DISK | STATUS_BAD => {
                    live += 1;
                    continue;
                }
                _ => {}
            }
            live += 1;
            let parent_id = record[1];
            if parent_id != dir_id && !with_extra {
                continue;
            }
            let word =
                |offset: usize| u16::from_le_bytes([record[offset], record[offset + 1]]);
            let mut entry = DirEntry {
                is_directory,
                read_only: status == STATUS_READ_ONLY,
                raw_name: record[2..16].to_vec(),
                entry_offset: Some(DIR_OFFSET + (i * ENTRY_SIZE) as u64),
                first_cluster: word(16) as u64,
                allocation_size: word(18) as u64 * SECTOR_SIZE as u64,
                driver: DriverData::Bk {
                    dir_id: own_id,
                    parent_id,
                    load_addr: word(20),
                },
                ..DirEntry::default()
            };
            let name_bytes = if is_directory {
                &record[3..16]
            } else {
                &record[2..16]
            };
            entry.name = TextEncoding::Koi8.decode_trimmed(name_bytes);
            entry.length = if entry.allocation_size != 0 {
                (entry.allocation_size - SECTOR_SIZE as u64) | word(22) as u64
            } else {
                0
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    fn reload(&mut self) -> Result<()> {
        self.files = self.dir_entries(self.position.cur_id, false)?;
        Ok(())
    }

    fn serialize_entry(&self, out: &mut Vec<u8>, entry: &DirEntry) -> Result<()> {
        let mut record = [0u8; ENTRY_SIZE];
        if entry.empty {
            record[0] = STATUS_DELETED;
            out.extend_from_slice(&record);
            return Ok(());
        }
        let (_, parent_id, load_addr) = entry.bk().unwrap_or((0, 0, 0));
        record[0] = if entry.read_only {
            STATUS_READ_ONLY
        } else {
            STATUS_NORMAL
        };
        record[1] = parent_id;
        let decoded_raw = if entry.raw_name.len() == 14 {
            let bytes = if entry.is_directory {
                &entry.raw_name[1..]
            } else {
                &entry.raw_name[..]
            };
            TextEncoding::Koi8.decode_trimmed(bytes) == entry.name
        } else {
            false
        };
        if decoded_raw {
            record[2..16].copy_from_slice(&entry.raw_name);
        } else if entry.is_directory {
            record[2] = DIR_NAME_MARK;
            let name = TextEncoding::Koi8.encode(&entry.name)?;
            let n = name.len().min(13);
            record[3..3 + n].copy_from_slice(&name[..n]);
        } else {
            let name = TextEncoding::Koi8.encode(&entry.name)?;
            let n = name.len().min(14);
            record[2..2 + n].copy_from_slice(&name[..n]);
        }
        if !entry.is_directory {
            let sectors = entry.length.div_ceil(SECTOR_SIZE as u64) as u16;
            record[16..18].copy_from_slice(&(entry.first_cluster as u16).to_le_bytes());
            record[18..20].copy_from_slice(&sectors.to_le_bytes());
            record[20..22].copy_from_slice(&load_addr.to_le_bytes());
            record[22..24].copy_from_slice(&(entry.length as u16).to_le_bytes());
        }
        out.extend_from_slice(&record);
        Ok(())
    }

    fn write_metadata(&mut self, entry_count: u16, used_sectors: u16) -> Result<()> {
        let mut words = [0u8; 4];
        words[..2].copy_from_slice(&entry_count.to_le_bytes());
        words[2..].copy_from_slice(&used_sectors.to_le_bytes());
        self.ds.write(0o30, &words)?;
        self.dir_entry_count = entry_count;
        self.total_used_sectors = used_sectors;
        Ok(())
    }

    fn save_dir_entries(&mut self, entries: &[DirEntry]) -> Result<()> {
        if entries.len() > MAX_DIR_ENTRIES {
            return Err(Error::NoSpaceOnDevice);
        }
        let mut stream = Vec::with_capacity(entries.len() * ENTRY_SIZE);
        for entry in entries {
            self.serialize_entry(&mut stream, entry)?;
        }
        stream.resize(MAX_DIR_ENTRIES * ENTRY_SIZE, 0);
        self.ds.write(DIR_OFFSET, &stream)?;
        let used = entries
            .iter()
            .filter(|entry| !entry.empty)
            .map(|entry| entry.length.div_ceil(SECTOR_SIZE as u64) as u16)
            .sum();
        self.write_metadata(entries.len() as u16, used)
    }

    fn modify_file_impl(
        &mut self,
        name: &str,
        length: u64,
        input: &mut dyn Read,
        _created: Option<NaiveDateTime>,
    ) -> Result<()> {
        self.ds.make_writable();
        let mut data = take_input(input, length)?;
        let load_addr = strip_bin_header(&mut data);

        let mut entries = self.dir_entries(ROOT_DIR_ID, true)?;
        if let Some(position) = entries.iter().position(|entry| {
            entry.name.eq_ignore_ascii_case(name) && entry.bk().map(|(_, p, _)| p) == Some(self.position.cur_id)
        }) {
            if entries[position].is_directory {
                return Err(Error::IsADirectory);
            }
            entries.remove(position);
        }

        let sectors = data.len().div_ceil(SECTOR_SIZE) as u64;
        let first_sector = if sectors > 0 {
            find_contiguous_gap(
                &entries,
                self.first_data_sector as u64,
                self.total_sectors as u64,
                sectors,
            )?
            .ok_or(Error::NoSpaceOnDevice)?
        } else {
            0
        };
        if !data.is_empty() {
            self.ds.write(first_sector * SECTOR_SIZE as u64, &data)?;
        }

        let entry = DirEntry {
            name: name.into(),
            length: data.len() as u64,
            allocation_size: sectors * SECTOR_SIZE as u64,
            first_cluster: first_sector,
            driver: DriverData::Bk {
                dir_id: 0,
                parent_id: self.position.cur_id,
                load_addr,
            },
            ..DirEntry::default()
        };
        add_to_dir_entries(&mut entries, entry);
        self.save_dir_entries(&entries)?;
        self.reload()
    }
}

impl<DS: DataStorage> Volume for MkdosVolume<DS> {
    fn files(&self) -> &[DirEntry] {
        &self.files
    }

    fn current_dir_name(&self) -> &str {
        &self.position.name
    }

    fn max_name_length(&self) -> usize {
        14
    }

    fn free_space(&mut self) -> Result<u64> {
        Ok((self.total_sectors - self.total_used_sectors) as u64 * SECTOR_SIZE as u64)
    }

    fn change_directory(&mut self, name: &str) -> Result<()> {
        let all = self.dir_entries(ROOT_DIR_ID, true)?;
        self.position =
            resolve_change_directory(name, ROOT_DIR_ID, &self.position, &all, &self.files)?;
        self.reload()
    }

    fn copy_file_to(
        &mut self,
        name: &str,
        output: &mut dyn Write,
        callback: &mut dyn VolumeCallback,
    ) -> Result<()> {
        let entry = self.get_entry(name)?.clone();
        emit_bin_header(&entry, output, callback)?;
        let mut remaining = entry.length;
        let mut offset = entry.first_cluster * SECTOR_SIZE as u64;
        let mut buffer = [0; SECTOR_SIZE];
        while remaining > 0 {
            let chunk = (remaining as usize).min(SECTOR_SIZE);
            self.ds.read(offset, &mut buffer[..chunk])?;
            output.write_all(&buffer[..chunk])?;
            offset += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(())
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
        self.ds.make_writable();
        let entry = self.get_entry(name)?.clone();
        if entry.is_directory {
            let (dir_id, _, _) = entry.bk().ok_or(Error::DiskCorrupt)?;
            if !self.dir_entries(dir_id, false)?.is_empty() {
                return Err(Error::DirectoryNotEmpty);
            }
        }
        let offset = entry.entry_offset.ok_or(Error::DiskCorrupt)?;
        self.ds.write(offset, &[STATUS_DELETED])?;
        let used = self
            .total_used_sectors
            .saturating_sub(entry.length.div_ceil(SECTOR_SIZE as u64) as u16);
        self.write_metadata(self.dir_entry_count.saturating_sub(1), used)?;
        self.reload()
    }

    fn make_directory(&mut self, name: &str) -> Result<()> {
        self.ds.make_writable();
        if find_position(&self.files, name, false).is_some() {
            return Err(Error::FileExists);
        }
        let mut entries = self.dir_entries(ROOT_DIR_ID, true)?;
        let dir_id = allocate_dir_id(&entries, 2..=MAX_DIR_ID - 1)?;
        let entry = DirEntry {
            name: name.into(),
            is_directory: true,
            driver: DriverData::Bk {
                dir_id,
                parent_id: self.position.cur_id,
                load_addr: 0,
            },
            ..DirEntry::default()
        };
        add_to_dir_entries(&mut entries, entry);
        self.save_dir_entries(&entries)?;
        self.reload()
    }

    fn flush(&mut self) -> Result<()> {
        self.ds.flush()
    }
}

/// MicroDOS/MK-DOS signature words at 0o400.
pub fn probe(prefix: &[u8]) -> u32 {
    if prefix.len() < 1024 {
        return 0;
    }
    let word = |offset: usize| u16::from_le_bytes([prefix[offset], prefix[offset + 1]]);
    if word(0o400) != 0o123456 || word(0o402) != 0o51414 {
        return 0;
    }
    let mut weight = 2;
    if word(0) == 0o240 {
        weight += 1;
    }
    weight
}

pub fn factory<DS: DataStorage + 'static>() -> VolumeFactory<DS> {
    VolumeFactory {
        name: "mkdos",
        probe,
        open: |ds| Ok(Box::new(MkdosVolume::new(ds)?)),
    }
}
