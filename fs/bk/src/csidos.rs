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

//! CSI-DOS: the directory spans sectors 2..=9. Each sector carries its own
//! sector number in byte 0 as an integrity check and 11 reserved bytes,
//! then 20-byte entries. The status byte doubles as the parent directory
//! id; values from 0xC9 up are markers (bad, deleted, empty), 0 ends the
//! directory.

use std::io::{Read, Write};

use chrono::NaiveDateTime;
use log::warn;

use dskview_ds::DataStorage;
use dskview_fs::{
    add_to_dir_entries, find_position,
    text::{split_name, TextEncoding},
    DirEntry, DriverData, Error, Result, Volume, VolumeCallback, VolumeFactory,
};

use crate::{
    allocate_dir_id, emit_bin_header, find_contiguous_gap, resolve_change_directory,
    strip_bin_header, take_input, DirPosition,
};

const SECTOR_SIZE: usize = 512;
const ENTRY_SIZE: usize = 20;
const FIRST_DIR_SECTOR: u32 = 2;
const LAST_DIR_SECTOR: u32 = 9;
const ENTRIES_PER_SECTOR: usize = (SECTOR_SIZE - 12) / ENTRY_SIZE;
/// Eight sectors of 500 payload bytes, minus room for the end marker.
pub const MAX_DIR_ENTRIES: usize = 8 * (500 / ENTRY_SIZE) - 1;
const ROOT_DIR_ID: u8 = 1;
const MAX_DIR_ID: u8 = 0xC8;
const FIRST_DATA_SECTOR: u64 = 10;

const STATUS_END: u8 = 0;
const STATUS_BAD: u8 = 0xC9;
const STATUS_DELETED_DIR: u8 = 0xCA;
const STATUS_EMPTY: u8 = 0xFE;
const STATUS_DELETED: u8 = 0xFF;

pub struct CsidosVolume<DS: DataStorage> {
    ds: DS,
    files: Vec<DirEntry>,
    position: DirPosition,
    total_sectors: u16,
}

impl<DS: DataStorage> CsidosVolume<DS> {
    pub fn new(ds: DS) -> Result<Self> {
        let mut info = [0; SECTOR_SIZE];
        ds.read(FIRST_DIR_SECTOR as u64 * SECTOR_SIZE as u64, &mut info)?;
        let mut volume = Self {
            ds,
            files: Vec::new(),
            position: DirPosition::root(ROOT_DIR_ID),
            total_sectors: u16::from_le_bytes([info[2], info[3]]),
        };
        volume.reload()?;
        Ok(volume)
    }

    fn dir_entries(&self, dir_id: u8, with_extra: bool) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut sector_data = [0; SECTOR_SIZE];
        'sectors: for sector in FIRST_DIR_SECTOR..=LAST_DIR_SECTOR {
            self.ds
                .read(sector as u64 * SECTOR_SIZE as u64, &mut sector_data)?;
            if sector_data[0] != sector as u8 {
                warn!("Directory sector {sector} carries a wrong index byte");
                continue;
            }
            for i in 0..ENTRIES_PER_SECTOR {
                let record = &sector_data[12 + i * ENTRY_SIZE..12 + (i + 1) * ENTRY_SIZE];
                let status = record[0];
                if status == STATUS_END {
                    break 'sectors;
                }
                if status >= STATUS_BAD {
                    continue;
                }
                if status != dir_id && !with_extra {
                    continue;
                }
                let word =
                    |offset: usize| u16::from_le_bytes([record[offset], record[offset + 1]]);
                let mut entry = DirEntry {
                    read_only: record[1] & 0x80 != 0,
                    is_directory: record[10] == 0,
                    raw_name: record[2..13].to_vec(),
                    entry_offset: Some(
                        sector as u64 * SECTOR_SIZE as u64 + (12 + i * ENTRY_SIZE) as u64,
                    ),
                    driver: DriverData::Bk {
                        dir_id: record[13],
                        parent_id: status,
                        load_addr: word(16),
                    },
                    ..DirEntry::default()
                };
                entry.name = TextEncoding::Koi8.decode_trimmed(&record[2..10]);
                if entry.is_directory {
                    entry.first_cluster = record[13] as u64;
                } else {
                    let ext = TextEncoding::Koi8.decode_trimmed(&record[10..13]);
                    if !ext.is_empty() {
                        entry.name = format!("{}.{ext}", entry.name);
                    }
                    entry.length = word(18) as u64;
                    if entry.length != 0 {
                        entry.allocation_size = (entry.length | 511) + 1;
                    }
                    entry.first_cluster = word(14) as u64;
                }
                entries.push(entry);
            }
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
            record[0] = STATUS_EMPTY;
            out.extend_from_slice(&record);
            return Ok(());
        }
        let (dir_id, parent_id, load_addr) = entry.bk().unwrap_or((0, ROOT_DIR_ID, 0));
        record[0] = parent_id;
        record[1] = if entry.read_only { 0xFF } else { 0 };
        let decoded_raw = if entry.raw_name.len() == 11 {
            let mut name = TextEncoding::Koi8.decode_trimmed(&entry.raw_name[..8]);
            if !entry.is_directory {
                let ext = TextEncoding::Koi8.decode_trimmed(&entry.raw_name[8..]);
                if !ext.is_empty() {
                    name = format!("{name}.{ext}");
                }
            }
            name == entry.name
        } else {
            false
        };
        if decoded_raw {
            record[2..13].copy_from_slice(&entry.raw_name);
        } else if entry.is_directory {
            let name = TextEncoding::Koi8.encode_padded(&entry.name, 8)?;
            record[2..10].copy_from_slice(&name);
        } else {
            let (base, ext) = split_name(&entry.name);
            let base = TextEncoding::Koi8.encode_padded(base, 8)?;
            let ext = TextEncoding::Koi8.encode_padded(if ext.is_empty() { " " } else { ext }, 3)?;
            record[2..10].copy_from_slice(&base);
            record[10..13].copy_from_slice(&ext);
        }
        record[13] = dir_id;
        if !entry.is_directory {
            record[14..16].copy_from_slice(&(entry.first_cluster as u16).to_le_bytes());
            record[16..18].copy_from_slice(&load_addr.to_le_bytes());
            record[18..20].copy_from_slice(&(entry.length as u16).to_le_bytes());
        }
        out.extend_from_slice(&record);
        Ok(())
    }

    fn save_dir_entries(&mut self, entries: &[DirEntry]) -> Result<()> {
        if entries.len() > MAX_DIR_ENTRIES {
            return Err(Error::NoSpaceOnDevice);
        }
        let mut stream = Vec::with_capacity(entries.len() * ENTRY_SIZE + 1);
        for entry in entries {
            self.serialize_entry(&mut stream, entry)?;
        }
        stream.push(STATUS_END);
        let payload = ENTRIES_PER_SECTOR * ENTRY_SIZE;
        for (i, chunk) in stream.chunks(payload).enumerate() {
            let mut sector_payload = vec![0; payload];
            sector_payload[..chunk.len()].copy_from_slice(chunk);
            self.ds.write(
                (FIRST_DIR_SECTOR as usize + i) as u64 * SECTOR_SIZE as u64 + 12,
                &sector_payload,
            )?;
        }
        Ok(())
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
        if data.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument);
        }

        let mut entries = self.dir_entries(ROOT_DIR_ID, true)?;
        if let Some(position) = entries.iter().position(|entry| {
            entry.name.eq_ignore_ascii_case(name)
                && entry.bk().map(|(_, parent, _)| parent) == Some(self.position.cur_id)
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
                FIRST_DATA_SECTOR,
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

impl<DS: DataStorage> Volume for CsidosVolume<DS> {
    fn files(&self) -> &[DirEntry] {
        &self.files
    }

    fn current_dir_name(&self) -> &str {
        &self.position.name
    }

    fn max_name_length(&self) -> usize {
        12
    }

    fn free_space(&mut self) -> Result<u64> {
        let used: u64 = self
            .dir_entries(ROOT_DIR_ID, true)?
            .iter()
            .filter(|entry| !entry.is_directory)
            .map(|entry| entry.length.div_ceil(SECTOR_SIZE as u64))
            .sum();
        Ok((self.total_sectors as u64).saturating_sub(used) * SECTOR_SIZE as u64)
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
        let mark = if entry.is_directory {
            let (dir_id, _, _) = entry.bk().ok_or(Error::DiskCorrupt)?;
            if !self.dir_entries(dir_id, false)?.is_empty() {
                return Err(Error::DirectoryNotEmpty);
            }
            STATUS_DELETED_DIR
        } else {
            STATUS_DELETED
        };
        let offset = entry.entry_offset.ok_or(Error::DiskCorrupt)?;
        self.ds.write(offset, &[mark])?;
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
            first_cluster: dir_id as u64,
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

/// The directory's own first sector index plus the CSI-DOS signature words.
pub fn probe(prefix: &[u8]) -> u32 {
    if prefix.len() < 1536 {
        return 0;
    }
    let word = |offset: usize| u16::from_le_bytes([prefix[offset], prefix[offset + 1]]);
    if word(0o2000) != 2 || word(0o2010) != 0o123123 {
        return 0;
    }
    let mut weight = 2;
    if word(0o2004) == 0o123123 && word(0o2006) == 0o123123 {
        weight += 3;
    }
    if word(0) == 0o240 {
        weight += 1;
    }
    weight
}

pub fn factory<DS: DataStorage + 'static>() -> VolumeFactory<DS> {
    VolumeFactory {
        name: "csidos",
        probe,
        open: |ds| Ok(Box::new(CsidosVolume::new(ds)?)),
    }
}
