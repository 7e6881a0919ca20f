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

//! ANDOS keeps a FAT12 volume on disk and builds its directory tree on top
//! of the root directory: every 32-byte record reuses the FAT32-only bytes
//! 20/21 for the entry's own and parent directory ids and the write-time
//! word at 22 for the load address; directories carry the volume-label
//! attribute. All storage management is delegated to the FAT driver.

use std::io::{Read, Write};

use chrono::NaiveDateTime;

use dskview_ds::DataStorage;
use dskview_fs::{
    add_to_dir_entries, find_position, text::TextEncoding, DirEntry, DriverData, Error, Result,
    Volume, VolumeCallback, VolumeFactory,
};
use dskview_fs_fat::{self as fat, FatVolume};

use crate::{
    allocate_dir_id, emit_bin_header, resolve_change_directory, strip_bin_header, take_input,
    DirPosition,
};

const ROOT_DIR_ID: u8 = 0;
/// Directories are marked with the FAT volume-label attribute bit.
const DIR_ATTR: u8 = 0x08;

pub struct AndosVolume<DS: DataStorage> {
    fat: FatVolume<DS>,
    files: Vec<DirEntry>,
    position: DirPosition,
}

impl<DS: DataStorage> AndosVolume<DS> {
    pub fn new(ds: DS) -> Result<Self> {
        let mut volume = Self {
            fat: FatVolume::open(ds, TextEncoding::Koi8)?,
            files: Vec::new(),
            position: DirPosition::root(ROOT_DIR_ID),
        };
        volume.reload()?;
        Ok(volume)
    }

    /// All entries live in the FAT root directory; the id fields express
    /// the hierarchy.
    fn dir_entries(&self, dir_id: u8, with_extra: bool) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for raw_entry in self.fat.raw_dir_entries(0, with_extra)? {
            let fat::RawDirEntry { mut entry, raw } = raw_entry;
            entry.is_volume_label = false;
            entry.is_directory = raw[20] != 0;
            entry.created = fat::decode_date(u16::from_le_bytes([raw[24], raw[25]]))
                .and_then(|date| date.and_hms_opt(0, 0, 0));
            entry.driver = DriverData::Bk {
                dir_id: raw[20],
                parent_id: raw[21],
                load_addr: u16::from_le_bytes([raw[22], raw[23]]),
            };
            let (_, parent_id, _) = entry.bk().unwrap();
            if with_extra || parent_id == dir_id {
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
        self.fat.serialize_entry(out, entry)?;
        let record_start = out.len() - fat::DIR_ENTRY_SIZE;
        let record = &mut out[record_start..];
        if let DriverData::Bk {
            dir_id,
            parent_id,
            load_addr,
        } = entry.driver
        {
            record[20] = dir_id;
            record[21] = parent_id;
            record[22..24].copy_from_slice(&load_addr.to_le_bytes());
        }
        if entry.is_directory {
            record[11] = DIR_ATTR;
        }
        Ok(())
    }

    fn save_entries(&mut self, entries: &[DirEntry]) -> Result<()> {
        let mut stream = Vec::with_capacity(entries.len() * fat::DIR_ENTRY_SIZE);
        for entry in entries {
            self.serialize_entry(&mut stream, entry)?;
        }
        self.fat.save_dir_stream(stream)
    }
}

impl<DS: DataStorage> Volume for AndosVolume<DS> {
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
        Ok(self.fat.free_space_bytes())
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
        self.fat.copy_chain_to(&entry, output)
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
        self.modify_file(name, length, input, created)
    }

    fn modify_file(
        &mut self,
        name: &str,
        length: u64,
        input: &mut dyn Read,
        created: Option<NaiveDateTime>,
    ) -> Result<()> {
        self.fat.ensure_write_mode();
        let mut data = take_input(input, length)?;
        let load_addr = strip_bin_header(&mut data);
        let length = data.len() as u64;

        if let Some(position) = find_position(&self.files, name, false) {
            let entry = self.files[position].clone();
            if entry.is_directory {
                return Err(Error::IsADirectory);
            }
            let first = self
                .fat
                .save_stream_contents(&mut &data[..], length, entry.first_cluster as u32)?;
            let offset = entry.entry_offset.ok_or(Error::DiskCorrupt)?;
            self.fat.patch_entry(offset, length as u32, first)?;
        } else {
            let first = self.fat.save_stream_contents(&mut &data[..], length, 0)?;
            let entry = DirEntry {
                name: name.to_uppercase(),
                length,
                first_cluster: first as u64,
                created: created.or_else(|| Some(chrono::Local::now().naive_local())),
                driver: DriverData::Bk {
                    dir_id: 0,
                    parent_id: self.position.cur_id,
                    load_addr,
                },
                ..DirEntry::default()
            };
            let mut entries = self.dir_entries(ROOT_DIR_ID, true)?;
            add_to_dir_entries(&mut entries, entry);
            self.save_entries(&entries)?;
        }
        self.fat.save_fats()?;
        self.reload()
    }

    fn remove_file(&mut self, name: &str) -> Result<()> {
        self.fat.ensure_write_mode();
        let entry = self.get_entry(name)?.clone();
        if entry.is_directory {
            let (dir_id, _, _) = entry.bk().ok_or(Error::DiskCorrupt)?;
            if !self.dir_entries(dir_id, false)?.is_empty() {
                return Err(Error::DirectoryNotEmpty);
            }
        }
        let offset = entry.entry_offset.ok_or(Error::DiskCorrupt)?;
        self.fat.remove_entry(offset, entry.first_cluster as u32)?;
        self.reload()
    }

    fn make_directory(&mut self, name: &str) -> Result<()> {
        self.fat.ensure_write_mode();
        if find_position(&self.files, name, false).is_some() {
            return Err(Error::FileExists);
        }
        let mut entries = self.dir_entries(ROOT_DIR_ID, true)?;
        let dir_id = allocate_dir_id(&entries, 1..=255)?;
        let entry = DirEntry {
            name: name.into(),
            is_directory: true,
            created: Some(chrono::Local::now().naive_local()),
            driver: DriverData::Bk {
                dir_id,
                parent_id: self.position.cur_id,
                load_addr: 0,
            },
            ..DirEntry::default()
        };
        add_to_dir_entries(&mut entries, entry);
        self.save_entries(&entries)?;
        self.reload()
    }

    fn flush(&mut self) -> Result<()> {
        Volume::flush(&mut self.fat)
    }
}

/// An ANDOS volume is a FAT volume whose OEM name field says so.
pub fn probe(prefix: &[u8]) -> u32 {
    let weight = fat::probe(prefix);
    if weight == 0 {
        return 0;
    }
    if prefix.len() >= 11 && &prefix[4..11] == b"ANDOS  " {
        weight + 2
    } else {
        0
    }
}

pub fn factory<DS: DataStorage + 'static>() -> VolumeFactory<DS> {
    VolumeFactory {
        name: "andos",
        probe,
        open: |ds| Ok(Box::new(AndosVolume::new(ds)?)),
    }
}
