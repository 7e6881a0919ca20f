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

use std::collections::HashMap;
use std::io::Write;

use log::debug;

use dskview_ds::DataStorage;
use dskview_fs::{DirEntry, Error, Result, Volume, VolumeCallback, VolumeFactory};

mod ods1;
mod ods2;

const SECTOR_SIZE: usize = 512;

/// File number 1 is the index file, 2 the storage bitmap, 3 the bad-block
/// file and 4 the MFD; none of them appear in listings.
pub const FILE_NUM_INDEX: u32 = 1;
pub const FILE_NUM_BITMAP: u32 = 2;
pub const FILE_NUM_BAD_BLOCKS: u32 = 3;
pub const FILE_NUM_MFD: u32 = 4;

fn is_system_file(file_number: u32) -> bool {
    (FILE_NUM_INDEX..=FILE_NUM_MFD).contains(&file_number)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructureLevel {
    Ods1,
    Ods2,
}

/// A Files-11 volume. The on-disk structure level decides home-block layout,
/// header format, timestamps and retrieval-pointer encoding; everything else
/// — the indexed header table keyed by file number, MFD traversal, the
/// directory stack — is common. Strictly read-only.
pub struct Files11Volume<DS: DataStorage> {
    ds: DS,
    level: StructureLevel,

    sectors_per_cluster: u16,
    bitmap_lba: u32,
    bitmap_sectors: u16,
    max_files: u32,

    all_entries: HashMap<u32, DirEntry>,
    cur_dir_fid: u32,
    cur_dir_name: String,
    cur_path: Vec<String>,
    cur_fid_path: Vec<u32>,
    files: Vec<DirEntry>,
}

/// Little-endian sum of the first 255 words must equal the word at 510.
fn header_checksum_ok(data: &[u8; SECTOR_SIZE]) -> bool {
    let mut sum = 0u16;
    for i in 0..255 {
        sum = sum.wrapping_add(u16::from_le_bytes([data[i * 2], data[i * 2 + 1]]));
    }
    sum == u16::from_le_bytes([data[510], data[511]])
}

impl<DS: DataStorage> Files11Volume<DS> {
    pub fn open(ds: DS, level: StructureLevel) -> Result<Self> {
        let mut volume = Self {
            ds,
            level,
            sectors_per_cluster: 1,
            bitmap_lba: 0,
            bitmap_sectors: 0,
            max_files: 0,
            all_entries: HashMap::new(),
            cur_dir_fid: FILE_NUM_MFD,
            cur_dir_name: "/".into(),
            cur_path: Vec::new(),
            cur_fid_path: Vec::new(),
            files: Vec::new(),
        };
        let home = volume.read_sector(1)?;
        match level {
            StructureLevel::Ods1 => ods1::load_home_block(&mut volume, &home)?,
            StructureLevel::Ods2 => ods2::load_home_block(&mut volume, &home)?,
        }
        match level {
            StructureLevel::Ods1 => ods1::load_all_entries(&mut volume)?,
            StructureLevel::Ods2 => ods2::load_all_entries(&mut volume)?,
        }
        volume.files = volume.dir_entries(FILE_NUM_MFD)?;
        Ok(volume)
    }

    pub fn level(&self) -> StructureLevel {
        self.level
    }

    fn read_sector(&self, lba: u32) -> Result<[u8; SECTOR_SIZE]> {
        let mut data = [0; SECTOR_SIZE];
        self.ds.read(lba as u64 * SECTOR_SIZE as u64, &mut data)?;
        Ok(data)
    }

    fn insert_entry(&mut self, file_number: u32, entry: DirEntry) -> Result<()> {
        if self.all_entries.insert(file_number, entry).is_some() {
            log::error!("Duplicate file header for file number {file_number}");
            return Err(Error::DiskCorrupt);
        }
        Ok(())
    }

    fn entry_by_fid(&self, file_number: u32) -> Result<&DirEntry> {
        self.all_entries
            .get(&file_number)
            .ok_or(Error::NoSuchFileOrDirectory)
    }

    /// Decodes the retrieval pointers of the file whose header lives at the
    /// entry's `first_cluster` into the ordered list of its sectors.
    fn file_sectors(&self, entry: &DirEntry) -> Result<Vec<u32>> {
        let header = self.read_sector(entry.first_cluster as u32)?;
        match self.level {
            StructureLevel::Ods1 => ods1::file_sectors(&header),
            StructureLevel::Ods2 => ods2::file_sectors(&header),
        }
    }

    fn copy_entry_to(&self, entry: &DirEntry, output: &mut dyn Write) -> Result<()> {
        for sector in self.file_sectors(entry)? {
            output.write_all(&self.read_sector(sector)?)?;
        }
        Ok(())
    }

    fn read_file_contents(&self, entry: &DirEntry) -> Result<Vec<u8>> {
        let mut contents = Vec::new();
        self.copy_entry_to(entry, &mut contents)?;
        Ok(contents)
    }

    /// Lists the directory file `file_number`; system files and the
    /// directory's own back-link are hidden. Every returned entry keeps its
    /// stable file number and carries the header name as the alternate.
    fn dir_entries(&self, file_number: u32) -> Result<Vec<DirEntry>> {
        let contents = self.read_file_contents(self.entry_by_fid(file_number)?)?;
        match self.level {
            StructureLevel::Ods1 => ods1::parse_directory(self, file_number, &contents),
            StructureLevel::Ods2 => ods2::parse_directory(self, file_number, &contents),
        }
    }

    fn listed_entry(&self, file_number: u32, dir_fid: u32, name: String) -> Option<DirEntry> {
        if is_system_file(file_number) {
            return None;
        }
        let Ok(header_entry) = self.entry_by_fid(file_number) else {
            debug!("Directory references missing file number {file_number}");
            return None;
        };
        if header_entry.file_number() == Some(dir_fid) {
            return None;
        }
        let mut entry = header_entry.clone();
        entry.alternate_name = Some(std::mem::replace(&mut entry.name, name));
        Some(entry)
    }
}

impl<DS: DataStorage> Volume for Files11Volume<DS> {
    fn files(&self) -> &[DirEntry] {
        &self.files
    }

    fn current_dir_name(&self) -> &str {
        &self.cur_dir_name
    }

    fn max_name_length(&self) -> usize {
        match self.level {
            StructureLevel::Ods1 => 13,
            StructureLevel::Ods2 => 80,
        }
    }

    fn free_space(&mut self) -> Result<u64> {
        let bitmap = self.read_file_contents(self.entry_by_fid(FILE_NUM_BITMAP)?)?;
        let mut free_clusters = 0u64;
        // The first block of the bitmap file is the storage control block.
        let mut offset = SECTOR_SIZE;
        while offset + 4 <= bitmap.len() {
            let word = u32::from_le_bytes(bitmap[offset..offset + 4].try_into().unwrap());
            free_clusters += word.count_ones() as u64;
            offset += 4;
        }
        Ok(free_clusters * self.sectors_per_cluster as u64 * SECTOR_SIZE as u64)
    }

    fn change_directory(&mut self, name: &str) -> Result<()> {
        match name {
            "/" => {
                self.cur_dir_fid = FILE_NUM_MFD;
                self.cur_dir_name = "/".into();
                self.cur_path.clear();
                self.cur_fid_path.clear();
            }
            ".." => {
                self.cur_path.pop();
                self.cur_fid_path.pop();
                self.cur_dir_name = self.cur_path.last().cloned().unwrap_or_else(|| "/".into());
                self.cur_dir_fid = self.cur_fid_path.last().copied().unwrap_or(FILE_NUM_MFD);
            }
            _ => {
                let entry = self.get_entry(name)?;
                let fid = entry.file_number().ok_or(Error::NoSuchFileOrDirectory)?;
                self.cur_dir_fid = fid;
                self.cur_dir_name = name.into();
                self.cur_path.push(name.into());
                self.cur_fid_path.push(fid);
            }
        }
        self.files = self.dir_entries(self.cur_dir_fid)?;
        Ok(())
    }

    fn copy_file_to(
        &mut self,
        name: &str,
        output: &mut dyn Write,
        _callback: &mut dyn VolumeCallback,
    ) -> Result<()> {
        let entry = self.get_entry(name)?.clone();
        self.copy_entry_to(&entry, output)
    }
}

pub fn ods1_factory<DS: DataStorage + 'static>() -> VolumeFactory<DS> {
    VolumeFactory {
        name: "files11-ods1",
        probe: ods1::probe,
        open: |ds| Ok(Box::new(Files11Volume::open(ds, StructureLevel::Ods1)?)),
    }
}

pub fn ods2_factory<DS: DataStorage + 'static>() -> VolumeFactory<DS> {
    VolumeFactory {
        name: "files11-ods2",
        probe: ods2::probe,
        open: |ds| Ok(Box::new(Files11Volume::open(ds, StructureLevel::Ods2)?)),
    }
}

#[cfg(test)]
mod tests;
