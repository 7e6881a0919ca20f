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

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use log::error;
use zerocopy::{little_endian::U16, FromBytes, Immutable, IntoBytes, KnownLayout};

use dskview_ds::DataStorage;
use dskview_fs::{
    radix50, DirEntry, Error, FilenameChars, Result, Volume, VolumeCallback, VolumeFactory,
};

const BLOCK_SIZE: usize = 512;
/// Entry area of a two-block segment: 1024 bytes minus the 10-byte header.
const SEGMENT_PAYLOAD: usize = 507 * 2;
const BASE_ENTRY_SIZE: usize = 14;
const MAX_SEGMENTS: u16 = 31;

/// Directory-entry status bits (E.TENT, E.MPTY, ...).
pub const STATUS_TENTATIVE: u16 = 0o400;
pub const STATUS_EMPTY: u16 = 0o1000;
pub const STATUS_PERMANENT: u16 = 0o2000;
pub const STATUS_END_OF_SEGMENT: u16 = 0o4000;
pub const STATUS_PROTECTED: u16 = 0o100000;

/// Word at this home-block offset points at the first directory segment.
const HOME_DIR_SEGMENT_OFFSET: usize = 0o724;

/// Two-block directory segment header: five words at offsets 0..10.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct SegmentHeader {
    /// Segments allocated to the directory, 1..=31.
    total_segments: U16,
    /// Number of the next segment, 0 in the last one.
    next_segment: U16,
    /// Highest segment currently in use; maintained in the first segment.
    highest_segment: U16,
    /// Extra bytes appended to each 14-byte entry; must be even.
    extra_bytes: U16,
    /// First data block mapped by this segment.
    start_block: U16,
}

/// Fixed part of a directory entry; `extra_bytes` trailing bytes follow.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct SegmentEntry {
    status: U16,
    /// Two RADIX-50 name words and one extension word.
    name: [U16; 3],
    length_blocks: U16,
    job_channel: U16,
    date: U16,
}

/// Split-field date: two high year bits at 14, month at 10, day at 5, low
/// five year bits at 0; years count from 1972.
pub fn decode_date(date: u16) -> Option<NaiveDateTime> {
    if date == 0 {
        return None;
    }
    NaiveDate::from_ymd_opt(
        1972 + (((date & 0xC000) >> 9) | (date & 0o37)) as i32,
        ((date >> 10) & 0o17) as u32,
        ((date >> 5) & 0o37) as u32,
    )?
    .and_hms_opt(0, 0, 0)
}

pub fn encode_date(datetime: NaiveDateTime) -> u16 {
    let date = datetime.date();
    let year = (date.year() - 1972).clamp(0, 127) as u16;
    (year & 0o37)
        | ((year & 0o140) << 9)
        | ((date.month() as u16) << 10)
        | ((date.day() as u16) << 5)
}

fn decode_filename_words(words: [u16; 3]) -> Result<String> {
    radix50::decode_filename(&words).map_err(|_| Error::DiskCorrupt)
}

pub struct Rt11Volume<DS: DataStorage> {
    ds: DS,
    files: Vec<DirEntry>,
    number_of_blocks: u16,
}

impl<DS: DataStorage> Rt11Volume<DS> {
    pub fn new(ds: DS) -> Result<Self> {
        let mut volume = Self {
            ds,
            files: Vec::new(),
            number_of_blocks: 0,
        };
        volume.load_files()?;
        Ok(volume)
    }

    fn read_block(&self, block: u32, data: &mut [u8]) -> Result<()> {
        self.ds.read(block as u64 * BLOCK_SIZE as u64, data)
    }

    fn write_block(&mut self, block: u32, data: &[u8]) -> Result<()> {
        self.ds.write(block as u64 * BLOCK_SIZE as u64, data)
    }

    fn first_segment_block(&self) -> Result<u16> {
        let mut home = [0; BLOCK_SIZE];
        self.read_block(1, &mut home)?;
        Ok(u16::from_le_bytes([
            home[HOME_DIR_SEGMENT_OFFSET],
            home[HOME_DIR_SEGMENT_OFFSET + 1],
        ]))
    }

    /// Walks the linked directory segments. Permanent and tentative entries
    /// become files, empty entries become gap records (included only
    /// `with_extra`); entries appear in on-disk block order.
    fn dir_entries(&mut self, with_extra: bool) -> Result<Vec<DirEntry>> {
        let dir_block = self.first_segment_block()?;
        let mut entries = Vec::new();
        let mut segment = [0u8; 2 * BLOCK_SIZE];
        let mut segment_number = 1u16;
        let mut visited = 0;
        loop {
            visited += 1;
            if visited > MAX_SEGMENTS {
                error!("Directory segment links do not terminate");
                return Err(Error::DiskCorrupt);
            }
            let segment_block = dir_block as u32 + (segment_number as u32 - 1) * 2;
            self.read_block(segment_block, &mut segment[..BLOCK_SIZE])?;
            self.read_block(segment_block + 1, &mut segment[BLOCK_SIZE..])?;
            let header = SegmentHeader::read_from_bytes(&segment[..10]).unwrap();
            let extra_bytes = header.extra_bytes.get() as usize;
            if extra_bytes & 1 != 0 {
                error!("Odd extra-bytes value in directory segment header");
                return Err(Error::DiskCorrupt);
            }
            let entry_size = BASE_ENTRY_SIZE + extra_bytes;
            let mut data_block = header.start_block.get();
            'segment: for i in 0..SEGMENT_PAYLOAD / entry_size {
                let offset = 10 + entry_size * i;
                let bytes = &segment[offset..offset + entry_size];
                let fixed = SegmentEntry::read_from_bytes(&bytes[..BASE_ENTRY_SIZE]).unwrap();
                let status = fixed.status.get();
                if status & STATUS_END_OF_SEGMENT != 0 {
                    break 'segment;
                }
                let mut entry = DirEntry::default();
                if status & STATUS_EMPTY != 0 {
                    entry.empty = true;
                } else {
                    entry.name = decode_filename_words([
                        fixed.name[0].get(),
                        fixed.name[1].get(),
                        fixed.name[2].get(),
                    ])?;
                    entry.created = decode_date(fixed.date.get());
                    entry.modified = entry.created;
                    entry.accessed = entry.created;
                }
                entry.read_only = status & STATUS_PROTECTED != 0;
                entry.entry_offset = Some(segment_block as u64 * BLOCK_SIZE as u64 + offset as u64);
                entry.entry_size = entry_size as u16;
                let length_blocks = fixed.length_blocks.get();
                entry.first_cluster = data_block as u64;
                data_block = data_block.wrapping_add(length_blocks);
                self.number_of_blocks = self.number_of_blocks.max(data_block);
                entry.length = length_blocks as u64 * BLOCK_SIZE as u64;
                entry.allocation_size = entry.length;
                entry.extra = bytes[BASE_ENTRY_SIZE..].to_vec();
                if !entry.empty || with_extra {
                    entries.push(entry);
                }
            }
            segment_number = header.next_segment.get();
            if segment_number == 0 {
                break;
            }
        }
        Ok(entries)
    }

    fn load_files(&mut self) -> Result<()> {
        self.files = self.dir_entries(false)?;
        self.files.sort_by_key(|entry| entry.first_cluster);
        Ok(())
    }

    fn insert_into_files(&mut self, entry: DirEntry) {
        let position = self
            .files
            .iter()
            .position(|existing| entry.first_cluster < existing.first_cluster)
            .unwrap_or(self.files.len());
        self.files.insert(position, entry);
    }

    /// First-fit over the empty runs; `None` when no gap is large enough.
    fn allocate(&mut self, blocks: u16) -> Result<Option<DirEntry>> {
        Ok(self
            .dir_entries(true)?
            .into_iter()
            .find(|entry| entry.empty && entry.length >= blocks as u64 * BLOCK_SIZE as u64))
    }

    fn write_directory(&mut self) -> Result<()> {
        let mut writer = DirectoryWriter::new(self)?;
        let files = writer.volume.files.clone();
        for entry in &files {
            writer.write_permanent_entry(entry)?;
        }
        writer.finish()
    }

    fn copy_from_stream(&mut self, offset: u64, input: &mut dyn Read, length: u64) -> Result<()> {
        let mut buffer = [0u8; BLOCK_SIZE];
        let mut written = 0u64;
        while written < length {
            let want = ((length - written) as usize).min(BLOCK_SIZE);
            let mut filled = 0;
            while filled < want {
                let n = input.read(&mut buffer[filled..want])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            self.ds.write(offset + written, &buffer[..filled])?;
            written += filled as u64;
        }
        Ok(())
    }

    fn modify_file_impl(
        &mut self,
        name: &str,
        length: u64,
        input: &mut dyn Read,
        created: Option<NaiveDateTime>,
    ) -> Result<()> {
        self.ds.make_writable();
        let uppercase = name.to_uppercase();
        radix50::encode_filename(&uppercase)?;
        if self.files.iter().any(|entry| entry.name == uppercase) {
            self.remove_file(&uppercase)?;
        }

        let blocks = length.div_ceil(BLOCK_SIZE as u64);
        if blocks > u16::MAX as u64 {
            return Err(Error::NoSpaceOnDevice);
        }
        let blocks = blocks as u16;
        let gap = match self.allocate(blocks)? {
            Some(gap) => gap,
            None => {
                self.defragment()?;
                self.allocate(blocks)?.ok_or(Error::NoSpaceOnDevice)?
            }
        };
        let mut entry = gap;
        entry.length = blocks as u64 * BLOCK_SIZE as u64;
        entry.allocation_size = entry.length;
        entry.name = uppercase;
        entry.empty = false;
        entry.created = created.or_else(|| Some(chrono::Local::now().naive_local()));
        if blocks > 0 {
            // Zero the last block so input that is not a block multiple does
            // not leave stale bytes behind.
            self.write_block(entry.first_cluster as u32 + blocks as u32 - 1, &[0; BLOCK_SIZE])?;
            self.copy_from_stream(entry.first_cluster * BLOCK_SIZE as u64, input, length)?;
        }
        self.load_files()?;
        self.insert_into_files(entry);
        self.write_directory()
    }
}

struct DirectoryWriter<'a, DS: DataStorage> {
    volume: &'a mut Rt11Volume<DS>,
    segment: [u8; 2 * BLOCK_SIZE],
    cur_entry: usize,
    cur_data_block: u16,
    cur_segment_id: u16,
    total_segments: u16,
    dir_block: u16,
    cur_segment_block: u16,
}

impl<'a, DS: DataStorage> DirectoryWriter<'a, DS> {
    fn new(volume: &'a mut Rt11Volume<DS>) -> Result<Self> {
        let dir_block = volume.first_segment_block()?;
        let mut writer = Self {
            volume,
            segment: [0; 2 * BLOCK_SIZE],
            cur_entry: 0,
            cur_data_block: 0,
            cur_segment_id: 1,
            total_segments: 0,
            dir_block,
            cur_segment_block: dir_block,
        };
        writer.load_segment()?;
        Ok(writer)
    }

    fn entry_size(&self) -> usize {
        BASE_ENTRY_SIZE + u16::from_le_bytes([self.segment[6], self.segment[7]]) as usize
    }

    fn load_segment(&mut self) -> Result<()> {
        let block = self.cur_segment_block as u32;
        self.volume
            .read_block(block, &mut self.segment[..BLOCK_SIZE])?;
        self.volume
            .read_block(block + 1, &mut self.segment[BLOCK_SIZE..])?;
        if self.cur_segment_block == self.dir_block {
            self.total_segments = u16::from_le_bytes([self.segment[0], self.segment[1]]);
            if !(1..=MAX_SEGMENTS).contains(&self.total_segments) {
                error!("Directory declares {} segments", self.total_segments);
                return Err(Error::DiskCorrupt);
            }
        } else {
            // Carry the running data position into the freshly opened
            // segment's start-block word.
            self.segment[8..10].copy_from_slice(&self.cur_data_block.to_le_bytes());
        }
        self.cur_data_block = u16::from_le_bytes([self.segment[8], self.segment[9]]);
        self.cur_entry = 0;
        Ok(())
    }

    fn save_segment(&mut self, last: bool) -> Result<()> {
        let entry_size = self.entry_size();
        let next = if last { 0 } else { self.cur_segment_id + 1 };
        self.segment[2..4].copy_from_slice(&next.to_le_bytes());
        let sentinel = 10 + self.cur_entry * entry_size;
        self.segment[sentinel..sentinel + 2]
            .copy_from_slice(&STATUS_END_OF_SEGMENT.to_le_bytes());
        let block = self.cur_segment_block as u32;
        let (first, second) = self.segment.split_at(BLOCK_SIZE);
        self.volume.write_block(block, first)?;
        self.volume.write_block(block + 1, second)?;
        self.cur_segment_block += 2;
        if last {
            self.volume.ds.write(
                self.dir_block as u64 * BLOCK_SIZE as u64 + 4,
                &self.cur_segment_id.to_le_bytes(),
            )?;
        }
        self.cur_segment_id += 1;
        Ok(())
    }

    fn write_entry(&mut self, entry: &DirEntry) -> Result<()> {
        if (self.cur_segment_block - self.dir_block) / 2 >= self.total_segments {
            error!("Out of directory segments");
            return Err(Error::NoSpaceOnDevice);
        }
        let entry_size = self.entry_size();
        let extra_bytes = entry_size - BASE_ENTRY_SIZE;

        let mut status = if entry.empty {
            STATUS_EMPTY
        } else {
            STATUS_PERMANENT
        };
        if entry.read_only {
            status |= STATUS_PROTECTED;
        }
        let name = radix50::encode_filename(&entry.name)?;
        let length_blocks = (entry.length / BLOCK_SIZE as u64) as u16;
        let fixed = SegmentEntry {
            status: U16::new(status),
            name: [U16::new(name[0]), U16::new(name[1]), U16::new(name[2])],
            length_blocks: U16::new(length_blocks),
            job_channel: U16::ZERO,
            date: U16::new(entry.created.map(encode_date).unwrap_or(0)),
        };
        let offset = 10 + self.cur_entry * entry_size;
        self.segment[offset..offset + BASE_ENTRY_SIZE].copy_from_slice(fixed.as_bytes());
        self.segment[offset + BASE_ENTRY_SIZE..offset + entry_size].fill(0);
        let extra = entry.extra.len().min(extra_bytes);
        self.segment[offset + BASE_ENTRY_SIZE..offset + BASE_ENTRY_SIZE + extra]
            .copy_from_slice(&entry.extra[..extra]);

        self.cur_data_block += length_blocks;
        self.cur_entry += 1;
        if SEGMENT_PAYLOAD - self.cur_entry * entry_size <= entry_size {
            self.save_segment(false)?;
            self.load_segment()?;
        }
        Ok(())
    }

    fn write_empty_entry(&mut self, blocks: u16) -> Result<()> {
        let empty = DirEntry {
            empty: true,
            name: "EMPTY.FIL".into(),
            length: blocks as u64 * BLOCK_SIZE as u64,
            ..DirEntry::default()
        };
        self.write_entry(&empty)
    }

    fn write_permanent_entry(&mut self, entry: &DirEntry) -> Result<()> {
        if entry.first_cluster > self.cur_data_block as u64 {
            self.write_empty_entry((entry.first_cluster - self.cur_data_block as u64) as u16)?;
        }
        self.write_entry(entry)
    }

    fn finish(mut self) -> Result<()> {
        if self.cur_data_block < self.volume.number_of_blocks {
            self.write_empty_entry(self.volume.number_of_blocks - self.cur_data_block)?;
        }
        self.save_segment(true)
    }
}

impl<DS: DataStorage> Volume for Rt11Volume<DS> {
    fn files(&self) -> &[DirEntry] {
        &self.files
    }

    fn current_dir_name(&self) -> &str {
        "/"
    }

    fn max_name_length(&self) -> usize {
        10
    }

    fn filename_chars(&self) -> FilenameChars {
        FilenameChars::allow("ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789.$%")
    }

    fn free_space(&mut self) -> Result<u64> {
        Ok(self
            .dir_entries(true)?
            .iter()
            .filter(|entry| entry.empty)
            .map(|entry| entry.length)
            .sum())
    }

    fn copy_file_to(
        &mut self,
        name: &str,
        output: &mut dyn Write,
        _callback: &mut dyn VolumeCallback,
    ) -> Result<()> {
        let entry = self.get_entry(name)?.clone();
        let mut block = [0; BLOCK_SIZE];
        for i in 0..entry.length.div_ceil(BLOCK_SIZE as u64) {
            self.read_block(entry.first_cluster as u32 + i as u32, &mut block)?;
            output.write_all(&block)?;
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
        let uppercase = name.to_uppercase();
        if self.files.iter().any(|entry| entry.name == uppercase) {
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
        let position = dskview_fs::find_position(&self.files, name, false)
            .ok_or(Error::NoSuchFileOrDirectory)?;
        let offset = self.files[position].entry_offset.ok_or(Error::DiskCorrupt)?;
        self.ds.write(offset, &STATUS_EMPTY.to_le_bytes())?;
        self.files.remove(position);
        Ok(())
    }

    /// Squeeze: moves every file down to the lowest free block and rewrites
    /// the directory with the remaining space coalesced into one empty run.
    /// Required because allocation is strictly contiguous.
    fn defragment(&mut self) -> Result<()> {
        self.ds.make_writable();
        let entries = self.dir_entries(true)?;
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let mut cur_free = first.first_cluster as u16;
        let mut block = [0; BLOCK_SIZE];
        let files = std::mem::take(&mut self.files);
        let mut moved = Vec::with_capacity(files.len());
        for mut entry in files {
            let blocks = (entry.length / BLOCK_SIZE as u64) as u16;
            if entry.first_cluster > cur_free as u64 {
                for i in 0..blocks as u32 {
                    self.read_block(entry.first_cluster as u32 + i, &mut block)?;
                    self.write_block(cur_free as u32 + i, &block)?;
                }
                entry.first_cluster = cur_free as u64;
            }
            cur_free = entry.first_cluster as u16 + blocks;
            moved.push(entry);
        }
        self.files = moved;
        self.write_directory()?;
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        self.ds.flush()
    }
}

fn pack_radix50(chars: &[u8; 3]) -> u16 {
    let index = |c: u8| {
        radix50::ALPHABET
            .iter()
            .position(|&a| a == c)
            .unwrap_or(0) as u16
    };
    index(chars[0]) * 40 * 40 + index(chars[1]) * 40 + index(chars[2])
}

/// Home-block signature probe: PDP-11 NOP in the boot word, the boot
/// message, system/volume identification strings and the home-block
/// checksum. The threshold stays above 3 because an all-zero home block
/// trivially satisfies the checksum.
pub fn probe(prefix: &[u8]) -> u32 {
    if prefix.len() < 1024 {
        return 0;
    }
    let word = |offset: usize| u16::from_le_bytes([prefix[offset], prefix[offset + 1]]);
    let mut weight = 0;
    if word(0) == 0o240 {
        weight += 1;
    }
    if &prefix[0o31..0o31 + 9] == b"\n?BOOT-U-" {
        weight += 2;
    }
    let system_version = word(0o1726);
    if system_version == pack_radix50(b"V3A") || system_version == pack_radix50(b"V05") {
        weight += 1;
    }
    if &prefix[0o1730..0o1730 + 12] == b"RT11A       " {
        weight += 2;
    }
    if &prefix[0o1760..0o1760 + 12] == b"DECRT11A    " {
        weight += 2;
    }
    let mut checksum = 0u16;
    for offset in (512..1022).step_by(2) {
        checksum = checksum.wrapping_add(word(offset));
    }
    if checksum == word(1022) {
        weight += 2;
    }
    if weight > 3 {
        weight
    } else {
        0
    }
}

pub fn factory<DS: DataStorage + 'static>() -> VolumeFactory<DS> {
    VolumeFactory {
        name: "rt11",
        probe,
        open: |ds| Ok(Box::new(Rt11Volume::new(ds)?)),
    }
}
