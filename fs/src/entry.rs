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

use chrono::NaiveDateTime;

/// Driver-private payload of a directory entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DriverData {
    #[default]
    None,
    /// BK family: the entry's own directory id (non-zero only for
    /// directories), its parent directory id, and the program load address
    /// (0 or 0xFFFF = none).
    Bk {
        dir_id: u8,
        parent_id: u8,
        load_addr: u16,
    },
    /// Files-11: the stable file number backing this entry.
    Files11 { file_number: u32 },
}

/// Canonical record for a file or directory, produced by every driver.
///
/// `raw_name` holds the undecoded on-disk filename bytes; serializers reuse
/// them verbatim while the decoded `name` is unchanged, so non-canonical
/// short names (multiple dots, odd padding) round-trip bit-exactly.
#[derive(Clone, Debug, Default)]
pub struct DirEntry {
    pub name: String,
    /// Secondary form, e.g. the 8.3 name when `name` is a long filename.
    pub alternate_name: Option<String>,
    pub raw_name: Vec<u8>,

    /// In bytes.
    pub length: u64,
    pub allocation_size: u64,

    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub accessed: Option<NaiveDateTime>,
    pub expires: Option<NaiveDateTime>,
    pub backed_up: Option<NaiveDateTime>,

    /// Per-format trailing bytes (RT-11 per-entry extension area).
    pub extra: Vec<u8>,

    /// Byte offset of the on-disk record, for in-place status flips.
    pub entry_offset: Option<u64>,
    /// First cluster/sector/block of the data chain, 0 = no data.
    pub first_cluster: u64,
    /// Raw attribute byte (FAT).
    pub attrs: u8,
    /// On-disk record stride where it varies per volume (RT-11).
    pub entry_size: u16,

    pub empty: bool,
    pub is_directory: bool,
    pub is_archive: bool,
    pub is_system: bool,
    pub is_volume_label: bool,
    pub hidden: bool,
    pub read_only: bool,

    pub driver: DriverData,
}

impl DirEntry {
    pub fn bk(&self) -> Option<(u8, u8, u16)> {
        match self.driver {
            DriverData::Bk {
                dir_id,
                parent_id,
                load_addr,
            } => Some((dir_id, parent_id, load_addr)),
            _ => None,
        }
    }

    pub fn file_number(&self) -> Option<u32> {
        match self.driver {
            DriverData::Files11 { file_number } => Some(file_number),
            _ => None,
        }
    }
}

pub fn find_position(files: &[DirEntry], name: &str, case_sensitive: bool) -> Option<usize> {
    files.iter().position(|entry| {
        if case_sensitive {
            entry.name == name
        } else {
            entry.name.eq_ignore_ascii_case(name)
        }
    })
}

pub fn find_entry<'a>(
    files: &'a [DirEntry],
    name: &str,
    case_sensitive: bool,
) -> Option<&'a DirEntry> {
    find_position(files, name, case_sensitive).map(|position| &files[position])
}

/// Slots `entry` into the first empty record, appending otherwise.
pub fn add_to_dir_entries(entries: &mut Vec<DirEntry>, entry: DirEntry) {
    match entries.iter_mut().find(|candidate| candidate.empty) {
        Some(slot) => *slot = entry,
        None => entries.push(entry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> DirEntry {
        DirEntry {
            name: name.into(),
            ..DirEntry::default()
        }
    }

    #[test]
    fn lookup_is_case_insensitive_by_default() {
        let files = vec![named("README.TXT")];
        assert!(find_entry(&files, "readme.txt", false).is_some());
        assert!(find_entry(&files, "readme.txt", true).is_none());
    }

    #[test]
    fn empty_slots_are_reused_before_appending() {
        let mut entries = vec![named("A"), named("B")];
        entries[0].empty = true;
        add_to_dir_entries(&mut entries, named("C"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "C");
        add_to_dir_entries(&mut entries, named("D"));
        assert_eq!(entries.len(), 3);
    }
}
