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

//! Filesystems of the Soviet BK-0010/0011 computers. All three share KOI-8
//! filenames, a flat on-disk directory whose hierarchy is expressed through
//! small directory ids (an entry's own id and its parent's), and the
//! optional 4-byte `.BIN` load-address/length header on program files.
//! ANDOS sits on top of FAT12; MK-DOS and CSI-DOS have their own layouts.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::ops::RangeInclusive;

use dskview_fs::{find_entry, DirEntry, DriverData, Error, Result, VolumeCallback};

mod andos;
mod csidos;
mod mkdos;

pub use andos::{factory as andos_factory, probe as andos_probe, AndosVolume};
pub use csidos::{factory as csidos_factory, probe as csidos_probe, CsidosVolume};
pub use mkdos::{factory as mkdos_factory, probe as mkdos_probe, MkdosVolume};

/// Current position in the virtual directory tree.
#[derive(Clone)]
pub(crate) struct DirPosition {
    pub cur_id: u8,
    pub parent_id: u8,
    pub name: String,
}

impl DirPosition {
    pub(crate) fn root(root_id: u8) -> Self {
        Self {
            cur_id: root_id,
            parent_id: root_id,
            name: "/".into(),
        }
    }
}

/// Resolves a `change_directory` target against the flat entry table.
/// `all_entries` is the unfiltered table (for `..`), `files` the current
/// listing (for child lookup).
pub(crate) fn resolve_change_directory(
    target: &str,
    root_id: u8,
    position: &DirPosition,
    all_entries: &[DirEntry],
    files: &[DirEntry],
) -> Result<DirPosition> {
    match target {
        "/" => Ok(DirPosition::root(root_id)),
        ".." => {
            let cur_id = position.parent_id;
            if cur_id != root_id {
                for entry in all_entries {
                    if let DriverData::Bk {
                        dir_id, parent_id, ..
                    } = entry.driver
                    {
                        if entry.is_directory && dir_id == cur_id {
                            return Ok(DirPosition {
                                cur_id,
                                parent_id,
                                name: entry.name.clone(),
                            });
                        }
                    }
                }
            }
            Ok(DirPosition::root(root_id))
        }
        _ => {
            let entry = find_entry(files, target, false).ok_or(Error::NoSuchFileOrDirectory)?;
            if !entry.is_directory {
                return Err(Error::InvalidArgument);
            }
            let (dir_id, _, _) = entry.bk().ok_or(Error::DiskCorrupt)?;
            Ok(DirPosition {
                cur_id: dir_id,
                parent_id: position.cur_id,
                name: entry.name.clone(),
            })
        }
    }
}

/// The smallest directory id in `range` not taken by any entry.
pub(crate) fn allocate_dir_id(
    entries: &[DirEntry],
    range: RangeInclusive<u8>,
) -> Result<u8> {
    let used: HashSet<u8> = entries
        .iter()
        .filter_map(|entry| entry.bk().map(|(dir_id, _, _)| dir_id))
        .collect();
    range
        .into_iter()
        .find(|id| !used.contains(id))
        .ok_or(Error::NoSpaceOnDevice)
}

pub(crate) fn take_input(input: &mut dyn Read, length: u64) -> Result<Vec<u8>> {
    let mut data = vec![0; length as usize];
    let mut filled = 0;
    while filled < data.len() {
        let n = input.read(&mut data[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);
    Ok(data)
}

/// Detects an external `.BIN` header: the first two words are load address
/// and length, and the length matches the remaining input. Strips it and
/// returns the load address.
pub(crate) fn strip_bin_header(data: &mut Vec<u8>) -> u16 {
    if data.len() >= 4 {
        let length = u16::from_le_bytes([data[2], data[3]]);
        if length as usize == data.len() - 4 {
            let load_addr = u16::from_le_bytes([data[0], data[1]]);
            data.drain(..4);
            return load_addr;
        }
    }
    0
}

/// On copy-out, an interactive caller may ask for the `.BIN` header to be
/// put back in front of a program file.
pub(crate) fn emit_bin_header(
    entry: &DirEntry,
    output: &mut dyn Write,
    callback: &mut dyn VolumeCallback,
) -> Result<()> {
    if let DriverData::Bk { load_addr, .. } = entry.driver {
        if !entry.is_directory
            && load_addr != 0
            && load_addr != 0xFFFF
            && callback.interactive()
            && callback.confirm("Add .BIN Address/Length header?")?
        {
            output.write_all(&load_addr.to_le_bytes())?;
            output.write_all(&(entry.length as u16).to_le_bytes())?;
        }
    }
    Ok(())
}

/// Contiguous-gap scan over the allocated runs, in sectors. Overlapping
/// runs mean a corrupted directory.
pub(crate) fn find_contiguous_gap(
    entries: &[DirEntry],
    first_data_sector: u64,
    total_sectors: u64,
    needed_sectors: u64,
) -> Result<Option<u64>> {
    let mut used: Vec<(u64, u64)> = entries
        .iter()
        .filter(|entry| !entry.empty && !entry.is_directory && entry.first_cluster != 0)
        .map(|entry| (entry.first_cluster, entry.length.div_ceil(512)))
        .collect();
    used.sort_unstable();
    let mut cursor = first_data_sector;
    for (start, sectors) in used {
        if start < cursor {
            log::error!("Overlapping data runs at sector {start}");
            return Err(Error::DiskCorrupt);
        }
        if start - cursor >= needed_sectors {
            return Ok(Some(cursor));
        }
        cursor = start + sectors;
    }
    if total_sectors.saturating_sub(cursor) >= needed_sectors {
        Ok(Some(cursor))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bk_entry(name: &str, dir_id: u8, parent_id: u8, is_directory: bool) -> DirEntry {
        DirEntry {
            name: name.into(),
            is_directory,
            driver: DriverData::Bk {
                dir_id,
                parent_id,
                load_addr: 0,
            },
            ..DirEntry::default()
        }
    }

    #[test]
    fn bin_header_is_stripped_only_when_the_length_matches() {
        let mut data = vec![0x00, 0x10, 0x04, 0x00, 1, 2, 3, 4];
        assert_eq!(strip_bin_header(&mut data), 0x1000);
        assert_eq!(data, [1, 2, 3, 4]);

        let mut data = vec![0x00, 0x10, 0x05, 0x00, 1, 2, 3, 4];
        assert_eq!(strip_bin_header(&mut data), 0);
        assert_eq!(data.len(), 8);
    }

    #[test]
    fn dir_id_allocation_picks_the_smallest_free() {
        let entries = vec![
            bk_entry("A", 2, 0, true),
            bk_entry("B", 3, 0, true),
            bk_entry("F", 0, 2, false),
        ];
        assert_eq!(allocate_dir_id(&entries, 2..=0xC7).unwrap(), 4);

        let full: Vec<DirEntry> = (1..=255)
            .map(|id| bk_entry(&format!("D{id}"), id, 0, true))
            .collect();
        assert!(matches!(
            allocate_dir_id(&full, 1..=255),
            Err(Error::NoSpaceOnDevice)
        ));
    }

    #[test]
    fn change_directory_walks_ids() {
        let all = vec![
            bk_entry("GAMES", 2, 0, true),
            bk_entry("DEEP", 3, 2, true),
            bk_entry("F.BIN", 0, 3, false),
        ];
        let mut position = DirPosition::root(0);
        position = resolve_change_directory("GAMES", 0, &position, &all, &all).unwrap();
        assert_eq!((position.cur_id, position.parent_id), (2, 0));
        position = resolve_change_directory("DEEP", 0, &position, &all, &all[1..]).unwrap();
        assert_eq!((position.cur_id, position.parent_id), (3, 2));
        position = resolve_change_directory("..", 0, &position, &all, &[]).unwrap();
        assert_eq!((position.cur_id, position.parent_id), (2, 0));
        assert_eq!(position.name, "GAMES");
        position = resolve_change_directory("/", 0, &position, &all, &[]).unwrap();
        assert_eq!(position.cur_id, 0);

        assert!(matches!(
            resolve_change_directory("F.BIN", 0, &DirPosition::root(0), &all, &all),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn gap_scan_finds_holes_and_detects_overlap() {
        let mut a = bk_entry("A", 0, 0, false);
        a.first_cluster = 10;
        a.length = 2 * 512;
        let mut b = bk_entry("B", 0, 0, false);
        b.first_cluster = 20;
        b.length = 512;
        let entries = vec![a.clone(), b.clone()];

        assert_eq!(find_contiguous_gap(&entries, 10, 40, 8).unwrap(), Some(12));
        assert_eq!(find_contiguous_gap(&entries, 10, 40, 19).unwrap(), Some(21));
        assert_eq!(find_contiguous_gap(&entries, 10, 40, 20).unwrap(), None);

        let mut overlapping = b;
        overlapping.first_cluster = 11;
        assert!(matches!(
            find_contiguous_gap(&[a, overlapping], 10, 40, 1),
            Err(Error::DiskCorrupt)
        ));
    }
}
