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

//! Partition-table containers for BK hard-disk images stored bit-inverted:
//! every sector is XOR'd with 0xFF on disk. An optional HDI header sector
//! (byte 510 = 0xA5, zero byte sum) shifts all addresses by one sector.
//! Partitions are exposed as virtual `Partition N.dsk` files.

use std::io::{Read, Write};

use log::error;

use dskview_ds::DataStorage;
use dskview_fs::{DirEntry, Error, Result, Volume, VolumeCallback, VolumeFactory};

const SECTOR_SIZE: usize = 512;

pub fn hdi_header_checksum_ok(sector: &[u8]) -> bool {
    if sector.len() < SECTOR_SIZE || sector[510] != 0xA5 {
        return false;
    }
    sector[..SECTOR_SIZE]
        .iter()
        .fold(0u8, |sum, &byte| sum.wrapping_add(byte))
        == 0
}

fn inverted(sector: &[u8]) -> [u8; SECTOR_SIZE] {
    let mut out = [0; SECTOR_SIZE];
    for (out, &byte) in out.iter_mut().zip(sector) {
        *out = !byte;
    }
    out
}

struct HdiCore<DS: DataStorage> {
    ds: DS,
    reserved_sectors: u32,
}

impl<DS: DataStorage> HdiCore<DS> {
    fn open(ds: DS) -> Result<Self> {
        let mut sector = [0; SECTOR_SIZE];
        ds.read(0, &mut sector)?;
        let reserved_sectors = if hdi_header_checksum_ok(&sector) { 1 } else { 0 };
        Ok(Self {
            ds,
            reserved_sectors,
        })
    }

    fn read_sector(&self, lba: u32) -> Result<[u8; SECTOR_SIZE]> {
        let mut sector = [0; SECTOR_SIZE];
        self.ds.read(
            (self.reserved_sectors + lba) as u64 * SECTOR_SIZE as u64,
            &mut sector,
        )?;
        Ok(inverted(&sector))
    }

    fn write_sector(&mut self, lba: u32, sector: &[u8]) -> Result<()> {
        self.ds.write(
            (self.reserved_sectors + lba) as u64 * SECTOR_SIZE as u64,
            &inverted(sector),
        )
    }

    fn copy_partition_to(&self, entry: &DirEntry, output: &mut dyn Write) -> Result<()> {
        for i in 0..entry.length / SECTOR_SIZE as u64 {
            output.write_all(&self.read_sector(entry.first_cluster as u32 + i as u32)?)?;
        }
        Ok(())
    }

    /// In-place rewrite of a partition; the replacement must match the
    /// partition length exactly.
    fn modify_partition(
        &mut self,
        entry: &DirEntry,
        length: u64,
        input: &mut dyn Read,
    ) -> Result<()> {
        if length != entry.length {
            error!("Partition size is not equal to the size of the new contents");
            return Err(Error::InvalidArgument);
        }
        self.ds.make_writable();
        let mut sector = [0; SECTOR_SIZE];
        for i in 0..length / SECTOR_SIZE as u64 {
            input.read_exact(&mut sector)?;
            self.write_sector(entry.first_cluster as u32 + i as u32, &sector)?;
        }
        Ok(())
    }
}

fn partition_name(index: usize) -> String {
    format!("Partition {}.dsk", index + 1)
}

/// AltPro controller layout: geometry and the partition table live in
/// sector 7, protected by a seeded word checksum.
pub struct AltProVolume<DS: DataStorage> {
    core: HdiCore<DS>,
    cylinders: u16,
    heads: u8,
    sectors: u16,
    files: Vec<DirEntry>,
}

impl<DS: DataStorage> AltProVolume<DS> {
    pub fn new(ds: DS) -> Result<Self> {
        let core = HdiCore::open(ds)?;
        let table = core.read_sector(7)?;
        let word = |offset: usize| u16::from_le_bytes([table[offset], table[offset + 1]]);
        let cylinders = word(510);
        let heads = table[508];
        let sectors = word(506);
        let partitions = table[504] as usize;
        if partitions > 125 {
            return Err(Error::DiskCorrupt);
        }

        let mut files = Vec::with_capacity(partitions);
        for i in 0..partitions {
            let mut entry = DirEntry::default();
            let mut cylinder = word(502 - i * 4) as i16;
            entry.read_only = cylinder < 0;
            cylinder = cylinder.abs();
            let head = cylinder as u16 & 0xF;
            let cylinder = (cylinder >> 4) as u16;
            if cylinder >= cylinders {
                error!("Partition {i} starts past the last cylinder");
                return Err(Error::DiskCorrupt);
            }
            entry.name = partition_name(i);
            entry.first_cluster = (cylinder as u64 * heads as u64 + head as u64) * sectors as u64;
            entry.length = word(500 - i * 4) as u64 * SECTOR_SIZE as u64;
            entry.allocation_size = entry.length;
            files.push(entry);
        }
        Ok(Self {
            core,
            cylinders,
            heads,
            sectors,
            files,
        })
    }
}

impl<DS: DataStorage> Volume for AltProVolume<DS> {
    fn files(&self) -> &[DirEntry] {
        &self.files
    }

    fn current_dir_name(&self) -> &str {
        "/"
    }

    fn max_name_length(&self) -> usize {
        255
    }

    fn free_space(&mut self) -> Result<u64> {
        let total =
            self.cylinders as u64 * self.heads as u64 * self.sectors as u64 * SECTOR_SIZE as u64;
        Ok(total - self.files.iter().map(|entry| entry.length).sum::<u64>())
    }

    fn copy_file_to(
        &mut self,
        name: &str,
        output: &mut dyn Write,
        _callback: &mut dyn VolumeCallback,
    ) -> Result<()> {
        let entry = self.get_entry(name)?.clone();
        self.core.copy_partition_to(&entry, output)
    }

    fn modify_file(
        &mut self,
        name: &str,
        length: u64,
        input: &mut dyn Read,
        _created: Option<chrono::NaiveDateTime>,
    ) -> Result<()> {
        let entry = self.get_entry(name)?.clone();
        self.core.modify_partition(&entry, length, input)
    }

    fn flush(&mut self) -> Result<()> {
        self.core.ds.flush()
    }
}

/// Samara controller layout: sector 1 holds the geometry and up to 64
/// partition LBAs; each partition starts with a header sector carrying its
/// index + 2 and its length.
pub struct SamaraVolume<DS: DataStorage> {
    core: HdiCore<DS>,
    files: Vec<DirEntry>,
}

impl<DS: DataStorage> SamaraVolume<DS> {
    pub fn new(ds: DS) -> Result<Self> {
        let core = HdiCore::open(ds)?;
        let table = core.read_sector(1)?;
        let mut files = Vec::new();
        for i in 0..64 {
            let lba = u32::from_le_bytes(table[6 + i * 4..10 + i * 4].try_into().unwrap());
            if lba == 0 {
                break;
            }
            let header = core.read_sector(lba)?;
            let mut entry = DirEntry::default();
            entry.name = partition_name(i);
            entry.read_only = header[4] & 2 != 0;
            entry.first_cluster = lba as u64 + 1;
            entry.length =
                u16::from_le_bytes([header[2], header[3]]) as u64 * SECTOR_SIZE as u64;
            entry.allocation_size = entry.length;
            files.push(entry);
        }
        Ok(Self { core, files })
    }
}

impl<DS: DataStorage> Volume for SamaraVolume<DS> {
    fn files(&self) -> &[DirEntry] {
        &self.files
    }

    fn current_dir_name(&self) -> &str {
        "/"
    }

    fn max_name_length(&self) -> usize {
        255
    }

    fn free_space(&mut self) -> Result<u64> {
        let total = self.core.ds.len() - self.core.reserved_sectors as u64 * SECTOR_SIZE as u64;
        Ok(total.saturating_sub(
            self.files.iter().map(|entry| entry.length).sum::<u64>(),
        ))
    }

    fn copy_file_to(
        &mut self,
        name: &str,
        output: &mut dyn Write,
        _callback: &mut dyn VolumeCallback,
    ) -> Result<()> {
        let entry = self.get_entry(name)?.clone();
        self.core.copy_partition_to(&entry, output)
    }

    fn modify_file(
        &mut self,
        name: &str,
        length: u64,
        input: &mut dyn Read,
        _created: Option<chrono::NaiveDateTime>,
    ) -> Result<()> {
        let entry = self.get_entry(name)?.clone();
        self.core.modify_partition(&entry, length, input)
    }

    fn flush(&mut self) -> Result<()> {
        self.core.ds.flush()
    }
}

fn inverted_probe_sector(prefix: &[u8], sector: usize) -> Option<[u8; SECTOR_SIZE]> {
    let offset = sector * SECTOR_SIZE;
    if offset + SECTOR_SIZE > prefix.len() {
        return None;
    }
    Some(inverted(&prefix[offset..offset + SECTOR_SIZE]))
}

/// Sector-7 geometry with the seeded checksum over geometry and partition
/// words.
pub fn altpro_probe(prefix: &[u8]) -> u32 {
    if prefix.len() < 8 * SECTOR_SIZE {
        return 0;
    }
    let mut weight = 0;
    let mut reserved = 0;
    if hdi_header_checksum_ok(prefix) {
        weight += 2;
        reserved = 1;
    }
    let Some(table) = inverted_probe_sector(prefix, reserved + 7) else {
        return 0;
    };
    let word = |offset: usize| u16::from_le_bytes([table[offset], table[offset + 1]]);
    let partitions = table[504] as usize;
    if partitions > 125 {
        return 0;
    }
    let mut crc = 0o12701u16;
    for i in 0..partitions * 2 + 4 {
        crc = crc.wrapping_add(word(510 - i * 2));
    }
    if word(502 - partitions * 4) != crc {
        return 0;
    }
    weight + 2
}

/// Sector-1 partition list; every listed partition header must carry its
/// index + 2. Requires the HDI header to reach its threshold.
pub fn samara_probe(prefix: &[u8]) -> u32 {
    if prefix.len() < 8 * SECTOR_SIZE {
        return 0;
    }
    let mut weight = 0;
    let mut reserved = 0u32;
    if hdi_header_checksum_ok(prefix) {
        weight += 2;
        reserved = 1;
    }
    let Some(table) = inverted_probe_sector(prefix, reserved as usize + 1) else {
        return 0;
    };
    let cylinder_volume = u16::from_le_bytes([table[2], table[3]]) as u32;
    let heads = table[5] as u32 + 1;
    let sectors = table[4] as u32;
    if cylinder_volume == 0 || cylinder_volume != heads * sectors {
        return 0;
    }
    let mut partitions = 0;
    for i in 0..64 {
        let lba = u32::from_le_bytes(table[6 + i * 4..10 + i * 4].try_into().unwrap());
        if lba == 0 || ((reserved + lba + 1) as usize * SECTOR_SIZE) >= prefix.len() {
            break;
        }
        let Some(header) = inverted_probe_sector(prefix, (reserved + lba) as usize) else {
            break;
        };
        if u16::from_le_bytes([header[0], header[1]]) != i as u16 + 2 {
            return 0;
        }
        partitions += 1;
    }
    if partitions > 0 {
        weight += 1;
    }
    if weight > 2 {
        weight
    } else {
        0
    }
}

pub fn altpro_factory<DS: DataStorage + 'static>() -> VolumeFactory<DS> {
    VolumeFactory {
        name: "hdi-altpro",
        probe: altpro_probe,
        open: |ds| Ok(Box::new(AltProVolume::new(ds)?)),
    }
}

pub fn samara_factory<DS: DataStorage + 'static>() -> VolumeFactory<DS> {
    VolumeFactory {
        name: "hdi-samara",
        probe: samara_probe,
        open: |ds| Ok(Box::new(SamaraVolume::new(ds)?)),
    }
}

#[cfg(test)]
mod tests {
    use dskview_ds::MemStorage;
    use dskview_fs::NonInteractive;

    use super::*;

    /// Writes a logical (non-inverted) sector into the raw image.
    fn put_sector(image: &mut [u8], lba: usize, sector: &[u8; SECTOR_SIZE]) {
        image[lba * SECTOR_SIZE..(lba + 1) * SECTOR_SIZE].copy_from_slice(&inverted(sector));
    }

    fn altpro_table() -> [u8; SECTOR_SIZE] {
        let mut table = [0u8; SECTOR_SIZE];
        let mut put_word = |offset: usize, value: u16| {
            table[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        };
        put_word(510, 80); // cylinders
        put_word(508, 2); // heads (byte 508)
        put_word(506, 18); // sectors
        put_word(504, 2); // partitions (byte 504)
        put_word(502, 0); // partition 1: cylinder 0, head 0
        put_word(500, 9); // partition 1: 9 sectors
        put_word(498, 1 << 4); // partition 2: cylinder 1, head 0
        put_word(496, 9); // partition 2: 9 sectors
        let mut crc = 0o12701u16;
        for i in 0..2 * 2 + 4 {
            crc = crc
                .wrapping_add(u16::from_le_bytes([table[510 - i * 2], table[510 - i * 2 + 1]]));
        }
        table[494..496].copy_from_slice(&crc.to_le_bytes());
        table
    }

    fn altpro_image() -> Vec<u8> {
        let mut image = vec![0u8; 64 * SECTOR_SIZE];
        // Raw zero bytes read back as 0xFF after inversion; make partition 1
        // recognizable instead.
        for lba in 0..9 {
            let mut data = [0u8; SECTOR_SIZE];
            data.fill(lba as u8);
            if lba != 7 {
                put_sector(&mut image, lba, &data);
            }
        }
        put_sector(&mut image, 7, &altpro_table());
        image
    }

    #[test]
    fn altpro_lists_partitions_as_virtual_files() {
        assert!(altpro_probe(&altpro_image()) >= 2);
        let mut volume = AltProVolume::new(MemStorage::new(altpro_image())).unwrap();
        let names: Vec<_> = volume.files().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, ["Partition 1.dsk", "Partition 2.dsk"]);
        assert_eq!(volume.files()[0].first_cluster, 0);
        assert_eq!(volume.files()[1].first_cluster, 36); // cylinder 1, 2 heads, 18 sectors
        assert_eq!(volume.files()[0].length, 9 * 512);

        let mut output = Vec::new();
        volume
            .copy_file_to("Partition 1.dsk", &mut output, &mut NonInteractive)
            .unwrap();
        assert_eq!(output.len(), 9 * 512);
        for (lba, sector) in output.chunks(SECTOR_SIZE).enumerate() {
            let expected = if lba == 7 {
                altpro_table().to_vec()
            } else {
                vec![lba as u8; SECTOR_SIZE]
            };
            assert_eq!(sector, &expected[..]);
        }
    }

    #[test]
    fn altpro_modify_round_trips_bit_inverted() {
        let mut volume = AltProVolume::new(MemStorage::new(altpro_image())).unwrap();
        let replacement: Vec<u8> = (0..9 * 512u32).map(|i| (i % 251) as u8).collect();
        volume
            .modify_file("Partition 2.dsk", replacement.len() as u64, &mut &replacement[..], None)
            .unwrap();
        let mut output = Vec::new();
        volume
            .copy_file_to("Partition 2.dsk", &mut output, &mut NonInteractive)
            .unwrap();
        assert_eq!(output, replacement);

        assert!(matches!(
            volume.modify_file("Partition 2.dsk", 512, &mut std::io::empty(), None),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn altpro_accepts_an_hdi_header() {
        let mut image = vec![0u8; SECTOR_SIZE];
        image[510] = 0xA5;
        image[0] = 0x5B; // byte sum over the header is zero
        assert!(hdi_header_checksum_ok(&image));
        image.extend_from_slice(&altpro_image());

        assert_eq!(altpro_probe(&image), 4);
        let volume = AltProVolume::new(MemStorage::new(image)).unwrap();
        assert_eq!(volume.files().len(), 2);
    }

    #[test]
    fn altpro_rejects_a_bad_checksum() {
        let mut image = altpro_image();
        image[7 * SECTOR_SIZE] ^= 0x01;
        assert_eq!(altpro_probe(&image), 0);
    }

    fn samara_image() -> Vec<u8> {
        let mut image = vec![0u8; SECTOR_SIZE];
        image[510] = 0xA5;
        image[0] = 0x5B;
        let mut body = vec![0u8; 64 * SECTOR_SIZE];

        let mut table = [0u8; SECTOR_SIZE];
        table[4] = 9; // sectors
        table[5] = 1; // heads - 1
        table[2..4].copy_from_slice(&18u16.to_le_bytes()); // cylinder volume
        table[6..10].copy_from_slice(&20u32.to_le_bytes()); // partition 1 LBA
        table[10..14].copy_from_slice(&30u32.to_le_bytes()); // partition 2 LBA
        put_sector(&mut body, 1, &table);

        let mut header = [0u8; SECTOR_SIZE];
        header[0..2].copy_from_slice(&2u16.to_le_bytes());
        header[2..4].copy_from_slice(&4u16.to_le_bytes()); // 4 sectors long
        put_sector(&mut body, 20, &header);
        let mut header = [0u8; SECTOR_SIZE];
        header[0..2].copy_from_slice(&3u16.to_le_bytes());
        header[2..4].copy_from_slice(&5u16.to_le_bytes());
        header[4] = 2; // read-only
        put_sector(&mut body, 30, &header);

        for i in 0..4 {
            let data = [0x60 + i as u8; SECTOR_SIZE];
            put_sector(&mut body, 21 + i, &data);
        }
        image.extend_from_slice(&body);
        image
    }

    #[test]
    fn samara_lists_partitions_with_header_lengths() {
        assert_eq!(samara_probe(&samara_image()), 3);
        let mut volume = SamaraVolume::new(MemStorage::new(samara_image())).unwrap();
        assert_eq!(volume.files().len(), 2);
        assert_eq!(volume.files()[0].name, "Partition 1.dsk");
        assert_eq!(volume.files()[0].first_cluster, 21);
        assert_eq!(volume.files()[0].length, 4 * 512);
        assert!(!volume.files()[0].read_only);
        assert!(volume.files()[1].read_only);
        assert_eq!(volume.files()[1].length, 5 * 512);

        let mut output = Vec::new();
        volume
            .copy_file_to("Partition 1.dsk", &mut output, &mut NonInteractive)
            .unwrap();
        assert_eq!(output.len(), 4 * 512);
        assert_eq!(output[0], 0x60);
        assert_eq!(output[3 * 512], 0x63);
    }

    #[test]
    fn samara_probe_rejects_wrong_partition_indices() {
        let mut image = samara_image();
        // Corrupt partition 2's index byte (stored inverted on disk).
        let offset = (1 + 30) * SECTOR_SIZE;
        image[offset] = !7u8;
        assert_eq!(samara_probe(&image), 0);
    }
}
