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

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use log::debug;

pub use dskview_err::{Error, Result};

/// Seekable random-access byte store backing a disk image.
///
/// A store starts read-only; the first mutating operation on a volume requests
/// `make_writable`, which may fail silently — subsequent `write` calls then
/// return `Error::ReadOnly`.
pub trait DataStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&mut self, offset: u64, buffer: &[u8]) -> Result<()>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether the store is writable after the call.
    fn make_writable(&mut self) -> bool;

    fn flush(&mut self) -> Result<()>;
}

/// Disk-image file on the local filesystem, opened read-only until promoted.
pub struct ImageFile {
    file: File,
    file_path: PathBuf,
    length: u64,
    writable: bool,
    promoted: bool,
}

impl ImageFile {
    pub fn open(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();
        let file = File::open(&file_path)?;
        let length = file.metadata()?.len();
        Ok(Self {
            file,
            file_path,
            length,
            writable: false,
            promoted: false,
        })
    }
}

impl DataStorage for ImageFile {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buffer, offset)?;
        Ok(())
    }

    fn write(&mut self, offset: u64, buffer: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.file.write_all_at(buffer, offset)?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.length
    }

    fn make_writable(&mut self) -> bool {
        if !self.promoted {
            self.promoted = true;
            match OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.file_path)
            {
                Ok(file) => {
                    self.file = file;
                    self.writable = true;
                }
                Err(error) => {
                    debug!(
                        "Cannot reopen {} for writing ({error}), staying read-only",
                        self.file_path.display()
                    );
                }
            }
        }
        self.writable
    }

    fn flush(&mut self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// In-memory byte store, used by the tests and for probing image prefixes.
pub struct MemStorage {
    data: Vec<u8>,
    writable: bool,
}

impl MemStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            writable: true,
        }
    }

    pub fn read_only(data: Vec<u8>) -> Self {
        Self {
            data,
            writable: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl DataStorage for MemStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let offset = offset as usize;
        let end = offset + buffer.len();
        if end > self.data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of image",
            )));
        }
        buffer.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buffer: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let offset = offset as usize;
        let end = offset + buffer.len();
        if end > self.data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "write past end of image",
            )));
        }
        self.data[offset..end].copy_from_slice(buffer);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn make_writable(&mut self) -> bool {
        self.writable = true;
        true
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_storage_round_trip() {
        let mut ds = MemStorage::new(vec![0; 1024]);
        ds.write(512, b"hello").unwrap();
        let mut buffer = [0; 5];
        ds.read(512, &mut buffer).unwrap();
        assert_eq!(&buffer, b"hello");
    }

    #[test]
    fn mem_storage_read_only_until_promoted() {
        let mut ds = MemStorage::read_only(vec![0; 512]);
        assert!(matches!(ds.write(0, &[1]), Err(Error::ReadOnly)));
        assert!(ds.make_writable());
        ds.write(0, &[1]).unwrap();
        assert_eq!(ds.data()[0], 1);
    }

    #[test]
    fn mem_storage_rejects_out_of_bounds() {
        let ds = MemStorage::new(vec![0; 512]);
        let mut buffer = [0; 16];
        assert!(ds.read(500, &mut buffer).is_err());
    }

    #[test]
    fn image_file_promotes_to_read_write() {
        let path = std::env::temp_dir().join(format!("dskview-ds-test-{}", std::process::id()));
        std::fs::write(&path, vec![0u8; 1024]).unwrap();

        let mut ds = ImageFile::open(&path).unwrap();
        assert_eq!(ds.len(), 1024);
        assert!(matches!(ds.write(0, &[0xA5]), Err(Error::ReadOnly)));
        assert!(ds.make_writable());
        ds.write(0, &[0xA5]).unwrap();
        ds.flush().unwrap();

        let mut buffer = [0; 1];
        ds.read(0, &mut buffer).unwrap();
        assert_eq!(buffer[0], 0xA5);

        std::fs::remove_file(&path).unwrap();
    }
}
