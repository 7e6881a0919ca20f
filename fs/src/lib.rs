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

use chrono::NaiveDateTime;

use dskview_ds::DataStorage;
pub use dskview_err::{Error, Result};

mod entry;
pub mod radix50;
pub mod text;

pub use entry::{add_to_dir_entries, find_entry, find_position, DirEntry, DriverData};

/// Allowed/forbidden filename characters of a volume. `valid` is an
/// allowlist (`None` = everything not denied), `invalid` a denylist.
#[derive(Clone, Copy, Debug)]
pub struct FilenameChars {
    pub valid: Option<&'static str>,
    pub invalid: &'static str,
}

impl FilenameChars {
    pub const fn deny(invalid: &'static str) -> Self {
        Self {
            valid: None,
            invalid,
        }
    }

    pub const fn allow(valid: &'static str) -> Self {
        Self {
            valid: Some(valid),
            invalid: "",
        }
    }
}

/// Capability for interactive decisions during an operation. `confirm`
/// returning `Err(OperationCanceled)` aborts the operation; partial writes
/// already performed are left as-is.
pub trait VolumeCallback {
    fn interactive(&self) -> bool {
        false
    }

    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Callback that never asks and always declines.
pub struct NonInteractive;

impl VolumeCallback for NonInteractive {}

/// A mounted volume: the uniform navigation/mutation contract every
/// filesystem driver implements. Methods a driver does not support keep the
/// default `NotSupported` body.
///
/// All operations are synchronous and blocking; a volume must be used from
/// one logical context at a time. Mutations are sequenced data region →
/// allocation metadata → directory entries, with no journal: a crash between
/// steps leaves the image partially written.
pub trait Volume {
    /// Entries of the current directory. Invalidated by `change_directory`
    /// and by every mutation.
    fn files(&self) -> &[DirEntry];

    fn current_dir_name(&self) -> &str;

    fn max_name_length(&self) -> usize;

    fn filename_chars(&self) -> FilenameChars {
        FilenameChars::deny("/\\:")
    }

    fn case_sensitive(&self) -> bool {
        false
    }

    fn free_space(&mut self) -> Result<u64> {
        Err(Error::NotSupported)
    }

    fn get_entry(&self, name: &str) -> Result<&DirEntry> {
        find_entry(self.files(), name, self.case_sensitive()).ok_or(Error::NoSuchFileOrDirectory)
    }

    /// `"/"` selects the root, `".."` the parent, anything else a child by
    /// exact name (case per `case_sensitive`).
    fn change_directory(&mut self, name: &str) -> Result<()> {
        if name == "/" {
            Ok(())
        } else {
            Err(Error::NotSupported)
        }
    }

    fn copy_file_to(
        &mut self,
        name: &str,
        output: &mut dyn Write,
        callback: &mut dyn VolumeCallback,
    ) -> Result<()>;

    fn add_file(
        &mut self,
        _name: &str,
        _length: u64,
        _input: &mut dyn Read,
        _created: Option<NaiveDateTime>,
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn modify_file(
        &mut self,
        _name: &str,
        _length: u64,
        _input: &mut dyn Read,
        _created: Option<NaiveDateTime>,
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn remove_file(&mut self, _name: &str) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn make_directory(&mut self, _name: &str) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn defragment(&mut self) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// How much of the image the probe pass reads before asking the factories.
pub const PROBE_PREFIX_LEN: u64 = 128 * 1024;

/// A driver's entry in the probe registry. `probe` returns a confidence
/// weight over an image prefix, 0 meaning "not mine".
pub struct VolumeFactory<DS> {
    pub name: &'static str,
    pub probe: fn(&[u8]) -> u32,
    pub open: fn(DS) -> Result<Box<dyn Volume>>,
}

/// Explicit driver registry, assembled by the application at startup so
/// registration order (the tie-break order) is deterministic.
pub struct Registry<DS> {
    factories: Vec<VolumeFactory<DS>>,
}

impl<DS: DataStorage> Registry<DS> {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    pub fn register(&mut self, factory: VolumeFactory<DS>) {
        self.factories.push(factory);
    }

    /// The highest-weighted factory claiming the prefix; earlier
    /// registrations win ties.
    pub fn best_match(&self, prefix: &[u8]) -> Option<&VolumeFactory<DS>> {
        let mut best: Option<&VolumeFactory<DS>> = None;
        let mut best_weight = 0;
        for factory in &self.factories {
            let weight = (factory.probe)(prefix);
            if weight > best_weight {
                best_weight = weight;
                best = Some(factory);
            }
        }
        best
    }

    pub fn mount(&self, ds: DS) -> Result<Box<dyn Volume>> {
        let mut prefix = vec![0; ds.len().min(PROBE_PREFIX_LEN) as usize];
        ds.read(0, &mut prefix)?;
        match self.best_match(&prefix) {
            Some(factory) => {
                log::debug!("Mounting as {}", factory.name);
                (factory.open)(ds)
            }
            None => Err(Error::UnrecognizedVolume),
        }
    }
}

impl<DS: DataStorage> Default for Registry<DS> {
    fn default() -> Self {
        Self::new()
    }
}
