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

use std::path::Path;

use dskview_ds::{DataStorage, ImageFile};
use dskview_fs::{Registry, Result, Volume};

/// The full driver registry. Registration order is the tie-break order for
/// equal probe weights; the more specific signatures all outweigh the
/// generic ones on their own volumes.
pub fn registry<DS: DataStorage + 'static>() -> Registry<DS> {
    let mut registry = Registry::new();
    registry.register(dskview_fs_fat::factory());
    registry.register(dskview_fs_bk::andos_factory());
    registry.register(dskview_fs_bk::mkdos_factory());
    registry.register(dskview_fs_bk::csidos_factory());
    registry.register(dskview_fs_files11::ods1_factory());
    registry.register(dskview_fs_files11::ods2_factory());
    registry.register(dskview_fs_rt11::factory());
    registry.register(dskview_fs_hdi::altpro_factory());
    registry.register(dskview_fs_hdi::samara_factory());
    registry
}

/// Probes the image file and constructs the best-matching volume driver.
pub fn mount(path: impl AsRef<Path>) -> Result<Box<dyn Volume>> {
    registry().mount(ImageFile::open(path)?)
}
