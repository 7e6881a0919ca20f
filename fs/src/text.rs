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

use encoding_rs::{IBM866, KOI8_R};

use dskview_err::{Error, Result};

/// Filename byte codec of a volume. OEM is the default; the BK family uses
/// KOI-8.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Oem,
    Koi8,
}

impl TextEncoding {
    fn encoding(self) -> &'static encoding_rs::Encoding {
        match self {
            TextEncoding::Oem => IBM866,
            TextEncoding::Koi8 => KOI8_R,
        }
    }

    pub fn decode(self, bytes: &[u8]) -> String {
        let (decoded, _, _) = self.encoding().decode(bytes);
        decoded.into_owned()
    }

    /// Decodes a fixed-width filename field, dropping the space/NUL padding.
    pub fn decode_trimmed(self, bytes: &[u8]) -> String {
        self.decode(bytes)
            .trim_matches(|c| c == ' ' || c == '\0')
            .to_string()
    }

    pub fn encode(self, s: &str) -> Result<Vec<u8>> {
        let (encoded, _, had_errors) = self.encoding().encode(s);
        if had_errors {
            return Err(Error::InvalidArgument);
        }
        Ok(encoded.into_owned())
    }

    /// Encodes into a space-padded fixed-width field, truncating overlength
    /// names.
    pub fn encode_padded(self, s: &str, width: usize) -> Result<Vec<u8>> {
        let mut bytes = self.encode(s)?;
        bytes.resize(width, b' ');
        Ok(bytes)
    }
}

/// Splits a filename at its last dot into name and extension (both may be
/// empty; the dot itself is dropped).
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => (name, ""),
    }
}
