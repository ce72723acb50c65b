// Copyright 2023, The Android Open Source Project
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

//! Non-volatile storage of the NFC stack.

use log::{debug, info};
use std::fs;
use std::io;
use std::path::Path;

/// Prefix of the stack's storage files.
pub const STORAGE_PREFIX: &str = "nfaStorage.bin";
/// File wiped on factory reset.
pub const FACTORY_FILE: &str = "nfaStorage.bin1";

/// Create the storage directory and, unless `preserve` is set, delete the
/// storage files left by a previous run.
pub fn prepare(dir: &Path, preserve: bool) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    if preserve {
        debug!("keeping storage in {}", dir.display());
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(STORAGE_PREFIX) && entry.file_type()?.is_file() {
            info!("deleting {}", entry.path().display());
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Delete the file holding factory-resettable state.
pub fn remove_factory_file(dir: &Path) -> io::Result<()> {
    match fs::remove_file(dir.join(FACTORY_FILE)) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
