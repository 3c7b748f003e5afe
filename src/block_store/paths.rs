// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::block_key::BlockKey;
use std::path::{Path, PathBuf};

/// `<root>/<seq mod 256 as 2-hex-digits>/<key_string>.kvblk`
#[must_use]
pub fn block_file_path(root: &Path, key: &BlockKey) -> PathBuf {
    root.join(key.shard()).join(format!("{}.kvblk", key.to_key_string()))
}

/// `<local_root>/index.json`
#[must_use]
pub fn index_file_path(local_root: &Path) -> PathBuf {
    local_root.join("index.json")
}
