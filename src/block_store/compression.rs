// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::error::{Error, Result};

/// Compresses `data` with zstd at the default level.
///
/// Returns `None` (uncompressed) when the `zstd` feature is disabled, so a
/// caller built without the feature degrades to `compressed=false` rather
/// than failing to build.
pub fn compress(data: &[u8]) -> Option<Vec<u8>> {
    #[cfg(feature = "zstd")]
    {
        zstd::stream::encode_all(data, 0 /* default level */).ok()
    }

    #[cfg(not(feature = "zstd"))]
    {
        let _ = data;
        None
    }
}

/// Decompresses a zstd-compressed payload.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    #[cfg(feature = "zstd")]
    {
        zstd::stream::decode_all(data).map_err(|e| Error::Decompression(e.to_string()))
    }

    #[cfg(not(feature = "zstd"))]
    {
        let _ = data;
        Err(Error::Decompression(
            "crate built without the `zstd` feature, cannot decompress a compressed block".into(),
        ))
    }
}
