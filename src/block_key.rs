// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The addressable unit of the [`crate::block_store`]: one (sequence, layer, position, K-or-V) row.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sequence identifier, scoped to the runtime's generation session.
pub type SeqId = u64;

/// Layer index within the transformer stack.
pub type LayerIdx = u32;

/// Token position within a sequence.
pub type Position = u64;

/// Identifies a single stored KV row.
///
/// `(begin, end)` permits future grouping of multiple positions, but a block
/// holds exactly one `(layer, position, K-or-V)` row in this implementation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub seq: SeqId,
    pub layer: LayerIdx,
    pub begin_pos: Position,
    pub end_pos: Position,
    pub is_key: bool,
}

impl BlockKey {
    /// Constructs the key for a single-position K or V row.
    #[must_use]
    pub fn row(seq: SeqId, layer: LayerIdx, pos: Position, is_key: bool) -> Self {
        Self {
            seq,
            layer,
            begin_pos: pos,
            end_pos: pos + 1,
            is_key,
        }
    }

    /// The on-disk/in-index string form: `seq<S>_L<L>_{k|v}_p<B>-<E>`.
    #[must_use]
    pub fn to_key_string(&self) -> String {
        format!(
            "seq{}_L{}_{}_p{}-{}",
            self.seq,
            self.layer,
            if self.is_key { "k" } else { "v" },
            self.begin_pos,
            self.end_pos
        )
    }

    /// The shard directory (`seq mod 256`, as two lowercase hex digits).
    #[must_use]
    pub fn shard(&self) -> String {
        format!("{:02x}", self.seq % 256)
    }

    /// Whether this key's range overlaps `[begin, end)`.
    #[must_use]
    pub fn overlaps(&self, begin: Position, end: Position) -> bool {
        self.begin_pos < end && begin < self.end_pos
    }
}

/// Which storage tier a block currently lives on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Local,
    Remote,
}

/// Per-block record persisted as part of the [`crate::block_store::Index`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub key: BlockKey,
    /// Original element dtype tag, e.g. `"f16"`.
    pub dtype: String,
    /// Original tensor shape, ordered dimensions.
    pub shape: Vec<u64>,
    /// Uncompressed byte size (shape-product * elem_bytes).
    pub size_bytes: u64,
    pub compressed: bool,
    pub tier: Tier,
    /// Unix-epoch seconds internally; (de)serialized as RFC 3339 on disk,
    /// per §6's on-disk index format.
    #[serde(with = "rfc3339_epoch_secs")]
    pub stored_at: u64,
    #[serde(with = "rfc3339_epoch_secs")]
    pub accessed_at: u64,
}

/// (De)serializes a Unix-epoch-seconds `u64` as an RFC 3339 string, so
/// `index.json` reads the way §6 documents it while the rest of the crate
/// (LRU ordering, tie-breaks) keeps comparing plain integers.
mod rfc3339_epoch_secs {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(secs: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        let dt = DateTime::<Utc>::from_timestamp(*secs as i64, 0).ok_or_else(|| serde::ser::Error::custom("timestamp out of range"))?;
        dt.to_rfc3339().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let dt = DateTime::parse_from_rfc3339(&raw).map_err(serde::de::Error::custom)?;
        Ok(dt.timestamp().max(0) as u64)
    }
}

impl BlockMeta {
    /// Byte size of the payload actually read from Get, before decompression
    /// bookkeeping -- always the uncompressed size, per the invariant in §3.
    #[must_use]
    pub fn uncompressed_size(&self) -> u64 {
        self.size_bytes
    }
}

/// Unix-epoch seconds, used for `stored_at`/`accessed_at`.
///
/// The on-disk index format documents these fields as RFC 3339 (see
/// [`rfc3339_epoch_secs`]), but internal bookkeeping (LRU ordering,
/// tie-breaks) only needs a monotonically comparable integer, so epoch
/// seconds are the representation everywhere except the JSON boundary.
#[must_use]
pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
