// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::block_key::Tier;

/// Represents errors that can occur anywhere in the tiering stack.
#[derive(Debug)]
pub enum Error {
    /// Filesystem read/write/sync failed.
    Io(std::io::Error),

    /// The index JSON failed to parse. Recoverable by treating the index as empty.
    CorruptIndex(serde_json::Error),

    /// A compressed block failed to decode.
    Decompression(String),

    /// `Put` could not fit the payload on the local tier, even after migrating
    /// the coldest blocks to remote (or no remote is configured / remote is full).
    BudgetExhausted {
        /// Tier that ran out of room.
        tier: Tier,
        /// Bytes requested.
        requested: u64,
        /// Bytes available before the request.
        available: u64,
    },

    /// The page manager's pinned host arena could not grow to fit the request,
    /// and no disk-spill policy is configured.
    HostBudgetExhausted,

    /// A pinned-arena reallocation failed.
    OutOfHostMemory,

    /// The accelerator backend reported a failure.
    Device(String),

    /// The kernel has no instantiation for this head dimension.
    UnsupportedHeadDim(usize),

    /// The context pool is full and cannot accept a new context.
    PoolExhausted,

    /// A requested block does not exist in the index.
    NotFound,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::CorruptIndex(e) => write!(f, "corrupt index: {e}"),
            Self::Decompression(msg) => write!(f, "decompression failed: {msg}"),
            Self::BudgetExhausted {
                tier,
                requested,
                available,
            } => write!(
                f,
                "budget exhausted on {tier:?} tier: requested {requested} bytes, {available} available"
            ),
            Self::HostBudgetExhausted => write!(f, "host pinned-memory budget exhausted"),
            Self::OutOfHostMemory => write!(f, "pinned arena reallocation failed"),
            Self::Device(msg) => write!(f, "device error: {msg}"),
            Self::UnsupportedHeadDim(d) => write!(f, "unsupported head_dim: {d}"),
            Self::PoolExhausted => write!(f, "context pool exhausted"),
            Self::NotFound => write!(f, "block not found"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::CorruptIndex(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
