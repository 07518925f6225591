// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tier traits and their backends.
//!
//! | Tier          | Trait             | Backends                                   |
//! |---------------|-------------------|--------------------------------------------|
//! | authoritative | [`RemoteStore`]   | [`SqlRemoteStore`], [`MemoryRemoteStore`]  |
//! | local cache   | [`CacheStore`]    | [`SqlCache`], [`MemoryCache`]              |
//! | fallback      | [`FallbackStore`] | [`FileFallback`], [`MemoryFallback`]       |

pub mod file;
pub mod memory;
pub mod sql;
pub mod traits;

pub use file::FileFallback;
pub use memory::{MemoryCache, MemoryFallback, MemoryRemoteStore};
pub use sql::{SqlCache, SqlRemoteStore};
pub use traits::{CacheStore, FallbackStore, RemoteStore};
