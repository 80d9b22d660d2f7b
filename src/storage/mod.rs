// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage tiers behind the [`traits::StorageBackend`] contract.
//!
//! | Tier | Type | Medium |
//! |------|------|--------|
//! | ephemeral | [`ephemeral::EphemeralStore`] | process memory, LRU + TTL |
//! | fast-local | [`fast_local::FastLocalStore`] | JSON file, atomic rewrite |
//! | bulk-local | [`bulk_local::BulkLocalStore`] | SQLite via sqlx |
//! | remote-server | [`remote_server::RemoteServerStore`] | application HTTP API |
//! | remote-object | [`remote_object::RemoteObjectStore`] | object store over HTTP |

pub mod traits;
pub mod ephemeral;
pub mod fast_local;
pub mod bulk_local;
pub(crate) mod http;
pub mod remote_server;
pub mod remote_object;
pub mod memory;
pub mod flaky;
pub mod registry;
