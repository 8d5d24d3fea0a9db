//! # docmesh
//!
//! Keeps documents that live in several storage providers (local Git
//! working trees, Google Drive, remote docmesh peers) addressable by one
//! stable UUID, records every observed revision, and detects conflicts
//! while a project migrates between providers.
//!
//! The storage-agnostic model (identity, registry, revisions, conflicts)
//! lives in `docmesh-core`. This crate adds the SQLite persistence, the
//! search replica, the sync loop, and the CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Providers  │──▶│  Sync loop   │──▶│   SQLite     │
//! │ Local/Drive │   │ assign+record│   │ revisions    │
//! │ Remote peer │   │ conflicts    │   │ conflicts    │
//! └─────────────┘   └──────┬───────┘   │ aliases      │
//!                          │           │ cursors      │
//!                          ▼           └──────────────┘
//!                   ┌──────────────┐
//!                   │Search replica│
//!                   │ (FTS5)       │
//!                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | Revision, conflict, alias, and cursor persistence |
//! | [`replica`] | Search replica over FTS5 |
//! | [`providers`] | Per-project provider registry |
//! | [`sync`] | The polling sync loop |
//! | [`commands`] | CLI command implementations |

pub mod commands;
pub mod config;
pub mod db;
pub mod migrate;
pub mod providers;
pub mod replica;
pub mod sqlite_store;
pub mod sync;

pub use docmesh_core as core;
