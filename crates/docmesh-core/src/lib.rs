//! # docmesh core
//!
//! Runtime-agnostic logic for docmesh: document identity, the per-project
//! provider registry, revision tracking, conflict detection, and the
//! persistence/provider/replica contracts the sync loop drives.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Storage backends,
//! provider implementations, and the scheduler live in the `docmesh` crate
//! or in the embedding application.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`identity`] | `DocumentUuid`, `ProviderId`, `CompositeId`, text encodings |
//! | [`hash`] | Normalized SHA-256 content hashes |
//! | [`registry`] | Projects, provider migration states, read/write resolution |
//! | [`health`] | Provider freshness and degraded-read labelling |
//! | [`revision`] | Revision records, observations, and outcomes |
//! | [`recorder`] | `record_observation`: no-op / new revision / promotion / conflict |
//! | [`conflict`] | Conflict records, detection, and explicit resolution |
//! | [`assign`] | UUID assignment for newly observed documents |
//! | [`provider`] | Provider contract used by the sync loop |
//! | [`replica`] | Search replica contract |
//! | [`store`] | Revision and cursor persistence contracts |

pub mod assign;
pub mod conflict;
pub mod error;
pub mod hash;
pub mod health;
pub mod identity;
pub mod provider;
pub mod recorder;
pub mod registry;
pub mod replica;
pub mod revision;
pub mod store;

pub use error::CoreError;
