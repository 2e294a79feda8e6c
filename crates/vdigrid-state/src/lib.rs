//! vdigrid-state — record store for vdigrid application clusters.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for the two records the autoscaler mutates: `Application` and
//! `Instance`.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Instances use the composite key `{application_id}:{instance_id}` so the
//! instances of one application can be collected with a prefix scan.
//!
//! Consumers program against the `RecordStore` trait; `StateStore` is the
//! redb implementation. It is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{RecordStore, StateStore};
pub use types::*;
