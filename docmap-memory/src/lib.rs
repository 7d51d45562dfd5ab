//! In-memory document storage backend for docmap.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! It uses async-aware read-write locks for concurrent access and is ideal for development
//! and testing.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Full query support** - The complete predicate tree, multi-key sorting, projection and windowing
//! - **Aggregation** - Match, group, sort, skip, limit and project stages
//! - **Sessions** - Token tracking so stale sessions are rejected
//!
//! # Quick Start
//!
//! ```ignore
//! use docmap::{memory::InMemoryStore, prelude::*};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ModelRegistry::builder()
//!         .register(ModelSchema::builder("User").field("name", FieldType::String))
//!         .build()?;
//!     let odm = Odm::new(InMemoryStore::new(), registry);
//!
//!     odm.create("User", doc! { "name": "Alice" }).await?;
//!     assert_eq!(odm.query("User")?.count().await?, 1);
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_memory;

pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder};
