//! MongoDB backend implementation for docmap.
//!
//! This crate provides a MongoDB-based implementation of the `StoreBackend` trait.
//! Predicate trees compiled by the mapper are translated into MongoDB query documents,
//! and grouped queries into aggregation pipelines.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docmap = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Features
//!
//! - **Persistent storage** - Data is persisted to MongoDB Atlas or self-hosted MongoDB
//! - **Full query support** - `like` patterns become regular expressions, negation is field-level where possible
//! - **Sessions and transactions** - Operations carrying a session token run inside that session
//!
//! # Example
//!
//! ```ignore
//! use docmap::{backend::StoreBackendBuilder, mongodb::MongoDbStore, prelude::*};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoDbStore::builder("mongodb://localhost:27017", "my_database")
//!         .build()
//!         .await?;
//!     let odm = Odm::new(store, registry);
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_mongodb;

mod query;
pub mod store;

pub use store::{MongoDbStore, MongoDbStoreBuilder};
