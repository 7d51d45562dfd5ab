//! Main docmap crate: an object-document mapper over pluggable document stores.
//!
//! This crate is the entry point for users of docmap. It re-exports the core types from
//! the sub-crates and gives access to the storage backends.
//!
//! # Features
//!
//! - **Declared models** - Schemas with typed fields, timestamps, relations and embedded collections
//! - **Chainable filters** - `where_*`/`or_where_*` conditions compiled into one predicate tree
//! - **Relationship loading** - HasOne, HasMany and BelongsTo with one query per preloaded relation
//! - **Embedded collections** - Sub-documents with an in-memory query builder
//! - **Multiple backends** - In-memory and MongoDB storage behind one trait
//!
//! # Quick Start
//!
//! ```ignore
//! use docmap::{memory::InMemoryStore, prelude::*};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ModelRegistry::builder()
//!         .register(
//!             ModelSchema::builder("User")
//!                 .required("name", FieldType::String)
//!                 .has_many("posts", "Post")
//!                 .embeds_many("addresses", "Address"),
//!         )
//!         .register(ModelSchema::builder("Post").field("title", FieldType::String))
//!         .register(ModelSchema::builder("Address").field("city", FieldType::String))
//!         .build()?;
//!
//!     let odm = Odm::new(InMemoryStore::new(), registry);
//!
//!     let mut alice = odm.create("User", doc! { "name": "Alice" }).await?;
//!     alice.has_many("posts")?.create(doc! { "title": "Hello" }).await?;
//!     alice.embed_many_mut("addresses")?.create(doc! { "city": "Paris" });
//!     alice.save().await?;
//!
//!     let users = odm
//!         .query("User")?
//!         .where_like("name", "A%")
//!         .preload("posts")
//!         .embed_with("addresses", |q| q.where_eq("city", "Paris"))
//!         .fetch()
//!         .await?;
//!
//!     println!("{}", serde_json::to_string_pretty(&users)?);
//!
//!     odm.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Backends
//!
//! - [`memory`] - Fast in-memory storage for development and testing
//! - [`mongodb`] - Persistent MongoDB backend (requires `mongodb` feature)

pub mod prelude;

pub use docmap_core::{
    backend, collection, embedded, embedded_query, error, eval, executor, filter, hooks, model, odm, page,
    query, registry, relation, schema,
};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend implementations.
pub mod memory {
    pub use docmap_memory::{InMemoryStore, InMemoryStoreBuilder};
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docmap_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}
