//! An object-document mapper over pluggable document stores.
//!
//! This crate is the core of the docmap project and provides:
//!
//! - **Schemas and registry** ([`schema`], [`registry`]) - Declaring models, their fields, relations and embedded collections
//! - **Filter compiler** ([`filter`], [`query`]) - Chainable `where`/`or_where` conditions compiled into one predicate tree
//! - **Query executor** ([`executor`]) - Fetching, counting, grouping, paginating and bulk writes over a model
//! - **Relationships** ([`relation`]) - HasOne, HasMany and BelongsTo proxies with bulk preloading
//! - **Embedded documents** ([`embedded`], [`embedded_query`]) - Sub-documents stored inside a parent, with an in-memory query builder
//! - **Model instances** ([`model`]) - Attribute access, dirty tracking and persistence
//! - **Store backend abstraction** ([`backend`], [`collection`]) - Traits for implementing different storage backends
//! - **Hooks** ([`hooks`]) - Vetoing queries, saves and deletes per model
//! - **Error handling** ([`error`]) - Error types and result types
//! - **Pagination** ([`page`]) - Page metadata shared by model and embedded queries
//!
//! # Example
//!
//! ```ignore
//! use docmap::prelude::*;
//!
//! let registry = ModelRegistry::builder()
//!     .register(
//!         ModelSchema::builder("User")
//!             .required("email", FieldType::String)
//!             .has_many("posts", "Post")
//!             .embeds_many("addresses", "Address"),
//!     )
//!     .register(ModelSchema::builder("Post").field("title", FieldType::String))
//!     .register(ModelSchema::builder("Address").field("city", FieldType::String))
//!     .build()?;
//!
//! let odm = Odm::new(InMemoryStore::new(), registry);
//!
//! let users = odm
//!     .query("User")?
//!     .where_like("email", "%@example.com")
//!     .preload("posts")
//!     .fetch()
//!     .await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_core;

pub mod backend;
pub mod collection;
pub mod embedded;
pub mod embedded_query;
pub mod error;
pub mod eval;
pub mod executor;
pub mod filter;
pub mod hooks;
mod loader;
pub mod model;
pub mod odm;
pub mod page;
pub mod query;
pub mod registry;
pub mod relation;
pub mod schema;
