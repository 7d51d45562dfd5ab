//! Storage backend abstraction for the mapper.
//!
//! This module defines the traits that abstract over document store implementations,
//! allowing the mapper to work against an in-process store during development and tests
//! and against MongoDB in production.
//!
//! # Overview
//!
//! The [`StoreBackend`] trait provides a unified async interface over one store: find,
//! insert, patch, delete, count, distinct and aggregation. Every call names its collection
//! and carries an optional [`SessionToken`] so a unit of work can be threaded through
//! the backend's own session machinery. The mapper never begins or commits transactions.
//!
//! # Traits
//!
//! - [`StoreBackend`]: The core trait for storage backends
//! - [`DynStoreBackend`]: A trait for dynamic dispatch over backend implementations
//! - [`StoreBackendBuilder`]: Factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use docmap::backend::StoreBackend;
//! use docmap::query::{Filter, FindOptions};
//! use bson::doc;
//!
//! let backend = MyBackendImpl::new();
//!
//! backend.insert_one("users", doc! { "name": "Alice", "age": 30 }, None).await?;
//! let adults = backend
//!     .find("users", Some(&Filter::gte("age", 18)), &FindOptions::new())
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use bson::{Bson, Document};
use std::{any::Any, fmt, fmt::Debug};
use uuid::Uuid;

use crate::{
    error::OdmResult,
    query::{Expr, FindOptions, Stage},
};

/// Opaque handle naming a backend session.
///
/// Tokens are issued by a backend (see the backend crates) and handed to queries and
/// model instances; the mapper only passes them along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(Uuid);

impl SessionToken {
    /// Creates a fresh random token.
    pub fn new() -> Self {
        SessionToken(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        SessionToken(id)
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Abstract interface for document storage backends.
///
/// # Thread Safety
///
/// All implementations must be thread-safe and support concurrent access from multiple
/// async tasks. The exact concurrency model is implementation-specific.
///
/// # Filters
///
/// A `None` filter matches every document of the collection. Filters use stored field
/// names; renaming from logical names happens in the mapper before the call.
///
/// # Error Handling
///
/// Driver failures are reported as [`OdmError::StoreOperation`](crate::error::OdmError)
/// with the driver's message preserved. An unknown session token is a
/// [`OdmError::Configuration`](crate::error::OdmError).
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Returns the documents matching `filter`, honouring projection, sort, skip and limit.
    async fn find(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        options: &FindOptions,
    ) -> OdmResult<Vec<Document>>;

    /// Returns the first matching document, if any.
    async fn find_one(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        options: &FindOptions,
    ) -> OdmResult<Option<Document>> {
        let options = options.clone().with_limit(1);

        Ok(self
            .find(collection, filter, &options)
            .await?
            .into_iter()
            .next())
    }

    /// Inserts documents, generating `_id` where missing.
    ///
    /// # Returns
    ///
    /// The `_id` of every inserted document, in input order.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>>;

    /// Inserts one document and returns its `_id`.
    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        session: Option<&SessionToken>,
    ) -> OdmResult<Bson> {
        Ok(self
            .insert_many(collection, vec![document], session)
            .await?
            .into_iter()
            .next()
            .unwrap_or(Bson::Null))
    }

    /// Applies `patch` as a field-level `$set` to every matching document.
    ///
    /// # Returns
    ///
    /// The number of matched documents.
    async fn update_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        patch: Document,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64>;

    /// Deletes every matching document and returns how many were removed.
    async fn delete_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64>;

    async fn count_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64>;

    /// Distinct values of `field` among matching documents. Array values are unwound.
    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>>;

    /// Runs an aggregation pipeline over the collection.
    async fn aggregate(
        &self,
        collection: &str,
        stages: &[Stage],
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Document>>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op, but backends with external connections
    /// should override this.
    async fn shutdown(self) -> OdmResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[async_trait]
pub trait DynStoreBackend: Send + Sync + Debug {
    async fn find(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        options: &FindOptions,
    ) -> OdmResult<Vec<Document>>;
    async fn find_one(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        options: &FindOptions,
    ) -> OdmResult<Option<Document>>;
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>>;
    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        session: Option<&SessionToken>,
    ) -> OdmResult<Bson>;
    async fn update_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        patch: Document,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64>;
    async fn delete_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64>;
    async fn count_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64>;
    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>>;
    async fn aggregate(
        &self,
        collection: &str,
        stages: &[Stage],
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Document>>;
    async fn shutdown_boxed(self: Box<Self>) -> OdmResult<()>;

    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

#[async_trait]
impl<B: StoreBackend + Send + Sync + 'static> DynStoreBackend for B {
    async fn find(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        options: &FindOptions,
    ) -> OdmResult<Vec<Document>> {
        StoreBackend::find(self, collection, filter, options).await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        options: &FindOptions,
    ) -> OdmResult<Option<Document>> {
        StoreBackend::find_one(self, collection, filter, options).await
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>> {
        StoreBackend::insert_many(self, collection, documents, session).await
    }

    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        session: Option<&SessionToken>,
    ) -> OdmResult<Bson> {
        StoreBackend::insert_one(self, collection, document, session).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        patch: Document,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64> {
        StoreBackend::update_many(self, collection, filter, patch, session).await
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64> {
        StoreBackend::delete_many(self, collection, filter, session).await
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64> {
        StoreBackend::count_documents(self, collection, filter, session).await
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>> {
        StoreBackend::distinct(self, collection, field, filter, session).await
    }

    async fn aggregate(
        &self,
        collection: &str,
        stages: &[Stage],
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Document>> {
        StoreBackend::aggregate(self, collection, stages, session).await
    }

    async fn shutdown_boxed(self: Box<Self>) -> OdmResult<()> {
        StoreBackend::shutdown(*self).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> OdmResult<Self::Backend>;
}
