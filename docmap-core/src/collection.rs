//! Collection handle used by the executor and by model persistence.
//!
//! A [`Collection`] binds a collection name to the [`Odm`](crate::odm::Odm)'s backend and
//! logs every store round-trip at `debug`.
//!
//! # Example
//!
//! ```ignore
//! let users = odm.collection("users");
//! let n = users.count(Some(&Filter::eq("active", true)), None).await?;
//! ```

use bson::{Bson, Document};
use tracing::debug;

use crate::{
    backend::{DynStoreBackend, SessionToken},
    error::OdmResult,
    query::{Expr, FindOptions, Stage},
};

/// An untyped collection with a reference to a storage backend.
#[derive(Debug, Clone, Copy)]
pub struct Collection<'a> {
    name: &'a str,
    backend: &'a dyn DynStoreBackend,
}

impl<'a> Collection<'a> {
    pub(crate) fn new(name: &'a str, backend: &'a dyn DynStoreBackend) -> Self {
        Self { name, backend }
    }

    /// Returns the name of this collection.
    pub fn name(&self) -> &str {
        self.name
    }

    pub async fn find(&self, filter: Option<&Expr>, options: &FindOptions) -> OdmResult<Vec<Document>> {
        debug!(collection = self.name, ?filter, limit = ?options.limit, skip = ?options.skip, "find");
        let documents = self.backend.find(self.name, filter, options).await?;
        debug!(collection = self.name, returned = documents.len(), "find completed");

        Ok(documents)
    }

    pub async fn find_one(&self, filter: Option<&Expr>, options: &FindOptions) -> OdmResult<Option<Document>> {
        debug!(collection = self.name, ?filter, "find_one");
        Ok(self.backend.find_one(self.name, filter, options).await?)
    }

    /// Inserts one document and returns its `_id`.
    pub async fn insert_one(&self, document: Document, session: Option<&SessionToken>) -> OdmResult<Bson> {
        debug!(collection = self.name, "insert_one");
        Ok(self.backend.insert_one(self.name, document, session).await?)
    }

    pub async fn insert_many(&self, documents: Vec<Document>, session: Option<&SessionToken>) -> OdmResult<Vec<Bson>> {
        debug!(collection = self.name, count = documents.len(), "insert_many");
        Ok(self.backend.insert_many(self.name, documents, session).await?)
    }

    /// Applies `patch` as a `$set` to every matching document.
    pub async fn update_many(
        &self,
        filter: Option<&Expr>,
        patch: Document,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64> {
        debug!(collection = self.name, ?filter, fields = patch.len(), "update_many");
        let matched = self.backend.update_many(self.name, filter, patch, session).await?;
        debug!(collection = self.name, matched, "update_many completed");

        Ok(matched)
    }

    pub async fn delete_many(&self, filter: Option<&Expr>, session: Option<&SessionToken>) -> OdmResult<u64> {
        debug!(collection = self.name, ?filter, "delete_many");
        let deleted = self.backend.delete_many(self.name, filter, session).await?;
        debug!(collection = self.name, deleted, "delete_many completed");

        Ok(deleted)
    }

    pub async fn count(&self, filter: Option<&Expr>, session: Option<&SessionToken>) -> OdmResult<u64> {
        debug!(collection = self.name, ?filter, "count_documents");
        Ok(self.backend.count_documents(self.name, filter, session).await?)
    }

    pub async fn distinct(
        &self,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>> {
        debug!(collection = self.name, field, ?filter, "distinct");
        Ok(self.backend.distinct(self.name, field, filter, session).await?)
    }

    pub async fn aggregate(&self, stages: &[Stage], session: Option<&SessionToken>) -> OdmResult<Vec<Document>> {
        debug!(collection = self.name, stages = stages.len(), "aggregate");
        let documents = self.backend.aggregate(self.name, stages, session).await?;
        debug!(collection = self.name, returned = documents.len(), "aggregate completed");

        Ok(documents)
    }
}
