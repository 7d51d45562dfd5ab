#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use docmap::{
    memory::InMemoryStore,
    prelude::*,
    query::{FindOptions, Stage},
};

/// Wraps the in-memory store and records every `find` per collection.
#[derive(Debug, Clone, Default)]
pub struct CountingStore {
    inner: InMemoryStore,
    finds: Arc<Mutex<HashMap<String, usize>>>,
}

impl CountingStore {
    pub fn finds(&self, collection: &str) -> usize {
        self.finds.lock().unwrap().get(collection).copied().unwrap_or(0)
    }

    pub fn total_finds(&self) -> usize {
        self.finds.lock().unwrap().values().sum()
    }

    pub fn reset(&self) {
        self.finds.lock().unwrap().clear();
    }
}

#[async_trait]
impl StoreBackend for CountingStore {
    async fn find(&self, collection: &str, filter: Option<&Expr>, options: &FindOptions) -> OdmResult<Vec<Document>> {
        *self.finds.lock().unwrap().entry(collection.to_string()).or_default() += 1;
        StoreBackend::find(&self.inner, collection, filter, options).await
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>> {
        StoreBackend::insert_many(&self.inner, collection, documents, session).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        patch: Document,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64> {
        StoreBackend::update_many(&self.inner, collection, filter, patch, session).await
    }

    async fn delete_many(&self, collection: &str, filter: Option<&Expr>, session: Option<&SessionToken>) -> OdmResult<u64> {
        StoreBackend::delete_many(&self.inner, collection, filter, session).await
    }

    async fn count_documents(&self, collection: &str, filter: Option<&Expr>, session: Option<&SessionToken>) -> OdmResult<u64> {
        StoreBackend::count_documents(&self.inner, collection, filter, session).await
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>> {
        StoreBackend::distinct(&self.inner, collection, field, filter, session).await
    }

    async fn aggregate(&self, collection: &str, stages: &[Stage], session: Option<&SessionToken>) -> OdmResult<Vec<Document>> {
        StoreBackend::aggregate(&self.inner, collection, stages, session).await
    }
}

/// Users with posts, a profile, a company and embedded addresses, contacts and settings.
pub fn registry() -> ModelRegistry {
    ModelRegistry::builder()
        .register(
            ModelSchema::builder("User")
                .required("name", FieldType::String)
                .field("email", FieldType::String)
                .field("age", FieldType::Int)
                .field("country", FieldType::String)
                .field("status", FieldType::String)
                .timestamps()
                .has_many("posts", "Post")
                .has_one("profile", "Profile")
                .belongs_to("company", "Company")
                .embeds_many("addresses", "Address")
                .embeds_many("contacts", "Contact")
                .embeds_one("settings", "Settings"),
        )
        .register(
            ModelSchema::builder("Post")
                .field("title", FieldType::String)
                .field("views", FieldType::Int)
                .belongs_to("author", "User")
                .has_many("comments", "Comment"),
        )
        .register(ModelSchema::builder("Comment").field("body", FieldType::String))
        .register(ModelSchema::builder("Profile").field("bio", FieldType::String))
        .register(ModelSchema::builder("Company").field("name", FieldType::String))
        .register(
            ModelSchema::builder("Address")
                .field("street", FieldType::String)
                .field("city", FieldType::String),
        )
        .register(
            ModelSchema::builder("Contact")
                .field("firstName", FieldType::String)
                .field("age", FieldType::Int),
        )
        .register(ModelSchema::builder("Settings").field("theme", FieldType::String))
        .build()
        .unwrap()
}

pub fn odm() -> Odm {
    Odm::new(InMemoryStore::new(), registry())
}

pub fn counting_odm() -> (Odm, CountingStore) {
    let store = CountingStore::default();
    (Odm::new(store.clone(), registry()), store)
}
