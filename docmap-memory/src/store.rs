//! In-memory storage implementation for the mapper.
//!
//! Collections are insertion-ordered vectors of BSON documents behind async-safe
//! read-write locks. Every operation scans the collection; there are no indexes.

use async_trait::async_trait;
use bson::{oid::ObjectId, Bson, Document};
use mea::rwlock::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::trace;
use uuid::Uuid;

use docmap_core::{
    backend::{SessionToken, StoreBackend, StoreBackendBuilder},
    error::{OdmError, OdmResult},
    eval::{compare_documents, is_nullish, key_string, lookup_path, DocumentEvaluator},
    query::{Accumulator, Expr, FindOptions, Stage},
    schema::ID_FIELD,
};

type StoreMap = HashMap<String, Vec<Document>>;

/// Thread-safe in-memory document storage backend.
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, allowing
/// it to be safely shared across async tasks. Multiple clones of the same instance
/// share the same underlying data.
///
/// Sessions are tracked so that operations carrying an unknown token fail, but writes
/// inside a session are applied immediately; there is no rollback.
///
/// # Example
///
/// ```ignore
/// use docmap_memory::InMemoryStore;
/// use docmap::backend::StoreBackend;
/// use bson::doc;
///
/// let store = InMemoryStore::new();
/// let ids = store.insert_many("users", vec![doc! { "name": "Alice" }], None).await?;
/// assert_eq!(store.count_documents("users", None, None).await?, 1);
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    /// collection name -> documents in insertion order
    store: Arc<RwLock<StoreMap>>,
    sessions: Arc<RwLock<HashSet<Uuid>>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(StoreMap::new())),
            sessions: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    /// Opens a session. Operations may carry its token until it is ended.
    pub async fn start_session(&self) -> SessionToken {
        let token = SessionToken::new();
        self.sessions.write().await.insert(token.id());
        token
    }

    pub async fn end_session(&self, token: SessionToken) -> OdmResult<()> {
        if self.sessions.write().await.remove(&token.id()) {
            Ok(())
        } else {
            Err(OdmError::Configuration(format!("unknown session {token}")))
        }
    }

    /// Names of the collections holding at least one write.
    pub async fn collection_names(&self) -> Vec<String> {
        self.store.read().await.keys().cloned().collect()
    }

    async fn check_session(&self, session: Option<&SessionToken>) -> OdmResult<()> {
        let Some(token) = session else {
            return Ok(());
        };

        if self.sessions.read().await.contains(&token.id()) {
            Ok(())
        } else {
            Err(OdmError::Configuration(format!("unknown session {token}")))
        }
    }

    fn matching<'a>(documents: &'a [Document], filter: Option<&'a Expr>) -> impl Iterator<Item = &'a Document> {
        documents
            .iter()
            .filter(move |document| DocumentEvaluator::matches(document, filter))
    }
}

/// Keeps `_id` and the listed fields. A dotted field keeps its top-level container.
fn project(document: &Document, fields: &[String]) -> Document {
    let mut projected = Document::new();

    if let Some(id) = document.get(ID_FIELD) {
        projected.insert(ID_FIELD, id.clone());
    }

    for field in fields {
        let head = field.split('.').next().unwrap_or(field);
        if let Some(value) = document.get(head) {
            projected.insert(head, value.clone());
        }
    }

    projected
}

/// Sets a possibly dotted path, creating intermediate documents.
fn set_path(document: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(document.get(head), Some(Bson::Document(_))) {
                document.insert(head, Document::new());
            }
            if let Some(Bson::Document(inner)) = document.get_mut(head) {
                set_path(inner, rest, value);
            }
        }
    }
}

fn group(documents: Vec<Document>, keys: &[String], accumulators: &[Accumulator]) -> Vec<Document> {
    let mut groups: Vec<(Document, Vec<Document>)> = Vec::new();

    for document in documents {
        let key = keys
            .iter()
            .map(|field| {
                let value = lookup_path(&document, field).cloned().unwrap_or(Bson::Null);
                (field.clone(), value)
            })
            .collect::<Document>();

        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, members)) => members.push(document),
            None => groups.push((key, vec![document])),
        }
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut row = Document::new();
            row.insert(ID_FIELD, key);

            for accumulator in accumulators {
                match accumulator {
                    Accumulator::Count { output } => {
                        row.insert(output.clone(), members.len() as i64);
                    }
                    Accumulator::First { output, field } => {
                        let value = members
                            .first()
                            .and_then(|first| lookup_path(first, field))
                            .cloned()
                            .unwrap_or(Bson::Null);
                        row.insert(output.clone(), value);
                    }
                }
            }

            row
        })
        .collect()
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn find(&self, collection: &str, filter: Option<&Expr>, options: &FindOptions) -> OdmResult<Vec<Document>> {
        self.check_session(options.session.as_ref()).await?;

        let store = self.store.read().await;
        let Some(documents) = store.get(collection) else {
            return Ok(vec![]);
        };

        let mut matched = Self::matching(documents, filter).cloned().collect::<Vec<_>>();

        if !options.sort.is_empty() {
            matched.sort_by(|a, b| compare_documents(a, b, &options.sort));
        }

        let window = matched
            .into_iter()
            .skip(options.skip.unwrap_or(0) as usize)
            .take(options.limit.map_or(usize::MAX, |limit| limit as usize));

        let documents = match &options.projection {
            Some(fields) => window.map(|document| project(&document, fields)).collect::<Vec<_>>(),
            None => window.collect(),
        };

        trace!(collection, returned = documents.len(), "find");
        Ok(documents)
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>> {
        self.check_session(session).await?;

        let mut store = self.store.write().await;
        let existing = store.entry(collection.to_string()).or_default();

        let mut seen = existing
            .iter()
            .filter_map(|document| document.get(ID_FIELD))
            .map(key_string)
            .collect::<HashSet<_>>();

        let mut prepared = Vec::with_capacity(documents.len());
        for mut document in documents {
            if is_nullish(document.get(ID_FIELD)) {
                document.insert(ID_FIELD, ObjectId::new());
            }

            let id = document.get(ID_FIELD).cloned().unwrap_or(Bson::Null);
            if !seen.insert(key_string(&id)) {
                return Err(OdmError::StoreOperation(format!(
                    "duplicate key {} in collection `{collection}`",
                    key_string(&id)
                )));
            }

            prepared.push((id, document));
        }

        let (ids, documents): (Vec<_>, Vec<_>) = prepared.into_iter().unzip();
        existing.extend(documents);

        trace!(collection, inserted = ids.len(), "insert_many");
        Ok(ids)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        patch: Document,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64> {
        self.check_session(session).await?;

        let mut store = self.store.write().await;
        let Some(documents) = store.get_mut(collection) else {
            return Ok(0);
        };

        let mut matched = 0;
        for document in documents.iter_mut() {
            if !DocumentEvaluator::matches(document, filter) {
                continue;
            }

            for (field, value) in &patch {
                if field != ID_FIELD {
                    set_path(document, field, value.clone());
                }
            }
            matched += 1;
        }

        trace!(collection, matched, "update_many");
        Ok(matched)
    }

    async fn delete_many(&self, collection: &str, filter: Option<&Expr>, session: Option<&SessionToken>) -> OdmResult<u64> {
        self.check_session(session).await?;

        let mut store = self.store.write().await;
        let Some(documents) = store.get_mut(collection) else {
            return Ok(0);
        };

        let before = documents.len();
        documents.retain(|document| !DocumentEvaluator::matches(document, filter));
        let deleted = (before - documents.len()) as u64;

        trace!(collection, deleted, "delete_many");
        Ok(deleted)
    }

    async fn count_documents(&self, collection: &str, filter: Option<&Expr>, session: Option<&SessionToken>) -> OdmResult<u64> {
        self.check_session(session).await?;

        let store = self.store.read().await;
        Ok(store
            .get(collection)
            .map_or(0, |documents| Self::matching(documents, filter).count() as u64))
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>> {
        self.check_session(session).await?;

        let store = self.store.read().await;
        let Some(documents) = store.get(collection) else {
            return Ok(vec![]);
        };

        let mut values: Vec<Bson> = Vec::new();
        for document in Self::matching(documents, filter) {
            let candidates = match lookup_path(document, field) {
                Some(Bson::Array(items)) => items.clone(),
                Some(value) => vec![value.clone()],
                None => continue,
            };

            for value in candidates {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }

        Ok(values)
    }

    async fn aggregate(&self, collection: &str, stages: &[Stage], session: Option<&SessionToken>) -> OdmResult<Vec<Document>> {
        self.check_session(session).await?;

        let mut documents = {
            let store = self.store.read().await;
            store.get(collection).cloned().unwrap_or_default()
        };

        for stage in stages {
            documents = match stage {
                Stage::Match(expr) => documents
                    .into_iter()
                    .filter(|document| DocumentEvaluator::matches(document, Some(expr)))
                    .collect(),
                Stage::Group { keys, accumulators } => group(documents, keys, accumulators),
                Stage::Sort(sorts) => {
                    documents.sort_by(|a, b| compare_documents(a, b, sorts));
                    documents
                }
                Stage::Skip(skip) => documents.into_iter().skip(*skip as usize).collect(),
                Stage::Limit(limit) => documents.into_iter().take(*limit as usize).collect(),
                Stage::Project(fields) => documents
                    .iter()
                    .map(|document| project(document, fields))
                    .collect(),
            };

            trace!(collection, %stage, remaining = documents.len(), "aggregate stage");
        }

        Ok(documents)
    }
}

/// Builder for constructing [`InMemoryStore`] instances, optionally pre-populated.
///
/// # Example
///
/// ```ignore
/// use docmap_memory::InMemoryStore;
/// use docmap::backend::StoreBackendBuilder;
///
/// let store = InMemoryStore::builder()
///     .seed("users", vec![doc! { "name": "Alice" }])
///     .build()
///     .await?;
/// ```
#[derive(Default, Debug)]
pub struct InMemoryStoreBuilder {
    seeds: Vec<(String, Vec<Document>)>,
}

impl InMemoryStoreBuilder {
    /// Documents inserted into `collection` when the store is built.
    pub fn seed(mut self, collection: impl Into<String>, documents: Vec<Document>) -> Self {
        self.seeds.push((collection.into(), documents));
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    async fn build(self) -> OdmResult<Self::Backend> {
        let store = InMemoryStore::new();

        for (collection, documents) in self.seeds {
            store.insert_many(&collection, documents, None).await?;
        }

        Ok(store)
    }
}
