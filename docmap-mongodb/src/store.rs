use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use futures::TryStreamExt;
use mea::mutex::Mutex;
use mongodb::{
    options::{ClientOptions, FindOptions as MongoFindOptions},
    Client, ClientSession, Collection as MongoCollection,
};
use std::{collections::HashMap, fmt};
use tracing::trace;
use uuid::Uuid;

use docmap_core::{
    backend::{SessionToken, StoreBackend, StoreBackendBuilder},
    error::{OdmError, OdmResult},
    eval::is_nullish,
    query::{Expr, FindOptions, Stage},
    schema::ID_FIELD,
};

use crate::query::{clamp_i64, pipeline, projection_document, sort_document, MongoQueryTranslator};

/// A MongoDB database used as the mapper's store.
///
/// Sessions started through [`MongoDbStore::start_session`] are kept by token; every
/// operation carrying that token runs inside the session, so transactions started on it
/// cover the mapper's reads and writes.
pub struct MongoDbStore {
    client: Client,
    database: String,
    sessions: Mutex<HashMap<Uuid, ClientSession>>,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self {
            client,
            database,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client.database(&self.database).collection(collection_name)
    }

    fn unknown_session(token: &SessionToken) -> OdmError {
        OdmError::Configuration(format!("unknown session {token}"))
    }

    pub async fn start_session(&self) -> OdmResult<SessionToken> {
        let session = self.client.start_session().await.map_err(OdmError::store)?;
        let token = SessionToken::new();

        self.sessions.lock().await.insert(token.id(), session);
        trace!(%token, "session started");

        Ok(token)
    }

    pub async fn start_transaction(&self, token: &SessionToken) -> OdmResult<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&token.id()).ok_or_else(|| Self::unknown_session(token))?;

        session.start_transaction().await.map_err(OdmError::store)
    }

    pub async fn commit_transaction(&self, token: &SessionToken) -> OdmResult<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&token.id()).ok_or_else(|| Self::unknown_session(token))?;

        session.commit_transaction().await.map_err(OdmError::store)
    }

    pub async fn abort_transaction(&self, token: &SessionToken) -> OdmResult<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&token.id()).ok_or_else(|| Self::unknown_session(token))?;

        session.abort_transaction().await.map_err(OdmError::store)
    }

    /// Ends a session. An open transaction on it is aborted by the server.
    pub async fn end_session(&self, token: SessionToken) -> OdmResult<()> {
        self.sessions
            .lock()
            .await
            .remove(&token.id())
            .map(drop)
            .ok_or_else(|| Self::unknown_session(&token))
    }
}

impl fmt::Debug for MongoDbStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoDbStore")
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn find(&self, collection: &str, filter: Option<&Expr>, options: &FindOptions) -> OdmResult<Vec<Document>> {
        let filter = MongoQueryTranslator::filter(filter)?;

        let mut find_options = MongoFindOptions::default();
        find_options.limit = options.limit.map(clamp_i64);
        find_options.skip = options.skip.map(|skip| clamp_i64(skip) as u64);
        if !options.sort.is_empty() {
            find_options.sort = Some(sort_document(&options.sort));
        }
        if let Some(fields) = &options.projection {
            find_options.projection = Some(projection_document(fields));
        }

        let coll = self.get_collection(collection);

        match &options.session {
            Some(token) => {
                let mut sessions = self.sessions.lock().await;
                let session = sessions.get_mut(&token.id()).ok_or_else(|| Self::unknown_session(token))?;

                let mut cursor = coll
                    .find(filter)
                    .with_options(find_options)
                    .session(&mut *session)
                    .await
                    .map_err(OdmError::store)?;

                let mut documents = Vec::new();
                while let Some(document) = cursor.next(&mut *session).await {
                    documents.push(document.map_err(OdmError::store)?);
                }
                Ok(documents)
            }
            None => coll
                .find(filter)
                .with_options(find_options)
                .await
                .map_err(OdmError::store)?
                .try_collect::<Vec<Document>>()
                .await
                .map_err(OdmError::store),
        }
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>> {
        let mut ids = Vec::with_capacity(documents.len());
        let documents = documents
            .into_iter()
            .map(|mut document| {
                if is_nullish(document.get(ID_FIELD)) {
                    document.insert(ID_FIELD, ObjectId::new());
                }
                ids.push(document.get(ID_FIELD).cloned().unwrap_or(Bson::Null));
                document
            })
            .collect::<Vec<_>>();

        let coll = self.get_collection(collection);

        match session {
            Some(token) => {
                let mut sessions = self.sessions.lock().await;
                let session = sessions.get_mut(&token.id()).ok_or_else(|| Self::unknown_session(token))?;
                coll.insert_many(documents).session(session).await
            }
            None => coll.insert_many(documents).await,
        }
        .map_err(OdmError::store)?;

        Ok(ids)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        patch: Document,
        session: Option<&SessionToken>,
    ) -> OdmResult<u64> {
        if patch.is_empty() {
            return self.count_documents(collection, filter, session).await;
        }

        let filter = MongoQueryTranslator::filter(filter)?;
        let update = doc! { "$set": patch };
        let coll = self.get_collection(collection);

        let result = match session {
            Some(token) => {
                let mut sessions = self.sessions.lock().await;
                let session = sessions.get_mut(&token.id()).ok_or_else(|| Self::unknown_session(token))?;
                coll.update_many(filter, update).session(session).await
            }
            None => coll.update_many(filter, update).await,
        }
        .map_err(OdmError::store)?;

        Ok(result.matched_count)
    }

    async fn delete_many(&self, collection: &str, filter: Option<&Expr>, session: Option<&SessionToken>) -> OdmResult<u64> {
        let filter = MongoQueryTranslator::filter(filter)?;
        let coll = self.get_collection(collection);

        let result = match session {
            Some(token) => {
                let mut sessions = self.sessions.lock().await;
                let session = sessions.get_mut(&token.id()).ok_or_else(|| Self::unknown_session(token))?;
                coll.delete_many(filter).session(session).await
            }
            None => coll.delete_many(filter).await,
        }
        .map_err(OdmError::store)?;

        Ok(result.deleted_count)
    }

    async fn count_documents(&self, collection: &str, filter: Option<&Expr>, session: Option<&SessionToken>) -> OdmResult<u64> {
        let filter = MongoQueryTranslator::filter(filter)?;
        let coll = self.get_collection(collection);

        match session {
            Some(token) => {
                let mut sessions = self.sessions.lock().await;
                let session = sessions.get_mut(&token.id()).ok_or_else(|| Self::unknown_session(token))?;
                coll.count_documents(filter).session(session).await
            }
            None => coll.count_documents(filter).await,
        }
        .map_err(OdmError::store)
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionToken>,
    ) -> OdmResult<Vec<Bson>> {
        let filter = MongoQueryTranslator::filter(filter)?;
        let coll = self.get_collection(collection);

        match session {
            Some(token) => {
                let mut sessions = self.sessions.lock().await;
                let session = sessions.get_mut(&token.id()).ok_or_else(|| Self::unknown_session(token))?;
                coll.distinct(field, filter).session(session).await
            }
            None => coll.distinct(field, filter).await,
        }
        .map_err(OdmError::store)
    }

    async fn aggregate(&self, collection: &str, stages: &[Stage], session: Option<&SessionToken>) -> OdmResult<Vec<Document>> {
        let pipeline = pipeline(stages)?;
        let coll = self.get_collection(collection);

        trace!(collection, stages = pipeline.len(), "aggregate");

        match session {
            Some(token) => {
                let mut sessions = self.sessions.lock().await;
                let session = sessions.get_mut(&token.id()).ok_or_else(|| Self::unknown_session(token))?;

                let mut cursor = coll
                    .aggregate(pipeline)
                    .session(&mut *session)
                    .await
                    .map_err(OdmError::store)?;

                let mut documents = Vec::new();
                while let Some(document) = cursor.next(&mut *session).await {
                    documents.push(document.map_err(OdmError::store)?);
                }
                Ok(documents)
            }
            None => coll
                .aggregate(pipeline)
                .await
                .map_err(OdmError::store)?
                .try_collect::<Vec<Document>>()
                .await
                .map_err(OdmError::store),
        }
    }

    async fn shutdown(self) -> OdmResult<()> {
        self.sessions.lock().await.clear();
        self.client.shutdown().await;

        Ok(())
    }
}

pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> OdmResult<Self::Backend> {
        let options = ClientOptions::parse(&self.dsn)
            .await
            .map_err(|e| OdmError::Configuration(e.to_string()))?;
        let client = Client::with_options(options).map_err(|e| OdmError::Configuration(e.to_string()))?;

        Ok(MongoDbStore::new(client, self.database))
    }
}
