//! The mapper handle.
//!
//! [`Odm`] ties a storage backend to a [`ModelRegistry`] and is the entry point for
//! queries, instance construction and raw collection access. It is cheap to clone; all
//! clones share one backend.
//!
//! # Example
//!
//! ```ignore
//! let registry = ModelRegistry::builder()
//!     .register(ModelSchema::builder("User").field("name", FieldType::String).has_many("posts", "Post"))
//!     .register(ModelSchema::builder("Post").field("title", FieldType::String))
//!     .build()?;
//!
//! let odm = Odm::new(InMemoryStore::new(), registry);
//! let user = odm.create("User", doc! { "name": "Ada" }).await?;
//! ```

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    backend::{DynStoreBackend, StoreBackend},
    collection::Collection,
    error::{OdmError, OdmResult},
    executor::ModelQuery,
    filter::Filterable,
    model::Model,
    registry::ModelRegistry,
    schema::ModelSchema,
};

/// Mapper-wide settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct OdmConfig {
    /// Page size used when `paginate` is called with `per_page == 0`.
    pub default_per_page: u64,
    /// Base of the page URLs in pagination metadata.
    pub pagination_base_url: String,
}

impl Default for OdmConfig {
    fn default() -> Self {
        Self {
            default_per_page: 20,
            pagination_base_url: "/".to_string(),
        }
    }
}

#[derive(Debug)]
struct OdmInner {
    backend: Box<dyn DynStoreBackend>,
    registry: ModelRegistry,
    config: OdmConfig,
}

/// A storage backend plus the registered models.
#[derive(Debug, Clone)]
pub struct Odm {
    inner: Arc<OdmInner>,
}

impl Odm {
    /// Creates a mapper with the default configuration.
    pub fn new(backend: impl StoreBackend + 'static, registry: ModelRegistry) -> Self {
        Self::from_parts(Box::new(backend), registry, OdmConfig::default())
    }

    pub fn builder() -> OdmBuilder {
        OdmBuilder::default()
    }

    fn from_parts(backend: Box<dyn DynStoreBackend>, registry: ModelRegistry, config: OdmConfig) -> Self {
        Self {
            inner: Arc::new(OdmInner {
                backend,
                registry,
                config,
            }),
        }
    }

    pub fn config(&self) -> &OdmConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    /// The schema of a registered model.
    pub fn schema(&self, model: &str) -> OdmResult<Arc<ModelSchema>> {
        self.inner.registry.resolve(model)
    }

    pub fn backend(&self) -> &dyn DynStoreBackend {
        self.inner.backend.as_ref()
    }

    /// The backend as its concrete type, if it is a `B`.
    pub fn backend_as<B: 'static>(&self) -> Option<&B> {
        self.inner.backend.as_any().downcast_ref::<B>()
    }

    /// Raw access to a collection by name.
    pub fn collection<'a>(&'a self, name: &'a str) -> Collection<'a> {
        Collection::new(name, self.inner.backend.as_ref())
    }

    /// Starts a query over a registered model.
    pub fn query(&self, model: &str) -> OdmResult<ModelQuery> {
        Ok(ModelQuery::new(self.clone(), self.schema(model)?))
    }

    /// A new, unsaved instance of a registered model.
    pub fn model(&self, model: &str) -> OdmResult<Model> {
        Model::new(self.clone(), self.schema(model)?)
    }

    /// Builds an instance from `attributes` and saves it.
    pub async fn create(&self, model: &str, attributes: Document) -> OdmResult<Model> {
        let mut instance = self.model(model)?;
        instance.merge(attributes);
        instance.save().await?;

        Ok(instance)
    }

    pub async fn create_many(
        &self,
        model: &str,
        attributes: impl IntoIterator<Item = Document>,
    ) -> OdmResult<Vec<Model>> {
        let mut created = Vec::new();
        for attributes in attributes {
            created.push(self.create(model, attributes).await?);
        }

        Ok(created)
    }

    /// Looks an instance up by primary key.
    pub async fn find(&self, model: &str, id: impl Into<Bson>) -> OdmResult<Option<Model>> {
        let schema = self.schema(model)?;
        let primary_key = schema.primary_key().to_string();

        ModelQuery::new(self.clone(), schema)
            .where_eq(primary_key, id)
            .first()
            .await
    }

    pub async fn find_or_fail(&self, model: &str, id: impl Into<Bson>) -> OdmResult<Model> {
        self.find(model, id).await?.ok_or_else(|| OdmError::NotFound {
            model: model.to_string(),
        })
    }

    /// Shuts the backend down.
    ///
    /// # Errors
    ///
    /// [`OdmError::InvalidState`] while other clones of this handle are alive.
    pub async fn shutdown(self) -> OdmResult<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner.backend.shutdown_boxed().await,
            Err(_) => Err(OdmError::InvalidState(
                "cannot shut down while other mapper handles are alive".to_string(),
            )),
        }
    }
}

/// Builder for [`Odm`].
#[derive(Debug, Default)]
pub struct OdmBuilder {
    backend: Option<Box<dyn DynStoreBackend>>,
    registry: Option<ModelRegistry>,
    config: OdmConfig,
}

impl OdmBuilder {
    pub fn backend(mut self, backend: impl StoreBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: OdmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn default_per_page(mut self, per_page: u64) -> Self {
        self.config.default_per_page = per_page.max(1);
        self
    }

    pub fn pagination_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.pagination_base_url = base_url.into();
        self
    }

    pub fn build(self) -> OdmResult<Odm> {
        let backend = self
            .backend
            .ok_or_else(|| OdmError::Configuration("no storage backend configured".to_string()))?;

        Ok(Odm::from_parts(
            backend,
            self.registry.unwrap_or_default(),
            self.config,
        ))
    }
}
