//! Convenient re-exports of commonly used types from docmap.
//!
//! ```ignore
//! use docmap::prelude::*;
//! ```
//!
//! This provides access to:
//! - The mapper, its configuration and model instances
//! - Schemas, relations and the registry
//! - Filter building and query execution
//! - Embedded documents and their query builder
//! - Store backends, hooks and error types

pub use bson::{doc, Bson, Document};

pub use docmap_core::{
    backend::{DynStoreBackend, SessionToken, StoreBackend, StoreBackendBuilder},
    collection::Collection,
    embedded::{EmbedMany, EmbedOne, EmbeddedCollection, EmbeddedDoc, EmbeddedMany, EmbeddedOne},
    embedded_query::{Aggregate, EmbeddedQuery},
    error::{OdmError, OdmResult},
    executor::ModelQuery,
    filter::{Boolean, FilterBuilder, Filterable},
    hooks::{HookOutcome, ModelHook, QueryAction, QueryContext},
    model::Model,
    odm::{Odm, OdmBuilder, OdmConfig},
    page::{Paginated, PaginationMeta, PaginationParams},
    query::{Expr, FieldOp, Filter, QueryVisitor, Sort, SortDirection},
    registry::{IdentityNaming, ModelRegistry, NamingStrategy, SnakeCaseNaming},
    relation::{BelongsTo, HasMany, HasOne, RelatedMany, RelatedOne},
    schema::{FieldType, KeyType, ModelSchema, RelationDecl, RelationKind},
};
