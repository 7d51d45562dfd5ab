//! The query executor.
//!
//! A [`ModelQuery`] is a schema-bound filter builder plus the options of one store
//! round-trip: projection, sorting, windowing, session, relations to preload, embedded
//! views to apply and an optional grouping. Terminal operations (`fetch`, `first`,
//! `count`, `paginate`, `update`, `delete`, ...) compile the filter with
//! [`FilterBuilder::final_filters`], consult the schema's query hooks and run against
//! the backend.
//!
//! Field names given to a query are logical. They are translated to stored names,
//! and key-typed values are converted, before reaching the store.
//!
//! # Example
//!
//! ```ignore
//! let posts = odm
//!     .query("Post")?
//!     .where_op("views", ">", 100)
//!     .or_where("featured", true)
//!     .order_by("createdAt", SortDirection::Desc)
//!     .preload("author")
//!     .preload_with("comments", |q| q.where_eq("approved", true))
//!     .limit(10)
//!     .fetch()
//!     .await?;
//! ```

use bson::{Bson, DateTime, Document};
use futures::future::BoxFuture;
use std::{fmt, sync::Arc};
use tracing::debug;

use crate::{
    backend::SessionToken,
    embedded,
    embedded_query::EmbeddedQuery,
    error::{OdmError, OdmResult},
    filter::{Boolean, FilterBuilder, Filterable},
    hooks::{self, HookOutcome, QueryAction, QueryContext},
    loader,
    model::Model,
    odm::Odm,
    page::{Paginated, PaginationMeta, PaginationParams},
    query::{Accumulator, Expr, FindOptions, Sort, SortDirection, Stage},
    schema::{ModelSchema, ID_FIELD},
};

/// Output field of the per-group document count.
pub const GROUP_COUNT_FIELD: &str = "count";

type PreloadConstraint = Box<dyn FnOnce(ModelQuery) -> ModelQuery + Send + Sync>;
type EmbedConstraint = Arc<dyn Fn(EmbeddedQuery) -> EmbeddedQuery + Send + Sync>;

/// A relation to load in bulk after the primary fetch.
pub(crate) struct Preload {
    pub(crate) name: String,
    pub(crate) constraint: Option<PreloadConstraint>,
    pub(crate) nested: Vec<Preload>,
}

impl Preload {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            constraint: None,
            nested: Vec::new(),
        }
    }

    /// Adds a dotted relation path, merging with already requested prefixes. The
    /// constraint applies to the last segment.
    fn insert(preloads: &mut Vec<Preload>, path: &str, constraint: Option<PreloadConstraint>) {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        let index = match preloads.iter().position(|p| p.name == head) {
            Some(index) => index,
            None => {
                preloads.push(Preload::new(head));
                preloads.len() - 1
            }
        };

        match rest {
            Some(rest) => Preload::insert(&mut preloads[index].nested, rest, constraint),
            None => {
                if constraint.is_some() {
                    preloads[index].constraint = constraint;
                }
            }
        }
    }
}

impl fmt::Debug for Preload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preload")
            .field("name", &self.name)
            .field("constrained", &self.constraint.is_some())
            .field("nested", &self.nested)
            .finish()
    }
}

/// An embedded field whose in-memory view is narrowed after fetching.
#[derive(Clone)]
pub(crate) struct EmbedLoad {
    name: String,
    constraint: Option<EmbedConstraint>,
}

/// A query over one model type.
pub struct ModelQuery {
    odm: Odm,
    schema: Arc<ModelSchema>,
    filters: FilterBuilder,
    projection: Option<Vec<String>>,
    sorts: Vec<Sort>,
    skip: Option<u64>,
    limit: Option<u64>,
    session: Option<SessionToken>,
    preloads: Vec<Preload>,
    embeds: Vec<EmbedLoad>,
    group_by: Vec<String>,
    having: FilterBuilder,
}

impl fmt::Debug for ModelQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelQuery")
            .field("model", &self.schema.name())
            .field("filters", &self.filters)
            .field("projection", &self.projection)
            .field("sorts", &self.sorts)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .field("session", &self.session)
            .field("preloads", &self.preloads)
            .field("embeds", &self.embeds.iter().map(|e| e.name.as_str()).collect::<Vec<_>>())
            .field("group_by", &self.group_by)
            .finish()
    }
}

impl ModelQuery {
    pub(crate) fn new(odm: Odm, schema: Arc<ModelSchema>) -> Self {
        Self {
            odm,
            filters: FilterBuilder::for_schema(schema.clone()),
            schema,
            projection: None,
            sorts: Vec::new(),
            skip: None,
            limit: None,
            session: None,
            preloads: Vec::new(),
            embeds: Vec::new(),
            group_by: Vec::new(),
            having: FilterBuilder::new(),
        }
    }

    pub fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    /// The compiled filter, in stored field names.
    pub fn compiled_filter(&self) -> OdmResult<Option<Expr>> {
        self.filters.final_filters()
    }

    /// Restricts the returned fields. The primary key is always returned.
    pub fn select<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a sort key. Earlier calls take precedence.
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sorts.push(Sort::new(field, direction));
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn offset(self, offset: u64) -> Self {
        self.skip(offset)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Windows the query to one page (1-indexed).
    pub fn for_page(self, page: u64, per_page: u64) -> Self {
        let params = PaginationParams::new(page, per_page);
        self.skip(params.offset()).limit(params.per_page)
    }

    /// Runs the query and everything it loads within `session`.
    pub fn with_session(mut self, session: Option<SessionToken>) -> Self {
        self.session = session;
        self
    }

    /// Loads a relation of every fetched instance in one extra query. Dotted paths
    /// load nested relations.
    pub fn preload(mut self, relation: &str) -> Self {
        Preload::insert(&mut self.preloads, relation, None);
        self
    }

    /// Like [`preload`](Self::preload), with extra constraints on the related query.
    pub fn preload_with(
        mut self,
        relation: &str,
        constraint: impl FnOnce(ModelQuery) -> ModelQuery + Send + Sync + 'static,
    ) -> Self {
        Preload::insert(&mut self.preloads, relation, Some(Box::new(constraint)));
        self
    }

    pub(crate) fn with_preloads(mut self, preloads: Vec<Preload>) -> Self {
        self.preloads.extend(preloads);
        self
    }

    /// Requires `name` to be an embedded field of the model.
    pub fn embed(mut self, name: impl Into<String>) -> Self {
        self.embeds.push(EmbedLoad {
            name: name.into(),
            constraint: None,
        });
        self
    }

    /// Narrows the in-memory view of an embedded field on every fetched instance. The
    /// stored value is not affected.
    pub fn embed_with(
        mut self,
        name: impl Into<String>,
        constraint: impl Fn(EmbeddedQuery) -> EmbeddedQuery + Send + Sync + 'static,
    ) -> Self {
        self.embeds.push(EmbedLoad {
            name: name.into(),
            constraint: Some(Arc::new(constraint)),
        });
        self
    }

    /// Groups matching documents by `fields`. Fetching then returns one detached
    /// instance per group carrying the key fields, `count` and the first value of each
    /// selected field.
    pub fn group_by<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.group_by.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Filters groups after aggregation.
    pub fn having(mut self, having: impl FnOnce(FilterBuilder) -> FilterBuilder) -> Self {
        self.having = having(self.having);
        self
    }

    fn aborted(schema: &ModelSchema, action: QueryAction, filter: Option<&Expr>) -> bool {
        let context = QueryContext {
            model: schema.name(),
            action,
            filter,
        };

        match hooks::run(schema.hooks(), |hook| hook.before_query(&context)) {
            HookOutcome::Abort(reason) => {
                debug!(model = schema.name(), ?action, %reason, "query aborted by hook");
                true
            }
            HookOutcome::Continue => false,
        }
    }

    /// Runs the query.
    pub async fn fetch(self) -> OdmResult<Vec<Model>> {
        if !self.group_by.is_empty() {
            return self.fetch_groups().await;
        }

        let ModelQuery {
            odm,
            schema,
            filters,
            projection,
            sorts,
            skip,
            limit,
            session,
            preloads,
            embeds,
            ..
        } = self;

        let filter = filters.final_filters()?;
        if Self::aborted(&schema, QueryAction::Find, filter.as_ref()) {
            return Ok(Vec::new());
        }

        for embed in &embeds {
            schema.require_embed(&embed.name)?;
        }

        let options = FindOptions {
            projection: projection.map(|fields| fields.iter().map(|f| schema.stored_name(f)).collect()),
            sort: sorts
                .into_iter()
                .map(|s| Sort::new(schema.stored_name(&s.field), s.direction))
                .collect(),
            skip,
            limit,
            session,
        };

        let documents = odm
            .collection(schema.collection())
            .find(filter.as_ref(), &options)
            .await?;

        let mut models = documents
            .into_iter()
            .map(|document| Model::hydrate(odm.clone(), schema.clone(), document, session))
            .collect::<OdmResult<Vec<_>>>()?;

        if !models.is_empty() && !preloads.is_empty() {
            loader::load_relations(&odm, &schema, &mut models, preloads, session).await?;
        }

        for embed in &embeds {
            if let Some(constraint) = &embed.constraint {
                for model in models.iter_mut() {
                    model.apply_embed_view(&embed.name, constraint.as_ref())?;
                }
            }
        }

        Ok(models)
    }

    /// Alias of [`fetch`](Self::fetch).
    pub async fn all(self) -> OdmResult<Vec<Model>> {
        self.fetch().await
    }

    pub(crate) fn fetch_boxed(self) -> BoxFuture<'static, OdmResult<Vec<Model>>> {
        Box::pin(self.fetch())
    }

    pub async fn first(self) -> OdmResult<Option<Model>> {
        Ok(self.limit(1).fetch().await?.into_iter().next())
    }

    /// Like [`first`](Self::first), failing with [`OdmError::NotFound`] when nothing
    /// matches.
    pub async fn first_or_fail(self) -> OdmResult<Model> {
        let model = self.schema.name().to_string();
        self.first().await?.ok_or(OdmError::NotFound { model })
    }

    fn group_field(&self, field: &str) -> String {
        let stored = self.schema.stored_name(field);

        if self.group_by.iter().any(|key| key == field) {
            format!("{ID_FIELD}.{stored}")
        } else {
            stored
        }
    }

    async fn fetch_groups(self) -> OdmResult<Vec<Model>> {
        let filter = self.filters.final_filters()?;
        if Self::aborted(&self.schema, QueryAction::Aggregate, filter.as_ref()) {
            return Ok(Vec::new());
        }

        let keys = self
            .group_by
            .iter()
            .map(|field| self.schema.stored_name(field))
            .collect::<Vec<_>>();

        let mut accumulators = vec![Accumulator::Count {
            output: GROUP_COUNT_FIELD.to_string(),
        }];
        for field in self.projection.iter().flatten() {
            if !self.group_by.contains(field) {
                let stored = self.schema.stored_name(field);
                accumulators.push(Accumulator::First {
                    output: stored.clone(),
                    field: stored,
                });
            }
        }

        let mut stages = Vec::new();
        if let Some(filter) = filter {
            stages.push(Stage::Match(filter));
        }
        stages.push(Stage::Group { keys, accumulators });
        if let Some(having) = self.having.final_filters()? {
            stages.push(Stage::Match(having.rename_fields(&|field| self.group_field(field))));
        }
        if !self.sorts.is_empty() {
            stages.push(Stage::Sort(
                self.sorts
                    .iter()
                    .map(|s| Sort::new(self.group_field(&s.field), s.direction))
                    .collect(),
            ));
        }
        if let Some(skip) = self.skip {
            stages.push(Stage::Skip(skip));
        }
        if let Some(limit) = self.limit {
            stages.push(Stage::Limit(limit));
        }

        let rows = self
            .odm
            .collection(self.schema.collection())
            .aggregate(&stages, self.session.as_ref())
            .await?;

        debug!(model = self.schema.name(), groups = rows.len(), "grouped");

        Ok(rows
            .into_iter()
            .map(|row| {
                let attributes = self.schema.from_stored(flatten_group(row));
                Model::detached(self.odm.clone(), self.schema.clone(), attributes)
            })
            .collect())
    }

    /// Distinct values of `field` among matching documents.
    pub async fn distinct(&self, field: &str) -> OdmResult<Vec<Bson>> {
        let filter = self.filters.final_filters()?;
        if Self::aborted(&self.schema, QueryAction::Distinct, filter.as_ref()) {
            return Ok(Vec::new());
        }

        self.odm
            .collection(self.schema.collection())
            .distinct(&self.schema.stored_name(field), filter.as_ref(), self.session.as_ref())
            .await
    }

    /// Fetches one page. A `per_page` of zero uses the configured default.
    pub async fn paginate(self, page: u64, per_page: u64) -> OdmResult<Paginated<Model>> {
        let config = self.odm.config();
        let per_page = if per_page == 0 { config.default_per_page } else { per_page };
        let base_url = config.pagination_base_url.clone();
        let params = PaginationParams::new(page, per_page);

        let total = self.count().await?;
        if total == 0 {
            return Ok(Paginated::empty(&params, &base_url));
        }

        let data = self.skip(params.offset()).limit(params.per_page).fetch().await?;

        Ok(Paginated::new(
            data,
            PaginationMeta::new(total, params.per_page, params.page, &base_url),
        ))
    }

    /// Number of matching documents, ignoring skip and limit.
    pub async fn count(&self) -> OdmResult<u64> {
        let filter = self.filters.final_filters()?;
        if Self::aborted(&self.schema, QueryAction::Count, filter.as_ref()) {
            return Ok(0);
        }

        self.odm
            .collection(self.schema.collection())
            .count(filter.as_ref(), self.session.as_ref())
            .await
    }

    pub async fn exists(&self) -> OdmResult<bool> {
        Ok(self.count().await? > 0)
    }

    /// Primary key values of matching documents.
    pub async fn ids(mut self) -> OdmResult<Vec<Bson>> {
        self.preloads.clear();
        self.embeds.clear();
        let primary_key = self.schema.primary_key().to_string();

        Ok(self
            .select([primary_key])
            .fetch()
            .await?
            .iter()
            .filter_map(|model| model.id().cloned())
            .collect())
    }

    /// Applies `patch` (logical names) to every matching document, stamping the
    /// update timestamp. Returns the number of matched documents.
    pub async fn update(&self, patch: Document) -> OdmResult<u64> {
        let filter = self.filters.final_filters()?;
        if Self::aborted(&self.schema, QueryAction::Update, filter.as_ref()) {
            return Ok(0);
        }

        let mut stored = Document::new();
        for (field, value) in patch {
            match self.schema.column(&field) {
                Some(column) if column.is_reference() => {}
                Some(column) if column.is_embedded() => {
                    let related = match column.related_model() {
                        Some(related) => self.odm.schema(related)?,
                        None => continue,
                    };
                    stored.insert(column.stored_name(), embedded::to_stored(&related, &value));
                }
                _ => {
                    let value = self.schema.coerce(&field, value);
                    stored.insert(self.schema.stored_name(&field), value);
                }
            }
        }

        if stored.is_empty() {
            return Ok(0);
        }

        if let Some(timestamps) = self.schema.timestamps() {
            let updated_at = self.schema.stored_name(&timestamps.updated_at);
            if !stored.contains_key(&updated_at) {
                stored.insert(updated_at, Bson::DateTime(DateTime::now()));
            }
        }

        self.odm
            .collection(self.schema.collection())
            .update_many(filter.as_ref(), stored, self.session.as_ref())
            .await
    }

    /// Deletes every matching document. Returns the number deleted.
    pub async fn delete(&self) -> OdmResult<u64> {
        let filter = self.filters.final_filters()?;
        if Self::aborted(&self.schema, QueryAction::Delete, filter.as_ref()) {
            return Ok(0);
        }

        self.odm
            .collection(self.schema.collection())
            .delete_many(filter.as_ref(), self.session.as_ref())
            .await
    }
}

// Lifts the group key document onto the row.
fn flatten_group(mut row: Document) -> Document {
    if let Some(Bson::Document(keys)) = row.remove(ID_FIELD) {
        for (key, value) in keys {
            row.insert(key, value);
        }
    }
    row
}

impl Filterable for ModelQuery {
    fn push_condition(&mut self, boolean: Boolean, expr: Expr) {
        self.filters.push_condition(boolean, expr);
    }

    fn reject(&mut self, field: &str, message: String) {
        self.filters.reject(field, message);
    }

    fn like_case_insensitive(&self) -> bool {
        self.filters.like_case_insensitive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(preloads: &[Preload]) -> Vec<&str> {
        preloads.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn dotted_preloads_nest_under_their_prefix() {
        let mut preloads = Vec::new();
        Preload::insert(&mut preloads, "posts.comments", None);
        Preload::insert(&mut preloads, "posts.tags", None);
        Preload::insert(&mut preloads, "profile", None);

        assert_eq!(names(&preloads), vec!["posts", "profile"]);
        assert_eq!(names(&preloads[0].nested), vec!["comments", "tags"]);
        assert!(preloads[0].constraint.is_none());
    }

    #[test]
    fn constraints_attach_to_the_last_segment() {
        let mut preloads = Vec::new();
        Preload::insert(&mut preloads, "posts", None);
        Preload::insert(&mut preloads, "posts.comments", Some(Box::new(|q: ModelQuery| q.limit(1))));

        assert!(preloads[0].constraint.is_none());
        assert!(preloads[0].nested[0].constraint.is_some());
    }

    #[test]
    fn group_keys_are_lifted_onto_the_row() {
        let row = flatten_group(bson::doc! { "_id": { "role": "admin" }, "count": 2 });

        assert_eq!(row, bson::doc! { "count": 2, "role": "admin" });
    }
}
