//! Model instances.
//!
//! A [`Model`] is one record of a registered model type: its attribute map (logical
//! field names), a snapshot of the attributes as last synced with the store, its
//! relationship proxies and its embedded collections.
//!
//! # Lifecycle
//!
//! An instance is created local and unsynced ([`Odm::model`](crate::odm::Odm::model)) or
//! hydrated from the store by a query. [`Model::save`] inserts the full document the
//! first time and afterwards writes only the dirty fields as a `$set` patch keyed by the
//! primary key. Every successful write re-syncs the snapshot, so saving twice without
//! changes issues no second write.
//!
//! Relationship and embedded fields are never part of the attribute diff. Embedded
//! fields become dirty only through their mutation guards and are always written in full
//! on insert.
//!
//! # Example
//!
//! ```ignore
//! let mut user = odm.model("User")?;
//! user.set("name", "Ada").set("age", 36);
//! user.save().await?;
//!
//! user.set("age", 37);
//! assert_eq!(user.dirty_attributes(), doc! { "age": 37 });
//! user.save().await?;
//! ```

use bson::{de::deserialize_from_bson, Bson, DateTime, Document};
use serde::{de::DeserializeOwned, Serialize, Serializer};
use serde_json::Value;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tracing::{debug, warn};

use crate::{
    backend::SessionToken,
    embedded::{self, EmbedMany, EmbedOne, EmbeddedCollection, EmbeddedMany, EmbeddedOne},
    embedded_query::EmbeddedQuery,
    error::{OdmError, OdmResult},
    eval::{is_nullish, key_string, lookup_path},
    hooks::{self, HookOutcome},
    odm::Odm,
    query::{Expr, FieldOp, FindOptions},
    relation::{BelongsTo, HasMany, HasOne, RelatedMany, RelatedOne, Scope},
    schema::{ModelSchema, RelationDef, RelationKind, ID_FIELD},
};

/// One record of a registered model type.
#[derive(Debug, Clone)]
pub struct Model {
    pub(crate) odm: Odm,
    pub(crate) schema: Arc<ModelSchema>,
    pub(crate) attributes: Document,
    pub(crate) original: Document,
    pub(crate) persisted: bool,
    pub(crate) local: bool,
    pub(crate) session: Option<SessionToken>,
    pub(crate) one_relations: HashMap<String, RelatedOne>,
    pub(crate) many_relations: HashMap<String, RelatedMany>,
    pub(crate) embeds: HashMap<String, EmbeddedCollection>,
    pub(crate) dirty_embeds: BTreeSet<String>,
}

impl Model {
    /// A new local, unsynced instance.
    pub(crate) fn new(odm: Odm, schema: Arc<ModelSchema>) -> OdmResult<Self> {
        let mut model = Self::blank(odm, schema, Document::new());
        model.local = true;
        model.init_embeds()?;

        Ok(model)
    }

    /// An instance built from a stored document.
    pub(crate) fn hydrate(
        odm: Odm,
        schema: Arc<ModelSchema>,
        stored: Document,
        session: Option<SessionToken>,
    ) -> OdmResult<Self> {
        let attributes = schema.from_stored(stored);
        let mut model = Self::blank(odm, schema, attributes);
        model.persisted = true;
        model.session = session;
        model.init_embeds()?;
        model.original = model.attributes.clone();

        Ok(model)
    }

    /// A non-persisted instance carrying an aggregation row.
    pub(crate) fn detached(odm: Odm, schema: Arc<ModelSchema>, attributes: Document) -> Self {
        let mut model = Self::blank(odm, schema, attributes);
        model.original = model.attributes.clone();
        model
    }

    fn blank(odm: Odm, schema: Arc<ModelSchema>, attributes: Document) -> Self {
        Self {
            odm,
            schema,
            attributes,
            original: Document::new(),
            persisted: false,
            local: false,
            session: None,
            one_relations: HashMap::new(),
            many_relations: HashMap::new(),
            embeds: HashMap::new(),
            dirty_embeds: BTreeSet::new(),
        }
    }

    fn init_embeds(&mut self) -> OdmResult<()> {
        let schema = self.schema.clone();

        for def in schema.columns().iter().filter_map(|column| column.embed()) {
            let element_schema = self.odm.schema(&def.related)?;
            let value = self.attributes.get(&def.name);

            let collection = if def.many {
                EmbeddedCollection::Many(EmbeddedMany::load(element_schema, value))
            } else {
                EmbeddedCollection::One(EmbeddedOne::load(element_schema, value))
            };

            self.attributes.insert(def.name.clone(), collection.to_bson());
            self.embeds.insert(def.name.clone(), collection);
        }

        Ok(())
    }

    pub fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    /// Name of the model type.
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn odm(&self) -> &Odm {
        &self.odm
    }

    /// Whether the instance exists in the store.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Whether the instance was created in process and has not been synced yet.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn session(&self) -> Option<SessionToken> {
        self.session
    }

    /// Sets the session used by this instance's writes and relation queries.
    pub fn with_session(mut self, session: Option<SessionToken>) -> Self {
        self.session = session;
        self
    }

    pub fn set_session(&mut self, session: Option<SessionToken>) {
        self.session = session;
    }

    /// The primary key value, if assigned.
    pub fn id(&self) -> Option<&Bson> {
        self.attributes
            .get(self.schema.primary_key())
            .filter(|id| !is_nullish(Some(*id)))
    }

    pub fn attributes(&self) -> &Document {
        &self.attributes
    }

    /// The attributes as last synced with the store.
    pub fn original(&self) -> &Document {
        &self.original
    }

    /// Reads a (possibly dotted) attribute.
    pub fn get(&self, field: &str) -> Option<&Bson> {
        lookup_path(&self.attributes, field)
    }

    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> OdmResult<Option<T>> {
        match self.get(field) {
            Some(value) => Ok(Some(deserialize_from_bson(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Sets an attribute, coercing it to the declared type.
    ///
    /// Writes to relationship fields are ignored; use the relation accessors instead.
    /// Writing an embedded field replaces the whole collection.
    pub fn set(&mut self, field: &str, value: impl Into<Bson>) -> &mut Self {
        let value = value.into();

        match self.schema.column(field) {
            Some(column) if column.is_reference() => {
                warn!(model = self.schema.name(), field, "ignoring write to a relationship field");
            }
            Some(column) if column.is_embedded() => {
                if let Some(collection) = self.embeds.get_mut(field) {
                    collection.reload(Some(&value));
                    self.attributes.insert(field, collection.to_bson());
                    self.dirty_embeds.insert(field.to_string());
                }
            }
            _ => {
                let value = self.schema.coerce(field, value);
                self.attributes.insert(field, value);
            }
        }

        self
    }

    /// Sets every attribute of `attributes`.
    pub fn merge(&mut self, attributes: Document) -> &mut Self {
        for (field, value) in attributes {
            self.set(&field, value);
        }
        self
    }

    /// Removes an attribute; the next save writes it as `null`.
    pub fn unset(&mut self, field: &str) -> Option<Bson> {
        match self.embeds.get_mut(field) {
            Some(collection) => {
                collection.reload(None);
                self.dirty_embeds.insert(field.to_string());
                self.attributes.insert(field, collection.to_bson())
            }
            None => self.attributes.remove(field),
        }
    }

    fn is_tracked(&self, field: &str) -> bool {
        self.schema
            .column(field)
            .is_none_or(|column| column.is_persisted_attribute())
    }

    /// Fields changed since the last sync: changed or added attributes with their new
    /// value, removed attributes as `null`, and embedded fields marked dirty.
    pub fn dirty_attributes(&self) -> Document {
        let mut dirty = Document::new();

        for (field, value) in &self.attributes {
            if self.is_tracked(field) && self.original.get(field) != Some(value) {
                dirty.insert(field.clone(), value.clone());
            }
        }

        for field in self.original.keys() {
            if self.is_tracked(field) && !self.attributes.contains_key(field) {
                dirty.insert(field.clone(), Bson::Null);
            }
        }

        for field in &self.dirty_embeds {
            if let Some(value) = self.attributes.get(field) {
                dirty.insert(field.clone(), value.clone());
            }
        }

        dirty
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty_attributes().is_empty()
    }

    /// Marks the current attributes as synced with the store.
    pub fn sync_original(&mut self) {
        self.original = self.attributes.clone();
        self.dirty_embeds.clear();
    }

    // Converts logical attributes to a stored document, dropping relationship fields.
    fn stored(&self, attributes: &Document) -> Document {
        let mut stored = Document::new();

        for (field, value) in attributes {
            match (self.schema.column(field), self.embeds.get(field)) {
                (Some(column), _) if column.is_reference() => {}
                (Some(column), Some(collection)) => {
                    stored.insert(column.stored_name(), embedded::to_stored(collection.schema(), value));
                }
                _ => {
                    stored.insert(self.schema.stored_name(field), value.clone());
                }
            }
        }

        stored
    }

    /// The full stored document: stored names, embedded fields included, relationship
    /// fields excluded.
    pub fn to_document(&self) -> Document {
        self.stored(&self.attributes)
    }

    /// A JSON view of the attributes with loaded relations nested under their names.
    pub fn to_json(&self) -> Value {
        let mut value = json_value(&Bson::Document(self.attributes.clone()));

        if let Value::Object(map) = &mut value {
            for (name, related) in &self.one_relations {
                if related.is_loaded() {
                    map.insert(name.clone(), related.get().map(Model::to_json).unwrap_or(Value::Null));
                }
            }
            for (name, related) in &self.many_relations {
                if related.is_loaded() {
                    map.insert(name.clone(), Value::Array(related.iter().map(Model::to_json).collect()));
                }
            }
        }

        value
    }

    /// Deserializes the attributes into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> OdmResult<T> {
        Ok(deserialize_from_bson(Bson::Document(self.attributes.clone()))?)
    }

    fn key_filter(&self) -> OdmResult<Expr> {
        match self.id() {
            Some(id) => Ok(Expr::field(ID_FIELD, FieldOp::Eq, id.clone())),
            None => Err(OdmError::InvalidState(format!(
                "{} has no primary key value",
                self.schema.name()
            ))),
        }
    }

    /// Inserts the instance or writes its dirty fields.
    ///
    /// Returns `false` when a `before_save` hook aborted the write.
    ///
    /// # Errors
    ///
    /// [`OdmError::Validation`] when a required field is missing or a declared type does
    /// not match, and [`OdmError::StoreOperation`] when the store rejects the write.
    pub async fn save(&mut self) -> OdmResult<bool> {
        if let HookOutcome::Abort(reason) = hooks::run(self.schema.hooks(), |hook| hook.before_save(self)) {
            debug!(model = self.schema.name(), %reason, "save aborted by hook");
            return Ok(false);
        }

        self.schema.validate(&self.attributes)?;

        if self.persisted {
            self.update().await
        } else {
            self.insert().await
        }
    }

    async fn insert(&mut self) -> OdmResult<bool> {
        let schema = self.schema.clone();
        let now = Bson::DateTime(DateTime::now());

        if let Some(timestamps) = schema.timestamps() {
            for field in [&timestamps.created_at, &timestamps.updated_at] {
                if is_nullish(self.attributes.get(field)) {
                    self.attributes.insert(field.clone(), now.clone());
                }
            }
        }

        if self.id().is_none() {
            self.attributes.insert(schema.primary_key(), schema.key_type().generate());
        }

        let document = self.to_document();
        let id = self
            .odm
            .collection(schema.collection())
            .insert_one(document, self.session.as_ref())
            .await?;

        if !is_nullish(Some(&id)) {
            self.attributes.insert(schema.primary_key(), id);
        }

        self.persisted = true;
        self.local = false;
        self.sync_original();

        debug!(model = schema.name(), id = %self.id().map(key_string).unwrap_or_default(), "inserted");
        Ok(true)
    }

    async fn update(&mut self) -> OdmResult<bool> {
        let schema = self.schema.clone();
        let mut dirty = self.dirty_attributes();

        if dirty.is_empty() {
            return Ok(true);
        }

        if let Some(timestamps) = schema.timestamps() {
            if !dirty.contains_key(&timestamps.updated_at) {
                let now = Bson::DateTime(DateTime::now());
                self.attributes.insert(timestamps.updated_at.clone(), now.clone());
                dirty.insert(timestamps.updated_at.clone(), now);
            }
        }

        let filter = self.key_filter()?;
        let patch = self.stored(&dirty);

        self.odm
            .collection(schema.collection())
            .update_many(Some(&filter), patch, self.session.as_ref())
            .await?;
        self.sync_original();

        debug!(model = schema.name(), fields = dirty.len(), "updated");
        Ok(true)
    }

    /// Deletes the instance from the store.
    ///
    /// Returns `false` when a `before_delete` hook aborted or nothing was deleted.
    pub async fn delete(&mut self) -> OdmResult<bool> {
        if !self.persisted {
            return Err(OdmError::InvalidState(format!(
                "cannot delete a {} that was never saved",
                self.schema.name()
            )));
        }

        if let HookOutcome::Abort(reason) = hooks::run(self.schema.hooks(), |hook| hook.before_delete(self)) {
            debug!(model = self.schema.name(), %reason, "delete aborted by hook");
            return Ok(false);
        }

        let filter = self.key_filter()?;
        let deleted = self
            .odm
            .collection(self.schema.collection())
            .delete_many(Some(&filter), self.session.as_ref())
            .await?;
        self.persisted = false;

        Ok(deleted > 0)
    }

    /// Reloads the attributes from the store, discarding unsaved changes and loaded
    /// relations.
    pub async fn refresh(&mut self) -> OdmResult<()> {
        let filter = self.key_filter()?;
        let options = FindOptions::new().with_session(self.session);

        let stored = self
            .odm
            .collection(self.schema.collection())
            .find_one(Some(&filter), &options)
            .await?
            .ok_or_else(|| OdmError::NotFound {
                model: self.schema.name().to_string(),
            })?;

        *self = Model::hydrate(self.odm.clone(), self.schema.clone(), stored, self.session)?;
        Ok(())
    }

    fn relation_of(&self, name: &str, kinds: &[RelationKind]) -> OdmResult<RelationDef> {
        let def = self.schema.require_relation(name)?;

        if !kinds.contains(&def.kind) {
            return Err(OdmError::Configuration(format!(
                "relation `{name}` of {} is {}",
                self.schema.name(),
                def.kind
            )));
        }

        Ok(def.clone())
    }

    pub(crate) fn scope(&self, def: &RelationDef) -> Scope {
        Scope {
            odm: self.odm.clone(),
            owner: self.schema.name().to_string(),
            key: self
                .get(def.owner_key())
                .filter(|key| !is_nullish(Some(*key)))
                .cloned(),
            persisted: self.persisted,
            session: self.session,
        }
    }

    /// The proxy of a HasOne relation.
    pub fn has_one(&mut self, name: &str) -> OdmResult<HasOne<'_>> {
        let def = self.relation_of(name, &[RelationKind::HasOne])?;
        let scope = self.scope(&def);
        let related = self.one_relations.entry(name.to_string()).or_default();

        Ok(HasOne::new(scope, def, related))
    }

    /// The proxy of a HasMany relation.
    pub fn has_many(&mut self, name: &str) -> OdmResult<HasMany<'_>> {
        let def = self.relation_of(name, &[RelationKind::HasMany])?;
        let scope = self.scope(&def);
        let related = self.many_relations.entry(name.to_string()).or_default();

        Ok(HasMany::new(scope, def, related))
    }

    /// The proxy of a BelongsTo relation.
    pub fn belongs_to(&mut self, name: &str) -> OdmResult<BelongsTo<'_>> {
        let def = self.relation_of(name, &[RelationKind::BelongsTo])?;
        self.one_relations.entry(name.to_string()).or_default();

        Ok(BelongsTo::new(self, def))
    }

    /// Loaded state of a HasOne or BelongsTo relation; `None` until first accessed.
    pub fn related_one(&self, name: &str) -> Option<&RelatedOne> {
        self.one_relations.get(name)
    }

    /// Loaded state of a HasMany relation; `None` until first accessed.
    pub fn related_many(&self, name: &str) -> Option<&RelatedMany> {
        self.many_relations.get(name)
    }

    pub(crate) fn set_related_one(&mut self, name: &str, value: Option<Model>) {
        self.one_relations.entry(name.to_string()).or_default().set(value);
    }

    pub(crate) fn set_related_many(&mut self, name: &str, items: Vec<Model>) {
        self.many_relations.entry(name.to_string()).or_default().set(items);
    }

    fn embedded(&self, name: &str) -> OdmResult<&EmbeddedCollection> {
        self.schema.require_embed(name)?;
        self.embeds.get(name).ok_or_else(|| {
            OdmError::InvalidState(format!("embedded collection `{name}` of {} is not initialised", self.schema.name()))
        })
    }

    pub fn embed_one(&self, name: &str) -> OdmResult<&EmbeddedOne> {
        match self.embedded(name)? {
            EmbeddedCollection::One(one) => Ok(one),
            EmbeddedCollection::Many(_) => Err(OdmError::Configuration(format!(
                "embedded collection `{name}` of {} holds many elements",
                self.schema.name()
            ))),
        }
    }

    pub fn embed_many(&self, name: &str) -> OdmResult<&EmbeddedMany> {
        match self.embedded(name)? {
            EmbeddedCollection::Many(many) => Ok(many),
            EmbeddedCollection::One(_) => Err(OdmError::Configuration(format!(
                "embedded collection `{name}` of {} holds a single element",
                self.schema.name()
            ))),
        }
    }

    /// Mutable access to a single embedded field.
    pub fn embed_one_mut(&mut self, name: &str) -> OdmResult<EmbedOne<'_>> {
        self.embed_one(name)?;

        match self.embeds.get_mut(name) {
            Some(EmbeddedCollection::One(one)) => Ok(EmbedOne::new(
                name.to_string(),
                one,
                &mut self.attributes,
                &mut self.dirty_embeds,
            )),
            _ => Err(OdmError::Configuration(format!("`{name}` is not a single embedded field"))),
        }
    }

    /// Mutable access to an embedded list.
    pub fn embed_many_mut(&mut self, name: &str) -> OdmResult<EmbedMany<'_>> {
        self.embed_many(name)?;

        match self.embeds.get_mut(name) {
            Some(EmbeddedCollection::Many(many)) => Ok(EmbedMany::new(
                name.to_string(),
                many,
                &mut self.attributes,
                &mut self.dirty_embeds,
            )),
            _ => Err(OdmError::Configuration(format!("`{name}` is not an embedded list"))),
        }
    }

    /// Replaces the in-memory view of an embedded field with the result of `constraint`.
    /// Nothing is marked dirty.
    pub(crate) fn apply_embed_view(
        &mut self,
        name: &str,
        constraint: &(dyn Fn(EmbeddedQuery) -> EmbeddedQuery + Send + Sync),
    ) -> OdmResult<()> {
        self.embedded(name)?;

        match self.embeds.get_mut(name) {
            Some(EmbeddedCollection::One(one)) => {
                let value = constraint(one.query()).first()?;
                one.replace_view(value);
            }
            Some(EmbeddedCollection::Many(many)) => {
                let items = constraint(many.query()).get()?;
                many.replace_view(items);
            }
            None => {}
        }

        Ok(())
    }
}

impl Serialize for Model {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// JSON rendering of BSON values: ObjectIds as hex, UUIDs hyphenated, datetimes as
/// RFC 3339.
pub(crate) fn json_value(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(n) => Value::from(*n),
        Bson::Int64(n) => Value::from(*n),
        Bson::Double(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s.clone()),
        Bson::ObjectId(_) | Bson::Binary(_) => Value::String(key_string(value)),
        Bson::DateTime(dt) => Value::String(dt.to_chrono().to_rfc3339()),
        Bson::Array(items) => Value::Array(items.iter().map(json_value).collect()),
        Bson::Document(doc) => Value::Object(
            doc.iter()
                .map(|(k, v)| (k.clone(), json_value(v)))
                .collect(),
        ),
        other => serde_json::to_value(other).unwrap_or(Value::Null),
    }
}
