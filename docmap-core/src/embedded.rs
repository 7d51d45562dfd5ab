//! Embedded collections: sub-documents stored inside a parent record.
//!
//! An embedded field holds either one sub-document ([`EmbeddedOne`]) or an ordered list
//! of them ([`EmbeddedMany`]). Elements have no identity of their own; in a list their
//! index is re-packed to `0..n` after every mutation.
//!
//! Mutations go through the [`EmbedOne`] and [`EmbedMany`] guards returned by
//! [`Model::embed_one_mut`](crate::model::Model::embed_one_mut) and
//! [`Model::embed_many_mut`](crate::model::Model::embed_many_mut). Every mutation
//! re-serialises the whole collection into the parent's attributes and marks the
//! parent field dirty, so the next `save` writes it.
//!
//! # Example
//!
//! ```ignore
//! let mut addresses = user.embed_many_mut("addresses")?;
//! addresses.create(doc! { "city": "Oslo", "primary": true });
//! addresses.remove_where(|a| a.get("city") == Some(&Bson::from("Bergen")));
//! drop(addresses);
//!
//! user.save().await?;
//! ```

use bson::{de::deserialize_from_bson, Bson, Document};
use serde::de::DeserializeOwned;
use std::{
    collections::BTreeSet,
    ops::{Deref, Range},
    sync::Arc,
};

use crate::{
    embedded_query::EmbeddedQuery,
    error::OdmResult,
    eval::lookup_path,
    model::json_value,
    schema::ModelSchema,
};

/// One embedded sub-document.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedDoc {
    pub(crate) index: Option<usize>,
    pub(crate) attributes: Document,
}

impl EmbeddedDoc {
    pub fn new(attributes: Document) -> Self {
        Self { index: None, attributes }
    }

    /// Position inside an [`EmbeddedMany`]; `None` for single embeds and detached copies.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn attributes(&self) -> &Document {
        &self.attributes
    }

    /// Reads a (possibly dotted) field.
    pub fn get(&self, field: &str) -> Option<&Bson> {
        lookup_path(&self.attributes, field)
    }

    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> OdmResult<Option<T>> {
        match self.attributes.get(field) {
            Some(value) => Ok(Some(deserialize_from_bson(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Bson>) {
        self.attributes.insert(field.into(), value.into());
    }

    pub fn unset(&mut self, field: &str) -> Option<Bson> {
        self.attributes.remove(field)
    }

    /// Deserializes the whole element into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> OdmResult<T> {
        Ok(deserialize_from_bson(Bson::Document(self.attributes.clone()))?)
    }

    pub fn to_json(&self) -> serde_json::Value {
        json_value(&Bson::Document(self.attributes.clone()))
    }

    pub fn into_attributes(self) -> Document {
        self.attributes
    }

    fn detached(mut self) -> Self {
        self.index = None;
        self
    }
}

impl From<Document> for EmbeddedDoc {
    fn from(attributes: Document) -> Self {
        EmbeddedDoc::new(attributes)
    }
}

/// Converts logical embedded values to stored names for writing.
pub(crate) fn to_stored(schema: &ModelSchema, value: &Bson) -> Bson {
    match value {
        Bson::Document(doc) => Bson::Document(schema.to_stored(doc)),
        Bson::Array(items) => Bson::Array(items.iter().map(|item| to_stored(schema, item)).collect()),
        other => other.clone(),
    }
}

fn element(schema: &ModelSchema, attributes: Document) -> EmbeddedDoc {
    EmbeddedDoc::new(schema.from_stored(attributes))
}

/// A single embedded sub-document.
#[derive(Debug, Clone)]
pub struct EmbeddedOne {
    schema: Arc<ModelSchema>,
    value: Option<EmbeddedDoc>,
}

impl EmbeddedOne {
    /// Builds the collection from a raw field value (stored or logical names).
    pub(crate) fn load(schema: Arc<ModelSchema>, value: Option<&Bson>) -> Self {
        let value = match value {
            Some(Bson::Document(doc)) => Some(element(&schema, doc.clone())),
            _ => None,
        };

        Self { schema, value }
    }

    pub fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    pub fn value(&self) -> Option<&EmbeddedDoc> {
        self.value.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// A query over the (zero or one) element.
    pub fn query(&self) -> EmbeddedQuery {
        EmbeddedQuery::new(self.value.iter().cloned())
    }

    pub(crate) fn to_bson(&self) -> Bson {
        match &self.value {
            Some(doc) => Bson::Document(doc.attributes.clone()),
            None => Bson::Null,
        }
    }

    pub(crate) fn replace_view(&mut self, value: Option<EmbeddedDoc>) {
        self.value = value.map(EmbeddedDoc::detached);
    }
}

/// An ordered list of embedded sub-documents.
#[derive(Debug, Clone)]
pub struct EmbeddedMany {
    schema: Arc<ModelSchema>,
    items: Vec<EmbeddedDoc>,
}

impl EmbeddedMany {
    pub(crate) fn load(schema: Arc<ModelSchema>, value: Option<&Bson>) -> Self {
        let items = match value {
            Some(Bson::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_document())
                .map(|doc| element(&schema, doc.clone()))
                .collect(),
            _ => Vec::new(),
        };

        let mut collection = Self { schema, items };
        collection.reindex();
        collection
    }

    pub fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&EmbeddedDoc> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EmbeddedDoc> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[EmbeddedDoc] {
        &self.items
    }

    /// A query over copies of the elements.
    pub fn query(&self) -> EmbeddedQuery {
        EmbeddedQuery::new(self.items.iter().cloned())
    }

    pub(crate) fn to_bson(&self) -> Bson {
        Bson::Array(
            self.items
                .iter()
                .map(|doc| Bson::Document(doc.attributes.clone()))
                .collect(),
        )
    }

    pub(crate) fn replace_view(&mut self, items: Vec<EmbeddedDoc>) {
        self.items = items;
        self.reindex();
    }

    fn reindex(&mut self) {
        for (i, item) in self.items.iter_mut().enumerate() {
            item.index = Some(i);
        }
    }
}

impl<'a> IntoIterator for &'a EmbeddedMany {
    type Item = &'a EmbeddedDoc;
    type IntoIter = std::slice::Iter<'a, EmbeddedDoc>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// An embedded field of a model.
#[derive(Debug, Clone)]
pub enum EmbeddedCollection {
    One(EmbeddedOne),
    Many(EmbeddedMany),
}

impl EmbeddedCollection {
    pub fn schema(&self) -> &ModelSchema {
        match self {
            EmbeddedCollection::One(one) => one.schema(),
            EmbeddedCollection::Many(many) => many.schema(),
        }
    }

    pub(crate) fn to_bson(&self) -> Bson {
        match self {
            EmbeddedCollection::One(one) => one.to_bson(),
            EmbeddedCollection::Many(many) => many.to_bson(),
        }
    }

    pub fn query(&self) -> EmbeddedQuery {
        match self {
            EmbeddedCollection::One(one) => one.query(),
            EmbeddedCollection::Many(many) => many.query(),
        }
    }

    /// Rebuilds the contents from a raw field value, keeping the element schema.
    pub(crate) fn reload(&mut self, value: Option<&Bson>) {
        match self {
            EmbeddedCollection::One(one) => *one = EmbeddedOne::load(one.schema.clone(), value),
            EmbeddedCollection::Many(many) => *many = EmbeddedMany::load(many.schema.clone(), value),
        }
    }
}

/// Mutable access to a single embedded field of a model.
#[derive(Debug)]
pub struct EmbedOne<'a> {
    name: String,
    collection: &'a mut EmbeddedOne,
    attributes: &'a mut Document,
    dirty: &'a mut BTreeSet<String>,
}

impl<'a> EmbedOne<'a> {
    pub(crate) fn new(
        name: String,
        collection: &'a mut EmbeddedOne,
        attributes: &'a mut Document,
        dirty: &'a mut BTreeSet<String>,
    ) -> Self {
        Self { name, collection, attributes, dirty }
    }

    pub fn value(&self) -> Option<&EmbeddedDoc> {
        self.collection.value()
    }

    /// Replaces the sub-document.
    pub fn set_value(&mut self, attributes: Document) {
        self.create(attributes);
    }

    /// Replaces the sub-document and returns it.
    pub fn create(&mut self, attributes: Document) -> &EmbeddedDoc {
        let doc = element(&self.collection.schema, attributes);
        self.attributes.insert(self.name.clone(), Bson::Document(doc.attributes.clone()));
        self.dirty.insert(self.name.clone());

        self.collection.value.insert(doc)
    }

    /// Edits the sub-document in place. Returns `false` when there is none.
    pub fn update(&mut self, edit: impl FnOnce(&mut EmbeddedDoc)) -> bool {
        let Some(doc) = self.collection.value.as_mut() else {
            return false;
        };

        edit(doc);
        self.sync();
        true
    }

    pub fn clear(&mut self) {
        self.collection.value = None;
        self.sync();
    }

    fn sync(&mut self) {
        self.attributes.insert(self.name.clone(), self.collection.to_bson());
        self.dirty.insert(self.name.clone());
    }
}

/// Mutable access to an embedded list of a model.
///
/// Dereferences to [`EmbeddedMany`] for reads.
#[derive(Debug)]
pub struct EmbedMany<'a> {
    name: String,
    collection: &'a mut EmbeddedMany,
    attributes: &'a mut Document,
    dirty: &'a mut BTreeSet<String>,
}

impl<'a> EmbedMany<'a> {
    pub(crate) fn new(
        name: String,
        collection: &'a mut EmbeddedMany,
        attributes: &'a mut Document,
        dirty: &'a mut BTreeSet<String>,
    ) -> Self {
        Self { name, collection, attributes, dirty }
    }

    /// Appends a new element and returns it.
    pub fn create(&mut self, attributes: Document) -> &EmbeddedDoc {
        let index = self.collection.items.len();
        self.push(attributes);

        &self.collection.items[index]
    }

    /// Appends several elements and returns the new ones.
    pub fn create_many(&mut self, attributes: impl IntoIterator<Item = Document>) -> &[EmbeddedDoc] {
        let start = self.collection.items.len();
        let schema = self.collection.schema.clone();
        self.collection
            .items
            .extend(attributes.into_iter().map(|attrs| element(&schema, attrs)));
        self.sync();

        &self.collection.items[start..]
    }

    pub fn push(&mut self, attributes: Document) {
        let doc = element(&self.collection.schema, attributes);
        self.collection.items.push(doc);
        self.sync();
    }

    pub fn pop(&mut self) -> Option<EmbeddedDoc> {
        let popped = self.collection.items.pop();
        self.sync();
        popped.map(EmbeddedDoc::detached)
    }

    /// Inserts at `index`, clamped to the current length.
    pub fn insert(&mut self, index: usize, attributes: Document) {
        let index = index.min(self.collection.items.len());
        let doc = element(&self.collection.schema, attributes);
        self.collection.items.insert(index, doc);
        self.sync();
    }

    /// Replaces `range` (clamped to the current length) with `replacement` and returns
    /// the removed elements.
    pub fn splice(&mut self, range: Range<usize>, replacement: impl IntoIterator<Item = Document>) -> Vec<EmbeddedDoc> {
        let len = self.collection.items.len();
        let start = range.start.min(len);
        let end = range.end.clamp(start, len);
        let schema = self.collection.schema.clone();

        let removed = self
            .collection
            .items
            .splice(start..end, replacement.into_iter().map(|attrs| element(&schema, attrs)))
            .map(EmbeddedDoc::detached)
            .collect();
        self.sync();

        removed
    }

    /// Removes the element at `index`; `None` when out of range.
    pub fn remove(&mut self, index: usize) -> Option<EmbeddedDoc> {
        if index >= self.collection.items.len() {
            return None;
        }

        let removed = self.collection.items.remove(index);
        self.sync();
        Some(removed.detached())
    }

    /// Removes every element matching `predicate` and returns how many were removed.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&EmbeddedDoc) -> bool) -> usize {
        let before = self.collection.items.len();
        self.collection.items.retain(|doc| !predicate(doc));
        let removed = before - self.collection.items.len();

        if removed > 0 {
            self.sync();
        }
        removed
    }

    /// Edits the element at `index` in place. Returns `false` when out of range.
    pub fn update(&mut self, index: usize, edit: impl FnOnce(&mut EmbeddedDoc)) -> bool {
        let Some(doc) = self.collection.items.get_mut(index) else {
            return false;
        };

        edit(doc);
        self.sync();
        true
    }

    pub fn clear(&mut self) {
        self.collection.items.clear();
        self.sync();
    }

    fn sync(&mut self) {
        self.collection.reindex();
        self.attributes.insert(self.name.clone(), self.collection.to_bson());
        self.dirty.insert(self.name.clone());
    }
}

impl Deref for EmbedMany<'_> {
    type Target = EmbeddedMany;

    fn deref(&self) -> &Self::Target {
        self.collection
    }
}
