//! Relationship proxies.
//!
//! Every relation declared on a schema is reached through a proxy borrowed from the
//! owning [`Model`]: [`HasOne`], [`HasMany`] or [`BelongsTo`]. A proxy starts unloaded.
//! It becomes loaded either by preloading ([`ModelQuery::preload`](crate::executor::ModelQuery::preload))
//! or by an explicit `load`. Reading an unloaded proxy yields nothing rather than
//! querying lazily.
//!
//! Creation and persistence through a proxy stamp the linking key before saving, so
//! both sides agree without the caller wiring ids by hand.

use bson::{Bson, Document};
use std::ops::{Deref, DerefMut, Index, IndexMut};

use crate::{
    backend::SessionToken,
    error::{OdmError, OdmResult},
    executor::ModelQuery,
    filter::Filterable,
    model::Model,
    odm::Odm,
    schema::RelationDef,
};

/// Loaded state of a HasOne or BelongsTo relation.
#[derive(Debug, Clone, Default)]
pub struct RelatedOne {
    loaded: bool,
    value: Option<Box<Model>>,
}

impl RelatedOne {
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The related instance; `None` when unloaded or when nothing is related.
    pub fn get(&self) -> Option<&Model> {
        self.value.as_deref()
    }

    pub fn get_mut(&mut self) -> Option<&mut Model> {
        self.value.as_deref_mut()
    }

    /// Reads an attribute of the related instance.
    pub fn attribute(&self, field: &str) -> Option<&Bson> {
        self.get().and_then(|model| model.get(field))
    }

    /// Writes an attribute of the related instance. Returns `false` when there is none.
    pub fn set_attribute(&mut self, field: &str, value: impl Into<Bson>) -> bool {
        match self.get_mut() {
            Some(model) => {
                model.set(field, value);
                true
            }
            None => false,
        }
    }

    /// Takes the related instance out, leaving the proxy loaded and empty.
    pub fn take(&mut self) -> Option<Model> {
        self.value.take().map(|model| *model)
    }

    pub(crate) fn set(&mut self, value: Option<Model>) {
        self.loaded = true;
        self.value = value.map(Box::new);
    }
}

/// Loaded state of a HasMany relation. Behaves as an ordered sequence.
#[derive(Debug, Clone, Default)]
pub struct RelatedMany {
    loaded: bool,
    items: Vec<Model>,
}

impl RelatedMany {
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Model> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Model> {
        self.items.iter_mut()
    }

    pub fn get(&self, index: usize) -> Option<&Model> {
        self.items.get(index)
    }

    pub fn first(&self) -> Option<&Model> {
        self.items.first()
    }

    pub fn last(&self) -> Option<&Model> {
        self.items.last()
    }

    pub fn as_slice(&self) -> &[Model] {
        &self.items
    }

    pub fn push(&mut self, model: Model) {
        self.items.push(model);
    }

    pub fn pop(&mut self) -> Option<Model> {
        self.items.pop()
    }

    /// Inserts at `index`, clamped to the current length.
    pub fn insert(&mut self, index: usize, model: Model) {
        let index = index.min(self.items.len());
        self.items.insert(index, model);
    }

    pub fn remove(&mut self, index: usize) -> Option<Model> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    pub fn retain(&mut self, keep: impl FnMut(&Model) -> bool) {
        self.items.retain(keep);
    }

    pub fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Replaces `range` (clamped) with `replacement` and returns the removed items.
    pub fn splice(&mut self, range: std::ops::Range<usize>, replacement: impl IntoIterator<Item = Model>) -> Vec<Model> {
        let end = range.end.min(self.items.len());
        let start = range.start.min(end);
        self.items.splice(start..end, replacement).collect()
    }

    pub(crate) fn set(&mut self, items: Vec<Model>) {
        self.loaded = true;
        self.items = items;
    }
}

impl Index<usize> for RelatedMany {
    type Output = Model;

    fn index(&self, index: usize) -> &Model {
        &self.items[index]
    }
}

impl IndexMut<usize> for RelatedMany {
    fn index_mut(&mut self, index: usize) -> &mut Model {
        &mut self.items[index]
    }
}

impl<'a> IntoIterator for &'a RelatedMany {
    type Item = &'a Model;
    type IntoIter = std::slice::Iter<'a, Model>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl IntoIterator for RelatedMany {
    type Item = Model;
    type IntoIter = std::vec::IntoIter<Model>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// What a proxy knows about its owner.
#[derive(Debug, Clone)]
pub(crate) struct Scope {
    pub(crate) odm: Odm,
    pub(crate) owner: String,
    pub(crate) key: Option<Bson>,
    pub(crate) persisted: bool,
    pub(crate) session: Option<SessionToken>,
}

impl Scope {
    fn query(&self, def: &RelationDef) -> OdmResult<ModelQuery> {
        let key = self.key.clone().ok_or_else(|| {
            OdmError::InvalidState(format!("{} has no value for `{}`", self.owner, def.owner_key()))
        })?;

        Ok(self
            .odm
            .query(&def.related)?
            .with_session(self.session)
            .where_eq(def.related_key(), key))
    }

    fn owner_key(&self, def: &RelationDef) -> OdmResult<Bson> {
        match (&self.key, self.persisted) {
            (Some(key), true) => Ok(key.clone()),
            _ => Err(OdmError::InvalidState(format!(
                "cannot modify relation `{}` before the {} is saved",
                def.name, self.owner
            ))),
        }
    }

    async fn first(&self, def: &RelationDef) -> OdmResult<Option<Model>> {
        if self.key.is_none() {
            return Ok(None);
        }

        self.query(def)?
            .first()
            .await
            .map_err(|e| OdmError::relationship(&def.name, &self.owner, e))
    }

    /// Stamps the owner's key on `instance` and saves it. `None` when a hook aborted the save.
    async fn save_related(&self, def: &RelationDef, mut instance: Model) -> OdmResult<Option<Model>> {
        let key = self.owner_key(def)?;

        if instance.session().is_none() {
            instance.set_session(self.session);
        }
        instance.set(def.related_key(), key);

        Ok(instance.save().await?.then_some(instance))
    }

    fn build(&self, def: &RelationDef, attributes: Document) -> OdmResult<Model> {
        let mut instance = self.odm.model(&def.related)?.with_session(self.session);
        instance.merge(attributes);
        Ok(instance)
    }
}

/// Proxy of a HasOne relation: the related record carries the owner's key.
#[derive(Debug)]
pub struct HasOne<'a> {
    scope: Scope,
    def: RelationDef,
    related: &'a mut RelatedOne,
}

impl<'a> HasOne<'a> {
    pub(crate) fn new(scope: Scope, def: RelationDef, related: &'a mut RelatedOne) -> Self {
        Self { scope, def, related }
    }

    pub fn is_loaded(&self) -> bool {
        self.related.is_loaded()
    }

    pub fn get(&self) -> Option<&Model> {
        self.related.get()
    }

    /// Fetches the related record and marks the proxy loaded.
    pub async fn load(&mut self) -> OdmResult<Option<&Model>> {
        let value = self.scope.first(&self.def).await?;
        self.related.set(value);
        Ok(self.related.get())
    }

    /// A query over the related model constrained to this owner.
    pub fn query(&self) -> OdmResult<ModelQuery> {
        self.scope.query(&self.def)
    }

    /// Creates and saves the related record, replacing the loaded value.
    pub async fn create(&mut self, attributes: Document) -> OdmResult<Option<&Model>> {
        let instance = self.scope.build(&self.def, attributes)?;
        self.save(instance).await
    }

    /// Links `instance` to the owner, saves it and makes it the loaded value.
    ///
    /// Returns `None` and keeps the loaded value when a hook aborts the save.
    pub async fn save(&mut self, instance: Model) -> OdmResult<Option<&Model>> {
        match self.scope.save_related(&self.def, instance).await? {
            Some(instance) => {
                self.related.set(Some(instance));
                Ok(self.related.get())
            }
            None => Ok(None),
        }
    }

    pub fn attribute(&self, field: &str) -> Option<&Bson> {
        self.related.attribute(field)
    }

    pub fn set_attribute(&mut self, field: &str, value: impl Into<Bson>) -> bool {
        self.related.set_attribute(field, value)
    }
}

/// Proxy of a HasMany relation. Dereferences to the loaded [`RelatedMany`].
#[derive(Debug)]
pub struct HasMany<'a> {
    scope: Scope,
    def: RelationDef,
    related: &'a mut RelatedMany,
}

impl<'a> HasMany<'a> {
    pub(crate) fn new(scope: Scope, def: RelationDef, related: &'a mut RelatedMany) -> Self {
        Self { scope, def, related }
    }

    /// Fetches all related records and marks the proxy loaded.
    pub async fn load(&mut self) -> OdmResult<&RelatedMany> {
        let items = match self.scope.key {
            Some(_) => self
                .scope
                .query(&self.def)?
                .fetch()
                .await
                .map_err(|e| OdmError::relationship(&self.def.name, &self.scope.owner, e))?,
            None => Vec::new(),
        };

        self.related.set(items);
        Ok(&*self.related)
    }

    pub fn query(&self) -> OdmResult<ModelQuery> {
        self.scope.query(&self.def)
    }

    /// Creates and saves one related record and appends it to the list.
    pub async fn create(&mut self, attributes: Document) -> OdmResult<Option<&Model>> {
        let instance = self.scope.build(&self.def, attributes)?;
        self.save(instance).await
    }

    /// Creates and saves several related records, returning the appended slice.
    /// Records whose save a hook aborted are left out.
    pub async fn create_many(&mut self, attributes: impl IntoIterator<Item = Document>) -> OdmResult<&[Model]> {
        let instances = attributes
            .into_iter()
            .map(|attributes| self.scope.build(&self.def, attributes))
            .collect::<OdmResult<Vec<_>>>()?;

        self.save_many(instances).await
    }

    /// Links `instance` to the owner, saves it and appends it to the list.
    ///
    /// Returns `None` and leaves the list alone when a hook aborts the save.
    pub async fn save(&mut self, instance: Model) -> OdmResult<Option<&Model>> {
        let Some(instance) = self.scope.save_related(&self.def, instance).await? else {
            return Ok(None);
        };

        self.related.loaded = true;
        self.related.push(instance);
        Ok(self.related.last())
    }

    pub async fn save_many(&mut self, instances: impl IntoIterator<Item = Model>) -> OdmResult<&[Model]> {
        let start = self.related.len();
        self.related.loaded = true;

        for instance in instances {
            if let Some(instance) = self.scope.save_related(&self.def, instance).await? {
                self.related.push(instance);
            }
        }

        Ok(&self.related.as_slice()[start..])
    }
}

impl Deref for HasMany<'_> {
    type Target = RelatedMany;

    fn deref(&self) -> &RelatedMany {
        &*self.related
    }
}

impl DerefMut for HasMany<'_> {
    fn deref_mut(&mut self) -> &mut RelatedMany {
        &mut *self.related
    }
}

/// Proxy of a BelongsTo relation: the owner carries the related record's key.
///
/// Changing the association rewrites the owner's foreign key and saves the owner.
#[derive(Debug)]
pub struct BelongsTo<'a> {
    owner: &'a mut Model,
    def: RelationDef,
}

impl<'a> BelongsTo<'a> {
    pub(crate) fn new(owner: &'a mut Model, def: RelationDef) -> Self {
        Self { owner, def }
    }

    fn related(&mut self) -> &mut RelatedOne {
        self.owner.one_relations.entry(self.def.name.clone()).or_default()
    }

    pub fn is_loaded(&self) -> bool {
        self.owner.related_one(&self.def.name).is_some_and(RelatedOne::is_loaded)
    }

    pub fn get(&self) -> Option<&Model> {
        self.owner.related_one(&self.def.name).and_then(RelatedOne::get)
    }

    /// Fetches the parent record and marks the proxy loaded.
    pub async fn load(&mut self) -> OdmResult<Option<&Model>> {
        let value = self.owner.scope(&self.def).first(&self.def).await?;
        let related = self.related();
        related.set(value);

        Ok(related.get())
    }

    pub fn query(&self) -> OdmResult<ModelQuery> {
        self.owner.scope(&self.def).query(&self.def)
    }

    fn ensure_owner_saved(&self) -> OdmResult<()> {
        if self.owner.is_persisted() {
            Ok(())
        } else {
            Err(OdmError::InvalidState(format!(
                "cannot modify relation `{}` before the {} is saved",
                self.def.name,
                self.owner.name()
            )))
        }
    }

    /// Points the owner at `parent` and saves the owner. An unsaved parent is saved
    /// first.
    ///
    /// Returns `false` when a hook aborts either save; the owner's key and the loaded
    /// value are then left as they were.
    pub async fn associate(&mut self, mut parent: Model) -> OdmResult<bool> {
        self.ensure_owner_saved()?;

        if !parent.is_persisted() && !parent.save().await? {
            return Ok(false);
        }

        let key = parent
            .get(self.def.related_key())
            .filter(|key| !matches!(key, Bson::Null))
            .cloned()
            .ok_or_else(|| {
                OdmError::InvalidState(format!("{} has no value for `{}`", parent.name(), self.def.related_key()))
            })?;

        if !self.write_owner_key(key).await? {
            return Ok(false);
        }
        self.related().set(Some(parent));

        Ok(true)
    }

    /// Clears the owner's foreign key and saves the owner. Returns `false` when a hook
    /// aborts the save.
    pub async fn dissociate(&mut self) -> OdmResult<bool> {
        self.ensure_owner_saved()?;

        if !self.write_owner_key(Bson::Null).await? {
            return Ok(false);
        }
        self.related().set(None);

        Ok(true)
    }

    // Restores the previous key when the owner's save is aborted.
    async fn write_owner_key(&mut self, key: Bson) -> OdmResult<bool> {
        let field = self.def.owner_key().to_string();
        let previous = self.owner.get(&field).cloned();

        self.owner.set(&field, key);
        if self.owner.save().await? {
            return Ok(true);
        }

        match previous {
            Some(previous) => {
                self.owner.set(&field, previous);
            }
            None => {
                self.owner.unset(&field);
            }
        }
        Ok(false)
    }

    /// Creates and saves a parent record, then associates it.
    pub async fn create(&mut self, attributes: Document) -> OdmResult<Option<&Model>> {
        self.ensure_owner_saved()?;

        let parent = self.owner.scope(&self.def).build(&self.def, attributes)?;
        if !self.associate(parent).await? {
            return Ok(None);
        }

        Ok(self.get())
    }

    /// Saves `parent` and associates it.
    pub async fn save(&mut self, mut parent: Model) -> OdmResult<Option<&Model>> {
        self.ensure_owner_saved()?;

        if !parent.save().await? || !self.associate(parent).await? {
            return Ok(None);
        }

        Ok(self.get())
    }
}
