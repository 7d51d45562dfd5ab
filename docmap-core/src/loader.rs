//! Bulk relationship loading.
//!
//! For each requested relation the loader collects the distinct linking keys of all
//! fetched owners and issues a single `IN` query against the related model, so loading
//! a relation for N owners costs one query instead of N. Results are distributed back
//! to the owners by key. Nested preloads ride along on that related query.

use bson::Bson;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::{
    backend::SessionToken,
    error::{OdmError, OdmResult},
    eval::{is_nullish, key_string},
    executor::Preload,
    filter::Filterable,
    model::Model,
    odm::Odm,
    schema::{ModelSchema, RelationDef, RelationKind},
};

pub(crate) async fn load_relations(
    odm: &Odm,
    schema: &ModelSchema,
    models: &mut [Model],
    preloads: Vec<Preload>,
    session: Option<SessionToken>,
) -> OdmResult<()> {
    for preload in preloads {
        let def = schema.require_relation(&preload.name)?.clone();

        load_relation(odm, models, &def, preload, session)
            .await
            .map_err(|e| OdmError::relationship(&def.name, schema.name(), e))?;
    }

    Ok(())
}

fn owner_key(model: &Model, def: &RelationDef) -> Option<String> {
    model
        .get(def.owner_key())
        .filter(|key| !is_nullish(Some(*key)))
        .map(key_string)
}

fn assign(model: &mut Model, def: &RelationDef, matches: Option<&Vec<Model>>) {
    match def.kind {
        RelationKind::HasMany => model.set_related_many(&def.name, matches.cloned().unwrap_or_default()),
        // Several matches for a single-valued relation: the last one wins.
        RelationKind::HasOne | RelationKind::BelongsTo => {
            model.set_related_one(&def.name, matches.and_then(|m| m.last()).cloned())
        }
    }
}

async fn load_relation(
    odm: &Odm,
    models: &mut [Model],
    def: &RelationDef,
    preload: Preload,
    session: Option<SessionToken>,
) -> OdmResult<()> {
    let mut seen = HashSet::new();
    let keys = models
        .iter()
        .filter_map(|model| model.get(def.owner_key()))
        .filter(|key| !is_nullish(Some(*key)) && seen.insert(key_string(key)))
        .cloned()
        .collect::<Vec<Bson>>();

    if keys.is_empty() {
        for model in models.iter_mut() {
            assign(model, def, None);
        }
        debug!(relation = def.name, "no keys to preload");
        return Ok(());
    }

    let Preload { constraint, nested, .. } = preload;
    let key_count = keys.len();

    let mut query = odm
        .query(&def.related)?
        .with_session(session)
        .where_in(def.related_key(), keys)
        .with_preloads(nested);
    if let Some(constraint) = constraint {
        query = constraint(query);
    }

    let related = query.fetch_boxed().await?;
    debug!(relation = def.name, keys = key_count, results = related.len(), "preloaded");

    let mut by_key: HashMap<String, Vec<Model>> = HashMap::new();
    for model in related {
        if let Some(key) = model.get(def.related_key()).map(key_string) {
            by_key.entry(key).or_default().push(model);
        }
    }

    for model in models.iter_mut() {
        let matches = owner_key(model, def).and_then(|key| by_key.get(&key));
        assign(model, def, matches);
    }

    Ok(())
}
