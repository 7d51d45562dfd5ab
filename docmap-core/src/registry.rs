//! The model registry: declared schemas bound by name in a single resolution pass.
//!
//! Models refer to each other by name, so declarations may appear in any order.
//! [`ModelRegistryBuilder::build`] checks every reference, infers default relation keys,
//! adds implicit foreign-key columns and computes stored names through the
//! [`NamingStrategy`]. The resulting registry is read-only and owned by the
//! [`Odm`](crate::odm::Odm).

use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    sync::Arc,
};

use crate::{
    error::{OdmError, OdmResult},
    schema::{
        snake_case, Column, ColumnKind, FieldDecl, FieldType, ModelSchema, ModelSchemaBuilder, RelationDef,
        RelationKind, ID_FIELD,
    },
};

/// Maps logical field names to stored column names.
pub trait NamingStrategy: Send + Sync + Debug {
    fn column_name(&self, model: &str, field: &str) -> String;
}

/// Stores fields under their logical names.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityNaming;

impl NamingStrategy for IdentityNaming {
    fn column_name(&self, _model: &str, field: &str) -> String {
        field.to_string()
    }
}

/// Stores `firstName` as `first_name`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnakeCaseNaming;

impl NamingStrategy for SnakeCaseNaming {
    fn column_name(&self, _model: &str, field: &str) -> String {
        snake_case(field)
    }
}

/// Resolved schemas keyed by model name.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    schemas: HashMap<String, Arc<ModelSchema>>,
}

impl ModelRegistry {
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::new()
    }

    /// Returns the schema named `name` or a configuration error naming it.
    pub fn resolve(&self, name: &str) -> OdmResult<Arc<ModelSchema>> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| OdmError::Configuration(format!("model `{name}` is not registered")))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ModelSchema>> {
        self.schemas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}

#[derive(Debug)]
pub struct ModelRegistryBuilder {
    naming: Box<dyn NamingStrategy>,
    declared: Vec<ModelSchemaBuilder>,
}

impl ModelRegistryBuilder {
    pub fn new() -> Self {
        Self {
            naming: Box::new(IdentityNaming),
            declared: Vec::new(),
        }
    }

    pub fn naming(mut self, naming: impl NamingStrategy + 'static) -> Self {
        self.naming = Box::new(naming);
        self
    }

    pub fn register(mut self, schema: ModelSchemaBuilder) -> Self {
        self.declared.push(schema);
        self
    }

    /// Resolves every declaration.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Configuration`] when a model is declared twice, a relation or
    /// embed names an unregistered model, or two fields share a name.
    pub fn build(self) -> OdmResult<ModelRegistry> {
        let mut declared: HashMap<&str, &ModelSchemaBuilder> = HashMap::new();
        for decl in &self.declared {
            if declared.insert(decl.name.as_str(), decl).is_some() {
                return Err(OdmError::Configuration(format!(
                    "model `{}` is registered twice",
                    decl.name
                )));
            }
        }

        let mut implicit: HashMap<String, Vec<FieldDecl>> = HashMap::new();
        let mut relations: HashMap<String, Vec<RelationDef>> = HashMap::new();

        for decl in &self.declared {
            for relation in &decl.relations {
                let related = declared.get(relation.related.as_str()).ok_or_else(|| {
                    OdmError::Configuration(format!(
                        "relation `{}.{}` references unknown model `{}`",
                        decl.name, relation.name, relation.related
                    ))
                })?;

                let def = match relation.kind {
                    RelationKind::HasOne | RelationKind::HasMany => RelationDef {
                        name: relation.name.clone(),
                        kind: relation.kind,
                        related: related.name.clone(),
                        local_key: relation.local_key.clone().unwrap_or_else(|| decl.primary_key.clone()),
                        foreign_key: relation
                            .foreign_key
                            .clone()
                            .unwrap_or_else(|| format!("{}_id", snake_case(&decl.name))),
                    },
                    RelationKind::BelongsTo => RelationDef {
                        name: relation.name.clone(),
                        kind: relation.kind,
                        related: related.name.clone(),
                        local_key: relation.local_key.clone().unwrap_or_else(|| related.primary_key.clone()),
                        foreign_key: relation
                            .foreign_key
                            .clone()
                            .unwrap_or_else(|| format!("{}_id", snake_case(&related.name))),
                    },
                };

                // The foreign key column lives on the side that stores the reference and
                // takes the type of the key it points at.
                let (holder, key_source) = match def.kind {
                    RelationKind::BelongsTo => (decl.name.clone(), *related),
                    RelationKind::HasOne | RelationKind::HasMany => (related.name.clone(), decl),
                };
                let field_type = if def.local_key == key_source.primary_key {
                    key_source.key_type.field_type()
                } else {
                    FieldType::Any
                };

                implicit.entry(holder).or_default().push(FieldDecl {
                    name: def.foreign_key.clone(),
                    field_type,
                    required: false,
                });
                relations.entry(decl.name.clone()).or_default().push(def);
            }

            for embed in &decl.embeds {
                if !declared.contains_key(embed.related.as_str()) {
                    return Err(OdmError::Configuration(format!(
                        "embedded collection `{}.{}` references unknown model `{}`",
                        decl.name, embed.name, embed.related
                    )));
                }
            }
        }

        let mut schemas = HashMap::new();
        for decl in &self.declared {
            let schema = self.resolve_one(
                decl,
                implicit.remove(&decl.name).unwrap_or_default(),
                relations.remove(&decl.name).unwrap_or_default(),
            )?;
            schemas.insert(decl.name.clone(), Arc::new(schema));
        }

        Ok(ModelRegistry { schemas })
    }

    fn resolve_one(
        &self,
        decl: &ModelSchemaBuilder,
        implicit: Vec<FieldDecl>,
        relations: Vec<RelationDef>,
    ) -> OdmResult<ModelSchema> {
        let mut columns = ColumnSet::new(&decl.name);

        columns.push(
            Column {
                name: decl.primary_key.clone(),
                stored_name: ID_FIELD.to_string(),
                field_type: decl.key_type.field_type(),
                required: false,
                kind: ColumnKind::Primary,
            },
            true,
        )?;

        for field in &decl.fields {
            columns.push(self.attribute(&decl.name, field), true)?;
        }

        for field in &implicit {
            columns.push(self.attribute(&decl.name, field), false)?;
        }

        if let Some(timestamps) = &decl.timestamps {
            for name in [&timestamps.created_at, &timestamps.updated_at] {
                let field = FieldDecl {
                    name: name.clone(),
                    field_type: FieldType::DateTime,
                    required: false,
                };
                columns.push(self.attribute(&decl.name, &field), false)?;
            }
        }

        for def in relations {
            columns.push(
                Column {
                    name: def.name.clone(),
                    stored_name: def.name.clone(),
                    field_type: FieldType::Any,
                    required: false,
                    kind: ColumnKind::Relation(def),
                },
                true,
            )?;
        }

        for embed in &decl.embeds {
            columns.push(
                Column {
                    name: embed.name.clone(),
                    stored_name: self.naming.column_name(&decl.name, &embed.name),
                    field_type: if embed.many { FieldType::Array } else { FieldType::Document },
                    required: false,
                    kind: ColumnKind::Embedded(embed.clone()),
                },
                true,
            )?;
        }

        let collection = decl
            .collection
            .clone()
            .unwrap_or_else(|| format!("{}s", snake_case(&decl.name)));

        Ok(ModelSchema {
            name: decl.name.clone(),
            collection,
            primary_key: decl.primary_key.clone(),
            key_type: decl.key_type,
            by_name: columns.by_name,
            by_stored: columns.by_stored,
            columns: columns.columns,
            timestamps: decl.timestamps.clone(),
            hooks: decl.hooks.clone(),
        })
    }

    fn attribute(&self, model: &str, field: &FieldDecl) -> Column {
        Column {
            name: field.name.clone(),
            stored_name: self.naming.column_name(model, &field.name),
            field_type: field.field_type,
            required: field.required,
            kind: ColumnKind::Attribute,
        }
    }
}

impl Default for ModelRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ColumnSet<'a> {
    model: &'a str,
    columns: Vec<Column>,
    by_name: HashMap<String, usize>,
    by_stored: HashMap<String, usize>,
    stored: HashSet<String>,
}

impl<'a> ColumnSet<'a> {
    fn new(model: &'a str) -> Self {
        Self {
            model,
            columns: Vec::new(),
            by_name: HashMap::new(),
            by_stored: HashMap::new(),
            stored: HashSet::new(),
        }
    }

    /// Adds a column. Duplicates are an error when `strict`, otherwise skipped.
    fn push(&mut self, column: Column, strict: bool) -> OdmResult<()> {
        if self.by_name.contains_key(&column.name) {
            if strict {
                return Err(OdmError::Configuration(format!(
                    "field `{}.{}` is declared twice",
                    self.model, column.name
                )));
            }
            return Ok(());
        }

        let index = self.columns.len();
        self.by_name.insert(column.name.clone(), index);
        if !column.is_reference() && self.stored.insert(column.stored_name.clone()) {
            self.by_stored.insert(column.stored_name.clone(), index);
        }
        self.columns.push(column);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{KeyType, RelationDecl};

    fn registry() -> ModelRegistry {
        ModelRegistry::builder()
            .register(ModelSchema::builder("Post").field("title", FieldType::String).belongs_to("author", "User"))
            .register(
                ModelSchema::builder("User")
                    .required("firstName", FieldType::String)
                    .has_many("posts", "Post")
                    .relation(RelationDecl::has_one("profile", "Profile").foreign_key("owner"))
                    .embeds_many("addresses", "Address"),
            )
            .register(ModelSchema::builder("Profile").primary_key("uuid", KeyType::Uuid))
            .register(ModelSchema::builder("Address").field("city", FieldType::String))
            .naming(SnakeCaseNaming)
            .build()
            .unwrap()
    }

    #[test]
    fn infers_default_relation_keys() {
        let registry = registry();
        let user = registry.resolve("User").unwrap();
        let post = registry.resolve("Post").unwrap();

        let posts = user.relation("posts").unwrap();
        assert_eq!(posts.local_key, "id");
        assert_eq!(posts.foreign_key, "user_id");

        let author = post.relation("author").unwrap();
        assert_eq!(author.local_key, "id");
        assert_eq!(author.foreign_key, "user_id");
        assert_eq!(author.owner_key(), "user_id");
        assert_eq!(author.related_key(), "id");

        assert_eq!(user.relation("profile").unwrap().foreign_key, "owner");
    }

    #[test]
    fn adds_implicit_foreign_key_columns() {
        let registry = registry();
        let post = registry.resolve("Post").unwrap();
        let profile = registry.resolve("Profile").unwrap();

        let user_id = post.column("user_id").unwrap();
        assert_eq!(user_id.field_type(), FieldType::ObjectId);
        assert!(!user_id.is_reference());
        assert!(profile.column("owner").is_some());
    }

    #[test]
    fn computes_stored_names() {
        let registry = registry();
        let user = registry.resolve("User").unwrap();

        assert_eq!(user.stored_name("firstName"), "first_name");
        assert_eq!(user.stored_name("id"), "_id");
        assert_eq!(user.logical_name("first_name"), "firstName");
        assert_eq!(user.collection(), "users");
        assert!(user.column("addresses").unwrap().is_embedded());
        assert!(user.column("addresses").unwrap().is_array());
        assert!(user.column("posts").unwrap().is_reference());
    }

    #[test]
    fn rejects_unknown_related_models() {
        let err = ModelRegistry::builder()
            .register(ModelSchema::builder("User").has_many("posts", "Post"))
            .build()
            .unwrap_err();

        assert!(matches!(err, OdmError::Configuration(message) if message.contains("Post")));
    }

    #[test]
    fn resolve_reports_missing_models() {
        assert!(matches!(
            registry().resolve("Comment"),
            Err(OdmError::Configuration(_))
        ));
    }
}
