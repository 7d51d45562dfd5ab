//! Model metadata: columns, relations, embedded collections and key types.
//!
//! Schemas are declared with [`ModelSchema::builder`] and only become usable once a
//! [`ModelRegistry`](crate::registry::ModelRegistry) has resolved them. Resolution binds
//! related model names, infers default keys and computes stored column names, after
//! which a schema is read-only.
//!
//! # Example
//!
//! ```ignore
//! use docmap::schema::{FieldType, ModelSchema, RelationDecl};
//!
//! let user = ModelSchema::builder("User")
//!     .required("name", FieldType::String)
//!     .field("age", FieldType::Int)
//!     .timestamps()
//!     .relation(RelationDecl::has_many("posts", "Post"))
//!     .embeds_many("addresses", "Address");
//! ```

use bson::{oid::ObjectId, spec::BinarySubtype, Binary, Bson, DateTime, Document};
use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    error::{OdmError, OdmResult},
    hooks::ModelHook,
};

/// Stored name of every primary key.
pub const ID_FIELD: &str = "_id";

/// Declared type of a column, used for coercion on hydration and validation on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Any,
    String,
    Int,
    Float,
    Bool,
    DateTime,
    ObjectId,
    Uuid,
    Document,
    Array,
}

impl FieldType {
    /// Converts a raw value to this type where a lossless conversion exists.
    ///
    /// RFC 3339 strings and epoch milliseconds become datetimes, integral doubles become
    /// integers, hex strings become ObjectIds and UUID strings become UUID binaries.
    /// Values that cannot be converted are returned unchanged.
    pub fn coerce(&self, value: Bson) -> Bson {
        match (self, value) {
            (FieldType::DateTime, Bson::String(s)) => match chrono::DateTime::parse_from_rfc3339(&s) {
                Ok(parsed) => Bson::DateTime(DateTime::from_millis(parsed.timestamp_millis())),
                Err(_) => Bson::String(s),
            },
            (FieldType::DateTime, Bson::Int64(millis)) => Bson::DateTime(DateTime::from_millis(millis)),
            (FieldType::DateTime, Bson::Int32(millis)) => Bson::DateTime(DateTime::from_millis(millis as i64)),
            (FieldType::DateTime, Bson::Double(millis)) if millis.fract() == 0.0 => {
                Bson::DateTime(DateTime::from_millis(millis as i64))
            }
            (FieldType::Int, Bson::Double(n)) if n.fract() == 0.0 => Bson::Int64(n as i64),
            (FieldType::Float, Bson::Int32(n)) => Bson::Double(n as f64),
            (FieldType::Float, Bson::Int64(n)) => Bson::Double(n as f64),
            (FieldType::ObjectId, Bson::String(s)) => match ObjectId::parse_str(&s) {
                Ok(oid) => Bson::ObjectId(oid),
                Err(_) => Bson::String(s),
            },
            (FieldType::Uuid, Bson::String(s)) => match uuid::Uuid::parse_str(&s) {
                Ok(id) => uuid_bson(id),
                Err(_) => Bson::String(s),
            },
            (_, value) => value,
        }
    }

    /// Whether a non-null value satisfies this type.
    pub fn accepts(&self, value: &Bson) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::String => matches!(value, Bson::String(_)),
            FieldType::Int => matches!(value, Bson::Int32(_) | Bson::Int64(_)),
            FieldType::Float => matches!(value, Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_)),
            FieldType::Bool => matches!(value, Bson::Boolean(_)),
            FieldType::DateTime => matches!(value, Bson::DateTime(_)),
            FieldType::ObjectId => matches!(value, Bson::ObjectId(_)),
            FieldType::Uuid => matches!(value, Bson::Binary(b) if b.bytes.len() == 16),
            FieldType::Document => matches!(value, Bson::Document(_)),
            FieldType::Array => matches!(value, Bson::Array(_)),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Any => "any",
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::DateTime => "datetime",
            FieldType::ObjectId => "object id",
            FieldType::Uuid => "uuid",
            FieldType::Document => "document",
            FieldType::Array => "array",
        };
        f.write_str(name)
    }
}

pub(crate) fn uuid_bson(id: uuid::Uuid) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Uuid,
        bytes: id.as_bytes().to_vec(),
    })
}

/// Native type of a model's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyType {
    #[default]
    ObjectId,
    Uuid,
}

impl KeyType {
    pub fn field_type(&self) -> FieldType {
        match self {
            KeyType::ObjectId => FieldType::ObjectId,
            KeyType::Uuid => FieldType::Uuid,
        }
    }

    /// Parses string keys to the native type, keeping the raw value when parsing fails.
    pub fn convert(&self, value: Bson) -> Bson {
        self.field_type().coerce(value)
    }

    /// Generates a fresh key.
    pub fn generate(&self) -> Bson {
        match self {
            KeyType::ObjectId => Bson::ObjectId(ObjectId::new()),
            KeyType::Uuid => uuid_bson(uuid::Uuid::new_v4()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    HasOne,
    HasMany,
    BelongsTo,
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationKind::HasOne => f.write_str("has one"),
            RelationKind::HasMany => f.write_str("has many"),
            RelationKind::BelongsTo => f.write_str("belongs to"),
        }
    }
}

/// A relation as declared, before related names are bound and keys inferred.
#[derive(Debug, Clone)]
pub struct RelationDecl {
    pub(crate) name: String,
    pub(crate) kind: RelationKind,
    pub(crate) related: String,
    pub(crate) local_key: Option<String>,
    pub(crate) foreign_key: Option<String>,
}

impl RelationDecl {
    fn new(name: impl Into<String>, kind: RelationKind, related: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            related: related.into(),
            local_key: None,
            foreign_key: None,
        }
    }

    /// The related model stores this model's key in its foreign key; at most one match.
    pub fn has_one(name: impl Into<String>, related: impl Into<String>) -> Self {
        Self::new(name, RelationKind::HasOne, related)
    }

    /// The related model stores this model's key in its foreign key.
    pub fn has_many(name: impl Into<String>, related: impl Into<String>) -> Self {
        Self::new(name, RelationKind::HasMany, related)
    }

    /// This model stores the related model's key in its own foreign key.
    pub fn belongs_to(name: impl Into<String>, related: impl Into<String>) -> Self {
        Self::new(name, RelationKind::BelongsTo, related)
    }

    /// Overrides the key on the side that is matched against the foreign key.
    ///
    /// Defaults to the primary key of the owner (HasOne/HasMany) or of the related
    /// model (BelongsTo).
    pub fn local_key(mut self, key: impl Into<String>) -> Self {
        self.local_key = Some(key.into());
        self
    }

    /// Overrides the foreign key, `{model}_id` in snake case by default.
    pub fn foreign_key(mut self, key: impl Into<String>) -> Self {
        self.foreign_key = Some(key.into());
        self
    }
}

/// A resolved relation.
///
/// For HasOne/HasMany, `local_key` lives on the owner and `foreign_key` on the related
/// model. For BelongsTo, `foreign_key` lives on the owner and `local_key` on the related
/// model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    pub name: String,
    pub kind: RelationKind,
    pub related: String,
    pub local_key: String,
    pub foreign_key: String,
}

impl RelationDef {
    /// The owner field whose value scopes the related query.
    pub fn owner_key(&self) -> &str {
        match self.kind {
            RelationKind::BelongsTo => &self.foreign_key,
            RelationKind::HasOne | RelationKind::HasMany => &self.local_key,
        }
    }

    /// The related field matched against the owner key.
    pub fn related_key(&self) -> &str {
        match self.kind {
            RelationKind::BelongsTo => &self.local_key,
            RelationKind::HasOne | RelationKind::HasMany => &self.foreign_key,
        }
    }
}

/// An embedded collection definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedDef {
    pub name: String,
    pub related: String,
    pub many: bool,
}

#[derive(Debug, Clone)]
pub enum ColumnKind {
    Attribute,
    Primary,
    Relation(RelationDef),
    Embedded(EmbedDef),
}

/// Column descriptor for one field of a model.
#[derive(Debug, Clone)]
pub struct Column {
    pub(crate) name: String,
    pub(crate) stored_name: String,
    pub(crate) field_type: FieldType,
    pub(crate) required: bool,
    pub(crate) kind: ColumnKind,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the field in stored documents.
    pub fn stored_name(&self) -> &str {
        &self.stored_name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn kind(&self) -> &ColumnKind {
        &self.kind
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.kind, ColumnKind::Primary)
    }

    /// Whether this column is a relation to another stored model.
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, ColumnKind::Relation(_))
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.kind, ColumnKind::Embedded(_))
    }

    pub fn is_array(&self) -> bool {
        match &self.kind {
            ColumnKind::Relation(def) => def.kind == RelationKind::HasMany,
            ColumnKind::Embedded(def) => def.many,
            _ => self.field_type == FieldType::Array,
        }
    }

    pub fn is_belongs_to(&self) -> bool {
        matches!(&self.kind, ColumnKind::Relation(def) if def.kind == RelationKind::BelongsTo)
    }

    /// Whether the column is written to the store as a plain attribute.
    pub fn is_persisted_attribute(&self) -> bool {
        matches!(self.kind, ColumnKind::Attribute | ColumnKind::Primary)
    }

    pub fn relation(&self) -> Option<&RelationDef> {
        match &self.kind {
            ColumnKind::Relation(def) => Some(def),
            _ => None,
        }
    }

    pub fn embed(&self) -> Option<&EmbedDef> {
        match &self.kind {
            ColumnKind::Embedded(def) => Some(def),
            _ => None,
        }
    }

    pub fn local_key(&self) -> Option<&str> {
        self.relation().map(|def| def.local_key.as_str())
    }

    pub fn foreign_key(&self) -> Option<&str> {
        self.relation().map(|def| def.foreign_key.as_str())
    }

    pub fn related_model(&self) -> Option<&str> {
        match &self.kind {
            ColumnKind::Relation(def) => Some(&def.related),
            ColumnKind::Embedded(def) => Some(&def.related),
            _ => None,
        }
    }
}

/// Names of the timestamp fields stamped on save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamps {
    pub created_at: String,
    pub updated_at: String,
}

impl Default for Timestamps {
    fn default() -> Self {
        Self {
            created_at: "created_at".to_string(),
            updated_at: "updated_at".to_string(),
        }
    }
}

/// Resolved metadata of one model type.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    pub(crate) name: String,
    pub(crate) collection: String,
    pub(crate) primary_key: String,
    pub(crate) key_type: KeyType,
    pub(crate) columns: Vec<Column>,
    pub(crate) by_name: HashMap<String, usize>,
    pub(crate) by_stored: HashMap<String, usize>,
    pub(crate) timestamps: Option<Timestamps>,
    pub(crate) hooks: Vec<Arc<dyn ModelHook>>,
}

impl ModelSchema {
    /// Starts declaring a model named `name`.
    pub fn builder(name: impl Into<String>) -> ModelSchemaBuilder {
        ModelSchemaBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Logical name of the primary key field.
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    pub fn timestamps(&self) -> Option<&Timestamps> {
        self.timestamps.as_ref()
    }

    pub fn hooks(&self) -> &[Arc<dyn ModelHook>] {
        &self.hooks
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.column(name).and_then(Column::relation)
    }

    pub fn embed(&self, name: &str) -> Option<&EmbedDef> {
        self.column(name).and_then(Column::embed)
    }

    /// The relation named `name`, or a configuration error.
    pub fn require_relation(&self, name: &str) -> OdmResult<&RelationDef> {
        self.relation(name).ok_or_else(|| {
            OdmError::Configuration(format!("{} has no relation named `{name}`", self.name))
        })
    }

    pub fn require_embed(&self, name: &str) -> OdmResult<&EmbedDef> {
        self.embed(name).ok_or_else(|| {
            OdmError::Configuration(format!("{} has no embedded collection named `{name}`", self.name))
        })
    }

    /// Maps a logical (possibly dotted) field name to its stored name.
    /// Undeclared fields are stored under their logical name.
    pub fn stored_name(&self, field: &str) -> String {
        let (head, tail) = match field.split_once('.') {
            Some((head, tail)) => (head, Some(tail)),
            None => (field, None),
        };

        let head = match self.column(head) {
            Some(column) => column.stored_name.as_str(),
            None => head,
        };

        match tail {
            Some(tail) => format!("{head}.{tail}"),
            None => head.to_string(),
        }
    }

    /// Maps a stored field name back to its logical name.
    pub fn logical_name<'a>(&'a self, stored: &'a str) -> &'a str {
        match self.by_stored.get(stored) {
            Some(&i) => &self.columns[i].name,
            None => stored,
        }
    }

    /// Applies the declared type of `field` to `value`. Primary keys are converted to the
    /// native key type.
    pub fn coerce(&self, field: &str, value: Bson) -> Bson {
        match self.column(field) {
            Some(column) => column.field_type.coerce(value),
            None => value,
        }
    }

    /// Converts a logical attribute map to a stored document.
    pub fn to_stored(&self, attributes: &Document) -> Document {
        attributes
            .iter()
            .map(|(k, v)| (self.stored_name(k), v.clone()))
            .collect()
    }

    /// Converts a stored document to logical names, coercing declared types.
    pub fn from_stored(&self, stored: Document) -> Document {
        stored
            .into_iter()
            .map(|(k, v)| {
                let name = self.logical_name(&k).to_string();
                let value = self.coerce(&name, v);
                (name, value)
            })
            .collect()
    }

    /// Checks required fields and declared types of plain attributes.
    pub fn validate(&self, attributes: &Document) -> OdmResult<()> {
        for column in self.columns.iter().filter(|c| matches!(c.kind, ColumnKind::Attribute)) {
            match attributes.get(&column.name) {
                None | Some(Bson::Null) if column.required => {
                    return Err(OdmError::validation(&column.name, "field is required"));
                }
                Some(value) if !matches!(value, Bson::Null) && !column.field_type.accepts(value) => {
                    return Err(OdmError::validation(
                        &column.name,
                        format!("expected a value of type {}", column.field_type),
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FieldDecl {
    pub(crate) name: String,
    pub(crate) field_type: FieldType,
    pub(crate) required: bool,
}

/// Declares a model before resolution.
#[derive(Debug, Clone)]
pub struct ModelSchemaBuilder {
    pub(crate) name: String,
    pub(crate) collection: Option<String>,
    pub(crate) primary_key: String,
    pub(crate) key_type: KeyType,
    pub(crate) fields: Vec<FieldDecl>,
    pub(crate) relations: Vec<RelationDecl>,
    pub(crate) embeds: Vec<EmbedDef>,
    pub(crate) timestamps: Option<Timestamps>,
    pub(crate) hooks: Vec<Arc<dyn ModelHook>>,
}

impl ModelSchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: None,
            primary_key: "id".to_string(),
            key_type: KeyType::default(),
            fields: Vec::new(),
            relations: Vec::new(),
            embeds: Vec::new(),
            timestamps: None,
            hooks: Vec::new(),
        }
    }

    /// Sets the collection name. Defaults to the snake-cased model name plus `s`.
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    /// Sets the logical primary key name (stored as `_id`) and its native type.
    pub fn primary_key(mut self, name: impl Into<String>, key_type: KeyType) -> Self {
        self.primary_key = name.into();
        self.key_type = key_type;
        self
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            field_type,
            required: false,
        });
        self
    }

    /// Declares a field that must be present and non-null on save.
    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            field_type,
            required: true,
        });
        self
    }

    /// Stamps `created_at`/`updated_at` on insert and update.
    pub fn timestamps(mut self) -> Self {
        self.timestamps = Some(Timestamps::default());
        self
    }

    pub fn timestamps_named(mut self, created_at: impl Into<String>, updated_at: impl Into<String>) -> Self {
        self.timestamps = Some(Timestamps {
            created_at: created_at.into(),
            updated_at: updated_at.into(),
        });
        self
    }

    pub fn relation(mut self, relation: RelationDecl) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn has_one(self, name: impl Into<String>, related: impl Into<String>) -> Self {
        self.relation(RelationDecl::has_one(name, related))
    }

    pub fn has_many(self, name: impl Into<String>, related: impl Into<String>) -> Self {
        self.relation(RelationDecl::has_many(name, related))
    }

    pub fn belongs_to(self, name: impl Into<String>, related: impl Into<String>) -> Self {
        self.relation(RelationDecl::belongs_to(name, related))
    }

    /// Embeds a single sub-document described by the model `related`.
    pub fn embeds_one(mut self, name: impl Into<String>, related: impl Into<String>) -> Self {
        self.embeds.push(EmbedDef {
            name: name.into(),
            related: related.into(),
            many: false,
        });
        self
    }

    /// Embeds an array of sub-documents described by the model `related`.
    pub fn embeds_many(mut self, name: impl Into<String>, related: impl Into<String>) -> Self {
        self.embeds.push(EmbedDef {
            name: name.into(),
            related: related.into(),
            many: true,
        });
        self
    }

    pub fn hook(mut self, hook: impl ModelHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// `BlogPost` -> `blog_post`.
pub(crate) fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut previous_lower = false;

    for ch in name.chars() {
        if ch.is_uppercase() {
            if previous_lower {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            previous_lower = false;
        } else {
            previous_lower = ch.is_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_cases_model_names() {
        assert_eq!(snake_case("User"), "user");
        assert_eq!(snake_case("BlogPost"), "blog_post");
        assert_eq!(snake_case("firstName"), "first_name");
        assert_eq!(snake_case("already_snake"), "already_snake");
    }

    #[test]
    fn coerces_declared_types() {
        let parsed = FieldType::DateTime.coerce(Bson::String("2024-01-02T03:04:05Z".into()));
        assert_eq!(parsed, Bson::DateTime(DateTime::from_millis(1_704_164_645_000)));

        assert_eq!(
            FieldType::DateTime.coerce(Bson::Int64(1_000)),
            Bson::DateTime(DateTime::from_millis(1_000))
        );
        assert_eq!(FieldType::Int.coerce(Bson::Double(3.0)), Bson::Int64(3));
        assert_eq!(FieldType::Int.coerce(Bson::Double(3.5)), Bson::Double(3.5));
        assert_eq!(FieldType::Float.coerce(Bson::Int32(2)), Bson::Double(2.0));

        let oid = ObjectId::new();
        assert_eq!(FieldType::ObjectId.coerce(Bson::String(oid.to_hex())), Bson::ObjectId(oid));
        assert_eq!(
            FieldType::ObjectId.coerce(Bson::String("not-an-id".into())),
            Bson::String("not-an-id".into())
        );
    }

    #[test]
    fn uuid_keys_parse_and_generate() {
        let id = uuid::Uuid::new_v4();

        assert_eq!(KeyType::Uuid.convert(Bson::String(id.to_string())), uuid_bson(id));
        assert!(FieldType::Uuid.accepts(&KeyType::Uuid.generate()));
        assert!(FieldType::ObjectId.accepts(&KeyType::ObjectId.generate()));
    }
}
