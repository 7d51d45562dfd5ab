//! The filter compiler.
//!
//! Chained `where*` calls accumulate in an ordered AND-bag keyed by field; `or_where*`
//! calls accumulate in an OR-list. [`FilterBuilder::final_filters`] turns both into one
//! predicate tree:
//!
//! - with no OR conditions: nothing, the single AND entry, or `And(entries)`;
//! - with only OR conditions: `Or(conditions)`;
//! - with both: the most recent AND entry joins the OR conditions, giving
//!   `And(prefix…, Or(last, or…))` (or just `Or(last, or…)` when nothing precedes it).
//!
//! In the AND-bag an equality replaces any earlier entry for its field in place, while
//! operator conditions on the same field merge into one [`Expr::FieldSet`], a repeated
//! operator replacing the earlier value.
//!
//! # Example
//!
//! ```ignore
//! use docmap::filter::{FilterBuilder, Filterable};
//!
//! // status = active AND (age >= 18 OR role = admin)
//! let filter = FilterBuilder::new()
//!     .where_eq("status", "active")
//!     .where_op("age", ">=", 18)
//!     .or_where("role", "admin")
//!     .final_filters()?;
//! ```

use bson::Bson;
use std::sync::Arc;

use crate::{
    error::{OdmError, OdmResult},
    query::{Expr, FieldOp, Operator},
    schema::{FieldType, ModelSchema},
};

/// Which list a condition joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boolean {
    And,
    Or,
}

/// Accumulates conditions and compiles them into one predicate.
///
/// A builder bound to a schema (see [`FilterBuilder::for_schema`]) emits stored field
/// names and converts key strings to the model's native key type.
#[derive(Debug, Clone)]
pub struct FilterBuilder {
    and: Vec<(Option<String>, Expr)>,
    or: Vec<Expr>,
    errors: Vec<(String, String)>,
    schema: Option<Arc<ModelSchema>>,
    like_case_insensitive: bool,
}

impl Default for FilterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterBuilder {
    /// An unbound builder whose `like` operator string is case-insensitive.
    pub fn new() -> Self {
        Self {
            and: Vec::new(),
            or: Vec::new(),
            errors: Vec::new(),
            schema: None,
            like_case_insensitive: true,
        }
    }

    pub fn for_schema(schema: Arc<ModelSchema>) -> Self {
        Self {
            schema: Some(schema),
            ..Self::new()
        }
    }

    /// Chooses the case sensitivity of the `like`/`regex` operator strings.
    pub fn with_like_case_insensitive(mut self, case_insensitive: bool) -> Self {
        self.like_case_insensitive = case_insensitive;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.and.is_empty() && self.or.is_empty()
    }

    /// AND entries in insertion order.
    pub fn and_conditions(&self) -> impl Iterator<Item = &Expr> {
        self.and.iter().map(|(_, expr)| expr)
    }

    pub fn or_conditions(&self) -> &[Expr] {
        &self.or
    }

    /// Compiles the accumulated conditions.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] for the first unknown operator that was used.
    pub fn final_filters(&self) -> OdmResult<Option<Expr>> {
        if let Some((field, message)) = self.errors.first() {
            return Err(OdmError::validation(field, message));
        }

        let mut and = self.and.iter().map(|(_, expr)| expr.clone()).collect::<Vec<_>>();

        let compiled = if self.or.is_empty() {
            match and.len() {
                0 => None,
                1 => and.pop(),
                _ => Some(Expr::And(and)),
            }
        } else {
            match and.pop() {
                None => Some(Expr::Or(self.or.clone())),
                Some(last) => {
                    let mut alternatives = Vec::with_capacity(self.or.len() + 1);
                    alternatives.push(last);
                    alternatives.extend(self.or.iter().cloned());

                    if and.is_empty() {
                        Some(Expr::Or(alternatives))
                    } else {
                        and.push(Expr::Or(alternatives));
                        Some(Expr::And(and))
                    }
                }
            }
        };

        Ok(compiled.map(|expr| match &self.schema {
            Some(schema) => bind(schema, expr),
            None => expr,
        }))
    }

    fn add_and(&mut self, expr: Expr) {
        let key = bag_key(&expr);

        let Some(key) = key else {
            self.and.push((None, expr));
            return;
        };

        match self.and.iter_mut().find(|(k, _)| k.as_deref() == Some(key.as_str())) {
            Some((_, slot)) => {
                *slot = match (operator_conditions(slot), operator_conditions(&expr)) {
                    (Some(mut conditions), Some(incoming)) => {
                        for (op, value) in incoming {
                            match conditions.iter_mut().find(|(existing, _)| *existing == op) {
                                Some(condition) => condition.1 = value,
                                None => conditions.push((op, value)),
                            }
                        }
                        field_set(key, conditions)
                    }
                    _ => expr,
                };
            }
            None => self.and.push((Some(key), expr)),
        }
    }
}

impl Filterable for FilterBuilder {
    fn push_condition(&mut self, boolean: Boolean, expr: Expr) {
        match boolean {
            Boolean::And => self.add_and(expr),
            Boolean::Or => self.or.push(expr),
        }
    }

    fn reject(&mut self, field: &str, message: String) {
        self.errors.push((field.to_string(), message));
    }

    fn like_case_insensitive(&self) -> bool {
        self.like_case_insensitive
    }
}

// Equality and operator leaves share their field's slot; negations and existence
// checks get their own slot per field; groups are never merged.
fn bag_key(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Field { field, .. } | Expr::FieldSet { field, .. } => Some(field.clone()),
        Expr::Exists(field, _) => Some(format!("{field}$exists")),
        Expr::Not(inner) => inner.leaf_field().map(|field| format!("{field}$not")),
        Expr::And(_) | Expr::Or(_) => None,
    }
}

fn operator_conditions(expr: &Expr) -> Option<Vec<(FieldOp, Bson)>> {
    match expr {
        Expr::Field { op, value, .. } if *op != FieldOp::Eq => Some(vec![(*op, value.clone())]),
        Expr::FieldSet { conditions, .. } => Some(conditions.clone()),
        _ => None,
    }
}

fn field_set(field: String, mut conditions: Vec<(FieldOp, Bson)>) -> Expr {
    if conditions.len() == 1 {
        let (op, value) = conditions.remove(0);
        return Expr::Field { field, op, value };
    }

    Expr::FieldSet { field, conditions }
}

// Converts key-typed values and renames fields to their stored names.
fn bind(schema: &ModelSchema, expr: Expr) -> Expr {
    expr.map_values(&|field, op, value| {
        let key_type = match schema.column(field).map(|column| column.field_type()) {
            Some(field_type @ (FieldType::ObjectId | FieldType::Uuid)) => field_type,
            _ => return value,
        };

        match (op, value) {
            (FieldOp::Like { .. }, value) => value,
            (FieldOp::In | FieldOp::NotIn, Bson::Array(values)) => {
                Bson::Array(values.into_iter().map(|v| key_type.coerce(v)).collect())
            }
            (_, value) => key_type.coerce(value),
        }
    })
    .rename_fields(&|field| schema.stored_name(field))
}

/// The chainable condition surface shared by every query builder.
///
/// Implementors decide how conditions are stored; every method here is a by-value
/// builder step and never fails. Invalid operators are recorded and reported when
/// the query is compiled or executed.
pub trait Filterable: Sized {
    /// Adds one compiled condition to the AND or OR side.
    fn push_condition(&mut self, boolean: Boolean, expr: Expr);

    /// Records an invalid condition.
    fn reject(&mut self, field: &str, message: String);

    /// Case sensitivity of the `like`/`regex` operator strings.
    fn like_case_insensitive(&self) -> bool;

    fn where_expr(mut self, expr: Expr) -> Self {
        self.push_condition(Boolean::And, expr);
        self
    }

    fn or_where_expr(mut self, expr: Expr) -> Self {
        self.push_condition(Boolean::Or, expr);
        self
    }

    fn where_eq(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.where_expr(Expr::field(field, FieldOp::Eq, value))
    }

    /// Adds `field <op> value`, `op` being a symbol from the operator table.
    fn where_op(self, field: impl Into<String>, op: &str, value: impl Into<Bson>) -> Self {
        self.condition(Boolean::And, false, field.into(), op, value.into())
    }

    fn where_not(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.where_expr(Expr::field(field, FieldOp::Ne, value))
    }

    /// Adds the negation of `field <op> value`.
    fn where_not_op(self, field: impl Into<String>, op: &str, value: impl Into<Bson>) -> Self {
        self.condition(Boolean::And, true, field.into(), op, value.into())
    }

    fn where_null(self, field: impl Into<String>) -> Self {
        self.where_expr(Expr::field(field, FieldOp::Eq, Bson::Null))
    }

    fn where_not_null(self, field: impl Into<String>) -> Self {
        self.where_expr(Expr::field(field, FieldOp::Ne, Bson::Null))
    }

    fn where_exists(self, field: impl Into<String>) -> Self {
        self.where_expr(Expr::Exists(field.into(), true))
    }

    fn where_not_exists(self, field: impl Into<String>) -> Self {
        self.where_expr(Expr::Exists(field.into(), false))
    }

    fn where_in<V: Into<Bson>>(self, field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.where_expr(Expr::field(field, FieldOp::In, array(values)))
    }

    fn where_not_in<V: Into<Bson>>(self, field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.where_expr(Expr::field(field, FieldOp::NotIn, array(values)))
    }

    /// Adds `low <= field <= high`.
    fn where_between(self, field: impl Into<String>, low: impl Into<Bson>, high: impl Into<Bson>) -> Self {
        self.where_expr(between(field.into(), low.into(), high.into()))
    }

    fn where_not_between(self, field: impl Into<String>, low: impl Into<Bson>, high: impl Into<Bson>) -> Self {
        self.where_expr(between(field.into(), low.into(), high.into()).not())
    }

    /// Case-sensitive substring pattern, `%` being a wildcard.
    fn where_like(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.where_expr(like(field.into(), pattern.into(), false))
    }

    /// Case-insensitive substring pattern, `%` being a wildcard.
    fn where_ilike(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.where_expr(like(field.into(), pattern.into(), true))
    }

    /// Adds a parenthesised sub-filter built by `group`.
    fn where_group(self, group: impl FnOnce(FilterBuilder) -> FilterBuilder) -> Self {
        self.group(Boolean::And, group)
    }

    fn or_where(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.or_where_expr(Expr::field(field, FieldOp::Eq, value))
    }

    fn or_where_op(self, field: impl Into<String>, op: &str, value: impl Into<Bson>) -> Self {
        self.condition(Boolean::Or, false, field.into(), op, value.into())
    }

    fn or_where_not(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.or_where_expr(Expr::field(field, FieldOp::Ne, value))
    }

    fn or_where_null(self, field: impl Into<String>) -> Self {
        self.or_where_expr(Expr::field(field, FieldOp::Eq, Bson::Null))
    }

    fn or_where_not_null(self, field: impl Into<String>) -> Self {
        self.or_where_expr(Expr::field(field, FieldOp::Ne, Bson::Null))
    }

    fn or_where_exists(self, field: impl Into<String>) -> Self {
        self.or_where_expr(Expr::Exists(field.into(), true))
    }

    fn or_where_in<V: Into<Bson>>(self, field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.or_where_expr(Expr::field(field, FieldOp::In, array(values)))
    }

    fn or_where_not_in<V: Into<Bson>>(self, field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.or_where_expr(Expr::field(field, FieldOp::NotIn, array(values)))
    }

    fn or_where_between(self, field: impl Into<String>, low: impl Into<Bson>, high: impl Into<Bson>) -> Self {
        self.or_where_expr(between(field.into(), low.into(), high.into()))
    }

    fn or_where_like(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.or_where_expr(like(field.into(), pattern.into(), false))
    }

    fn or_where_ilike(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.or_where_expr(like(field.into(), pattern.into(), true))
    }

    fn or_where_group(self, group: impl FnOnce(FilterBuilder) -> FilterBuilder) -> Self {
        self.group(Boolean::Or, group)
    }

    #[doc(hidden)]
    fn condition(mut self, boolean: Boolean, negate: bool, field: String, op: &str, value: Bson) -> Self {
        match Operator::parse(op, self.like_case_insensitive()) {
            Ok(operator) => {
                let expr = operator.into_expr(field, value);
                self.push_condition(boolean, if negate { expr.not() } else { expr });
            }
            Err(_) => self.reject(&field, format!("unknown query operator `{op}`")),
        }
        self
    }

    #[doc(hidden)]
    fn group(mut self, boolean: Boolean, group: impl FnOnce(FilterBuilder) -> FilterBuilder) -> Self {
        let builder = group(FilterBuilder::new().with_like_case_insensitive(self.like_case_insensitive()));

        match builder.final_filters() {
            Ok(Some(expr)) => self.push_condition(boolean, expr),
            Ok(None) => {}
            Err(OdmError::Validation { field, message }) => self.reject(&field, message),
            Err(other) => self.reject("", other.to_string()),
        }
        self
    }
}

fn array<V: Into<Bson>>(values: impl IntoIterator<Item = V>) -> Bson {
    Bson::Array(values.into_iter().map(Into::into).collect())
}

fn between(field: String, low: Bson, high: Bson) -> Expr {
    Expr::FieldSet {
        field,
        conditions: vec![(FieldOp::Gte, low), (FieldOp::Lte, high)],
    }
}

fn like(field: String, pattern: String, case_insensitive: bool) -> Expr {
    Expr::Field {
        field,
        op: FieldOp::Like { case_insensitive },
        value: Bson::String(pattern),
    }
}
