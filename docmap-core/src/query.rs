//! Predicate tree, find options and aggregation stages shared by every backend.
//!
//! The filter compiler ([`crate::filter`]) produces an [`Expr`]; backends either evaluate
//! it in process ([`crate::eval`]) or translate it to their native query language through
//! a [`QueryVisitor`].
//!
//! # Operator table
//!
//! | symbol                 | operator                              |
//! |------------------------|---------------------------------------|
//! | `=` `==` `eq`          | [`FieldOp::Eq`]                       |
//! | `!=` `<>` `ne`         | [`FieldOp::Ne`]                       |
//! | `>` `gt`               | [`FieldOp::Gt`]                       |
//! | `>=` `gte`             | [`FieldOp::Gte`]                      |
//! | `<` `lt`               | [`FieldOp::Lt`]                       |
//! | `<=` `lte`             | [`FieldOp::Lte`]                      |
//! | `in`                   | [`FieldOp::In`]                       |
//! | `not in` `nin`         | [`FieldOp::NotIn`]                    |
//! | `exists`               | [`Expr::Exists`]                      |
//! | `like` `regex`         | [`FieldOp::Like`], case-insensitive   |

use bson::Bson;
use std::{fmt, str::FromStr};

use crate::{
    backend::SessionToken,
    error::{OdmError, OdmResult},
};

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

impl FromStr for SortDirection {
    type Err = OdmError;

    fn from_str(s: &str) -> OdmResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortDirection::Asc),
            "desc" | "descending" => Ok(SortDirection::Desc),
            other => Err(OdmError::validation("order_by", format!("unknown sort direction `{other}`"))),
        }
    }
}

/// Sort specification for query results.
#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    /// The field name to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

impl Sort {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Sort { field: field.into(), direction }
    }
}

/// Field comparison operators for filter expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    /// Equal to (exact match).
    Eq,
    /// Not equal to.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// Value is one of the given array elements.
    In,
    /// Value is none of the given array elements.
    NotIn,
    /// Substring pattern match where `%` is a wildcard.
    Like {
        /// Whether letter case is ignored.
        case_insensitive: bool,
    },
}

impl FieldOp {
    /// The MongoDB operator symbol for this operator.
    pub fn symbol(&self) -> &'static str {
        match self {
            FieldOp::Eq => "$eq",
            FieldOp::Ne => "$ne",
            FieldOp::Gt => "$gt",
            FieldOp::Gte => "$gte",
            FieldOp::Lt => "$lt",
            FieldOp::Lte => "$lte",
            FieldOp::In => "$in",
            FieldOp::NotIn => "$nin",
            FieldOp::Like { .. } => "$regex",
        }
    }
}

/// An operator parsed from the closed operator table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// A field comparison.
    Field(FieldOp),
    /// Field existence check; the value is interpreted as a boolean.
    Exists,
}

impl Operator {
    /// Parses an operator symbol, choosing the case sensitivity used for `like`.
    pub fn parse(symbol: &str, like_case_insensitive: bool) -> OdmResult<Self> {
        let normalized = symbol
            .trim()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();

        Ok(match normalized.as_str() {
            "=" | "==" | "eq" => Operator::Field(FieldOp::Eq),
            "!=" | "<>" | "ne" => Operator::Field(FieldOp::Ne),
            ">" | "gt" => Operator::Field(FieldOp::Gt),
            ">=" | "gte" => Operator::Field(FieldOp::Gte),
            "<" | "lt" => Operator::Field(FieldOp::Lt),
            "<=" | "lte" => Operator::Field(FieldOp::Lte),
            "in" => Operator::Field(FieldOp::In),
            "not in" | "nin" => Operator::Field(FieldOp::NotIn),
            "exists" => Operator::Exists,
            "like" | "regex" => Operator::Field(FieldOp::Like {
                case_insensitive: like_case_insensitive,
            }),
            _ => {
                return Err(OdmError::validation(
                    symbol,
                    format!("unknown query operator `{symbol}`"),
                ));
            }
        })
    }

    /// Builds the leaf expression for `field <op> value`.
    pub fn into_expr(self, field: String, value: Bson) -> Expr {
        match self {
            Operator::Field(op) => Expr::Field { field, op, value },
            Operator::Exists => Expr::Exists(field, truthy(&value)),
        }
    }
}

impl FromStr for Operator {
    type Err = OdmError;

    fn from_str(s: &str) -> OdmResult<Self> {
        Operator::parse(s, true)
    }
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null | Bson::Undefined => false,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        _ => true,
    }
}

/// A predicate node.
///
/// Leaves compare one field; composites combine children. [`Expr::FieldSet`] is the
/// merged form of several operator conditions on the same field
/// (`{age: {$gte: 18, $lt: 65}}`).
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Logical AND of multiple expressions (all must match).
    And(Vec<Expr>),
    /// Logical OR of multiple expressions (any must match).
    Or(Vec<Expr>),
    /// Logical NOT of an expression (inverts the result).
    Not(Box<Expr>),
    /// Checks if a field exists or doesn't exist.
    Exists(String, bool),
    /// Field comparison expression.
    Field {
        /// The field name to compare.
        field: String,
        /// The comparison operator.
        op: FieldOp,
        /// The value to compare against.
        value: Bson,
    },
    /// Several operator conditions on one field, all of which must hold.
    FieldSet {
        /// The field name to compare.
        field: String,
        /// Operator/value pairs, at most one per operator.
        conditions: Vec<(FieldOp, Bson)>,
    },
}

impl Expr {
    /// Creates a field comparison expression.
    pub fn field(field: impl Into<String>, op: FieldOp, value: impl Into<Bson>) -> Self {
        Expr::Field { field: field.into(), op, value: value.into() }
    }

    /// Combines this expression with another using logical AND.
    ///
    /// If this expression is already an AND, the other expression is appended
    /// to the list. Otherwise, a new AND expression is created.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    /// Negates this expression (logical NOT).
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// The single field a leaf (or a negated leaf) constrains.
    pub fn leaf_field(&self) -> Option<&str> {
        match self {
            Expr::Field { field, .. } | Expr::FieldSet { field, .. } | Expr::Exists(field, _) => Some(field),
            Expr::Not(inner) => inner.leaf_field(),
            Expr::And(_) | Expr::Or(_) => None,
        }
    }

    /// Rewrites every field name in the tree.
    pub fn rename_fields(self, rename: &impl Fn(&str) -> String) -> Expr {
        match self {
            Expr::And(list) => Expr::And(list.into_iter().map(|e| e.rename_fields(rename)).collect()),
            Expr::Or(list) => Expr::Or(list.into_iter().map(|e| e.rename_fields(rename)).collect()),
            Expr::Not(inner) => Expr::Not(Box::new(inner.rename_fields(rename))),
            Expr::Exists(field, should_exist) => Expr::Exists(rename(&field), should_exist),
            Expr::Field { field, op, value } => Expr::Field { field: rename(&field), op, value },
            Expr::FieldSet { field, conditions } => Expr::FieldSet { field: rename(&field), conditions },
        }
    }

    /// Rewrites every comparison value in the tree.
    pub fn map_values(self, map: &impl Fn(&str, FieldOp, Bson) -> Bson) -> Expr {
        match self {
            Expr::And(list) => Expr::And(list.into_iter().map(|e| e.map_values(map)).collect()),
            Expr::Or(list) => Expr::Or(list.into_iter().map(|e| e.map_values(map)).collect()),
            Expr::Not(inner) => Expr::Not(Box::new(inner.map_values(map))),
            Expr::Exists(..) => self,
            Expr::Field { field, op, value } => {
                let value = map(&field, op, value);
                Expr::Field { field, op, value }
            }
            Expr::FieldSet { field, conditions } => {
                let conditions = conditions
                    .into_iter()
                    .map(|(op, value)| (op, map(&field, op, value)))
                    .collect();
                Expr::FieldSet { field, conditions }
            }
        }
    }
}

/// Helper struct for constructing filter expressions.
///
/// # Example
///
/// ```ignore
/// use docmap::query::Filter;
///
/// let expr = Filter::eq("name", "Alice").and(Filter::gt("age", 18));
/// ```
pub struct Filter;

impl Filter {
    /// Matches documents where the field equals the specified value.
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Eq, value)
    }

    /// Matches documents where the field does not equal the specified value.
    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Ne, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Gte, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Lt, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Lte, value)
    }

    /// Matches documents where the field is one of `values`.
    pub fn in_list(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Bson>>) -> Expr {
        Expr::field(field, FieldOp::In, Bson::Array(values.into_iter().map(Into::into).collect()))
    }

    /// Matches documents where the field is none of `values`.
    pub fn not_in(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Bson>>) -> Expr {
        Expr::field(field, FieldOp::NotIn, Bson::Array(values.into_iter().map(Into::into).collect()))
    }

    /// Case-insensitive substring pattern, `%` being a wildcard.
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Expr {
        Expr::field(field, FieldOp::Like { case_insensitive: true }, pattern.into())
    }

    pub fn exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), true)
    }

    pub fn not_exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), false)
    }

    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(exprs.into_iter().collect())
    }

    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(exprs.into_iter().collect())
    }
}

/// Options accompanying a `find` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Fields to return. The primary key is always returned.
    pub projection: Option<Vec<String>>,
    /// Sort keys, the first being the primary key.
    pub sort: Vec<Sort>,
    /// Number of documents to skip.
    pub skip: Option<u64>,
    /// Maximum number of documents to return.
    pub limit: Option<u64>,
    /// Session the operation belongs to.
    pub session: Option<SessionToken>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_session(mut self, session: Option<SessionToken>) -> Self {
        self.session = session;
        self
    }
}

/// Group accumulators supported by [`Stage::Group`].
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    /// Number of documents in the group.
    Count {
        output: String,
    },
    /// Value of `field` in the first document of the group.
    First {
        output: String,
        field: String,
    },
}

/// One aggregation pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Expr),
    /// Groups by `keys`; the output `_id` is a document of the key values.
    Group {
        keys: Vec<String>,
        accumulators: Vec<Accumulator>,
    },
    Sort(Vec<Sort>),
    Skip(u64),
    Limit(u64),
    Project(Vec<String>),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Match(_) => write!(f, "$match"),
            Stage::Group { .. } => write!(f, "$group"),
            Stage::Sort(_) => write!(f, "$sort"),
            Stage::Skip(_) => write!(f, "$skip"),
            Stage::Limit(_) => write!(f, "$limit"),
            Stage::Project(_) => write!(f, "$project"),
        }
    }
}

pub trait QueryVisitor {
    type Output;
    type Error: Into<OdmError>;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error>;
    fn visit_exists(
        &mut self,
        field: &str,
        should_exist: bool,
    ) -> Result<Self::Output, Self::Error>;
    fn visit_field(
        &mut self,
        field: &str,
        op: &FieldOp,
        value: &Bson,
    ) -> Result<Self::Output, Self::Error>;

    /// Visits a merged multi-operator leaf. Defaults to the conjunction of its conditions.
    fn visit_field_set(
        &mut self,
        field: &str,
        conditions: &[(FieldOp, Bson)],
    ) -> Result<Self::Output, Self::Error> {
        let exprs = conditions
            .iter()
            .map(|(op, value)| Expr::field(field, *op, value.clone()))
            .collect::<Vec<_>>();

        self.visit_and(&exprs)
    }

    fn visit_expr(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Exists(field, should_exist) => self.visit_exists(field, *should_exist),
            Expr::Field { field, op, value } => self.visit_field(field, op, value),
            Expr::FieldSet { field, conditions } => self.visit_field_set(field, conditions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_operator_table() {
        assert_eq!(Operator::parse("==", true).unwrap(), Operator::Field(FieldOp::Eq));
        assert_eq!(Operator::parse("<>", true).unwrap(), Operator::Field(FieldOp::Ne));
        assert_eq!(Operator::parse("GTE", true).unwrap(), Operator::Field(FieldOp::Gte));
        assert_eq!(Operator::parse("not  in", true).unwrap(), Operator::Field(FieldOp::NotIn));
        assert_eq!(Operator::parse("nin", true).unwrap(), Operator::Field(FieldOp::NotIn));
        assert_eq!(Operator::parse("exists", true).unwrap(), Operator::Exists);
        assert_eq!(
            Operator::parse("regex", true).unwrap(),
            Operator::Field(FieldOp::Like { case_insensitive: true })
        );
        assert_eq!(
            Operator::parse("like", false).unwrap(),
            Operator::Field(FieldOp::Like { case_insensitive: false })
        );
    }

    #[test]
    fn rejects_unknown_operators() {
        assert!(matches!(
            Operator::parse("~=", true),
            Err(OdmError::Validation { .. })
        ));
    }

    #[test]
    fn exists_operator_reads_value_as_boolean() {
        assert_eq!(
            Operator::Exists.into_expr("email".into(), Bson::Boolean(false)),
            Expr::Exists("email".into(), false)
        );
        assert_eq!(
            Operator::Exists.into_expr("email".into(), Bson::Int32(1)),
            Expr::Exists("email".into(), true)
        );
    }

    #[test]
    fn renames_fields_through_the_whole_tree() {
        let expr = Filter::and([
            Filter::eq("firstName", "Ada"),
            Filter::or([Filter::exists("lastName"), Filter::gt("age", 3)]).not(),
        ])
        .rename_fields(&|f| format!("x_{f}"));

        assert_eq!(
            expr,
            Filter::and([
                Filter::eq("x_firstName", "Ada"),
                Filter::or([Filter::exists("x_lastName"), Filter::gt("x_age", 3)]).not(),
            ])
        );
    }
}
