//! In-process evaluation of predicate trees.
//!
//! Used by the embedded query builder and by the in-memory backend, so both agree
//! on comparison, `like` and missing-field semantics.

use bson::{oid::ObjectId, Bson, DateTime, Document};
use std::{cmp::Ordering, collections::BTreeMap};

use crate::{
    error::{OdmError, OdmResult},
    query::{Expr, FieldOp, QueryVisitor, Sort, SortDirection},
};

/// Type-erased, comparable representation of BSON values.
///
/// Numeric types are normalised to `f64`.
#[derive(Debug)]
pub enum Comparable<'a> {
    Null,
    Bool(bool),
    Number(f64),
    DateTime(DateTime),
    String(&'a str),
    ObjectId(ObjectId),
    Binary(&'a [u8]),
    Array(Vec<Comparable<'a>>),
    Map(BTreeMap<&'a str, Comparable<'a>>),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null | Bson::Undefined => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(*value as f64),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::ObjectId(value) => Comparable::ObjectId(*value),
            Bson::Binary(binary) => Comparable::Binary(&binary.bytes),
            Bson::Array(arr) => Comparable::Array(arr.iter().map(Comparable::from).collect()),
            Bson::Document(doc) => Comparable::Map(
                doc.iter()
                    .map(|(k, v)| (k.as_str(), Comparable::from(v)))
                    .collect(),
            ),
            _ => Comparable::Null,
        }
    }
}

impl Comparable<'_> {
    // Cross-type ordering for sorts, following MongoDB's BSON comparison order.
    fn type_rank(&self) -> u8 {
        match self {
            Comparable::Null => 0,
            Comparable::Number(_) => 1,
            Comparable::String(_) => 2,
            Comparable::Map(_) => 3,
            Comparable::Array(_) => 4,
            Comparable::Binary(_) => 5,
            Comparable::ObjectId(_) => 6,
            Comparable::Bool(_) => 7,
            Comparable::DateTime(_) => 8,
        }
    }
}

impl PartialEq for Comparable<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a == b,
            (Comparable::Binary(a), Comparable::Binary(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Comparable<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a.partial_cmp(b),
            (Comparable::Binary(a), Comparable::Binary(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl Comparable<'_> {
    /// Sort order: values of different types by type rank, numbers by
    /// [`f64::total_cmp`], arrays and maps element by element.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => Ordering::Equal,
            (Comparable::Bool(a), Comparable::Bool(b)) => a.cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.total_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.cmp(b),
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a.cmp(b),
            (Comparable::Binary(a), Comparable::Binary(b)) => a.cmp(b),
            (Comparable::Array(a), Comparable::Array(b)) => a
                .iter()
                .zip(b)
                .map(|(a, b)| a.total_cmp(b))
                .find(|ordering| ordering.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            (Comparable::Map(a), Comparable::Map(b)) => a
                .iter()
                .zip(b)
                .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| va.total_cmp(vb)))
                .find(|ordering| ordering.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

/// Total order over BSON values used for sorting.
pub fn compare_bson(left: &Bson, right: &Bson) -> Ordering {
    Comparable::from(left).total_cmp(&Comparable::from(right))
}

/// Compares two documents by a list of sort keys, the first key being primary.
pub fn compare_documents(left: &Document, right: &Document, sorts: &[Sort]) -> Ordering {
    for sort in sorts {
        let left = lookup_path(left, &sort.field).unwrap_or(&Bson::Null);
        let right = lookup_path(right, &sort.field).unwrap_or(&Bson::Null);

        let ordering = match sort.direction {
            SortDirection::Asc => compare_bson(left, right),
            SortDirection::Desc => compare_bson(right, left),
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}

/// Resolves a possibly dotted path (`address.city`) inside a document.
pub fn lookup_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;

    for segment in segments {
        current = current.as_document()?.get(segment)?;
    }

    Some(current)
}

/// Matches `pattern` as an unanchored substring pattern where `%` is a wildcard.
///
/// The literal segments between wildcards must appear in order.
pub fn like_match(haystack: &str, pattern: &str, case_insensitive: bool) -> bool {
    let (haystack, pattern) = if case_insensitive {
        (haystack.to_lowercase(), pattern.to_lowercase())
    } else {
        (haystack.to_string(), pattern.to_string())
    };

    let mut rest = haystack.as_str();
    for segment in pattern.split('%').filter(|s| !s.is_empty()) {
        match rest.find(segment) {
            Some(position) => rest = &rest[position + segment.len()..],
            None => return false,
        }
    }

    true
}

/// Stringifies a key value for lookups: ObjectIds as hex, UUIDs hyphenated,
/// integral numbers without a fraction.
pub fn key_string(value: &Bson) -> String {
    match value {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(n) if n.fract() == 0.0 => (*n as i64).to_string(),
        Bson::Binary(binary) => match uuid::Uuid::from_slice(&binary.bytes) {
            Ok(id) => id.to_string(),
            Err(_) => value.to_string(),
        },
        other => other.to_string(),
    }
}

/// Whether a value counts as absent for null checks and key collection.
pub fn is_nullish(value: Option<&Bson>) -> bool {
    matches!(value, None | Some(Bson::Null) | Some(Bson::Undefined))
}

/// Evaluates a predicate tree against one document.
pub struct DocumentEvaluator<'a> {
    document: &'a Document,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> OdmResult<bool> {
        self.visit_expr(expr)
    }

    /// Evaluates an optional filter; `None` matches everything.
    pub fn matches(document: &Document, expr: Option<&Expr>) -> bool {
        match expr {
            Some(expr) => DocumentEvaluator::new(document)
                .evaluate(expr)
                .unwrap_or(false),
            None => true,
        }
    }

    fn equals(field_value: &Bson, value: &Bson) -> bool {
        let expected = Comparable::from(value);

        match Comparable::from(field_value) {
            Comparable::Array(items) if !matches!(expected, Comparable::Array(_)) => {
                items.iter().any(|item| item == &expected)
            }
            actual => actual == expected,
        }
    }

    fn one_of(field_value: &Bson, values: &Bson) -> bool {
        match values {
            Bson::Array(values) => values
                .iter()
                .any(|value| Self::equals(field_value, value)),
            single => Self::equals(field_value, single),
        }
    }

    fn ordered(field_value: &Bson, op: &FieldOp, value: &Bson) -> bool {
        let ordering = Comparable::from(field_value).partial_cmp(&Comparable::from(value));

        match (ordering, op) {
            (Some(ordering), FieldOp::Gt) => ordering == Ordering::Greater,
            (Some(ordering), FieldOp::Gte) => ordering != Ordering::Less,
            (Some(ordering), FieldOp::Lt) => ordering == Ordering::Less,
            (Some(ordering), FieldOp::Lte) => ordering != Ordering::Greater,
            _ => false,
        }
    }
}

impl QueryVisitor for DocumentEvaluator<'_> {
    type Output = bool;
    type Error = OdmError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if !self.visit_expr(expr)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if self.visit_expr(expr)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(!self.visit_expr(expr)?)
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(lookup_path(self.document, field).is_some() == should_exist)
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        let field_value = lookup_path(self.document, field);

        if is_nullish(field_value) {
            // Missing fields compare as null for equality and never satisfy ranges.
            return Ok(match op {
                FieldOp::Eq => matches!(value, Bson::Null),
                FieldOp::Ne => !matches!(value, Bson::Null),
                FieldOp::In => matches!(value, Bson::Array(values) if values.contains(&Bson::Null)),
                FieldOp::NotIn => !matches!(value, Bson::Array(values) if values.contains(&Bson::Null)),
                _ => false,
            });
        }

        let Some(field_value) = field_value else {
            return Ok(false);
        };

        Ok(match op {
            FieldOp::Eq => Self::equals(field_value, value),
            FieldOp::Ne => !Self::equals(field_value, value),
            FieldOp::Gt | FieldOp::Gte | FieldOp::Lt | FieldOp::Lte => Self::ordered(field_value, op, value),
            FieldOp::In => Self::one_of(field_value, value),
            FieldOp::NotIn => !Self::one_of(field_value, value),
            FieldOp::Like { case_insensitive } => match (field_value, value) {
                (Bson::String(haystack), Bson::String(pattern)) => like_match(haystack, pattern, *case_insensitive),
                _ => false,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;
    use bson::doc;

    #[test]
    fn like_segments_match_in_order() {
        assert!(like_match("Alice Cooper", "ali", true));
        assert!(!like_match("Alice Cooper", "ali", false));
        assert!(like_match("Alice Cooper", "A%Coop", false));
        assert!(!like_match("Alice Cooper", "Coop%A", false));
        assert!(like_match("anything", "%", false));
    }

    #[test]
    fn missing_fields_behave_like_null() {
        let doc = doc! { "name": "Alice" };

        assert!(DocumentEvaluator::matches(&doc, Some(&Filter::eq("email", Bson::Null))));
        assert!(DocumentEvaluator::matches(&doc, Some(&Filter::ne("email", "x@y.z"))));
        assert!(!DocumentEvaluator::matches(&doc, Some(&Filter::gt("age", 3))));
        assert!(DocumentEvaluator::matches(&doc, Some(&Filter::not_in("age", [1, 2]))));
    }

    #[test]
    fn sort_order_is_total() {
        assert_eq!(compare_bson(&Bson::Double(f64::NAN), &Bson::Double(f64::NAN)), Ordering::Equal);
        assert_eq!(compare_bson(&Bson::Int32(1), &Bson::Double(f64::NAN)), Ordering::Less);
        assert_eq!(compare_bson(&Bson::Null, &Bson::Int32(1)), Ordering::Less);
        assert_eq!(
            compare_bson(&Bson::Document(doc! { "a": 1 }), &Bson::Document(doc! { "a": 2 })),
            Ordering::Less
        );
        assert_eq!(
            compare_bson(&Bson::Array(vec![1.into(), 2.into()]), &Bson::Array(vec![1.into()])),
            Ordering::Greater
        );

        let mut values = vec![
            Bson::Double(f64::NAN),
            Bson::Int32(3),
            Bson::Document(doc! { "b": 1 }),
            Bson::Double(-1.5),
            Bson::Document(doc! { "a": 1 }),
            Bson::Double(f64::NAN),
            Bson::Null,
        ];
        values.sort_by(compare_bson);

        assert_eq!(values[0], Bson::Null);
        assert_eq!(values[1], Bson::Double(-1.5));
        assert_eq!(values[2], Bson::Int32(3));
        assert!(values[3..5].iter().all(|v| matches!(v, Bson::Double(n) if n.is_nan())));
        assert_eq!(values[5], Bson::Document(doc! { "a": 1 }));
    }

    #[test]
    fn numbers_compare_across_widths() {
        let doc = doc! { "age": 30_i64, "score": 4.5 };

        assert!(DocumentEvaluator::matches(&doc, Some(&Filter::eq("age", 30))));
        assert!(DocumentEvaluator::matches(&doc, Some(&Filter::gte("score", 4))));
        assert!(DocumentEvaluator::matches(&doc, Some(&Filter::in_list("age", [10, 30]))));
    }

    #[test]
    fn equality_matches_array_members_and_dotted_paths() {
        let doc = doc! { "tags": ["a", "b"], "address": { "city": "Oslo" } };

        assert!(DocumentEvaluator::matches(&doc, Some(&Filter::eq("tags", "b"))));
        assert!(DocumentEvaluator::matches(&doc, Some(&Filter::eq("address.city", "Oslo"))));
        assert!(DocumentEvaluator::matches(&doc, Some(&Filter::exists("address.city"))));
    }

    #[test]
    fn field_sets_require_every_condition() {
        let set = Expr::FieldSet {
            field: "age".into(),
            conditions: vec![(FieldOp::Gte, Bson::Int32(18)), (FieldOp::Lt, Bson::Int32(65))],
        };

        assert!(DocumentEvaluator::matches(&doc! { "age": 30 }, Some(&set)));
        assert!(!DocumentEvaluator::matches(&doc! { "age": 70 }, Some(&set)));
    }

    #[test]
    fn sorts_by_several_keys() {
        let a = doc! { "last": "Smith", "first": "Ann" };
        let b = doc! { "last": "Smith", "first": "Bob" };
        let sorts = vec![
            Sort::new("last", SortDirection::Asc),
            Sort::new("first", SortDirection::Desc),
        ];

        assert_eq!(compare_documents(&a, &b, &sorts), Ordering::Greater);
    }

    #[test]
    fn key_strings_are_stable() {
        let oid = ObjectId::new();

        assert_eq!(key_string(&Bson::ObjectId(oid)), oid.to_hex());
        assert_eq!(key_string(&Bson::Double(7.0)), "7");
        assert_eq!(key_string(&Bson::Int64(7)), "7");
    }
}
