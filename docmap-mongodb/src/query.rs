//! Query translation from docmap predicate trees to MongoDB query syntax.
//!
//! Equality is written in the short `{field: value}` form, other operators as
//! `{field: {$op: value}}`. A `like` pattern becomes an unanchored `$regex` whose
//! literal segments are escaped and joined by `.*`.

use bson::{doc, Bson, Document};

use docmap_core::{
    error::OdmError,
    query::{Expr, FieldOp, QueryVisitor, Sort, SortDirection, Stage, Accumulator},
};

/// Translates predicate trees into MongoDB query documents.
pub(crate) struct MongoQueryTranslator;

impl MongoQueryTranslator {
    /// Translates an optional filter; `None` matches everything.
    pub(crate) fn filter(expr: Option<&Expr>) -> Result<Document, OdmError> {
        match expr {
            Some(expr) => MongoQueryTranslator.visit_expr(expr),
            None => Ok(Document::new()),
        }
    }

    // Several operators on one field share a single operator document.
    fn operators(conditions: &[(FieldOp, Bson)]) -> Document {
        conditions
            .iter()
            .flat_map(|(op, value)| Self::operator(op, value))
            .collect()
    }

    fn operator(op: &FieldOp, value: &Bson) -> Document {
        match op {
            FieldOp::Eq => doc! { "$eq": value },
            FieldOp::Ne => doc! { "$ne": value },
            FieldOp::Gt => doc! { "$gt": value },
            FieldOp::Gte => doc! { "$gte": value },
            FieldOp::Lt => doc! { "$lt": value },
            FieldOp::Lte => doc! { "$lte": value },
            FieldOp::In => doc! { "$in": as_array(value) },
            FieldOp::NotIn => doc! { "$nin": as_array(value) },
            FieldOp::Like { case_insensitive } => {
                let pattern = match value {
                    Bson::String(s) => like_to_regex(s),
                    other => like_to_regex(&other.to_string()),
                };

                if *case_insensitive {
                    doc! { "$regex": pattern, "$options": "i" }
                } else {
                    doc! { "$regex": pattern }
                }
            }
        }
    }
}

fn as_array(value: &Bson) -> Bson {
    match value {
        Bson::Array(_) => value.clone(),
        other => Bson::Array(vec![other.clone()]),
    }
}

/// Converts a `%` wildcard pattern into an unanchored regular expression.
pub(crate) fn like_to_regex(pattern: &str) -> String {
    pattern
        .split('%')
        .map(escape_regex)
        .collect::<Vec<_>>()
        .join(".*")
}

fn escape_regex(segment: &str) -> String {
    let mut escaped = String::with_capacity(segment.len());

    for c in segment.chars() {
        if "\\.^$|?*+()[]{}/".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped
}

impl QueryVisitor for MongoQueryTranslator {
    type Output = Document;
    type Error = OdmError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$and": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$or": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        // Field-level negation keeps documents missing the field, like `$nor` does.
        match expr {
            Expr::Field { field, op, value } => Ok(doc! {
                field: { "$not": Self::operator(op, value) },
            }),
            Expr::FieldSet { field, conditions } => Ok(doc! {
                field: { "$not": Self::operators(conditions) },
            }),
            other => Ok(doc! { "$nor": [self.visit_expr(other)?] }),
        }
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            field: { "$exists": should_exist },
        })
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        Ok(match op {
            FieldOp::Eq => doc! { field: value },
            _ => doc! { field: Self::operator(op, value) },
        })
    }

    fn visit_field_set(&mut self, field: &str, conditions: &[(FieldOp, Bson)]) -> Result<Self::Output, Self::Error> {
        Ok(doc! { field: Self::operators(conditions) })
    }
}

/// Counts above `i64::MAX` are clamped; the server only accepts signed 64-bit values.
pub(crate) fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn sort_document(sorts: &[Sort]) -> Document {
    sorts
        .iter()
        .map(|sort| {
            let direction = match sort.direction {
                SortDirection::Asc => 1,
                SortDirection::Desc => -1,
            };
            (sort.field.clone(), Bson::Int32(direction))
        })
        .collect()
}

pub(crate) fn projection_document(fields: &[String]) -> Document {
    fields
        .iter()
        .map(|field| (field.clone(), Bson::Int32(1)))
        .collect()
}

/// Translates pipeline stages into MongoDB aggregation stages.
pub(crate) fn pipeline(stages: &[Stage]) -> Result<Vec<Document>, OdmError> {
    stages
        .iter()
        .map(|stage| {
            Ok(match stage {
                Stage::Match(expr) => doc! { "$match": MongoQueryTranslator.visit_expr(expr)? },
                Stage::Group { keys, accumulators } => {
                    // Group keys may be dotted; the `_id` sub-document uses them verbatim.
                    let id = keys
                        .iter()
                        .map(|key| (key.clone(), Bson::String(format!("${key}"))))
                        .collect::<Document>();

                    let mut group = doc! { "_id": id };
                    for accumulator in accumulators {
                        match accumulator {
                            Accumulator::Count { output } => {
                                group.insert(output.clone(), doc! { "$sum": 1 });
                            }
                            Accumulator::First { output, field } => {
                                group.insert(output.clone(), doc! { "$first": format!("${field}") });
                            }
                        }
                    }

                    doc! { "$group": group }
                }
                Stage::Sort(sorts) => doc! { "$sort": sort_document(sorts) },
                Stage::Skip(skip) => doc! { "$skip": clamp_i64(*skip) },
                Stage::Limit(limit) => doc! { "$limit": clamp_i64(*limit) },
                Stage::Project(fields) => doc! { "$project": projection_document(fields) },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmap_core::query::Filter;

    fn translate(expr: Expr) -> Document {
        MongoQueryTranslator.visit_expr(&expr).unwrap()
    }

    #[test]
    fn equality_uses_the_short_form() {
        assert_eq!(translate(Filter::eq("name", "Ada")), doc! { "name": "Ada" });
        assert_eq!(translate(Filter::gte("age", 18)), doc! { "age": { "$gte": 18 } });
    }

    #[test]
    fn field_sets_merge_into_one_operator_document() {
        let expr = Expr::FieldSet {
            field: "age".to_string(),
            conditions: vec![(FieldOp::Gte, Bson::Int32(18)), (FieldOp::Lt, Bson::Int32(65))],
        };

        assert_eq!(translate(expr), doc! { "age": { "$gte": 18, "$lt": 65 } });
    }

    #[test]
    fn like_becomes_an_escaped_regex() {
        assert_eq!(like_to_regex("%a.b%c"), ".*a\\.b.*c");
        assert_eq!(
            translate(Filter::like("email", "%@example.com")),
            doc! { "email": { "$regex": ".*@example\\.com", "$options": "i" } }
        );

        let case_sensitive = Expr::field("name", FieldOp::Like { case_insensitive: false }, "Al%");
        assert_eq!(translate(case_sensitive), doc! { "name": { "$regex": "Al.*" } });
    }

    #[test]
    fn negation_is_field_level_when_possible() {
        assert_eq!(
            translate(Filter::eq("role", "admin").not()),
            doc! { "role": { "$not": { "$eq": "admin" } } }
        );
        assert_eq!(
            translate(Filter::or([Filter::eq("a", 1), Filter::eq("b", 2)]).not()),
            doc! { "$nor": [{ "$or": [{ "a": 1 }, { "b": 2 }] }] }
        );
    }

    #[test]
    fn in_lists_and_boolean_groups() {
        let expr = Filter::and([Filter::in_list("tag", ["x", "y"]), Filter::exists("deleted_at").not()]);

        assert_eq!(
            translate(expr),
            doc! { "$and": [{ "tag": { "$in": ["x", "y"] } }, { "$nor": [{ "deleted_at": { "$exists": true } }] }] }
        );
    }

    #[test]
    fn group_pipelines() {
        let stages = vec![
            Stage::Match(Filter::eq("active", true)),
            Stage::Group {
                keys: vec!["role".to_string()],
                accumulators: vec![Accumulator::Count { output: "count".to_string() }],
            },
            Stage::Sort(vec![Sort::new("count", SortDirection::Desc)]),
            Stage::Limit(5),
        ];

        assert_eq!(
            pipeline(&stages).unwrap(),
            vec![
                doc! { "$match": { "active": true } },
                doc! { "$group": { "_id": { "role": "$role" }, "count": { "$sum": 1 } } },
                doc! { "$sort": { "count": -1 } },
                doc! { "$limit": 5_i64 },
            ]
        );
    }
}
