//! In-memory query builder over embedded elements.
//!
//! Conditions use the same [`Filterable`] surface as store queries but are kept as
//! plain lists: every AND condition must hold, and an element passes the OR stage when
//! any OR condition holds (or there are none). `like` is case-sensitive here, while
//! `ilike` and [`EmbeddedQuery::search`] ignore case.
//!
//! [`EmbeddedQuery::get`] applies, in order: search, AND conditions and closure filters,
//! OR conditions, sorts, skip, limit and field selection.
//!
//! # Example
//!
//! ```ignore
//! let recent = user
//!     .embed_many("orders")?
//!     .query()
//!     .where_op("total", ">", 100)
//!     .order_by("placed_at", SortDirection::Desc)
//!     .limit(5)
//!     .get()?;
//! ```

use bson::{Bson, Document};
use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    embedded::EmbeddedDoc,
    error::{OdmError, OdmResult},
    eval::{compare_bson, is_nullish, key_string, DocumentEvaluator},
    filter::{Boolean, Filterable},
    page::{Paginated, PaginationParams},
    query::{Expr, Sort, SortDirection},
};

type Predicate = Arc<dyn Fn(&EmbeddedDoc) -> bool + Send + Sync>;

/// Summary statistics over the numeric values of one field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    pub count: usize,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Clone)]
pub struct EmbeddedQuery {
    items: Vec<EmbeddedDoc>,
    and: Vec<Expr>,
    or: Vec<Expr>,
    predicates: Vec<Predicate>,
    errors: Vec<(String, String)>,
    search: Option<(String, Vec<String>)>,
    sorts: Vec<Sort>,
    skip: usize,
    limit: Option<usize>,
    select: Option<Vec<String>>,
    base_url: String,
}

impl fmt::Debug for EmbeddedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedQuery")
            .field("items", &self.items.len())
            .field("and", &self.and)
            .field("or", &self.or)
            .field("predicates", &self.predicates.len())
            .field("search", &self.search)
            .field("sorts", &self.sorts)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .field("select", &self.select)
            .finish()
    }
}

impl EmbeddedQuery {
    pub fn new(items: impl IntoIterator<Item = EmbeddedDoc>) -> Self {
        Self {
            items: items.into_iter().collect(),
            and: Vec::new(),
            or: Vec::new(),
            predicates: Vec::new(),
            errors: Vec::new(),
            search: None,
            sorts: Vec::new(),
            skip: 0,
            limit: None,
            select: None,
            base_url: "/".to_string(),
        }
    }

    /// Keeps only elements for which `predicate` returns `true`.
    pub fn filter(mut self, predicate: impl Fn(&EmbeddedDoc) -> bool + Send + Sync + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Case-insensitive substring search over `fields`, or over every string and number
    /// field when `fields` is empty.
    pub fn search<S: Into<String>>(mut self, term: impl Into<String>, fields: impl IntoIterator<Item = S>) -> Self {
        self.search = Some((term.into(), fields.into_iter().map(Into::into).collect()));
        self
    }

    /// Sorts by `field`. Each call re-sorts stably, so the last call is the primary key.
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sorts.push(Sort::new(field, direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn offset(self, offset: usize) -> Self {
        self.skip(offset)
    }

    pub fn for_page(self, page: u64, per_page: u64) -> Self {
        let params = PaginationParams::new(page, per_page);
        self.skip(params.offset() as usize).limit(params.per_page as usize)
    }

    /// Restricts returned elements to `fields`.
    pub fn select<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Base URL used for page links built by [`EmbeddedQuery::paginate`].
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Runs the query.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] if an unknown operator was used.
    pub fn get(&self) -> OdmResult<Vec<EmbeddedDoc>> {
        let matched = self.sorted(self.matching()?);

        Ok(matched
            .into_iter()
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX))
            .map(|doc| self.project(doc))
            .collect())
    }

    pub fn first(&self) -> OdmResult<Option<EmbeddedDoc>> {
        Ok(self.clone().limit(1).get()?.into_iter().next())
    }

    /// Number of elements passing the filters; skip and limit are ignored.
    pub fn count(&self) -> OdmResult<usize> {
        Ok(self.matching()?.len())
    }

    /// Distinct non-null values of `field` among the results, in first-seen order.
    pub fn distinct(&self, field: &str) -> OdmResult<Vec<Bson>> {
        let mut seen = Vec::new();

        for doc in self.get()? {
            if let Some(value) = doc.get(field) {
                if !is_nullish(Some(value)) && !seen.contains(value) {
                    seen.push(value.clone());
                }
            }
        }

        Ok(seen)
    }

    /// Groups the results by the stringified value of `field`.
    pub fn group_by(&self, field: &str) -> OdmResult<BTreeMap<String, Vec<EmbeddedDoc>>> {
        let mut groups: BTreeMap<String, Vec<EmbeddedDoc>> = BTreeMap::new();

        for doc in self.get()? {
            let key = key_string(doc.get(field).unwrap_or(&Bson::Null));
            groups.entry(key).or_default().push(doc);
        }

        Ok(groups)
    }

    /// Statistics over the numeric values of `field`; `None` when there are none.
    pub fn aggregate(&self, field: &str) -> OdmResult<Option<Aggregate>> {
        let values = self
            .get()?
            .iter()
            .filter_map(|doc| match doc.get(field) {
                Some(Bson::Int32(n)) => Some(*n as f64),
                Some(Bson::Int64(n)) => Some(*n as f64),
                Some(Bson::Double(n)) => Some(*n),
                _ => None,
            })
            .collect::<Vec<_>>();

        if values.is_empty() {
            return Ok(None);
        }

        let sum: f64 = values.iter().sum();
        Ok(Some(Aggregate {
            count: values.len(),
            sum,
            avg: sum / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }))
    }

    /// One page of the sorted results. Any skip or limit set on the query is replaced.
    pub fn paginate(&self, page: u64, per_page: u64) -> OdmResult<Paginated<EmbeddedDoc>> {
        let params = PaginationParams::new(page, per_page);
        let all = self.clone().skip(0).with_limit(None).get()?;

        Ok(params.paginate(all, &self.base_url))
    }

    fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    fn matching(&self) -> OdmResult<Vec<EmbeddedDoc>> {
        if let Some((field, message)) = self.errors.first() {
            return Err(OdmError::validation(field, message));
        }

        Ok(self
            .items
            .iter()
            .filter(|doc| self.matches_search(doc))
            .filter(|doc| self.and.iter().all(|expr| evaluate(doc, expr)))
            .filter(|doc| self.predicates.iter().all(|predicate| predicate(*doc)))
            .filter(|doc| self.or.is_empty() || self.or.iter().any(|expr| evaluate(doc, expr)))
            .cloned()
            .collect())
    }

    fn sorted(&self, mut docs: Vec<EmbeddedDoc>) -> Vec<EmbeddedDoc> {
        for sort in &self.sorts {
            docs.sort_by(|a, b| {
                let left = a.get(&sort.field).unwrap_or(&Bson::Null);
                let right = b.get(&sort.field).unwrap_or(&Bson::Null);

                match sort.direction {
                    SortDirection::Asc => compare_bson(left, right),
                    SortDirection::Desc => compare_bson(right, left),
                }
            });
        }

        docs
    }

    fn matches_search(&self, doc: &EmbeddedDoc) -> bool {
        let Some((term, fields)) = &self.search else {
            return true;
        };
        let term = term.to_lowercase();

        let hit = |value: &Bson| match value {
            Bson::String(s) => s.to_lowercase().contains(&term),
            Bson::Int32(n) => n.to_string().contains(&term),
            Bson::Int64(n) => n.to_string().contains(&term),
            Bson::Double(n) => n.to_string().contains(&term),
            _ => false,
        };

        if fields.is_empty() {
            doc.attributes.values().any(hit)
        } else {
            fields.iter().filter_map(|field| doc.get(field)).any(hit)
        }
    }

    fn project(&self, mut doc: EmbeddedDoc) -> EmbeddedDoc {
        if let Some(fields) = &self.select {
            let projected: Document = fields
                .iter()
                .filter_map(|field| doc.attributes.get(field).map(|value| (field.clone(), value.clone())))
                .collect();
            doc.attributes = projected;
        }

        doc
    }
}

fn evaluate(doc: &EmbeddedDoc, expr: &Expr) -> bool {
    DocumentEvaluator::matches(&doc.attributes, Some(expr))
}

impl Filterable for EmbeddedQuery {
    fn push_condition(&mut self, boolean: Boolean, expr: Expr) {
        match boolean {
            Boolean::And => self.and.push(expr),
            Boolean::Or => self.or.push(expr),
        }
    }

    fn reject(&mut self, field: &str, message: String) {
        self.errors.push((field.to_string(), message));
    }

    fn like_case_insensitive(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn people() -> EmbeddedQuery {
        EmbeddedQuery::new(
            [
                doc! { "name": "Alice", "age": 31, "city": "Oslo" },
                doc! { "name": "Bob", "age": 25, "city": "Bergen" },
                doc! { "name": "Carol", "age": 31, "city": "Bergen" },
                doc! { "name": "dave", "age": 19 },
            ]
            .into_iter()
            .map(EmbeddedDoc::new),
        )
    }

    fn names(docs: &[EmbeddedDoc]) -> Vec<&str> {
        docs.iter()
            .filter_map(|d| d.get("name").and_then(Bson::as_str))
            .collect()
    }

    #[test]
    fn or_conditions_widen_the_match() {
        let docs = people()
            .where_eq("name", "Alice")
            .or_where("name", "Bob")
            .get()
            .unwrap();

        assert_eq!(names(&docs), vec!["Alice", "Bob"]);
    }

    #[test]
    fn and_conditions_all_apply() {
        let docs = people()
            .where_op("age", ">", 20)
            .where_eq("city", "Bergen")
            .get()
            .unwrap();

        assert_eq!(names(&docs), vec!["Bob", "Carol"]);
    }

    #[test]
    fn like_is_case_sensitive_and_ilike_is_not() {
        assert!(people().where_like("name", "Dav").get().unwrap().is_empty());
        assert_eq!(names(&people().where_ilike("name", "Dav").get().unwrap()), vec!["dave"]);
        assert!(people().where_op("name", "like", "ALICE").get().unwrap().is_empty());
    }

    #[test]
    fn successive_sorts_make_the_last_call_primary() {
        let docs = people()
            .order_by("name", SortDirection::Desc)
            .order_by("age", SortDirection::Asc)
            .get()
            .unwrap();

        assert_eq!(names(&docs), vec!["dave", "Bob", "Carol", "Alice"]);
    }

    #[test]
    fn search_skip_limit_and_select() {
        let docs = people()
            .search("BERG", ["city"])
            .skip(1)
            .limit(5)
            .select(["name"])
            .get()
            .unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].attributes(), &doc! { "name": "Carol" });
    }

    #[test]
    fn closure_filters_and_counts() {
        let query = people().filter(|d| d.get("city").is_none());

        assert_eq!(query.count().unwrap(), 1);
        assert_eq!(names(&query.get().unwrap()), vec!["dave"]);
    }

    #[test]
    fn groups_distinct_and_aggregates() {
        let groups = people().group_by("age").unwrap();
        assert_eq!(groups["31"].len(), 2);
        assert_eq!(groups["19"].len(), 1);

        assert_eq!(
            people().distinct("city").unwrap(),
            vec![Bson::from("Oslo"), Bson::from("Bergen")]
        );

        let stats = people().aggregate("age").unwrap().unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.sum, 106.0);
        assert_eq!(stats.min, 19.0);
        assert_eq!(stats.max, 31.0);
        assert_eq!(stats.avg, 26.5);

        assert!(people().aggregate("city").unwrap().is_none());
    }

    #[test]
    fn paginates_the_filtered_results() {
        let page = people().order_by("age", SortDirection::Asc).paginate(2, 3).unwrap();

        assert_eq!(page.meta.total, 4);
        assert_eq!(page.meta.last_page, 2);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].get("age"), Some(&Bson::Int32(31)));
    }

    #[test]
    fn unknown_operators_are_reported() {
        assert!(matches!(
            people().where_op("age", "approx", 3).get(),
            Err(OdmError::Validation { .. })
        ));
    }
}
