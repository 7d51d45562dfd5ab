//! Pagination types.
//!
//! [`Paginated`] is the `{data, meta}` shape returned by `paginate` on model queries
//! and embedded queries. It serialises with camelCase keys.

use serde::{Deserialize, Serialize};

/// One page of results plus navigation metadata.
///
/// # Example
///
/// ```ignore
/// let page = User::query(&odm).where_eq("active", true).paginate(2, 10).await?;
///
/// assert_eq!(page.meta.current_page, 2);
/// println!("{}", serde_json::to_string(&page)?);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub meta: PaginationMeta,
}

impl<T> Paginated<T> {
    pub fn new(data: Vec<T>, meta: PaginationMeta) -> Self {
        Self { data, meta }
    }

    /// A page with no data and `total = 0`.
    pub fn empty(params: &PaginationParams, base_url: &str) -> Self {
        Self::new(Vec::new(), PaginationMeta::new(0, params.per_page, params.page, base_url))
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginated<U> {
        Paginated {
            data: self.data.into_iter().map(f).collect(),
            meta: self.meta,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    pub total: u64,
    pub per_page: u64,
    pub current_page: u64,
    /// `max(1, ceil(total / per_page))`.
    pub last_page: u64,
    pub first_page: u64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
    pub first_page_url: String,
    pub last_page_url: String,
    pub next_page_url: Option<String>,
    pub previous_page_url: Option<String>,
}

impl PaginationMeta {
    pub fn new(total: u64, per_page: u64, current_page: u64, base_url: &str) -> Self {
        let per_page = per_page.max(1);
        let current_page = current_page.max(1);
        let last_page = total.div_ceil(per_page).max(1);
        let has_next_page = current_page < last_page;
        let has_prev_page = current_page > 1;

        Self {
            total,
            per_page,
            current_page,
            last_page,
            first_page: 1,
            has_next_page,
            has_prev_page,
            first_page_url: page_url(base_url, 1),
            last_page_url: page_url(base_url, last_page),
            next_page_url: has_next_page.then(|| page_url(base_url, current_page + 1)),
            previous_page_url: has_prev_page.then(|| page_url(base_url, current_page - 1)),
        }
    }
}

fn page_url(base_url: &str, page: u64) -> String {
    let separator = if base_url.contains('?') { '&' } else { '?' };
    format!("{base_url}{separator}page={page}")
}

/// Which page to retrieve and how many items per page. Pages are 1-indexed.
///
/// # Example
///
/// ```ignore
/// use docmap::page::PaginationParams;
///
/// let params = PaginationParams::new(3, 20);
/// assert_eq!(params.offset(), 40);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationParams {
    pub page: u64,
    pub per_page: u64,
}

impl PaginationParams {
    /// Creates pagination parameters, clamping both values to at least 1.
    pub fn new(page: u64, per_page: u64) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.max(1),
        }
    }

    /// Number of items to skip for this page. Saturates, so a page far past the end is
    /// simply empty.
    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.per_page)
    }

    /// Slices an already materialised list into a page.
    pub fn paginate<T>(&self, items: Vec<T>, base_url: &str) -> Paginated<T> {
        let total = items.len() as u64;
        let data = items
            .into_iter()
            .skip(self.offset() as usize)
            .take(self.per_page as usize)
            .collect();

        Paginated::new(data, PaginationMeta::new(total, self.per_page, self.page, base_url))
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self { page: 1, per_page: 20 }
    }
}
