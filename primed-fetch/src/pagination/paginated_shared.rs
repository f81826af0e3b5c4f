use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::FetchError;

/// One fetched chunk of an offset-paginated collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// The items of this page, in collection order.
    pub items: Vec<T>,
    /// The zero-based index of the first item of this page in the collection.
    pub offset: u64,
    /// The requested page size.
    pub limit: u64,
    /// Whether another page exists after this one.
    pub has_more: bool,
}

impl<T> Page<T> {
    /// The offset of the following page, `None` when this is the last page.
    pub fn next_offset(&self) -> Option<u64> {
        self.has_more.then(|| self.offset.saturating_add(self.limit))
    }
}

/// The pages accumulated for one paginated query key, in the order they were fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfinitePages<T> {
    pages: Vec<Page<T>>,
    page_params: Vec<u64>,
}

impl<T> Default for InfinitePages<T> {
    fn default() -> Self {
        Self {
            pages: vec![],
            page_params: vec![],
        }
    }
}

impl<T> InfinitePages<T> {
    pub(crate) fn first(page_param: u64, page: Page<T>) -> Self {
        Self {
            pages: vec![page],
            page_params: vec![page_param],
        }
    }

    pub(crate) fn push(&mut self, page_param: u64, page: Page<T>) {
        self.pages.push(page);
        self.page_params.push(page_param);
    }

    /// The fetched pages.
    pub fn pages(&self) -> &[Page<T>] {
        &self.pages
    }

    /// The page param each page was fetched with, index-aligned with [`InfinitePages::pages`].
    pub fn page_params(&self) -> &[u64] {
        &self.page_params
    }

    /// The most recently fetched page and the param it was fetched with.
    pub fn last(&self) -> Option<(u64, &Page<T>)> {
        self.page_params.last().copied().zip(self.pages.last())
    }

    /// All items across all pages.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flat_map(|page| page.items.iter())
    }

    /// The number of pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// `true` if no page has been fetched.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Consume into the fetched pages.
    pub fn into_pages(self) -> Vec<Page<T>> {
        self.pages
    }
}

/// An incrementally loaded, ordered collection.
pub trait PagedSource<T> {
    /// Fetch the page after the last fetched one, or the first page if none has been fetched.
    ///
    /// Resolves to `None` once the collection is exhausted, without fetching.
    fn fetch_next(&self) -> impl Future<Output = Result<Option<Page<T>>, FetchError>> + Send;

    /// Whether [`PagedSource::fetch_next`] could produce another page.
    fn has_more(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::more(0, 20, true, Some(20))]
    #[case::more_later(40, 20, true, Some(60))]
    #[case::last(20, 20, false, None)]
    fn test_next_offset(
        #[case] offset: u64,
        #[case] limit: u64,
        #[case] has_more: bool,
        #[case] expected: Option<u64>,
    ) {
        let page = Page::<u8> {
            items: vec![],
            offset,
            limit,
            has_more,
        };
        assert_eq!(page.next_offset(), expected);
    }

    #[test]
    fn test_page_deserializes_from_api_json() {
        let page: Page<String> = serde_json::from_str(
            r#"{"items": ["two-sum", "add-two-numbers"], "offset": 0, "limit": 20, "has_more": true}"#,
        )
        .unwrap();
        assert_eq!(page.items, vec!["two-sum", "add-two-numbers"]);
        assert_eq!(page.next_offset(), Some(20));
    }

    #[test]
    fn test_infinite_pages_accumulate_in_order() {
        let page = |offset: u64, items: Vec<u64>, has_more| Page {
            items,
            offset,
            limit: 2,
            has_more,
        };
        let mut pages = InfinitePages::first(0, page(0, vec![0, 1], true));
        pages.push(2, page(2, vec![2], false));

        assert_eq!(pages.len(), 2);
        assert_eq!(pages.page_params(), &[0, 2]);
        assert_eq!(pages.items().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(pages.last().map(|(param, page)| (param, page.has_more)), Some((2, false)));
        assert!(InfinitePages::<u64>::default().is_empty());
    }
}
