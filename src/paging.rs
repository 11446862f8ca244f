//! 1-based pagination with `[from, to)` slice semantics.

use std::ops::Range;

use serde::Serialize;

use crate::error::{PlaneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingRequest {
    page: usize,
    page_size: usize,
}

impl PagingRequest {
    pub fn new(page: usize, page_size: usize) -> Result<Self> {
        if page < 1 {
            return Err(PlaneError::IllegalArgument(
                "page must be at least 1".to_string(),
            ));
        }
        if page_size < 1 {
            return Err(PlaneError::IllegalArgument(
                "page size must be at least 1".to_string(),
            ));
        }
        Ok(Self { page, page_size })
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Inclusive start offset.
    pub fn from_index(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }

    /// Slice of a collection of `total_size` items covered by this page.
    /// Pages past the end give an empty range.
    pub fn range(&self, total_size: usize) -> Range<usize> {
        let from = self.from_index();
        if from >= total_size {
            return total_size..total_size;
        }
        let to = from.saturating_add(self.page_size).min(total_size);
        from..to
    }

    pub fn paginate<T>(&self, mut items: Vec<T>) -> PageView<T> {
        let total_size = items.len();
        let range = self.range(total_size);
        let data = items.drain(range).collect();
        PageView {
            page: self.page,
            page_size: self.page_size,
            total_size,
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageView<T> {
    pub page: usize,
    pub page_size: usize,
    pub total_size: usize,
    pub data: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_page_is_truncated_to_total() {
        let paging = PagingRequest::new(2, 10).unwrap();
        assert_eq!(paging.range(15), 10..15);
    }

    #[test]
    fn page_past_end_is_empty() {
        let paging = PagingRequest::new(3, 10).unwrap();
        assert!(paging.range(15).is_empty());
        assert!(PagingRequest::new(1, 10).unwrap().range(0).is_empty());
    }

    #[test]
    fn bounds_hold_for_small_grid() {
        for page in 1..6 {
            for page_size in 1..6 {
                for total in 0..20 {
                    let r = PagingRequest::new(page, page_size).unwrap().range(total);
                    assert!(r.start <= r.end);
                    assert!(r.end <= total);
                    assert!(r.end - r.start <= page_size);
                }
            }
        }
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(PagingRequest::new(0, 10).is_err());
        assert!(PagingRequest::new(1, 0).is_err());
    }

    #[test]
    fn paginate_slices_items() {
        let view = PagingRequest::new(2, 2)
            .unwrap()
            .paginate(vec!["a", "b", "c", "d", "e"]);
        assert_eq!(view.total_size, 5);
        assert_eq!(view.data, vec!["c", "d"]);
    }
}
