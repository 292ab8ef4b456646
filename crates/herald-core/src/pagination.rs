//! Page slicing.

use serde::Serialize;

use crate::error::HeraldError;

/// One page of a result set plus the totals needed to render page links.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total_rows: usize,
    pub total_pages: usize,
}

/// Slices `rows` into the 1-based `page` of `page_size` rows.
///
/// A page past the end yields no rows but keeps the totals intact.
pub fn paginate<T>(rows: Vec<T>, page: usize, page_size: usize) -> Result<Page<T>, HeraldError> {
    if page == 0 {
        return Err(HeraldError::invalid_pagination("page must be >= 1"));
    }
    if page_size == 0 {
        return Err(HeraldError::invalid_pagination("page size must be >= 1"));
    }

    let total_rows = rows.len();
    let total_pages = total_rows.div_ceil(page_size);
    let offset = (page - 1).saturating_mul(page_size);

    let rows = if offset >= total_rows {
        Vec::new()
    } else {
        rows.into_iter().skip(offset).take(page_size).collect()
    };

    Ok(Page {
        rows,
        page,
        page_size,
        total_rows,
        total_pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_pages() {
        let rows: Vec<usize> = (0..237).collect();
        let first = paginate(rows.clone(), 1, 50).unwrap();
        assert_eq!(first.total_pages, 5);
        assert_eq!(first.rows.len(), 50);
        assert_eq!(first.rows[0], 0);

        let last = paginate(rows, 5, 50).unwrap();
        assert_eq!(last.rows, (200..237).collect::<Vec<_>>());
    }

    #[test]
    fn test_page_past_end_is_empty() {
        let page = paginate(vec![1, 2, 3], 9, 2).unwrap();
        assert!(page.rows.is_empty());
        assert_eq!(page.total_rows, 3);
        assert_eq!(page.total_pages, 2);
    }

    #[test]
    fn test_empty_input() {
        let page = paginate(Vec::<u8>::new(), 1, 10).unwrap();
        assert_eq!(page.total_pages, 0);
        assert!(page.rows.is_empty());
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(matches!(
            paginate(vec![1], 0, 10),
            Err(HeraldError::InvalidPagination { .. })
        ));
        assert!(matches!(
            paginate(vec![1], 1, 0),
            Err(HeraldError::InvalidPagination { .. })
        ));
    }

    #[test]
    fn test_page_size_bound_holds() {
        for size in 1..=12 {
            for page in 1..=15 {
                let p = paginate((0..37).collect::<Vec<_>>(), page, size).unwrap();
                assert!(p.rows.len() <= size);
                assert_eq!(p.total_pages, 37usize.div_ceil(size));
            }
        }
    }

    #[test]
    fn test_huge_page_does_not_overflow() {
        let page = paginate(vec![1, 2], usize::MAX, usize::MAX).unwrap();
        assert!(page.rows.is_empty());
    }
}
