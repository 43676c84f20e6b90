use serde::{Deserialize, Serialize};

/// Pagination parameters.
///
/// `sort` takes the form `field` or `field,asc` / `field,desc`.
#[derive(Debug, Clone, Deserialize)]
pub struct Pageable {
    #[serde(default)]
    pub page: u64,
    #[serde(default = "default_page_size")]
    pub size: u64,
    #[serde(default)]
    pub sort: Option<String>,
}

fn default_page_size() -> u64 {
    20
}

impl Default for Pageable {
    fn default() -> Self {
        Self {
            page: 0,
            size: default_page_size(),
            sort: None,
        }
    }
}

impl Pageable {
    pub fn new(page: u64, size: u64) -> Self {
        Self {
            page,
            size,
            sort: None,
        }
    }

    pub fn sorted(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn offset(&self) -> u64 {
        self.page * self.size
    }

    /// The sort field and direction (`true` for ascending).
    pub fn sort_order(&self) -> Option<(&str, bool)> {
        let sort = self.sort.as_deref()?.trim();
        if sort.is_empty() {
            return None;
        }
        match sort.split_once(',') {
            Some((field, dir)) => Some((field.trim(), !dir.trim().eq_ignore_ascii_case("desc"))),
            None => Some((sort, true)),
        }
    }
}

/// A page of results with pagination metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub page: u64,
    pub size: u64,
    pub total_elements: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, pageable: &Pageable, total_elements: u64) -> Self {
        let total_pages = if pageable.size == 0 {
            0
        } else {
            total_elements.div_ceil(pageable.size)
        };
        Self {
            content,
            page: pageable.page,
            size: pageable.size,
            total_elements,
            total_pages,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            page: self.page,
            size: self.size,
            total_elements: self.total_elements,
            total_pages: self.total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_parsing() {
        assert_eq!(Pageable::default().sort_order(), None);
        assert_eq!(Pageable::new(0, 5).sorted("label").sort_order(), Some(("label", true)));
        assert_eq!(
            Pageable::new(0, 5).sorted("score, DESC").sort_order(),
            Some(("score", false))
        );
    }

    #[test]
    fn test_page_totals() {
        let pageable = Pageable::new(1, 2);
        assert_eq!(pageable.offset(), 2);
        let page = Page::new(vec![3, 4], &pageable, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.map(|n| n * 2).content, vec![6, 8]);
        assert_eq!(Page::<i32>::new(vec![], &Pageable::new(0, 0), 5).total_pages, 0);
    }

    #[test]
    fn test_deserializes_with_defaults() {
        let p: Pageable = serde_json::from_str(r#"{"page": 2}"#).unwrap();
        assert_eq!((p.page, p.size, p.sort), (2, 20, None));
    }
}
