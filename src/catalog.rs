//! Shapes a fetched catalog into the indices one loop iteration works from.

use std::collections::HashMap;

use crate::four_chan::{Board, CatalogPage, CatalogThread, Post, ValidationError};

/// A validated, indexed view of one board's catalog.
pub struct Catalog {
    pub board: Board,
    threads: HashMap<u64, CatalogThread>,
    pages: HashMap<u64, u64>,
}

impl Catalog {
    /// Validate every thread against the closed schema and index them by id and page. Duplicate
    /// thread ids across pages are rejected; any failure aborts this board for this loop.
    pub fn build(board: Board, pages: Vec<CatalogPage>) -> Result<Catalog, ValidationError> {
        let mut threads = HashMap::new();
        let mut page_index = HashMap::new();

        for (i, page) in pages.into_iter().enumerate() {
            // Fall back to the page's ordinal when the remote doesn't number its pages.
            let page_no = if page.page != 0 {
                page.page
            } else {
                i as u64 + 1
            };

            for thread in page.threads {
                thread.validate()?;
                let no = thread.no();
                if threads.insert(no, thread).is_some() {
                    return Err(ValidationError::DuplicateThread(no));
                }
                page_index.insert(no, page_no);
            }
        }

        Ok(Catalog {
            board,
            threads,
            pages: page_index,
        })
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn contains(&self, no: u64) -> bool {
        self.threads.contains_key(&no)
    }

    pub fn thread(&self, no: u64) -> Option<&CatalogThread> {
        self.threads.get(&no)
    }

    pub fn threads(&self) -> impl Iterator<Item = &CatalogThread> {
        self.threads.values()
    }

    pub fn thread_nos(&self) -> impl Iterator<Item = u64> + '_ {
        self.threads.keys().cloned()
    }

    /// 1-based page position of a thread.
    pub fn page(&self, no: u64) -> Option<u64> {
        self.pages.get(&no).cloned()
    }

    /// The catalog's preview of a thread's most recent replies, if it has one.
    pub fn last_replies(&self, no: u64) -> Option<&[Post]> {
        self.threads.get(&no).and_then(|thread| {
            if thread.last_replies.is_empty() {
                None
            } else {
                Some(thread.last_replies.as_slice())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> Board {
        Board::new("po").unwrap()
    }

    fn pages(json: &str) -> Vec<CatalogPage> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn builds_indices() {
        let catalog = Catalog::build(
            board(),
            pages(
                r#"[
                    {"page": 1, "threads": [
                        {"no": 100, "resto": 0, "time": 1571420000, "last_modified": 1571430000,
                         "replies": 2, "images": 0,
                         "last_replies": [{"no": 102, "resto": 100, "time": 1571430000}]},
                        {"no": 200, "resto": 0, "time": 1571421000, "last_modified": 1571429000}
                    ]},
                    {"page": 2, "threads": [
                        {"no": 300, "resto": 0, "time": 1571422000, "last_modified": 1571428000}
                    ]}
                ]"#,
            ),
        )
        .unwrap();

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.page(100), Some(1));
        assert_eq!(catalog.page(300), Some(2));
        assert_eq!(catalog.thread(200).unwrap().replies, 0);
        assert_eq!(catalog.last_replies(100).unwrap().len(), 1);
        assert!(catalog.last_replies(200).is_none());
    }

    #[test]
    fn page_ordinal_fallback() {
        let catalog = Catalog::build(
            board(),
            pages(
                r#"[
                    {"threads": [{"no": 100, "resto": 0, "time": 1571420000, "last_modified": 1}]},
                    {"threads": [{"no": 200, "resto": 0, "time": 1571421000, "last_modified": 1}]}
                ]"#,
            ),
        )
        .unwrap();
        assert_eq!(catalog.page(100), Some(1));
        assert_eq!(catalog.page(200), Some(2));
    }

    #[test]
    fn rejects_duplicate_thread_nos() {
        let result = Catalog::build(
            board(),
            pages(
                r#"[
                    {"page": 1, "threads": [{"no": 100, "resto": 0, "time": 1, "last_modified": 2}]},
                    {"page": 2, "threads": [{"no": 100, "resto": 0, "time": 1, "last_modified": 2}]}
                ]"#,
            ),
        );
        match result {
            Err(ValidationError::DuplicateThread(100)) => {}
            other => panic!("unexpected result: {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn rejects_invalid_thread() {
        let result = Catalog::build(
            board(),
            pages(r#"[{"page": 1, "threads": [{"no": 100, "resto": 0, "time": 0, "last_modified": 2}]}]"#),
        );
        assert!(result.is_err());
    }

    #[test]
    fn empty_catalog() {
        let catalog = Catalog::build(board(), vec![]).unwrap();
        assert!(catalog.is_empty());
    }
}
