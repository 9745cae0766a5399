//! Paginated, bounded-memory row cache (spec.md §4.6).
//!
//! A table browse session never materialises more than a bounded window of
//! pages: scrolling forward loads ahead of the cursor and trims pages that
//! fell far behind it, scrolling backward does the mirror image. This keeps
//! memory bounded for tables with millions of rows while still presenting a
//! scrollable, randomly-addressable row range to the client. There is no
//! equivalent window in the teacher's codebase (the teacher loads one page
//! at a time per UI request with no client-side merge); this module is new,
//! built to spec.md's cache invariants rather than adapted from an existing
//! file, and reuses `drivers::DatabaseDriver::query_page`/`count` as its only
//! dependency on the rest of the crate.

use std::collections::BTreeMap;

use crate::schema::{ResultSet, Row};

/// Rows per page. Chosen to keep a single page's JSON payload comfortably
/// under typical pipe buffer sizes while still amortising per-query
/// overhead across enough rows to matter.
pub const PAGE_SIZE: i64 = 500;

/// Pages eagerly loaded beyond the page the cursor currently sits in, in the
/// direction of travel.
pub const PREFETCH_PAGES: i64 = 2;

/// Cache never holds more than this many pages at once; the trim pass runs
/// once this is exceeded.
pub const MAX_LOADED_PAGES: usize = 5;

/// A page this many pages away from the cursor's current page is eligible
/// for trimming.
pub const TRIM_DISTANCE_PAGES: i64 = 3;

/// Distance (in rows) from the edge of the loaded window at which a
/// synchronous load is issued — closer than this and the caller would
/// otherwise scroll past the end of what's buffered.
pub const LOAD_THRESHOLD: i64 = PAGE_SIZE / 4;

/// Distance (in rows) from the edge of the loaded window at which a
/// background prefetch is kicked off — fires well before `LOAD_THRESHOLD`
/// so the synchronous path is rarely hit during steady scrolling.
pub const PREFETCH_THRESHOLD: i64 = PAGE_SIZE;

/// Hard ceiling on the number of rows ever buffered across all loaded pages,
/// regardless of `MAX_LOADED_PAGES` — a final backstop against a
/// pathologically large `PAGE_SIZE` override.
pub const ROW_CAP: i64 = 1_000_000;

/// One loaded page of rows, keyed by its starting row offset in `PageCache`.
struct Page {
    rows: Vec<Row>,
}

/// The windowed row buffer for a single open table-browse session (one
/// table, one filter/sort combination). Lives inside the operation context
/// that owns a table view; never shared across threads — all merges happen
/// on the thread driving the dispatch loop, per spec.md §5 "the page cache
/// is owned by the dispatcher, never the operation threads".
pub struct PageCache {
    pages: BTreeMap<i64, Page>,
    /// Logical cursor: the row offset the client is currently viewing.
    cursor: i64,
    total_rows: i64,
    approximate: bool,
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            cursor: 0,
            total_rows: 0,
            approximate: false,
        }
    }

    fn page_start(offset: i64) -> i64 {
        (offset / PAGE_SIZE) * PAGE_SIZE
    }

    pub fn set_count(&mut self, total_rows: i64, approximate: bool) {
        self.total_rows = total_rows;
        self.approximate = approximate;
    }

    pub fn total_rows(&self) -> i64 {
        self.total_rows
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Merges a freshly-fetched page's rows into the window at the given
    /// starting offset, then trims if the window has grown past
    /// `MAX_LOADED_PAGES`. The trim preserves whatever page the cursor sits
    /// in, even if it's the oldest-loaded page — losing the page under the
    /// cursor would force an immediate re-load on the very next read.
    pub fn merge_page(&mut self, start_offset: i64, result: ResultSet) {
        let capped: Vec<Row> = if self.pages.values().map(|p| p.rows.len() as i64).sum::<i64>() + result.rows.len() as i64 > ROW_CAP {
            let room = (ROW_CAP - self.pages.values().map(|p| p.rows.len() as i64).sum::<i64>()).max(0) as usize;
            result.rows.into_iter().take(room).collect()
        } else {
            result.rows
        };
        self.pages.insert(start_offset, Page { rows: capped });
        self.trim();
    }

    fn trim(&mut self) {
        if self.pages.len() <= MAX_LOADED_PAGES {
            return;
        }
        let cursor_page = Self::page_start(self.cursor);
        let mut candidates: Vec<i64> = self
            .pages
            .keys()
            .copied()
            .filter(|&start| {
                let pages_away = (start - cursor_page).abs() / PAGE_SIZE;
                pages_away >= TRIM_DISTANCE_PAGES
            })
            .collect();
        // Farthest from the cursor first.
        candidates.sort_by_key(|&start| -(start - cursor_page).abs());
        while self.pages.len() > MAX_LOADED_PAGES {
            match candidates.pop() {
                Some(start) => {
                    self.pages.remove(&start);
                }
                None => break,
            }
        }
    }

    /// True if the row at `offset` is currently buffered.
    pub fn has_row(&self, offset: i64) -> bool {
        let start = Self::page_start(offset);
        self.pages.get(&start).map(|p| (offset - start) < p.rows.len() as i64).unwrap_or(false)
    }

    pub fn row_at(&self, offset: i64) -> Option<&Row> {
        let start = Self::page_start(offset);
        self.pages.get(&start).and_then(|p| p.rows.get((offset - start) as usize))
    }

    /// Moves the logical cursor and reports whether a synchronous load is
    /// now required (the new cursor sits within `LOAD_THRESHOLD` rows of the
    /// edge of what's buffered, or entirely outside it) and whether a
    /// background prefetch should be kicked off in the direction of travel.
    pub fn move_cursor(&mut self, offset: i64) -> CursorMove {
        self.cursor = offset.clamp(0, self.total_rows.max(1) - 1);

        let needs_load = !self.has_row(self.cursor);
        let forward_gap = self.distance_to_loaded_edge(true);
        let backward_gap = self.distance_to_loaded_edge(false);

        let prefetch_forward = forward_gap.map(|d| d <= PREFETCH_THRESHOLD).unwrap_or(true);
        let prefetch_backward = backward_gap.map(|d| d <= PREFETCH_THRESHOLD).unwrap_or(true);
        let urgent = forward_gap.map(|d| d <= LOAD_THRESHOLD).unwrap_or(needs_load)
            || backward_gap.map(|d| d <= LOAD_THRESHOLD).unwrap_or(needs_load);

        CursorMove {
            needs_synchronous_load: needs_load || urgent,
            prefetch_forward,
            prefetch_backward,
        }
    }

    /// Rows remaining between the cursor and the forward (or backward) edge
    /// of the contiguous block of pages the cursor sits in. `None` if the
    /// cursor's own page isn't loaded at all.
    fn distance_to_loaded_edge(&self, forward: bool) -> Option<i64> {
        let cursor_page = Self::page_start(self.cursor);
        self.pages.get(&cursor_page)?;

        let mut edge_page = cursor_page;
        loop {
            let next = if forward { edge_page + PAGE_SIZE } else { edge_page - PAGE_SIZE };
            if next < 0 || next >= self.total_rows {
                break;
            }
            if self.pages.contains_key(&next) {
                edge_page = next;
            } else {
                break;
            }
        }

        if forward {
            Some(edge_page + PAGE_SIZE - self.cursor)
        } else {
            Some(self.cursor - edge_page)
        }
    }

    /// Starting offset of the next page to speculatively prefetch in the
    /// given direction, or `None` if the cursor's own page isn't loaded yet
    /// (a blocking load takes priority in that case) or there are no more
    /// rows in that direction. Mirrors `distance_to_loaded_edge`'s walk but
    /// returns the first unloaded page instead of a distance.
    pub fn next_prefetch_offset(&self, forward: bool) -> Option<i64> {
        let cursor_page = Self::page_start(self.cursor);
        self.pages.get(&cursor_page)?;

        let mut edge_page = cursor_page;
        loop {
            let next = if forward { edge_page + PAGE_SIZE } else { edge_page - PAGE_SIZE };
            if next < 0 || next >= self.total_rows {
                return None;
            }
            if self.pages.contains_key(&next) {
                edge_page = next;
            } else {
                return Some(next);
            }
        }
    }

    /// Invalidates the entire window — called when filters or sort order
    /// change, since every previously-loaded page was computed against a
    /// different query.
    pub fn invalidate(&mut self) {
        self.pages.clear();
        self.cursor = 0;
    }

    pub fn page_start_for(offset: i64) -> i64 {
        Self::page_start(offset)
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CursorMove {
    pub needs_synchronous_load: bool,
    pub prefetch_forward: bool,
    pub prefetch_backward: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ResultColumn, ResultSet};
    use crate::value::Value;

    fn fake_page(start: i64, len: i64) -> ResultSet {
        let mut rs = ResultSet::empty(vec![ResultColumn { name: "id".into(), type_tag: "int".into() }]);
        for i in 0..len {
            rs.push_row(vec![Value::Int(start + i)]).unwrap();
        }
        rs
    }

    #[test]
    fn merged_page_rows_are_retrievable_by_offset() {
        let mut cache = PageCache::new();
        cache.set_count(10_000, false);
        cache.merge_page(0, fake_page(0, PAGE_SIZE));
        assert!(cache.has_row(0));
        assert!(cache.has_row(PAGE_SIZE - 1));
        assert!(!cache.has_row(PAGE_SIZE));
        match cache.row_at(10).unwrap().cells[0] {
            Value::Int(n) => assert_eq!(n, 10),
            _ => panic!("wrong cell type"),
        }
    }

    #[test]
    fn trim_never_evicts_the_page_under_the_cursor() {
        let mut cache = PageCache::new();
        cache.set_count(100_000, false);
        for p in 0..(MAX_LOADED_PAGES as i64 + 3) {
            cache.merge_page(p * PAGE_SIZE, fake_page(p * PAGE_SIZE, PAGE_SIZE));
        }
        cache.move_cursor(2 * PAGE_SIZE + 10);
        // Force another merge to retrigger trim after moving the cursor.
        cache.merge_page((MAX_LOADED_PAGES as i64 + 3) * PAGE_SIZE, fake_page(0, PAGE_SIZE));
        assert!(cache.pages.len() <= MAX_LOADED_PAGES);
        assert!(cache.has_row(2 * PAGE_SIZE + 10), "page under cursor must survive trim");
    }

    #[test]
    fn row_cap_limits_total_buffered_rows() {
        let mut cache = PageCache::new();
        cache.set_count(ROW_CAP * 2, false);
        let huge = fake_page(0, ROW_CAP + 100);
        cache.merge_page(0, huge);
        let buffered: i64 = cache.pages.values().map(|p| p.rows.len() as i64).sum();
        assert!(buffered <= ROW_CAP);
    }

    #[test]
    fn move_cursor_past_loaded_window_requests_synchronous_load() {
        let mut cache = PageCache::new();
        cache.set_count(100_000, false);
        cache.merge_page(0, fake_page(0, PAGE_SIZE));
        let mv = cache.move_cursor(50_000);
        assert!(mv.needs_synchronous_load);
    }

    #[test]
    fn move_cursor_near_loaded_edge_requests_prefetch_not_synchronous_load() {
        let mut cache = PageCache::new();
        cache.set_count(100_000, false);
        cache.merge_page(0, fake_page(0, PAGE_SIZE));
        cache.merge_page(PAGE_SIZE, fake_page(PAGE_SIZE, PAGE_SIZE));
        let mv = cache.move_cursor(PAGE_SIZE + PAGE_SIZE / 2);
        assert!(!mv.needs_synchronous_load);
        assert!(mv.prefetch_forward);
    }

    #[test]
    fn next_prefetch_offset_finds_first_unloaded_adjacent_page() {
        let mut cache = PageCache::new();
        cache.set_count(100_000, false);
        cache.merge_page(PAGE_SIZE, fake_page(PAGE_SIZE, PAGE_SIZE));
        cache.move_cursor(PAGE_SIZE + 10);
        assert_eq!(cache.next_prefetch_offset(true), Some(2 * PAGE_SIZE));
        assert_eq!(cache.next_prefetch_offset(false), Some(0));
    }

    #[test]
    fn next_prefetch_offset_none_when_cursor_page_unloaded() {
        let mut cache = PageCache::new();
        cache.set_count(100_000, false);
        cache.move_cursor(50_000);
        assert_eq!(cache.next_prefetch_offset(true), None);
    }

    #[test]
    fn invalidate_clears_window_and_resets_cursor() {
        let mut cache = PageCache::new();
        cache.set_count(1000, false);
        cache.merge_page(0, fake_page(0, PAGE_SIZE));
        cache.move_cursor(200);
        cache.invalidate();
        assert!(!cache.has_row(0));
        assert_eq!(cache.cursor(), 0);
    }
}
