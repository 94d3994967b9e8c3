use super::host::{BookmarkNode, HistoryItem, HistoryQuery, HostStore};
use super::model::{BookmarkEntry, BookmarkKind, HistoryEntry, Snapshot};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::Result;
use std::sync::Arc;

const ROOT_TITLE: &str = "root";
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Reads the host's bookmark tree and history into a [`Snapshot`].
pub struct SnapshotExtractor {
    host: Arc<dyn HostStore>,
    clock: Arc<dyn Clock>,
    max_history_items: u32,
    history_window_days: Option<u32>,
}

impl SnapshotExtractor {
    pub fn new(host: Arc<dyn HostStore>, clock: Arc<dyn Clock>, config: &SyncConfig) -> Self {
        Self {
            host,
            clock,
            max_history_items: config.max_history_items,
            history_window_days: config.history_window_days,
        }
    }

    pub async fn extract(&self) -> Result<Snapshot> {
        let now = self.clock.now_ms();
        let start_time = self
            .history_window_days
            .map(|days| now - i64::from(days) * DAY_MS)
            .unwrap_or(0);
        let query = HistoryQuery {
            text: String::new(),
            max_results: self.max_history_items,
            start_time,
        };

        // both reads are independent
        let (tree, history) = tokio::join!(self.host.get_bookmark_tree(), self.host.search_history(query));

        let bookmarks = flatten_tree(&tree?, now);
        let history: Vec<HistoryEntry> = history?
            .into_iter()
            .filter_map(|item| normalize_history(item, now))
            .collect();

        tracing::debug!(bookmarks = bookmarks.len(), history = history.len(), "snapshot extracted");
        Ok(Snapshot::new(now, bookmarks, history))
    }
}

/// Pre-order walk of the tree. Each node's path is its parent's path plus
/// its own title (`"root"` when untitled). Missing fields get defaults:
/// empty title, index 0, `now` as the add time.
pub fn flatten_tree(roots: &[BookmarkNode], now: i64) -> Vec<BookmarkEntry> {
    let mut out = Vec::new();
    let mut stack: Vec<(&BookmarkNode, Vec<String>)> = roots.iter().rev().map(|n| (n, Vec::new())).collect();

    while let Some((node, parent_path)) = stack.pop() {
        let title = node.title.clone().unwrap_or_default();
        let mut path = parent_path;
        path.push(if title.is_empty() { ROOT_TITLE.to_string() } else { title.clone() });

        for child in node.children.iter().rev() {
            stack.push((child, path.clone()));
        }

        out.push(BookmarkEntry {
            id: node.id.clone(),
            parent_id: node.parent_id.clone(),
            index: node.index.unwrap_or(0),
            title,
            kind: if node.url.is_some() { BookmarkKind::Bookmark } else { BookmarkKind::Folder },
            url: node.url.clone(),
            date_added: node.date_added.unwrap_or(now),
            date_group_modified: node.date_group_modified,
            path,
        });
    }
    out
}

fn normalize_history(item: HistoryItem, now: i64) -> Option<HistoryEntry> {
    let url = item.url.filter(|u| !u.is_empty())?;
    Some(HistoryEntry {
        url,
        title: item.title.unwrap_or_default(),
        visit_count: item.visit_count.unwrap_or(1),
        last_visit_time: item.last_visit_time.unwrap_or(now),
        typed_count: item.typed_count.unwrap_or(0),
    })
}
