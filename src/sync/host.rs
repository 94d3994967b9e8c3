//! Seam to the browser's bookmark and history storage.

use crate::clock::{Clock, SystemClock};
use crate::error::HostError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Raw tree node as the host hands it out. Every field but `id` may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkNode {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub index: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub date_added: Option<i64>,
    #[serde(default)]
    pub date_group_modified: Option<i64>,
    #[serde(default)]
    pub children: Vec<BookmarkNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub visit_count: Option<i64>,
    #[serde(default)]
    pub last_visit_time: Option<i64>,
    #[serde(default)]
    pub typed_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBookmark {
    pub parent_id: String,
    pub title: String,
    /// `None` creates a folder
    pub url: Option<String>,
    pub index: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookmarkChanges {
    pub title: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// empty matches everything
    pub text: String,
    pub max_results: u32,
    pub start_time: i64,
}

#[async_trait]
pub trait HostStore: Send + Sync {
    async fn get_bookmark_tree(&self) -> Result<Vec<BookmarkNode>, HostError>;
    async fn search_bookmarks_by_url(&self, url: &str) -> Result<Vec<BookmarkNode>, HostError>;
    async fn create_bookmark(&self, bookmark: NewBookmark) -> Result<BookmarkNode, HostError>;
    async fn update_bookmark(&self, id: &str, changes: BookmarkChanges) -> Result<BookmarkNode, HostError>;
    async fn list_children(&self, id: &str) -> Result<Vec<BookmarkNode>, HostError>;
    async fn search_history(&self, query: HistoryQuery) -> Result<Vec<HistoryItem>, HostError>;
    async fn add_history_visit(&self, url: &str, title: &str, visit_time: i64) -> Result<(), HostError>;
}

// ── in-memory host ──

#[derive(Debug, Clone)]
struct StoredNode {
    id: String,
    parent_id: Option<String>,
    title: String,
    url: Option<String>,
    date_added: i64,
    date_group_modified: Option<i64>,
    children: Vec<String>,
}

#[derive(Default)]
struct MemoryState {
    nodes: BTreeMap<String, StoredNode>,
    history: BTreeMap<String, HistoryItem>,
    next_id: u64,
    rejected_urls: HashSet<String>,
    tree_unavailable: bool,
}

impl MemoryState {
    fn alloc_id(&mut self) -> String {
        let id = self.next_id.to_string();
        self.next_id += 1;
        id
    }

    fn to_node(&self, stored: &StoredNode, recursive: bool) -> BookmarkNode {
        let index = stored.parent_id.as_ref().and_then(|p| {
            self.nodes
                .get(p)
                .and_then(|parent| parent.children.iter().position(|c| c == &stored.id))
                .map(|i| i as i64)
        });
        let children = if recursive {
            stored
                .children
                .iter()
                .filter_map(|c| self.nodes.get(c))
                .map(|c| self.to_node(c, true))
                .collect()
        } else {
            Vec::new()
        };
        BookmarkNode {
            id: stored.id.clone(),
            parent_id: stored.parent_id.clone(),
            index,
            title: Some(stored.title.clone()),
            url: stored.url.clone(),
            date_added: Some(stored.date_added),
            date_group_modified: stored.date_group_modified,
            children,
        }
    }
}

/// Browser-like store kept in memory: a root `"0"` holding
/// `"1"` Bookmarks Bar and `"2"` Other Bookmarks.
pub struct MemoryHost {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryHost {
    pub const ROOT_ID: &'static str = "0";
    pub const BAR_ID: &'static str = "1";
    pub const OTHER_ID: &'static str = "2";

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        let mut state = MemoryState { next_id: 3, ..Default::default() };
        let folder = |id: &str, parent: Option<&str>, title: &str| StoredNode {
            id: id.into(),
            parent_id: parent.map(String::from),
            title: title.into(),
            url: None,
            date_added: now,
            date_group_modified: None,
            children: Vec::new(),
        };
        let mut root = folder(Self::ROOT_ID, None, "");
        root.children = vec![Self::BAR_ID.into(), Self::OTHER_ID.into()];
        state.nodes.insert(Self::ROOT_ID.into(), root);
        state.nodes.insert(Self::BAR_ID.into(), folder(Self::BAR_ID, Some(Self::ROOT_ID), "Bookmarks Bar"));
        state.nodes.insert(Self::OTHER_ID.into(), folder(Self::OTHER_ID, Some(Self::ROOT_ID), "Other Bookmarks"));
        Self { state: Mutex::new(state), clock }
    }

    /// Seed a node directly, bypassing the async api. Returns its id.
    pub fn insert(&self, parent_id: &str, title: &str, url: Option<&str>, date_added: i64) -> String {
        let mut st = self.state.lock();
        let id = st.alloc_id();
        st.nodes.insert(
            id.clone(),
            StoredNode {
                id: id.clone(),
                parent_id: Some(parent_id.into()),
                title: title.into(),
                url: url.map(String::from),
                date_added,
                date_group_modified: None,
                children: Vec::new(),
            },
        );
        if let Some(parent) = st.nodes.get_mut(parent_id) {
            parent.children.push(id.clone());
        }
        id
    }

    pub fn insert_history(&self, url: &str, title: &str, visit_count: i64, last_visit_time: i64) {
        self.state.lock().history.insert(
            url.into(),
            HistoryItem {
                url: Some(url.into()),
                title: Some(title.into()),
                visit_count: Some(visit_count),
                last_visit_time: Some(last_visit_time),
                typed_count: Some(0),
            },
        );
    }

    pub fn history_item(&self, url: &str) -> Option<HistoryItem> {
        self.state.lock().history.get(url).cloned()
    }

    pub fn bookmark_count(&self) -> usize {
        self.state.lock().nodes.values().filter(|n| n.url.is_some()).count()
    }

    pub fn folder_count(&self) -> usize {
        self.state.lock().nodes.values().filter(|n| n.url.is_none()).count()
    }

    /// Make every write for `url` fail.
    pub fn reject_url(&self, url: &str) {
        self.state.lock().rejected_urls.insert(url.into());
    }

    pub fn set_tree_unavailable(&self, unavailable: bool) {
        self.state.lock().tree_unavailable = unavailable;
    }
}

#[async_trait]
impl HostStore for MemoryHost {
    async fn get_bookmark_tree(&self) -> Result<Vec<BookmarkNode>, HostError> {
        let st = self.state.lock();
        if st.tree_unavailable {
            return Err(HostError::Unavailable("bookmark tree".into()));
        }
        let root = st
            .nodes
            .get(Self::ROOT_ID)
            .ok_or_else(|| HostError::NotFound("root".into()))?;
        Ok(vec![st.to_node(root, true)])
    }

    async fn search_bookmarks_by_url(&self, url: &str) -> Result<Vec<BookmarkNode>, HostError> {
        let st = self.state.lock();
        Ok(st
            .nodes
            .values()
            .filter(|n| n.url.as_deref() == Some(url))
            .map(|n| st.to_node(n, false))
            .collect())
    }

    async fn create_bookmark(&self, bookmark: NewBookmark) -> Result<BookmarkNode, HostError> {
        let now = self.clock.now_ms();
        let mut st = self.state.lock();
        if let Some(url) = &bookmark.url {
            if st.rejected_urls.contains(url) {
                return Err(HostError::Rejected(url.clone()));
            }
        }
        match st.nodes.get(&bookmark.parent_id) {
            Some(parent) if parent.url.is_none() => {}
            Some(_) => return Err(HostError::Rejected(format!("{} is not a folder", bookmark.parent_id))),
            None => return Err(HostError::NotFound(bookmark.parent_id.clone())),
        }

        let id = st.alloc_id();
        let stored = StoredNode {
            id: id.clone(),
            parent_id: Some(bookmark.parent_id.clone()),
            title: bookmark.title,
            url: bookmark.url,
            date_added: now,
            date_group_modified: None,
            children: Vec::new(),
        };
        st.nodes.insert(id.clone(), stored);
        if let Some(parent) = st.nodes.get_mut(&bookmark.parent_id) {
            let at = bookmark
                .index
                .map(|i| (i.max(0) as usize).min(parent.children.len()))
                .unwrap_or(parent.children.len());
            parent.children.insert(at, id.clone());
            parent.date_group_modified = Some(now);
        }
        let node = st.nodes.get(&id).ok_or_else(|| HostError::NotFound(id.clone()))?;
        Ok(st.to_node(node, false))
    }

    async fn update_bookmark(&self, id: &str, changes: BookmarkChanges) -> Result<BookmarkNode, HostError> {
        let mut st = self.state.lock();
        let rejected = st
            .nodes
            .get(id)
            .and_then(|n| n.url.as_ref())
            .map(|u| st.rejected_urls.contains(u))
            .unwrap_or(false);
        if rejected {
            return Err(HostError::Rejected(id.into()));
        }
        let node = st.nodes.get_mut(id).ok_or_else(|| HostError::NotFound(id.into()))?;
        if let Some(title) = changes.title {
            node.title = title;
        }
        if let Some(url) = changes.url {
            if node.url.is_none() {
                return Err(HostError::Rejected("cannot set url on a folder".into()));
            }
            node.url = Some(url);
        }
        let snapshot = node.clone();
        Ok(st.to_node(&snapshot, false))
    }

    async fn list_children(&self, id: &str) -> Result<Vec<BookmarkNode>, HostError> {
        let st = self.state.lock();
        let parent = st.nodes.get(id).ok_or_else(|| HostError::NotFound(id.into()))?;
        Ok(parent
            .children
            .iter()
            .filter_map(|c| st.nodes.get(c))
            .map(|c| st.to_node(c, false))
            .collect())
    }

    async fn search_history(&self, query: HistoryQuery) -> Result<Vec<HistoryItem>, HostError> {
        let st = self.state.lock();
        let needle = query.text.to_lowercase();
        let mut hits: Vec<HistoryItem> = st
            .history
            .values()
            .filter(|h| h.last_visit_time.unwrap_or(0) >= query.start_time)
            .filter(|h| {
                needle.is_empty()
                    || h.url.as_deref().unwrap_or("").to_lowercase().contains(&needle)
                    || h.title.as_deref().unwrap_or("").to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.last_visit_time.cmp(&a.last_visit_time));
        hits.truncate(query.max_results as usize);
        Ok(hits)
    }

    async fn add_history_visit(&self, url: &str, title: &str, visit_time: i64) -> Result<(), HostError> {
        let mut st = self.state.lock();
        if st.rejected_urls.contains(url) {
            return Err(HostError::Rejected(url.into()));
        }
        let item = st.history.entry(url.to_string()).or_insert_with(|| HistoryItem {
            url: Some(url.into()),
            title: None,
            visit_count: Some(0),
            last_visit_time: Some(visit_time),
            typed_count: Some(0),
        });
        item.visit_count = Some(item.visit_count.unwrap_or(0) + 1);
        item.last_visit_time = Some(item.last_visit_time.unwrap_or(visit_time).max(visit_time));
        if !title.is_empty() {
            item.title = Some(title.into());
        }
        Ok(())
    }
}
