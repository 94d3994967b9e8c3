use serde::{Deserialize, Serialize};

// ── bookmarks ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkKind {
    Bookmark,
    Folder,
}

/// One node of the bookmark tree, flattened with its title path from the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkEntry {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    pub date_added: i64,
    #[serde(default)]
    pub date_group_modified: Option<i64>,
    #[serde(rename = "type")]
    pub kind: BookmarkKind,
    pub path: Vec<String>,
}

impl BookmarkEntry {
    /// Identity across devices: node ids are device-local and never compared.
    pub fn key(&self) -> String {
        match &self.url {
            Some(url) => format!("url:{}", url),
            None => format!("folder:{}", self.path.join("/")),
        }
    }

    pub fn modified_time(&self) -> i64 {
        self.date_group_modified.unwrap_or(self.date_added)
    }

    pub fn is_folder(&self) -> bool {
        self.kind == BookmarkKind::Folder
    }

    /// Titles of the ancestors below the root, i.e. the folders to resolve
    /// before this entry can be placed.
    pub fn ancestor_titles(&self) -> &[String] {
        match self.path.len() {
            0 | 1 => &[],
            n => &self.path[1..n - 1],
        }
    }
}

// ── history ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub visit_count: i64,
    pub last_visit_time: i64,
    #[serde(default)]
    pub typed_count: i64,
}

// ── snapshot / delta ──

/// Point-in-time view of one device's bookmarks and history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    timestamp: i64,
    bookmarks: Vec<BookmarkEntry>,
    history: Vec<HistoryEntry>,
    bookmark_count: u64,
    history_count: u64,
}

impl Snapshot {
    pub fn new(timestamp: i64, bookmarks: Vec<BookmarkEntry>, history: Vec<HistoryEntry>) -> Self {
        Self {
            timestamp,
            bookmark_count: bookmarks.len() as u64,
            history_count: history.len() as u64,
            bookmarks,
            history,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn bookmarks(&self) -> &[BookmarkEntry] {
        &self.bookmarks
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn bookmark_count(&self) -> u64 {
        self.bookmark_count
    }

    pub fn history_count(&self) -> u64 {
        self.history_count
    }
}

/// Changes to apply locally so that it reflects a remote snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub bookmarks_to_add: Vec<BookmarkEntry>,
    pub bookmarks_to_update: Vec<BookmarkEntry>,
    pub history_to_add: Vec<HistoryEntry>,
    pub timestamp: i64,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.bookmarks_to_add.is_empty()
            && self.bookmarks_to_update.is_empty()
            && self.history_to_add.is_empty()
    }
}

// ── results / stats ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyErrorKind {
    BookmarkAdd,
    BookmarkUpdate,
    HistoryAdd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyError {
    #[serde(rename = "type")]
    pub kind: ApplyErrorKind,
    /// url or folder key the failure belongs to
    pub item: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub bookmarks_added: u64,
    pub bookmarks_updated: u64,
    pub history_added: u64,
    #[serde(default)]
    pub errors: Vec<ApplyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncStats {
    pub total_bookmarks_synced: u64,
    pub total_history_synced: u64,
    /// milliseconds
    pub last_sync_duration: i64,
    pub sync_count: u64,
}

impl SyncStats {
    pub fn record(&mut self, result: &ApplyResult, duration_ms: i64) {
        self.total_bookmarks_synced += result.bookmarks_added + result.bookmarks_updated;
        self.total_history_synced += result.history_added;
        self.last_sync_duration = duration_ms;
        self.sync_count += 1;
    }
}
