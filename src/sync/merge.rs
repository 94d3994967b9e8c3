//! Delta computation, delta application and two-way snapshot merge.
//!
//! Bookmarks are keyed by url (or by folder path); history by url. A remote
//! entry replaces a local one only when strictly newer, so equal timestamps
//! keep the local copy and re-running a sync is a no-op. Titles are
//! stored as received; escaping is the renderer's job.

use super::host::{BookmarkChanges, HostStore, NewBookmark};
use super::model::{ApplyError, ApplyErrorKind, ApplyResult, BookmarkEntry, Delta, HistoryEntry, Snapshot};
use crate::error::HostError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const BLOCKED_SCHEMES: &[&str] = &[
    "ms-msdt:", "search-ms:", "ms-officecmd:", "ms-word:",
    "ms-excel:", "ms-powerpoint:", "ms-cxh:", "ms-cxh-full:",
    "file:", "javascript:", "data:", "vbscript:",
];

pub fn is_safe_url(url: &str) -> bool {
    let lower = url.trim_start().to_lowercase();
    !BLOCKED_SCHEMES.iter().any(|s| lower.starts_with(s))
}

/// Only web history is replicated.
pub fn is_web_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

// ── delta ──

/// What `local` must apply to reflect `remote`.
///
/// Remote-only entries are added. Shared entries are updated when the
/// remote copy is strictly newer and actually differs. History takes the
/// larger visit count. Blocked url schemes and non-web history never make
/// it into a delta.
pub fn compute_delta(local: &Snapshot, remote: &Snapshot) -> Delta {
    let local_bookmarks: HashMap<String, &BookmarkEntry> =
        local.bookmarks().iter().map(|b| (b.key(), b)).collect();
    let local_history: HashMap<&str, &HistoryEntry> =
        local.history().iter().map(|h| (h.url.as_str(), h)).collect();

    let mut delta = Delta {
        timestamp: local.timestamp(),
        ..Default::default()
    };

    let mut seen = HashSet::new();
    for remote_bm in remote.bookmarks() {
        if let Some(url) = &remote_bm.url {
            if !is_safe_url(url) {
                tracing::debug!(url = %url, "skipping blocked scheme");
                continue;
            }
        }
        let key = remote_bm.key();
        if !seen.insert(key.clone()) {
            continue;
        }
        match local_bookmarks.get(&key) {
            None => delta.bookmarks_to_add.push(remote_bm.clone()),
            Some(existing) => {
                let newer = remote_bm.modified_time() > existing.modified_time();
                let differs = remote_bm.title != existing.title || remote_bm.url != existing.url;
                if newer && differs {
                    delta.bookmarks_to_update.push(remote_bm.clone());
                }
            }
        }
    }

    for remote_h in remote.history() {
        if !is_web_url(&remote_h.url) {
            continue;
        }
        match local_history.get(remote_h.url.as_str()) {
            None => delta.history_to_add.push(remote_h.clone()),
            Some(existing) if remote_h.last_visit_time > existing.last_visit_time => {
                let mut merged = remote_h.clone();
                merged.visit_count = remote_h.visit_count.max(existing.visit_count);
                delta.history_to_add.push(merged);
            }
            Some(_) => {}
        }
    }

    delta
}

// ── merge ──

/// Union of two snapshots, newest entry per key. On a timestamp tie the
/// entry from `a` stays. History always carries the larger counts.
pub fn merge_snapshots(a: &Snapshot, b: &Snapshot) -> Snapshot {
    let mut bookmarks: Vec<BookmarkEntry> = Vec::new();
    let mut bookmark_slots: HashMap<String, usize> = HashMap::new();
    for bm in a.bookmarks() {
        match bookmark_slots.get(&bm.key()) {
            Some(&i) => bookmarks[i] = bm.clone(),
            None => {
                bookmark_slots.insert(bm.key(), bookmarks.len());
                bookmarks.push(bm.clone());
            }
        }
    }
    for bm in b.bookmarks() {
        match bookmark_slots.get(&bm.key()) {
            Some(&i) if bm.modified_time() > bookmarks[i].modified_time() => bookmarks[i] = bm.clone(),
            Some(_) => {}
            None => {
                bookmark_slots.insert(bm.key(), bookmarks.len());
                bookmarks.push(bm.clone());
            }
        }
    }

    let mut history: Vec<HistoryEntry> = Vec::new();
    let mut history_slots: HashMap<String, usize> = HashMap::new();
    for h in a.history().iter().chain(b.history()) {
        match history_slots.get(&h.url) {
            Some(&i) => history[i] = merge_history(&history[i], h),
            None => {
                history_slots.insert(h.url.clone(), history.len());
                history.push(h.clone());
            }
        }
    }

    Snapshot::new(a.timestamp().max(b.timestamp()), bookmarks, history)
}

fn merge_history(existing: &HistoryEntry, incoming: &HistoryEntry) -> HistoryEntry {
    let mut winner = if incoming.last_visit_time > existing.last_visit_time {
        incoming.clone()
    } else {
        existing.clone()
    };
    winner.visit_count = existing.visit_count.max(incoming.visit_count);
    winner.typed_count = existing.typed_count.max(incoming.typed_count);
    winner
}

// ── apply ──

/// Writes a [`Delta`] into the host store. Items fail independently; the
/// failures are collected into the result instead of aborting the batch.
pub struct MergeEngine {
    host: Arc<dyn HostStore>,
}

impl MergeEngine {
    pub fn new(host: Arc<dyn HostStore>) -> Self {
        Self { host }
    }

    pub async fn apply_delta(&self, delta: &Delta) -> ApplyResult {
        let mut result = ApplyResult::default();

        let root = if delta.bookmarks_to_add.is_empty() && delta.bookmarks_to_update.is_empty() {
            Err(HostError::NotFound("bookmark root".into()))
        } else {
            self.root_id().await
        };

        for entry in &delta.bookmarks_to_add {
            match self.add_bookmark(&root, entry).await {
                Ok(true) => result.bookmarks_added += 1,
                Ok(false) => {}
                Err(e) => result.errors.push(apply_error(ApplyErrorKind::BookmarkAdd, entry.key(), e)),
            }
        }

        for entry in &delta.bookmarks_to_update {
            match self.update_bookmark(&root, entry).await {
                Ok(()) => result.bookmarks_updated += 1,
                Err(e) => result.errors.push(apply_error(ApplyErrorKind::BookmarkUpdate, entry.key(), e)),
            }
        }

        for entry in &delta.history_to_add {
            match self.host.add_history_visit(&entry.url, &entry.title, entry.last_visit_time).await {
                Ok(()) => result.history_added += 1,
                Err(e) => result.errors.push(apply_error(ApplyErrorKind::HistoryAdd, entry.url.clone(), e)),
            }
        }

        if !result.errors.is_empty() {
            tracing::warn!(failed = result.errors.len(), "some delta items could not be applied");
        }
        result
    }

    async fn root_id(&self) -> Result<String, HostError> {
        let tree = self.host.get_bookmark_tree().await?;
        tree.first()
            .map(|n| n.id.clone())
            .ok_or_else(|| HostError::NotFound("bookmark root".into()))
    }

    /// `Ok(false)` when the url already exists somewhere locally.
    async fn add_bookmark(&self, root: &Result<String, HostError>, entry: &BookmarkEntry) -> Result<bool, HostError> {
        let root = root.as_ref().map_err(Clone::clone)?;

        let Some(url) = &entry.url else {
            let names = entry.path.get(1..).unwrap_or(&[]);
            let (_, created) = self.resolve_folders(root, names).await?;
            return Ok(created);
        };

        if !self.host.search_bookmarks_by_url(url).await?.is_empty() {
            return Ok(false);
        }
        let (parent_id, _) = self.resolve_folders(root, entry.ancestor_titles()).await?;
        self.host
            .create_bookmark(NewBookmark {
                parent_id,
                title: entry.title.clone(),
                url: Some(url.clone()),
                index: None,
            })
            .await?;
        Ok(true)
    }

    async fn update_bookmark(&self, root: &Result<String, HostError>, entry: &BookmarkEntry) -> Result<(), HostError> {
        let Some(url) = &entry.url else {
            // a folder's identity is its path, so there's nothing to rename
            return Ok(());
        };
        let existing = self.host.search_bookmarks_by_url(url).await?;
        match existing.first() {
            Some(node) => {
                let changes = BookmarkChanges {
                    title: Some(entry.title.clone()),
                    url: None,
                };
                self.host.update_bookmark(&node.id, changes).await?;
                Ok(())
            }
            None => self.add_bookmark(root, entry).await.map(|_| ()),
        }
    }

    /// Walk `names` down from `root`, reusing a same-titled child folder at
    /// each level and creating it otherwise. Returns the last folder id and
    /// whether anything was created.
    async fn resolve_folders(&self, root: &str, names: &[String]) -> Result<(String, bool), HostError> {
        let mut current = root.to_string();
        let mut created = false;
        for name in names {
            let children = self.host.list_children(&current).await?;
            let found = children
                .into_iter()
                .find(|c| c.url.is_none() && c.title.as_deref().unwrap_or("") == name);
            current = match found {
                Some(folder) => folder.id,
                None => {
                    created = true;
                    self.host
                        .create_bookmark(NewBookmark {
                            parent_id: current.clone(),
                            title: name.clone(),
                            url: None,
                            index: None,
                        })
                        .await?
                        .id
                }
            };
        }
        Ok((current, created))
    }
}

fn apply_error(kind: ApplyErrorKind, item: String, err: HostError) -> ApplyError {
    ApplyError {
        kind,
        item,
        error: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SyncConfig;
    use crate::sync::host::MemoryHost;
    use crate::sync::model::BookmarkKind;
    use crate::sync::snapshot::SnapshotExtractor;

    fn bm(url: &str, title: &str, path: &[&str], date_added: i64) -> BookmarkEntry {
        BookmarkEntry {
            id: format!("id-{}", title),
            parent_id: None,
            index: 0,
            title: title.into(),
            url: Some(url.into()),
            date_added,
            date_group_modified: None,
            kind: BookmarkKind::Bookmark,
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn folder(path: &[&str], date_added: i64) -> BookmarkEntry {
        BookmarkEntry {
            id: format!("f-{}", path.join("/")),
            parent_id: None,
            index: 0,
            title: path.last().map(|s| s.to_string()).unwrap_or_default(),
            url: None,
            date_added,
            date_group_modified: None,
            kind: BookmarkKind::Folder,
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn hist(url: &str, visits: i64, last: i64) -> HistoryEntry {
        HistoryEntry {
            url: url.into(),
            title: url.into(),
            visit_count: visits,
            last_visit_time: last,
            typed_count: 0,
        }
    }

    fn snap(ts: i64, bookmarks: Vec<BookmarkEntry>, history: Vec<HistoryEntry>) -> Snapshot {
        Snapshot::new(ts, bookmarks, history)
    }

    fn setup() -> (Arc<MemoryHost>, SnapshotExtractor, MergeEngine) {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(50_000));
        let host = Arc::new(MemoryHost::new(clock.clone()));
        let extractor = SnapshotExtractor::new(host.clone(), clock, &SyncConfig::default());
        let engine = MergeEngine::new(host.clone());
        (host, extractor, engine)
    }

    // ── compute_delta ──

    #[test]
    fn remote_only_entries_are_added() {
        let local = snap(1, vec![], vec![]);
        let remote = snap(2, vec![bm("https://a.com", "A", &["root", "A"], 1000)], vec![hist("https://b.com", 1, 10)]);
        let d = compute_delta(&local, &remote);
        assert_eq!(d.bookmarks_to_add.len(), 1);
        assert_eq!(d.history_to_add.len(), 1);
        assert!(d.bookmarks_to_update.is_empty());
    }

    #[test]
    fn equal_timestamps_keep_local() {
        let local = snap(1, vec![bm("https://a.com", "Mine", &["root", "Mine"], 1000)], vec![]);
        let remote = snap(1, vec![bm("https://a.com", "Theirs", &["root", "Theirs"], 1000)], vec![]);
        assert!(compute_delta(&local, &remote).is_empty());
    }

    #[test]
    fn strictly_newer_and_different_is_updated() {
        let local = snap(1, vec![bm("https://a.com", "Old", &["root", "Old"], 1000)], vec![]);
        let remote = snap(1, vec![bm("https://a.com", "New", &["root", "New"], 2000)], vec![]);
        let d = compute_delta(&local, &remote);
        assert_eq!(d.bookmarks_to_update.len(), 1);
        assert_eq!(d.bookmarks_to_update[0].title, "New");

        let same = snap(1, vec![bm("https://a.com", "Old", &["root", "Old"], 9000)], vec![]);
        assert!(compute_delta(&local, &same).is_empty());
    }

    #[test]
    fn history_takes_max_visits_from_newer_remote() {
        let local = snap(1, vec![], vec![hist("https://b.com", 3, 500)]);
        let remote = snap(1, vec![], vec![hist("https://b.com", 5, 900)]);
        let d = compute_delta(&local, &remote);
        assert_eq!(d.history_to_add.len(), 1);
        assert_eq!(d.history_to_add[0].visit_count, 5);
        assert_eq!(d.history_to_add[0].last_visit_time, 900);

        let local = snap(1, vec![], vec![hist("https://b.com", 9, 500)]);
        let d = compute_delta(&local, &remote);
        assert_eq!(d.history_to_add[0].visit_count, 9);

        let stale = snap(1, vec![], vec![hist("https://b.com", 50, 100)]);
        assert!(compute_delta(&local, &stale).is_empty());
    }

    #[test]
    fn unsafe_and_non_web_entries_are_dropped() {
        let local = snap(1, vec![], vec![]);
        let remote = snap(
            1,
            vec![
                bm("javascript:alert(1)", "x", &["root", "x"], 1),
                bm("FILE:///etc/passwd", "y", &["root", "y"], 1),
                bm("https://ok.com", "ok", &["root", "ok"], 1),
            ],
            vec![hist("chrome://settings", 1, 1), hist("ftp://files", 1, 1), hist("HTTPS://ok.com", 1, 1)],
        );
        let d = compute_delta(&local, &remote);
        assert_eq!(d.bookmarks_to_add.len(), 1);
        assert_eq!(d.bookmarks_to_add[0].url.as_deref(), Some("https://ok.com"));
        assert_eq!(d.history_to_add.len(), 1);
    }

    #[test]
    fn titles_and_paths_are_kept_verbatim() {
        let local = snap(1, vec![folder(&["root", "<Dev>"], 1)], vec![]);
        let remote = snap(
            1,
            vec![
                folder(&["root", "<Dev>"], 1),
                bm("https://a.com", "C++ <3 & a<b", &["root", "<Dev>", "C++ <3 & a<b"], 1),
            ],
            vec![HistoryEntry { title: "a<b".into(), ..hist("https://b.com", 1, 1) }],
        );
        let d = compute_delta(&local, &remote);
        // the folder matches the local one by its raw path
        assert_eq!(d.bookmarks_to_add.len(), 1);
        assert_eq!(d.bookmarks_to_add[0].title, "C++ <3 & a<b");
        assert_eq!(d.bookmarks_to_add[0].path[1], "<Dev>");
        assert_eq!(d.history_to_add[0].title, "a<b");
    }

    #[test]
    fn duplicate_remote_keys_are_scheduled_once() {
        let local = snap(1, vec![], vec![]);
        let remote = snap(
            1,
            vec![bm("https://a.com", "A", &["root", "Bar", "A"], 1), bm("https://a.com", "A", &["root", "Other", "A"], 1)],
            vec![],
        );
        assert_eq!(compute_delta(&local, &remote).bookmarks_to_add.len(), 1);
    }

    // ── merge_snapshots ──

    #[test]
    fn merge_is_commutative_for_distinct_timestamps() {
        let a = snap(
            10,
            vec![bm("https://x.com", "X-a", &["root", "X-a"], 100), folder(&["root", "Dev"], 5)],
            vec![hist("https://h.com", 3, 700), hist("https://only-a.com", 1, 1)],
        );
        let b = snap(
            20,
            vec![bm("https://x.com", "X-b", &["root", "X-b"], 200), bm("https://y.com", "Y", &["root", "Y"], 50)],
            vec![hist("https://h.com", 8, 400)],
        );

        let ab = merge_snapshots(&a, &b);
        let ba = merge_snapshots(&b, &a);

        let by_key = |s: &Snapshot| -> HashMap<String, BookmarkEntry> {
            s.bookmarks().iter().map(|e| (e.key(), e.clone())).collect()
        };
        let hist_by_url = |s: &Snapshot| -> HashMap<String, HistoryEntry> {
            s.history().iter().map(|e| (e.url.clone(), e.clone())).collect()
        };
        assert_eq!(by_key(&ab), by_key(&ba));
        assert_eq!(hist_by_url(&ab), hist_by_url(&ba));

        assert_eq!(by_key(&ab)["url:https://x.com"].title, "X-b");
        let h = &hist_by_url(&ab)["https://h.com"];
        assert_eq!(h.visit_count, 8);
        assert_eq!(h.last_visit_time, 700);
        assert_eq!(ab.timestamp(), 20);
        assert_eq!(ab.bookmark_count(), 3);
        assert_eq!(ab.history_count(), 2);
    }

    #[test]
    fn merge_tie_keeps_first() {
        let a = snap(1, vec![bm("https://x.com", "first", &["root", "first"], 100)], vec![]);
        let b = snap(1, vec![bm("https://x.com", "second", &["root", "second"], 100)], vec![]);
        assert_eq!(merge_snapshots(&a, &b).bookmarks()[0].title, "first");
        assert_eq!(merge_snapshots(&b, &a).bookmarks()[0].title, "second");
    }

    // ── apply_delta ──

    #[tokio::test]
    async fn apply_creates_missing_folders_once() {
        let (host, _, engine) = setup();
        let delta = Delta {
            bookmarks_to_add: vec![
                folder(&["root", "Bookmarks Bar", "Dev"], 1),
                bm("https://rust-lang.org", "Rust", &["root", "Bookmarks Bar", "Dev", "Lang", "Rust"], 1),
                bm("https://go.dev", "Go", &["root", "Bookmarks Bar", "Dev", "Lang", "Go"], 1),
            ],
            ..Default::default()
        };
        let before = host.folder_count();
        let r = engine.apply_delta(&delta).await;
        assert!(r.errors.is_empty(), "{:?}", r.errors);
        assert_eq!(r.bookmarks_added, 3);
        // Dev and Lang, nothing duplicated
        assert_eq!(host.folder_count(), before + 2);
        assert_eq!(host.bookmark_count(), 2);
    }

    #[tokio::test]
    async fn folder_names_with_markup_characters_are_reused() {
        let (host, _, engine) = setup();
        host.insert(MemoryHost::BAR_ID, "<Dev>", None, 1);
        let before = host.folder_count();
        let delta = Delta {
            bookmarks_to_add: vec![bm("https://a.com", "A", &["root", "Bookmarks Bar", "<Dev>", "A"], 1)],
            ..Default::default()
        };
        let r = engine.apply_delta(&delta).await;
        assert!(r.errors.is_empty(), "{:?}", r.errors);
        assert_eq!(r.bookmarks_added, 1);
        assert_eq!(host.folder_count(), before);
    }

    #[tokio::test]
    async fn existing_url_is_not_recreated() {
        let (host, _, engine) = setup();
        host.insert(MemoryHost::OTHER_ID, "A", Some("https://a.com"), 1);
        let delta = Delta {
            bookmarks_to_add: vec![bm("https://a.com", "A", &["root", "Bookmarks Bar", "A"], 1)],
            ..Default::default()
        };
        let r = engine.apply_delta(&delta).await;
        assert_eq!(r.bookmarks_added, 0);
        assert!(r.errors.is_empty());
        assert_eq!(host.bookmark_count(), 1);
    }

    #[tokio::test]
    async fn update_renames_or_falls_back_to_create() {
        let (host, _, engine) = setup();
        host.insert(MemoryHost::BAR_ID, "Old", Some("https://a.com"), 1);
        let delta = Delta {
            bookmarks_to_update: vec![
                bm("https://a.com", "New", &["root", "Bookmarks Bar", "New"], 5),
                bm("https://gone.com", "Gone", &["root", "Bookmarks Bar", "Gone"], 5),
            ],
            ..Default::default()
        };
        let r = engine.apply_delta(&delta).await;
        assert_eq!(r.bookmarks_updated, 2);
        let found = host.search_bookmarks_by_url("https://a.com").await.unwrap();
        assert_eq!(found[0].title.as_deref(), Some("New"));
        assert_eq!(host.bookmark_count(), 2);
    }

    #[tokio::test]
    async fn failures_are_collected_per_item() {
        let (host, _, engine) = setup();
        host.reject_url("https://bad.com");
        let delta = Delta {
            bookmarks_to_add: vec![
                bm("https://bad.com", "Bad", &["root", "Bookmarks Bar", "Bad"], 1),
                bm("https://good.com", "Good", &["root", "Bookmarks Bar", "Good"], 1),
            ],
            history_to_add: vec![hist("https://bad.com", 1, 1), hist("https://good.com", 1, 1)],
            ..Default::default()
        };
        let r = engine.apply_delta(&delta).await;
        assert_eq!(r.bookmarks_added, 1);
        assert_eq!(r.history_added, 1);
        assert_eq!(r.errors.len(), 2);
        assert_eq!(r.errors[0].kind, ApplyErrorKind::BookmarkAdd);
        assert_eq!(r.errors[0].item, "url:https://bad.com");
        assert_eq!(r.errors[1].kind, ApplyErrorKind::HistoryAdd);
    }

    #[tokio::test]
    async fn unreadable_tree_fails_bookmarks_not_history() {
        let (host, _, engine) = setup();
        host.set_tree_unavailable(true);
        let delta = Delta {
            bookmarks_to_add: vec![bm("https://a.com", "A", &["root", "Bookmarks Bar", "A"], 1)],
            history_to_add: vec![hist("https://b.com", 1, 1)],
            ..Default::default()
        };
        let r = engine.apply_delta(&delta).await;
        assert_eq!(r.bookmarks_added, 0);
        assert_eq!(r.history_added, 1);
        assert_eq!(r.errors.len(), 1);
    }

    #[tokio::test]
    async fn applying_a_delta_makes_the_next_delta_empty() {
        let (host, extractor, engine) = setup();
        host.insert(MemoryHost::BAR_ID, "Stale", Some("https://a.com"), 1_000);
        host.insert_history("https://b.com", "B", 3, 500);

        let remote = snap(
            60_000,
            vec![
                folder(&["root"], 1),
                folder(&["root", "Bookmarks Bar"], 1),
                folder(&["root", "Bookmarks Bar", "Dev"], 1),
                bm("https://a.com", "Fresh <3", &["root", "Bookmarks Bar", "Fresh <3"], 90_000),
                bm("https://rust-lang.org", "Rust", &["root", "Bookmarks Bar", "Dev", "Rust"], 2_000),
                bm("data:text/html,hi", "nope", &["root", "nope"], 2_000),
            ],
            vec![hist("https://b.com", 5, 900), hist("https://c.com", 1, 800), hist("about:blank", 1, 1)],
        );

        let local = extractor.extract().await.unwrap();
        let first = compute_delta(&local, &remote);
        assert!(!first.is_empty());
        let r = engine.apply_delta(&first).await;
        assert!(r.errors.is_empty(), "{:?}", r.errors);
        assert_eq!(r.bookmarks_added, 2);
        assert_eq!(r.bookmarks_updated, 1);
        assert_eq!(r.history_added, 2);

        let local = extractor.extract().await.unwrap();
        let second = compute_delta(&local, &remote);
        assert!(second.is_empty(), "{:?}", second);

        let b = host.history_item("https://b.com").unwrap();
        assert_eq!(b.last_visit_time, Some(900));
    }
}
