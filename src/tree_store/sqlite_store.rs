use super::json_tree::{children_of, get_at, normalize, set_at};
use super::schema::{INSERT_LOG_TRIGGER, TREE_VERSIONED_SCHEMAS};
use super::{
    created_nodes, is_valid_key, ChildFeed, MultiPathUpdate, NodeCreated, Relist, StoreError,
    TreePath, TreeStore, FEED_CHANNEL_CAPACITY,
};
use crate::sqlite_persistence;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How often subscribed stores look for rows inserted by any connection.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(200);

/// Insert log entries older than this are pruned.
const INSERT_LOG_RETENTION_SECS: i64 = 60 * 60;

/// Tree persisted in SQLite, one row per record.
///
/// Records inserted into a collection reach subscribers whichever connection
/// wrote them, through the insert log polled every `watch_interval`. Nodes
/// created inside an existing record are only seen when written through this
/// instance.
pub struct SqliteTreeStore {
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<NodeCreated>,
    watch_interval: Duration,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteTreeStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = sqlite_persistence::open_versioned(
            db_path.as_ref(),
            TREE_VERSIONED_SCHEMAS,
            "tree",
        )?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = sqlite_persistence::open_in_memory(TREE_VERSIONED_SCHEMAS, "tree")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(INSERT_LOG_TRIGGER, [])?;
        let (events, _) = broadcast::channel(FEED_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            events,
            watch_interval: DEFAULT_WATCH_INTERVAL,
            watcher: Mutex::new(None),
        })
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Start polling the insert log from `cursor` unless a watcher already runs.
    fn ensure_watcher(&self, cursor: i64) {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *watcher = Some(tokio::spawn(watch_inserts(
            Arc::clone(&self.conn),
            self.events.clone(),
            cursor,
            self.watch_interval,
        )));
    }
}

impl Drop for SqliteTreeStore {
    fn drop(&mut self) {
        let watcher = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = watcher.take() {
            handle.abort();
        }
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    // A panic mid-write drops the open transaction, which rolls it back.
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_record(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

fn load_rows(conn: &Connection, collection: Option<&str>) -> Result<Vec<(String, String, Value)>> {
    let mut stmt = conn.prepare(
        "SELECT collection, key, value FROM tree_nodes
         WHERE ?1 IS NULL OR collection = ?1
         ORDER BY collection, key",
    )?;
    let rows = stmt
        .query_map(params![collection], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(collection, key, raw)| Ok((collection, key, parse_record(&raw)?)))
        .collect()
}

fn load_record(conn: &Connection, collection: &str, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM tree_nodes WHERE collection = ?1 AND key = ?2",
            params![collection, key],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_record).transpose()
}

fn read_at(conn: &Connection, path: &TreePath) -> Result<Option<Value>> {
    match path.segments() {
        [] => {
            let mut root = Map::new();
            for (collection, key, value) in load_rows(conn, None)? {
                if let Value::Object(records) = root
                    .entry(collection)
                    .or_insert_with(|| Value::Object(Map::new()))
                {
                    records.insert(key, value);
                }
            }
            Ok(normalize(Value::Object(root)))
        }
        [collection] => {
            let records: Map<String, Value> = load_rows(conn, Some(collection.as_str()))?
                .into_iter()
                .map(|(_, key, value)| (key, value))
                .collect();
            Ok(normalize(Value::Object(records)))
        }
        [collection, key, rest @ ..] => Ok(load_record(conn, collection, key)?
            .and_then(|record| get_at(&record, rest).cloned())),
    }
}

/// Existence check that never loads more than one record.
fn node_exists(conn: &Connection, path: &TreePath) -> Result<bool> {
    match path.segments() {
        [] => Ok(conn
            .query_row("SELECT 1 FROM tree_nodes LIMIT 1", [], |_| Ok(()))
            .optional()?
            .is_some()),
        [collection] => Ok(conn
            .query_row(
                "SELECT 1 FROM tree_nodes WHERE collection = ?1 LIMIT 1",
                params![collection],
                |_| Ok(()),
            )
            .optional()?
            .is_some()),
        [collection, key] => Ok(conn
            .query_row(
                "SELECT 1 FROM tree_nodes WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |_| Ok(()),
            )
            .optional()?
            .is_some()),
        [collection, key, rest @ ..] => Ok(load_record(conn, collection, key)?
            .is_some_and(|record| get_at(&record, rest).is_some())),
    }
}

/// Update in place, insert only when the row is new, so the insert log only
/// records real insertions.
fn upsert_record(conn: &Connection, collection: &str, key: &str, value: &Value) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    let now = Utc::now().timestamp();
    let updated = conn.execute(
        "UPDATE tree_nodes SET value = ?3, updated_at = ?4 WHERE collection = ?1 AND key = ?2",
        params![collection, key, raw, now],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO tree_nodes (collection, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![collection, key, raw, now],
        )?;
    }
    Ok(())
}

fn delete_record(conn: &Connection, collection: &str, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM tree_nodes WHERE collection = ?1 AND key = ?2",
        params![collection, key],
    )?;
    Ok(())
}

/// Make the rows under `collection` (every row when `None`) exactly `rows`.
fn replace_rows(
    conn: &Connection,
    collection: Option<&str>,
    rows: Vec<(String, String, Value)>,
) -> Result<()> {
    let keep: HashSet<(&str, &str)> = rows
        .iter()
        .map(|(collection, key, _)| (collection.as_str(), key.as_str()))
        .collect();
    let existing = {
        let mut stmt = conn.prepare(
            "SELECT collection, key FROM tree_nodes WHERE ?1 IS NULL OR collection = ?1",
        )?;
        let existing = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        existing
    };
    for (stale_collection, stale_key) in &existing {
        if !keep.contains(&(stale_collection.as_str(), stale_key.as_str())) {
            delete_record(conn, stale_collection, stale_key)?;
        }
    }
    for (collection, key, record) in &rows {
        upsert_record(conn, collection, key, record)?;
    }
    Ok(())
}

/// Keyed children of a node that has to hold records.
fn keyed_children(path: &TreePath, node: &Value) -> Result<Vec<(String, Value)>, StoreError> {
    if !matches!(node, Value::Object(_) | Value::Array(_)) {
        return Err(StoreError::InvalidValue {
            path: path.to_string(),
            reason: "only keyed records can be stored at this depth",
        });
    }
    let children = children_of(node);
    if children.iter().any(|(key, _)| !is_valid_key(key)) {
        return Err(StoreError::InvalidValue {
            path: path.to_string(),
            reason: "contains a key that is not a valid path segment",
        });
    }
    Ok(children)
}

fn write_at(conn: &Connection, path: &TreePath, value: Option<Value>) -> Result<(), StoreError> {
    let io = |e: anyhow::Error| StoreError::write(path, e);
    match path.segments() {
        [] => {
            let mut rows = Vec::new();
            if let Some(root) = value {
                for (collection, node) in keyed_children(path, &root)? {
                    let collection_path = path.child(&collection);
                    for (key, record) in keyed_children(&collection_path, &node)? {
                        rows.push((collection.clone(), key, record));
                    }
                }
            }
            replace_rows(conn, None, rows).map_err(io)?;
        }
        [collection] => {
            let rows = match value {
                Some(node) => keyed_children(path, &node)?
                    .into_iter()
                    .map(|(key, record)| (collection.clone(), key, record))
                    .collect(),
                None => Vec::new(),
            };
            replace_rows(conn, Some(collection.as_str()), rows).map_err(io)?;
        }
        [collection, key] => match value {
            Some(record) => upsert_record(conn, collection, key, &record).map_err(io)?,
            None => delete_record(conn, collection, key).map_err(io)?,
        },
        [collection, key, rest @ ..] => {
            let mut record = load_record(conn, collection, key)
                .map_err(io)?
                .unwrap_or(Value::Null);
            set_at(&mut record, rest, value);
            match normalize(record) {
                Some(record) => upsert_record(conn, collection, key, &record).map_err(io)?,
                None => delete_record(conn, collection, key).map_err(io)?,
            }
        }
    }
    Ok(())
}

fn describe(update: &MultiPathUpdate) -> String {
    match update.iter().next() {
        Some((first, _)) if update.len() > 1 => {
            format!("{} (+{} more)", first, update.len() - 1)
        }
        Some((first, _)) => first.to_string(),
        None => "/".to_string(),
    }
}

fn last_logged_insert(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM tree_inserts", [], |row| {
        row.get(0)
    })?)
}

/// Records inserted after `cursor` that still exist, and the new cursor.
fn poll_inserts(conn: &Connection, cursor: i64) -> Result<(i64, Vec<NodeCreated>)> {
    let mut stmt = conn.prepare(
        "SELECT l.seq, l.collection, l.key, n.value
         FROM tree_inserts l
         LEFT JOIN tree_nodes n ON n.collection = l.collection AND n.key = l.key
         WHERE l.seq > ?1
         ORDER BY l.seq",
    )?;
    let rows = stmt
        .query_map(params![cursor], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut next = cursor;
    let mut latest: BTreeMap<(String, String), (i64, String)> = BTreeMap::new();
    for (seq, collection, key, raw) in rows {
        next = next.max(seq);
        if let Some(raw) = raw {
            latest.insert((collection, key), (seq, raw));
        }
    }

    let mut ordered: Vec<_> = latest.into_iter().collect();
    ordered.sort_by_key(|(_, (seq, _))| *seq);
    let mut created = Vec::with_capacity(ordered.len());
    for ((collection, key), (_, raw)) in ordered {
        if !is_valid_key(&collection) || !is_valid_key(&key) {
            warn!("Skipping inserted row with unaddressable key {}/{}", collection, key);
            continue;
        }
        match parse_record(&raw) {
            Ok(value) => created.push(NodeCreated {
                path: TreePath::root().child(&collection).child(&key),
                value,
            }),
            Err(e) => warn!("Skipping unreadable inserted row {}/{}: {}", collection, key, e),
        }
    }
    Ok((next, created))
}

fn prune_insert_log(conn: &Connection) -> Result<usize> {
    // The newest entry stays so `seq` keeps growing.
    Ok(conn.execute(
        "DELETE FROM tree_inserts
         WHERE created_at < ?1 AND seq < (SELECT MAX(seq) FROM tree_inserts)",
        params![Utc::now().timestamp() - INSERT_LOG_RETENTION_SECS],
    )?)
}

async fn watch_inserts(
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<NodeCreated>,
    mut cursor: i64,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let shared = Arc::clone(&conn);
        let polled = tokio::task::spawn_blocking(move || {
            let conn = lock(&shared);
            let polled = poll_inserts(&conn, cursor)?;
            let pruned = prune_insert_log(&conn)?;
            if pruned > 0 {
                debug!("Pruned {} insert log entries", pruned);
            }
            Ok::<_, anyhow::Error>(polled)
        })
        .await;
        match polled {
            Ok(Ok((next, created))) => {
                cursor = next;
                for node in created {
                    // No receivers is fine: every feed may be gone.
                    let _ = events.send(node);
                }
            }
            Ok(Err(e)) => warn!("Polling the tree insert log failed: {}", e),
            Err(e) => warn!("Insert log poll task failed: {}", e),
        }
    }
}

#[async_trait]
impl TreeStore for SqliteTreeStore {
    async fn get(&self, path: &TreePath) -> Result<Option<Value>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let target = path.clone();
        tokio::task::spawn_blocking(move || read_at(&lock(&conn), &target))
            .await
            .map_err(|e| StoreError::read(path, e))?
            .map_err(|e| StoreError::read(path, e))
    }

    async fn exists(&self, path: &TreePath) -> Result<bool, StoreError> {
        let conn = Arc::clone(&self.conn);
        let target = path.clone();
        tokio::task::spawn_blocking(move || node_exists(&lock(&conn), &target))
            .await
            .map_err(|e| StoreError::read(path, e))?
            .map_err(|e| StoreError::read(path, e))
    }

    async fn update(&self, update: MultiPathUpdate) -> Result<(), StoreError> {
        update.validate()?;
        if update.is_empty() {
            return Ok(());
        }
        let label = describe(&update);
        let join_label = label.clone();
        let conn = Arc::clone(&self.conn);
        let events = self.events.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn);

            let mut lookup_error = None;
            let created = created_nodes(&update, |path| match node_exists(&conn, path) {
                Ok(exists) => exists,
                Err(e) => {
                    lookup_error.get_or_insert(StoreError::read(path, e));
                    true
                }
            });
            if let Some(e) = lookup_error {
                return Err(e);
            }

            let tx = conn
                .transaction()
                .map_err(|e| StoreError::write(&label, e))?;
            for (path, value) in update.into_entries() {
                write_at(&tx, &path, value)?;
            }
            tx.commit().map_err(|e| StoreError::write(&label, e))?;

            // Whole records and collections come in through the insert log.
            for path in created.into_iter().filter(|path| path.len() > 2) {
                match read_at(&conn, &path) {
                    Ok(Some(value)) => {
                        let _ = events.send(NodeCreated { path, value });
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Committed {} but could not re-read it: {}", path, e),
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::write(&join_label, e))?
    }

    async fn subscribe_child_added(&self, parent: &TreePath) -> Result<ChildFeed, StoreError> {
        let conn = Arc::clone(&self.conn);
        let events = self.events.clone();
        let target = parent.clone();
        let (receiver, existing, cursor) = tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let cursor =
                last_logged_insert(&conn).map_err(|e| StoreError::read(&target, e))?;
            let receiver = events.subscribe();
            let existing = read_at(&conn, &target)
                .map_err(|e| StoreError::read(&target, e))?
                .map(|node| children_of(&node))
                .unwrap_or_default();
            Ok::<_, StoreError>((receiver, existing, cursor))
        })
        .await
        .map_err(|e| StoreError::read(parent, e))??;
        self.ensure_watcher(cursor);

        let shared = Arc::clone(&self.conn);
        let target = parent.clone();
        let relist: Relist = Box::new(move || {
            let conn = Arc::clone(&shared);
            let target = target.clone();
            async move {
                let listed = target.clone();
                tokio::task::spawn_blocking(move || {
                    read_at(&lock(&conn), &listed)
                        .map(|node| node.map(|node| children_of(&node)).unwrap_or_default())
                        .map_err(|e| StoreError::read(&listed, e))
                })
                .await
                .map_err(|e| StoreError::read(&target, e))?
            }
            .boxed()
        });
        Ok(ChildFeed::new(parent.clone(), existing, receiver, relist))
    }
}
