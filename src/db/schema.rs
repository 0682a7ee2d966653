/// Current schema version, tracked in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Schema for the first version of the database.
pub const SCHEMA_V1: &str = r#"
-- Named cache partitions (one per logical cache per generation)
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

-- Cached responses; seq preserves insertion order for eviction
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    cache_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    UNIQUE (cache_name, key_hash),
    FOREIGN KEY (cache_name) REFERENCES cache_partitions(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_order
    ON cache_entries(cache_name, seq);

-- Pending mutating requests awaiting replay
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_name TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_name ON sync_queue(queue_name, id);

-- Engine generations and their lifecycle state
CREATE TABLE IF NOT EXISTS generations (
    version INTEGER PRIMARY KEY,
    state TEXT NOT NULL,
    partitions TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;
