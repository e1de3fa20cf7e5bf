//! SQLite persistence for imported content.
//!
//! Pages, page history, attached files, redirects, tags and map data all
//! land here. Writes are idempotent so a re-run converges instead of
//! duplicating rows.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

const STORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pages (
    slug TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    content TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS page_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    revision_id INTEGER NOT NULL,
    revision_timestamp TEXT NOT NULL,
    change_type TEXT NOT NULL,
    user_name TEXT,
    comment TEXT,
    UNIQUE (slug, revision_id)
);
CREATE INDEX IF NOT EXISTS idx_page_versions_slug ON page_versions(slug);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_slug TEXT NOT NULL,
    filename TEXT NOT NULL,
    content BLOB NOT NULL,
    sha256 TEXT NOT NULL,
    UNIQUE (page_slug, filename)
);

CREATE TABLE IF NOT EXISTS redirects (
    source_slug TEXT PRIMARY KEY,
    source_name TEXT NOT NULL,
    destination_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS page_tags (
    page_slug TEXT NOT NULL,
    tag_id INTEGER NOT NULL,
    PRIMARY KEY (page_slug, tag_id),
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS mapdata (
    page_slug TEXT PRIMARY KEY,
    page_name TEXT NOT NULL,
    geojson TEXT NOT NULL
);
"#;

/// What happened to a page write when a slug collision is possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Created,
    Replaced,
    KeptExisting,
}

/// How a historical rendition changed the page: its oldest revision
/// created it, every later one updated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Updated,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Updated => "updated",
        }
    }
}

pub struct SqliteStore {
    connection: Connection,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign_keys pragma")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        connection
            .execute_batch(STORE_SCHEMA_SQL)
            .context("failed to initialize store schema")?;
        Ok(Self { connection })
    }

    pub fn clear_all(&mut self) -> Result<()> {
        self.connection
            .execute_batch(
                "DELETE FROM page_tags;
                 DELETE FROM tags;
                 DELETE FROM mapdata;
                 DELETE FROM redirects;
                 DELETE FROM files;
                 DELETE FROM page_versions;
                 DELETE FROM pages;",
            )
            .context("failed to clear store tables")
    }

    /// Writes a page, resolving slug collisions in favor of the longer
    /// content. Distinct titles can share a slug (namespace folding), and
    /// the shorter rendition is usually the stub.
    pub fn save_page(&mut self, name: &str, content: &str) -> Result<PageOutcome> {
        let slug = slugify(name);
        let existing: Option<(String, i64)> = self
            .connection
            .query_row(
                "SELECT name, LENGTH(content) FROM pages WHERE slug = ?1",
                params![slug],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to look up page slug {slug}"))?;

        match existing {
            None => {
                self.connection
                    .execute(
                        "INSERT INTO pages (slug, name, content) VALUES (?1, ?2, ?3)",
                        params![slug, name, content],
                    )
                    .with_context(|| format!("failed to insert page {name}"))?;
                Ok(PageOutcome::Created)
            }
            Some((existing_name, existing_len)) => {
                if (content.len() as i64) > existing_len {
                    info!("replacing {existing_name} with longer rendition {name} (slug {slug})");
                    self.connection
                        .execute(
                            "UPDATE pages SET name = ?2, content = ?3 WHERE slug = ?1",
                            params![slug, name, content],
                        )
                        .with_context(|| format!("failed to replace page {name}"))?;
                    Ok(PageOutcome::Replaced)
                } else {
                    info!("keeping {existing_name} over shorter rendition {name} (slug {slug})");
                    Ok(PageOutcome::KeptExisting)
                }
            }
        }
    }

    pub fn page_exists(&self, name: &str) -> Result<bool> {
        let slug = slugify(name);
        let exists: i64 = self
            .connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM pages WHERE slug = ?1)",
                params![slug],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to check page slug {slug}"))?;
        Ok(exists == 1)
    }

    pub fn page_content(&self, name: &str) -> Result<Option<String>> {
        let slug = slugify(name);
        self.connection
            .query_row(
                "SELECT content FROM pages WHERE slug = ?1",
                params![slug],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read page slug {slug}"))
    }

    /// Inserts one historical rendition. Returns false when the revision
    /// was already stored.
    pub fn save_page_version(
        &mut self,
        name: &str,
        content: &str,
        revision_id: i64,
        timestamp: &str,
        change_type: ChangeType,
        user: Option<&str>,
        comment: Option<&str>,
    ) -> Result<bool> {
        let slug = slugify(name);
        let inserted = self
            .connection
            .execute(
                "INSERT OR IGNORE INTO page_versions
                     (slug, name, content, revision_id, revision_timestamp, change_type, user_name, comment)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![slug, name, content, revision_id, timestamp, change_type.as_str(), user, comment],
            )
            .with_context(|| format!("failed to insert revision {revision_id} of {name}"))?;
        Ok(inserted > 0)
    }

    pub fn page_version_change_type(&self, name: &str, revision_id: i64) -> Result<Option<String>> {
        let slug = slugify(name);
        self.connection
            .query_row(
                "SELECT change_type FROM page_versions WHERE slug = ?1 AND revision_id = ?2",
                params![slug, revision_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read revision {revision_id} of {name}"))
    }

    pub fn file_exists(&self, page_name: &str, filename: &str) -> Result<bool> {
        let slug = slugify(page_name);
        let exists: i64 = self
            .connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM files WHERE page_slug = ?1 AND filename = ?2)",
                params![slug, filename],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to check file {filename} on {slug}"))?;
        Ok(exists == 1)
    }

    /// Attaches a binary to a page. A concurrent duplicate insert is
    /// dropped and logged rather than failing the page import.
    pub fn attach_file(&mut self, page_name: &str, filename: &str, content: &[u8]) -> Result<()> {
        let slug = slugify(page_name);
        let digest = hex_digest(content);
        let inserted = self
            .connection
            .execute(
                "INSERT OR IGNORE INTO files (page_slug, filename, content, sha256)
                 VALUES (?1, ?2, ?3, ?4)",
                params![slug, filename, content, digest],
            )
            .with_context(|| format!("failed to attach {filename} to {slug}"))?;
        if inserted == 0 {
            warn!("file {filename} already attached to {slug}, dropping duplicate write");
        }
        Ok(())
    }

    pub fn save_redirect(&mut self, source_name: &str, destination_name: &str) -> Result<()> {
        let slug = slugify(source_name);
        self.connection
            .execute(
                "INSERT OR REPLACE INTO redirects (source_slug, source_name, destination_name)
                 VALUES (?1, ?2, ?3)",
                params![slug, source_name, destination_name],
            )
            .with_context(|| format!("failed to save redirect {source_name}"))?;
        Ok(())
    }

    pub fn add_tags(&mut self, page_name: &str, tags: &[String]) -> Result<()> {
        let slug = slugify(page_name);
        for tag in tags {
            let normalized = tag.trim().to_lowercase();
            if normalized.is_empty() {
                continue;
            }
            self.connection
                .execute(
                    "INSERT OR IGNORE INTO tags (name) VALUES (?1)",
                    params![normalized],
                )
                .with_context(|| format!("failed to insert tag {normalized}"))?;
            self.connection
                .execute(
                    "INSERT OR IGNORE INTO page_tags (page_slug, tag_id)
                     SELECT ?1, id FROM tags WHERE name = ?2",
                    params![slug, normalized],
                )
                .with_context(|| format!("failed to tag {slug} with {normalized}"))?;
        }
        Ok(())
    }

    pub fn set_mapdata(&mut self, page_name: &str, geojson: &str) -> Result<()> {
        let slug = slugify(page_name);
        self.connection
            .execute(
                "INSERT OR REPLACE INTO mapdata (page_slug, page_name, geojson)
                 VALUES (?1, ?2, ?3)",
                params![slug, page_name, geojson],
            )
            .with_context(|| format!("failed to save map data for {page_name}"))?;
        Ok(())
    }

    pub fn page_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM pages")
    }

    pub fn file_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM files")
    }

    pub fn redirect_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM redirects")
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row(sql, [], |row| row.get(0))
            .with_context(|| format!("failed query: {sql}"))?;
        usize::try_from(count).context("count does not fit into usize")
    }
}

/// One store handle shared across pool workers. SQLite serializes writers
/// anyway; the mutex keeps the read-check-write sequences atomic.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<SqliteStore>>,
}

impl SharedStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(SqliteStore::open(db_path)?)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SqliteStore> {
        self.inner.lock().expect("store lock poisoned")
    }

    pub fn clear_all(&self) -> Result<()> {
        self.lock().clear_all()
    }

    pub fn save_page(&self, name: &str, content: &str) -> Result<PageOutcome> {
        self.lock().save_page(name, content)
    }

    pub fn page_exists(&self, name: &str) -> Result<bool> {
        self.lock().page_exists(name)
    }

    pub fn page_content(&self, name: &str) -> Result<Option<String>> {
        self.lock().page_content(name)
    }

    pub fn save_page_version(
        &self,
        name: &str,
        content: &str,
        revision_id: i64,
        timestamp: &str,
        change_type: ChangeType,
        user: Option<&str>,
        comment: Option<&str>,
    ) -> Result<bool> {
        self.lock()
            .save_page_version(name, content, revision_id, timestamp, change_type, user, comment)
    }

    pub fn page_version_change_type(&self, name: &str, revision_id: i64) -> Result<Option<String>> {
        self.lock().page_version_change_type(name, revision_id)
    }

    pub fn file_exists(&self, page_name: &str, filename: &str) -> Result<bool> {
        self.lock().file_exists(page_name, filename)
    }

    pub fn attach_file(&self, page_name: &str, filename: &str, content: &[u8]) -> Result<()> {
        self.lock().attach_file(page_name, filename, content)
    }

    pub fn save_redirect(&self, source_name: &str, destination_name: &str) -> Result<()> {
        self.lock().save_redirect(source_name, destination_name)
    }

    pub fn add_tags(&self, page_name: &str, tags: &[String]) -> Result<()> {
        self.lock().add_tags(page_name, tags)
    }

    pub fn set_mapdata(&self, page_name: &str, geojson: &str) -> Result<()> {
        self.lock().set_mapdata(page_name, geojson)
    }

    pub fn page_count(&self) -> Result<usize> {
        self.lock().page_count()
    }

    pub fn file_count(&self) -> Result<usize> {
        self.lock().file_count()
    }

    pub fn redirect_count(&self) -> Result<usize> {
        self.lock().redirect_count()
    }
}

/// Canonical page slug: lowercased, whitespace folded to underscores,
/// path separators kept so subpages nest.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_separator = false;
    for ch in name.trim().chars() {
        if ch.is_whitespace() || ch == '_' {
            if !last_was_separator {
                slug.push('_');
                last_was_separator = true;
            }
            continue;
        }
        last_was_separator = false;
        if ch.is_alphanumeric() || matches!(ch, '/' | '-' | '.' | '~' | '\'') {
            for lowered in ch.to_lowercase() {
                slug.push(lowered);
            }
        }
    }
    slug.trim_matches('_').to_string()
}

fn hex_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
