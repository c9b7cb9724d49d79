use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::article::{Article, ScrapedArticle, UngroupedArticle};
use crate::models::cve::{CveInfo, CveMention};
use crate::models::entity::{
    ArticleEntity, CategoryEntity, Entity, EntityCoOccurrence, TrendingEntity,
};
use crate::models::group::{Group, GroupWithMembers};
use crate::models::trend::{Trend, TrendArticle, TrendEntity};
use crate::timefmt;

/// Typed store failure. Callers treat `Busy` as retryable; everything else
/// rolls back and surfaces.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database is busy")]
    Busy,
    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, _) = &e {
            if matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return StoreError::Busy;
            }
        }
        StoreError::Sqlite(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Owns the SQLite database. Single writer, many readers; every multi-row
/// write goes through `with_tx` so callers share one transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS articles (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                link           TEXT NOT NULL UNIQUE,
                title          TEXT NOT NULL,
                content        TEXT NOT NULL,
                published_date TEXT NOT NULL,
                source         TEXT NOT NULL,
                processed_date TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_articles_published ON articles(published_date DESC);

            CREATE TABLE IF NOT EXISTS article_groups (
                group_id          INTEGER PRIMARY KEY AUTOINCREMENT,
                main_topic        TEXT NOT NULL,
                sub_topic         TEXT NOT NULL DEFAULT '',
                group_label       TEXT NOT NULL,
                description       TEXT NOT NULL DEFAULT '',
                consistency_score REAL NOT NULL DEFAULT 1.0,
                created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now')),
                updated_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_groups_topic ON article_groups(main_topic);

            CREATE TABLE IF NOT EXISTS article_group_memberships (
                article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                group_id   INTEGER NOT NULL REFERENCES article_groups(group_id) ON DELETE CASCADE,
                added_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now')),
                PRIMARY KEY (article_id, group_id)
            );
            CREATE INDEX IF NOT EXISTS idx_memberships_group ON article_group_memberships(group_id);

            CREATE TABLE IF NOT EXISTS entity_profiles (
                entity_id     INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_name   TEXT NOT NULL,
                entity_type   TEXT NOT NULL,
                description   TEXT,
                first_seen    TEXT,
                last_seen     TEXT,
                mention_count INTEGER NOT NULL DEFAULT 1,
                created_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now')),
                updated_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now')),
                UNIQUE(entity_name, entity_type)
            );

            CREATE TABLE IF NOT EXISTS article_entities (
                article_id      INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                entity_id       INTEGER NOT NULL REFERENCES entity_profiles(entity_id) ON DELETE CASCADE,
                relevance_score REAL NOT NULL DEFAULT 1.0,
                context_snippet TEXT,
                PRIMARY KEY (article_id, entity_id)
            );

            CREATE TABLE IF NOT EXISTS group_entities (
                group_id        INTEGER NOT NULL REFERENCES article_groups(group_id) ON DELETE CASCADE,
                entity_id       INTEGER NOT NULL REFERENCES entity_profiles(entity_id) ON DELETE CASCADE,
                relevance_score REAL NOT NULL DEFAULT 1.0,
                PRIMARY KEY (group_id, entity_id)
            );

            CREATE TABLE IF NOT EXISTS article_companies (
                article_id   INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                company_name TEXT NOT NULL,
                PRIMARY KEY (article_id, company_name)
            );

            CREATE TABLE IF NOT EXISTS article_cves (
                article_id     INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                cve_id         TEXT NOT NULL,
                published_date TEXT,
                PRIMARY KEY (article_id, cve_id)
            );

            CREATE TABLE IF NOT EXISTS cve_info (
                cve_id            TEXT PRIMARY KEY,
                base_score        REAL,
                vendor            TEXT,
                affected_products TEXT,
                cve_url           TEXT,
                vendor_link       TEXT,
                solution          TEXT,
                times_mentioned   INTEGER NOT NULL DEFAULT 0,
                raw_json          TEXT,
                created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now')),
                updated_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now'))
            );

            CREATE TABLE IF NOT EXISTS trending_groups (
                trend_id         INTEGER PRIMARY KEY AUTOINCREMENT,
                category         TEXT NOT NULL,
                trend_label      TEXT NOT NULL,
                summary          TEXT NOT NULL,
                importance_score REAL NOT NULL DEFAULT 5.0,
                confidence_score REAL NOT NULL DEFAULT 1.0,
                created_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now')),
                updated_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now'))
            );

            CREATE TABLE IF NOT EXISTS trending_group_memberships (
                article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                trend_id   INTEGER NOT NULL REFERENCES trending_groups(trend_id) ON DELETE CASCADE,
                added_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now')),
                PRIMARY KEY (article_id, trend_id)
            );

            CREATE TABLE IF NOT EXISTS trend_entities (
                trend_id        INTEGER NOT NULL REFERENCES trending_groups(trend_id) ON DELETE CASCADE,
                entity_id       INTEGER NOT NULL REFERENCES entity_profiles(entity_id) ON DELETE CASCADE,
                relevance_score REAL NOT NULL DEFAULT 1.0,
                PRIMARY KEY (trend_id, entity_id)
            );

            CREATE TABLE IF NOT EXISTS exemplar_groups (
                exemplar_id         INTEGER PRIMARY KEY AUTOINCREMENT,
                category            TEXT NOT NULL,
                pattern_name        TEXT NOT NULL,
                pattern_description TEXT,
                success_score       REAL NOT NULL DEFAULT 1.0,
                created_at          TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now'))
            );

            CREATE TABLE IF NOT EXISTS exemplar_articles (
                exemplar_id INTEGER NOT NULL REFERENCES exemplar_groups(exemplar_id) ON DELETE CASCADE,
                article_id  INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                PRIMARY KEY (exemplar_id, article_id)
            );

            CREATE TABLE IF NOT EXISTS article_external_references (
                article_id     INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                original_url   TEXT NOT NULL,
                normalized_url TEXT NOT NULL,
                domain         TEXT NOT NULL,
                reference_type TEXT NOT NULL DEFAULT 'external',
                PRIMARY KEY (article_id, normalized_url)
            );
            CREATE INDEX IF NOT EXISTS idx_references_domain ON article_external_references(domain);

            CREATE TABLE IF NOT EXISTS named_events (
                event_id        INTEGER PRIMARY KEY AUTOINCREMENT,
                event_name      TEXT NOT NULL,
                event_type      TEXT NOT NULL,
                cve_ids         TEXT,
                first_seen_date TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now')),
                last_seen_date  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now')),
                UNIQUE(event_name, event_type)
            );

            CREATE TABLE IF NOT EXISTS article_events (
                article_id      INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                event_id        INTEGER NOT NULL REFERENCES named_events(event_id) ON DELETE CASCADE,
                context_snippet TEXT,
                PRIMARY KEY (article_id, event_id)
            );

            CREATE TABLE IF NOT EXISTS quotes (
                quote_id        INTEGER PRIMARY KEY AUTOINCREMENT,
                quote_text      TEXT NOT NULL,
                quote_hash      TEXT NOT NULL UNIQUE,
                speaker         TEXT,
                first_seen_date TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now'))
            );

            CREATE TABLE IF NOT EXISTS article_quotes (
                article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                quote_id   INTEGER NOT NULL REFERENCES quotes(quote_id) ON DELETE CASCADE,
                PRIMARY KEY (article_id, quote_id)
            );

            CREATE TABLE IF NOT EXISTS article_authors (
                article_id  INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                author_name TEXT NOT NULL,
                PRIMARY KEY (article_id, author_name)
            );
            ",
        )?;
        Ok(())
    }

    /// Run `f` inside a single transaction, retrying once if the database
    /// reports busy.
    pub fn with_tx<T>(&self, mut f: impl FnMut(&Transaction) -> StoreResult<T>) -> StoreResult<T> {
        match self.run_tx(&mut f) {
            Err(StoreError::Busy) => {
                tracing::warn!("store busy, retrying transaction once");
                std::thread::sleep(std::time::Duration::from_millis(50));
                self.run_tx(&mut f)
            }
            other => other,
        }
    }

    fn run_tx<T>(&self, f: &mut impl FnMut(&Transaction) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Article operations ──

    /// Insert a scraped article, deduplicating by link. Returns the new id,
    /// or None if the link was already present.
    pub fn insert_article(&self, article: &ScrapedArticle) -> StoreResult<Option<i64>> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "INSERT OR IGNORE INTO articles (link, title, content, published_date, source) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    article.link,
                    article.title,
                    article.content,
                    article.published_date,
                    article.source
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let id = tx.last_insert_rowid();
            if let Some(author) = &article.author {
                tx.execute(
                    "INSERT OR IGNORE INTO article_authors (article_id, author_name) VALUES (?1, ?2)",
                    params![id, author],
                )?;
            }
            Ok(Some(id))
        })
    }

    pub fn articles_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<Article>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, link, title, content, published_date, source, processed_date \
             FROM articles WHERE id IN ({}) ORDER BY published_date DESC",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                Ok(Article {
                    id: row.get(0)?,
                    link: row.get(1)?,
                    title: row.get(2)?,
                    content: row.get(3)?,
                    published_date: row.get(4)?,
                    source: row.get(5)?,
                    processed_date: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn article_meta(&self, article_id: i64) -> StoreResult<Option<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT published_date, source FROM articles WHERE id = ?1",
                params![article_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Articles with no group membership, newest first.
    pub fn ungrouped_articles(&self) -> StoreResult<Vec<UngroupedArticle>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.title, a.content, a.published_date FROM articles a \
             WHERE NOT EXISTS (SELECT 1 FROM article_group_memberships m WHERE m.article_id = a.id) \
             ORDER BY a.published_date DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UngroupedArticle {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    published_date: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Entity operations ──

    /// Upsert by (name, type): a hit bumps the mention counter, refreshes
    /// last_seen and fills an empty description; a miss inserts. Returns the
    /// entity id either way.
    pub fn insert_or_bump_entity_tx(
        conn: &Connection,
        name: &str,
        entity_type: &str,
        description: Option<&str>,
    ) -> StoreResult<i64> {
        let now = timefmt::now_string();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT entity_id FROM entity_profiles WHERE entity_name = ?1 AND entity_type = ?2",
                params![name, entity_type],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE entity_profiles SET mention_count = mention_count + 1, \
                     last_seen = ?2, updated_at = ?2, description = COALESCE(description, ?3) \
                     WHERE entity_id = ?1",
                    params![id, now, description],
                )?;
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO entity_profiles \
                     (entity_name, entity_type, description, first_seen, last_seen, mention_count) \
                     VALUES (?1, ?2, ?3, ?4, ?4, 1)",
                    params![name, entity_type, description, now],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    pub fn insert_or_bump_entity(
        &self,
        name: &str,
        entity_type: &str,
        description: Option<&str>,
    ) -> StoreResult<i64> {
        self.with_tx(|tx| Self::insert_or_bump_entity_tx(tx, name, entity_type, description))
    }

    pub fn link_entity_to_article_tx(
        conn: &Connection,
        article_id: i64,
        entity_id: i64,
        relevance: f64,
        context: Option<&str>,
    ) -> StoreResult<()> {
        conn.execute(
            "INSERT OR REPLACE INTO article_entities (article_id, entity_id, relevance_score, context_snippet) \
             VALUES (?1, ?2, ?3, ?4)",
            params![article_id, entity_id, relevance, context],
        )?;
        Ok(())
    }

    pub fn link_entity_to_group_tx(
        conn: &Connection,
        group_id: i64,
        entity_id: i64,
        relevance: f64,
    ) -> StoreResult<()> {
        conn.execute(
            "INSERT OR REPLACE INTO group_entities (group_id, entity_id, relevance_score) \
             VALUES (?1, ?2, ?3)",
            params![group_id, entity_id, relevance],
        )?;
        Ok(())
    }

    pub fn link_entity_to_trend_tx(
        conn: &Connection,
        trend_id: i64,
        entity_id: i64,
        relevance: f64,
    ) -> StoreResult<()> {
        conn.execute(
            "INSERT OR REPLACE INTO trend_entities (trend_id, entity_id, relevance_score) \
             VALUES (?1, ?2, ?3)",
            params![trend_id, entity_id, relevance],
        )?;
        Ok(())
    }

    /// Whether an article already has a link to the given entity. The
    /// enricher uses this to keep mention counters idempotent.
    pub fn article_has_entity(&self, article_id: i64, name: &str, entity_type: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM article_entities ae \
                 JOIN entity_profiles e ON ae.entity_id = e.entity_id \
                 WHERE ae.article_id = ?1 AND e.entity_name = ?2 AND e.entity_type = ?3",
                params![article_id, name, entity_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    pub fn primary_entities_for_article(
        &self,
        article_id: i64,
        min_relevance: f64,
    ) -> StoreResult<Vec<ArticleEntity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT e.entity_id, e.entity_name, e.entity_type, ae.relevance_score \
             FROM article_entities ae JOIN entity_profiles e ON ae.entity_id = e.entity_id \
             WHERE ae.article_id = ?1 AND ae.relevance_score >= ?2 \
             ORDER BY ae.relevance_score DESC, e.entity_id ASC",
        )?;
        let rows = stmt
            .query_map(params![article_id, min_relevance], map_article_entity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn entities_by_type_for_article(
        &self,
        article_id: i64,
        entity_type: &str,
    ) -> StoreResult<Vec<ArticleEntity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT e.entity_id, e.entity_name, e.entity_type, ae.relevance_score \
             FROM article_entities ae JOIN entity_profiles e ON ae.entity_id = e.entity_id \
             WHERE ae.article_id = ?1 AND e.entity_type = ?2 \
             ORDER BY ae.relevance_score DESC, e.entity_id ASC",
        )?;
        let rows = stmt
            .query_map(params![article_id, entity_type], map_article_entity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn entities_for_article(&self, article_id: i64) -> StoreResult<Vec<ArticleEntity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT e.entity_id, e.entity_name, e.entity_type, ae.relevance_score \
             FROM article_entities ae JOIN entity_profiles e ON ae.entity_id = e.entity_id \
             WHERE ae.article_id = ?1 ORDER BY ae.relevance_score DESC, e.entity_id ASC",
        )?;
        let rows = stmt
            .query_map(params![article_id], map_article_entity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Full profiles for a set of entity ids, in id order.
    pub fn entity_details(&self, ids: &[i64]) -> StoreResult<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT entity_id, entity_name, entity_type, description, first_seen, last_seen, \
             mention_count FROM entity_profiles \
             WHERE entity_id IN ({}) ORDER BY entity_id ASC",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                Ok(Entity {
                    entity_id: row.get(0)?,
                    entity_name: row.get(1)?,
                    entity_type: row.get(2)?,
                    description: row.get(3)?,
                    first_seen: row.get(4)?,
                    last_seen: row.get(5)?,
                    mention_count: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn trending_entities(&self, hours: i64, limit: i64) -> StoreResult<Vec<TrendingEntity>> {
        let cutoff = timefmt::hours_ago_string(hours);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT e.entity_id, e.entity_name, e.entity_type, e.description, \
             COUNT(DISTINCT ae.article_id) AS recent_mentions \
             FROM entity_profiles e \
             JOIN article_entities ae ON e.entity_id = ae.entity_id \
             JOIN articles a ON ae.article_id = a.id \
             WHERE a.published_date >= ?1 \
             GROUP BY e.entity_id \
             ORDER BY recent_mentions DESC, e.entity_id ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit], |row| {
                Ok(TrendingEntity {
                    entity_id: row.get(0)?,
                    entity_name: row.get(1)?,
                    entity_type: row.get(2)?,
                    description: row.get(3)?,
                    recent_mentions: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn category_entities(&self, category: &str, limit: i64) -> StoreResult<Vec<CategoryEntity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT e.entity_id, e.entity_name, e.entity_type, e.description, e.mention_count, \
             COUNT(DISTINCT ae.article_id) AS article_count \
             FROM entity_profiles e \
             JOIN article_entities ae ON e.entity_id = ae.entity_id \
             JOIN article_group_memberships m ON ae.article_id = m.article_id \
             JOIN article_groups g ON m.group_id = g.group_id \
             WHERE g.main_topic = ?1 \
             GROUP BY e.entity_id \
             ORDER BY article_count DESC, e.mention_count DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![category, limit], |row| {
                Ok(CategoryEntity {
                    entity_id: row.get(0)?,
                    entity_name: row.get(1)?,
                    entity_type: row.get(2)?,
                    description: row.get(3)?,
                    mention_count: row.get(4)?,
                    article_count: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn entity_co_occurrences(
        &self,
        category: &str,
        hours: i64,
        limit: i64,
    ) -> StoreResult<Vec<EntityCoOccurrence>> {
        let cutoff = timefmt::hours_ago_string(hours);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT e1.entity_name, e2.entity_name, COUNT(DISTINCT a.id) AS co_count \
             FROM articles a \
             JOIN article_group_memberships m ON a.id = m.article_id \
             JOIN article_groups g ON m.group_id = g.group_id \
             JOIN article_entities ae1 ON a.id = ae1.article_id \
             JOIN entity_profiles e1 ON ae1.entity_id = e1.entity_id \
             JOIN article_entities ae2 ON a.id = ae2.article_id \
             JOIN entity_profiles e2 ON ae2.entity_id = e2.entity_id \
             WHERE g.main_topic = ?1 AND a.published_date >= ?2 \
               AND e1.entity_id < e2.entity_id \
             GROUP BY e1.entity_id, e2.entity_id \
             HAVING co_count > 1 \
             ORDER BY co_count DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![category, cutoff, limit], |row| {
                Ok(EntityCoOccurrence {
                    entity1_name: row.get(0)?,
                    entity2_name: row.get(1)?,
                    co_occurrence_count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Articles still missing entity extraction, newest first, as
    /// (id, title + content).
    pub fn articles_missing_entities(&self) -> StoreResult<Vec<(i64, String)>> {
        self.articles_missing_from("article_entities")
    }

    pub fn articles_missing_companies(&self) -> StoreResult<Vec<(i64, String)>> {
        self.articles_missing_from("article_companies")
    }

    fn articles_missing_from(&self, link_table: &str) -> StoreResult<Vec<(i64, String)>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT a.id, a.title || ' - ' || a.content FROM articles a \
             WHERE NOT EXISTS (SELECT 1 FROM {link_table} t WHERE t.article_id = a.id) \
             ORDER BY a.published_date DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// (id, published_date, content) for every article; the CVE mention
    /// scan re-runs over the full corpus since inserts are idempotent.
    pub fn articles_for_cve_scan(&self) -> StoreResult<Vec<(i64, String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, published_date, content FROM articles ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Company operations ──

    pub fn insert_article_company_tx(
        conn: &Connection,
        article_id: i64,
        company: &str,
    ) -> StoreResult<bool> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO article_companies (article_id, company_name) VALUES (?1, ?2)",
            params![article_id, company],
        )?;
        Ok(changed > 0)
    }

    pub fn companies_for_article(&self, article_id: i64) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT company_name FROM article_companies WHERE article_id = ?1 ORDER BY company_name ASC",
        )?;
        let rows = stmt
            .query_map(params![article_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── CVE operations ──

    pub fn insert_article_cve(
        &self,
        article_id: i64,
        cve_id: &str,
        published_date: Option<&str>,
    ) -> StoreResult<bool> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "INSERT OR IGNORE INTO article_cves (article_id, cve_id, published_date) \
                 VALUES (?1, ?2, ?3)",
                params![article_id, cve_id, published_date],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn cves_for_article(&self, article_id: i64) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT cve_id FROM article_cves WHERE article_id = ?1 ORDER BY cve_id ASC")?;
        let rows = stmt
            .query_map(params![article_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Distinct mentioned CVE ids with their mention counts.
    pub fn cve_mention_counts(&self) -> StoreResult<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT cve_id, COUNT(*) FROM article_cves GROUP BY cve_id ORDER BY cve_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn cve_info_updated_at(&self, cve_id: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT updated_at FROM cve_info WHERE cve_id = ?1",
                params![cve_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_cve_info(
        &self,
        cve_id: &str,
        base_score: Option<f64>,
        vendor: &str,
        affected_products: &str,
        cve_url: &str,
        vendor_link: &str,
        solution: &str,
        times_mentioned: i64,
        raw_json: &str,
    ) -> StoreResult<()> {
        let now = timefmt::now_string();
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO cve_info (cve_id, base_score, vendor, affected_products, cve_url, \
                 vendor_link, solution, times_mentioned, raw_json, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(cve_id) DO UPDATE SET \
                 base_score=excluded.base_score, vendor=excluded.vendor, \
                 affected_products=excluded.affected_products, cve_url=excluded.cve_url, \
                 vendor_link=excluded.vendor_link, solution=excluded.solution, \
                 times_mentioned=excluded.times_mentioned, raw_json=excluded.raw_json, \
                 updated_at=excluded.updated_at",
                params![
                    cve_id,
                    base_score,
                    vendor,
                    affected_products,
                    cve_url,
                    vendor_link,
                    solution,
                    times_mentioned,
                    raw_json,
                    now
                ],
            )?;
            Ok(())
        })
    }

    /// CVE mentions joined with their articles, optionally bounded to the
    /// last N hours by article publication date.
    pub fn cve_mentions(&self, hours: Option<i64>) -> StoreResult<Vec<CveMention>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = "SELECT ac.cve_id, ac.article_id, a.link, a.source, a.published_date \
                       FROM article_cves ac JOIN articles a ON ac.article_id = a.id"
            .to_string();
        let cutoff = hours.map(timefmt::hours_ago_string);
        if cutoff.is_some() {
            sql.push_str(" WHERE a.published_date >= ?1");
        }
        sql.push_str(" ORDER BY ac.cve_id ASC, a.published_date ASC");
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(CveMention {
                cve_id: row.get(0)?,
                article_id: row.get(1)?,
                article_url: row.get(2)?,
                source: row.get(3)?,
                published_date: row.get(4)?,
            })
        };
        let rows = match &cutoff {
            Some(c) => stmt.query_map(params![c], map_row)?.collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], map_row)?.collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    pub fn cve_info_all(&self) -> StoreResult<HashMap<String, CveInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT cve_id, base_score, vendor, affected_products, cve_url, vendor_link, \
             solution, times_mentioned, updated_at FROM cve_info",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CveInfo {
                    cve_id: row.get(0)?,
                    base_score: row.get(1)?,
                    vendor: row.get(2)?,
                    affected_products: row.get(3)?,
                    cve_url: row.get(4)?,
                    vendor_link: row.get(5)?,
                    solution: row.get(6)?,
                    times_mentioned: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|c| (c.cve_id.clone(), c)).collect())
    }

    // ── Reference / event / quote / author operations ──

    pub fn insert_external_reference_tx(
        conn: &Connection,
        article_id: i64,
        original_url: &str,
        normalized_url: &str,
        domain: &str,
        reference_type: &str,
    ) -> StoreResult<bool> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO article_external_references \
             (article_id, original_url, normalized_url, domain, reference_type) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![article_id, original_url, normalized_url, domain, reference_type],
        )?;
        Ok(changed > 0)
    }

    pub fn external_references_for_article(
        &self,
        article_id: i64,
    ) -> StoreResult<Vec<(String, String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT normalized_url, domain, reference_type FROM article_external_references \
             WHERE article_id = ?1 ORDER BY normalized_url ASC",
        )?;
        let rows = stmt
            .query_map(params![article_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Upsert a named event by (name, type), refreshing last_seen on a hit.
    pub fn upsert_named_event_tx(
        conn: &Connection,
        event_name: &str,
        event_type: &str,
        cve_ids: Option<&str>,
    ) -> StoreResult<i64> {
        let now = timefmt::now_string();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT event_id FROM named_events WHERE event_name = ?1 AND event_type = ?2",
                params![event_name, event_type],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE named_events SET last_seen_date = ?2, cve_ids = COALESCE(?3, cve_ids) \
                     WHERE event_id = ?1",
                    params![id, now, cve_ids],
                )?;
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO named_events (event_name, event_type, cve_ids) VALUES (?1, ?2, ?3)",
                    params![event_name, event_type, cve_ids],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    pub fn link_article_event_tx(
        conn: &Connection,
        article_id: i64,
        event_id: i64,
        context: Option<&str>,
    ) -> StoreResult<()> {
        conn.execute(
            "INSERT OR IGNORE INTO article_events (article_id, event_id, context_snippet) \
             VALUES (?1, ?2, ?3)",
            params![article_id, event_id, context],
        )?;
        Ok(())
    }

    pub fn named_events_for_article(
        &self,
        article_id: i64,
    ) -> StoreResult<Vec<(i64, String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ne.event_id, ne.event_name, ne.event_type \
             FROM article_events ae JOIN named_events ne ON ae.event_id = ne.event_id \
             WHERE ae.article_id = ?1 ORDER BY ne.event_name ASC",
        )?;
        let rows = stmt
            .query_map(params![article_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert a quote deduplicated by hash, returning the quote id.
    pub fn insert_quote_tx(
        conn: &Connection,
        quote_text: &str,
        quote_hash: &str,
        speaker: Option<&str>,
    ) -> StoreResult<i64> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT quote_id FROM quotes WHERE quote_hash = ?1",
                params![quote_hash],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => Ok(id),
            None => {
                conn.execute(
                    "INSERT INTO quotes (quote_text, quote_hash, speaker) VALUES (?1, ?2, ?3)",
                    params![quote_text, quote_hash, speaker],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    pub fn link_article_quote_tx(conn: &Connection, article_id: i64, quote_id: i64) -> StoreResult<()> {
        conn.execute(
            "INSERT OR IGNORE INTO article_quotes (article_id, quote_id) VALUES (?1, ?2)",
            params![article_id, quote_id],
        )?;
        Ok(())
    }

    pub fn quotes_for_article(&self, article_id: i64) -> StoreResult<Vec<(i64, String, Option<String>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT q.quote_id, q.quote_text, q.speaker \
             FROM article_quotes aq JOIN quotes q ON aq.quote_id = q.quote_id \
             WHERE aq.article_id = ?1 ORDER BY q.quote_id ASC",
        )?;
        let rows = stmt
            .query_map(params![article_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn author_for_article(&self, article_id: i64) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT author_name FROM article_authors WHERE article_id = ?1 LIMIT 1",
                params![article_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    // ── Group operations ──

    pub fn create_group_tx(
        conn: &Connection,
        main_topic: &str,
        sub_topic: &str,
        label: &str,
        description: &str,
        consistency_score: f64,
    ) -> StoreResult<i64> {
        conn.execute(
            "INSERT INTO article_groups (main_topic, sub_topic, group_label, description, consistency_score) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![main_topic, sub_topic, label, description, consistency_score],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Attach an article to a group. Any prior membership is removed first,
    /// so an article is in at most one group at any instant.
    pub fn move_article_to_group_tx(conn: &Connection, article_id: i64, group_id: i64) -> StoreResult<()> {
        conn.execute(
            "DELETE FROM article_group_memberships WHERE article_id = ?1",
            params![article_id],
        )?;
        conn.execute(
            "INSERT INTO article_group_memberships (article_id, group_id) VALUES (?1, ?2)",
            params![article_id, group_id],
        )?;
        Ok(())
    }

    pub fn move_article_to_group(&self, article_id: i64, group_id: i64) -> StoreResult<()> {
        self.with_tx(|tx| Self::move_article_to_group_tx(tx, article_id, group_id))
    }

    pub fn delete_group(&self, group_id: i64) -> StoreResult<bool> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "DELETE FROM article_groups WHERE group_id = ?1",
                params![group_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Drop groups that lost all members (article deletions cascade through
    /// memberships but leave the group row behind).
    pub fn delete_empty_groups(&self) -> StoreResult<usize> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "DELETE FROM article_groups WHERE group_id NOT IN \
                 (SELECT DISTINCT group_id FROM article_group_memberships)",
                [],
            )?;
            Ok(changed)
        })
    }

    pub fn update_group_label_tx(
        conn: &Connection,
        group_id: i64,
        label: &str,
        description: &str,
    ) -> StoreResult<()> {
        conn.execute(
            "UPDATE article_groups SET group_label = ?2, description = ?3, \
             updated_at = strftime('%Y-%m-%d %H:%M:%S','now') WHERE group_id = ?1",
            params![group_id, label, description],
        )?;
        Ok(())
    }

    pub fn update_group_consistency(&self, group_id: i64, score: f64) -> StoreResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE article_groups SET consistency_score = ?2, \
                 updated_at = strftime('%Y-%m-%d %H:%M:%S','now') WHERE group_id = ?1",
                params![group_id, score],
            )?;
            Ok(())
        })
    }

    pub fn merge_memberships_tx(conn: &Connection, from_group: i64, to_group: i64) -> StoreResult<()> {
        conn.execute(
            "INSERT OR IGNORE INTO article_group_memberships (article_id, group_id) \
             SELECT article_id, ?2 FROM article_group_memberships WHERE group_id = ?1",
            params![from_group, to_group],
        )?;
        Ok(())
    }

    /// Entities linked directly to a group, highest relevance first.
    pub fn entities_for_group(&self, group_id: i64) -> StoreResult<Vec<ArticleEntity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT e.entity_id, e.entity_name, e.entity_type, ge.relevance_score \
             FROM group_entities ge JOIN entity_profiles e ON ge.entity_id = e.entity_id \
             WHERE ge.group_id = ?1 ORDER BY ge.relevance_score DESC, e.entity_id ASC",
        )?;
        let rows = stmt
            .query_map(params![group_id], map_article_entity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_group(&self, group_id: i64) -> StoreResult<Option<Group>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT group_id, main_topic, sub_topic, group_label, description, \
                 consistency_score, created_at, updated_at FROM article_groups WHERE group_id = ?1",
                params![group_id],
                map_group,
            )
            .optional()?;
        Ok(row)
    }

    /// All groups that currently have at least one member, with member ids.
    pub fn groups_with_members(&self) -> StoreResult<Vec<GroupWithMembers>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT g.group_id, g.main_topic, g.sub_topic, g.group_label, g.description, \
             g.consistency_score, g.created_at, g.updated_at FROM article_groups g \
             WHERE EXISTS (SELECT 1 FROM article_group_memberships m WHERE m.group_id = g.group_id) \
             ORDER BY g.group_id ASC",
        )?;
        let groups = stmt
            .query_map([], map_group)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut member_stmt = conn.prepare(
            "SELECT article_id FROM article_group_memberships WHERE group_id = ?1 ORDER BY article_id ASC",
        )?;
        let mut out = Vec::with_capacity(groups.len());
        for group in groups {
            let article_ids = member_stmt
                .query_map(params![group.group_id], |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            out.push(GroupWithMembers { group, article_ids });
        }
        Ok(out)
    }

    pub fn groups_for_category(&self, category: &str) -> StoreResult<Vec<Group>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT group_id, main_topic, sub_topic, group_label, description, \
             consistency_score, created_at, updated_at FROM article_groups \
             WHERE main_topic = ?1 ORDER BY group_id ASC",
        )?;
        let rows = stmt
            .query_map(params![category], map_group)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Member articles of a group, newest first, optionally bounded to the
    /// last N hours.
    pub fn articles_for_group(&self, group_id: i64, hours: Option<i64>) -> StoreResult<Vec<Article>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = "SELECT a.id, a.link, a.title, a.content, a.published_date, a.source, a.processed_date \
                       FROM articles a JOIN article_group_memberships m ON a.id = m.article_id \
                       WHERE m.group_id = ?1"
            .to_string();
        let cutoff = hours.map(timefmt::hours_ago_string);
        if cutoff.is_some() {
            sql.push_str(" AND a.published_date >= ?2");
        }
        sql.push_str(" ORDER BY a.published_date DESC");
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(Article {
                id: row.get(0)?,
                link: row.get(1)?,
                title: row.get(2)?,
                content: row.get(3)?,
                published_date: row.get(4)?,
                source: row.get(5)?,
                processed_date: row.get(6)?,
            })
        };
        let rows = match &cutoff {
            Some(c) => stmt
                .query_map(params![group_id, c], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![group_id], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    /// Articles of a category published within the window, joined through
    /// group memberships. Feeds trend synthesis.
    pub fn articles_for_category_since(
        &self,
        category: &str,
        hours: i64,
    ) -> StoreResult<Vec<UngroupedArticle>> {
        let cutoff = timefmt::hours_ago_string(hours);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.title, a.content, a.published_date FROM articles a \
             JOIN article_group_memberships m ON a.id = m.article_id \
             JOIN article_groups g ON m.group_id = g.group_id \
             WHERE g.main_topic = ?1 AND a.published_date >= ?2 \
             ORDER BY a.published_date DESC",
        )?;
        let rows = stmt
            .query_map(params![category, cutoff], |row| {
                Ok(UngroupedArticle {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    published_date: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Recent high-consistency groups of a category, used as prompt context.
    pub fn recent_consistent_groups(
        &self,
        category: &str,
        days: i64,
        limit: i64,
    ) -> StoreResult<Vec<(Group, i64)>> {
        let cutoff = timefmt::hours_ago_string(days * 24);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT g.group_id, g.main_topic, g.sub_topic, g.group_label, g.description, \
             g.consistency_score, g.created_at, g.updated_at, COUNT(m.article_id) AS article_count \
             FROM article_groups g \
             JOIN article_group_memberships m ON g.group_id = m.group_id \
             WHERE g.main_topic = ?1 AND g.created_at >= ?2 AND g.consistency_score >= 0.7 \
             GROUP BY g.group_id \
             ORDER BY g.consistency_score DESC, article_count DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![category, cutoff, limit], |row| {
                Ok((map_group(row)?, row.get(8)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Popular groups with recent articles whose labels are not already
    /// trend labels. Feeds the minimum-trend floor.
    pub fn popular_groups_not_trending(
        &self,
        hours: i64,
        limit: i64,
    ) -> StoreResult<Vec<(i64, String, String, i64)>> {
        let cutoff = timefmt::hours_ago_string(hours);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT g.group_id, g.main_topic, g.group_label, COUNT(m.article_id) AS article_count \
             FROM article_groups g \
             JOIN article_group_memberships m ON g.group_id = m.group_id \
             JOIN articles a ON m.article_id = a.id \
             WHERE a.published_date >= ?1 \
               AND NOT EXISTS (SELECT 1 FROM trending_groups t WHERE t.trend_label = g.group_label) \
             GROUP BY g.group_id \
             ORDER BY article_count DESC, g.created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recent_article_ids_for_group(&self, group_id: i64, limit: i64) -> StoreResult<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id FROM articles a JOIN article_group_memberships m ON a.id = m.article_id \
             WHERE m.group_id = ?1 ORDER BY a.published_date DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![group_id, limit], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most frequently linked entities across a set of articles.
    pub fn top_entities_for_articles(
        &self,
        article_ids: &[i64],
        limit: i64,
    ) -> StoreResult<Vec<(i64, String, String)>> {
        if article_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT e.entity_id, e.entity_name, e.entity_type \
             FROM article_entities ae JOIN entity_profiles e ON ae.entity_id = e.entity_id \
             WHERE ae.article_id IN ({}) \
             GROUP BY e.entity_id ORDER BY COUNT(*) DESC, e.entity_id ASC LIMIT {limit}",
            placeholders(article_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(article_ids.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Trend operations ──

    pub fn insert_trend_tx(
        conn: &Connection,
        category: &str,
        label: &str,
        summary: &str,
        importance: f64,
        confidence: f64,
    ) -> StoreResult<i64> {
        conn.execute(
            "INSERT INTO trending_groups (category, trend_label, summary, importance_score, confidence_score) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![category, label, summary, importance, confidence],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Link an article to a trend. Returns false (without error) when the
    /// article id does not exist, so callers can warn and move on.
    pub fn link_trend_article_tx(conn: &Connection, trend_id: i64, article_id: i64) -> StoreResult<bool> {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM articles WHERE id = ?1",
                params![article_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(false);
        }
        conn.execute(
            "INSERT OR IGNORE INTO trending_group_memberships (article_id, trend_id) VALUES (?1, ?2)",
            params![article_id, trend_id],
        )?;
        Ok(true)
    }

    pub fn delete_trends_older_than(&self, hours: i64) -> StoreResult<usize> {
        let cutoff = timefmt::hours_ago_string(hours);
        self.with_tx(|tx| {
            let changed = tx.execute(
                "DELETE FROM trending_groups WHERE created_at < ?1",
                params![cutoff],
            )?;
            Ok(changed)
        })
    }

    pub fn trend_count(&self) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM trending_groups", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn trend_labels(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT trend_label FROM trending_groups")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn trends(&self, category: Option<&str>, limit: i64) -> StoreResult<Vec<Trend>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = "SELECT trend_id, category, trend_label, summary, importance_score, \
                       confidence_score, created_at, updated_at FROM trending_groups"
            .to_string();
        if category.is_some() {
            sql.push_str(" WHERE category = ?1");
        }
        sql.push_str(" ORDER BY importance_score DESC, confidence_score DESC, created_at DESC LIMIT ");
        sql.push_str(&limit.to_string());
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(Trend {
                trend_id: row.get(0)?,
                category: row.get(1)?,
                trend_label: row.get(2)?,
                summary: row.get(3)?,
                importance_score: row.get(4)?,
                confidence_score: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
            })
        };
        let rows = match category {
            Some(c) => stmt.query_map(params![c], map_row)?.collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], map_row)?.collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    pub fn trend_articles(&self, trend_id: i64) -> StoreResult<Vec<TrendArticle>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.title, a.link, a.published_date, a.source \
             FROM articles a JOIN trending_group_memberships m ON a.id = m.article_id \
             WHERE m.trend_id = ?1 ORDER BY a.published_date DESC",
        )?;
        let rows = stmt
            .query_map(params![trend_id], |row| {
                Ok(TrendArticle {
                    article_id: row.get(0)?,
                    title: row.get(1)?,
                    link: row.get(2)?,
                    published_date: row.get(3)?,
                    source: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn trend_entities(&self, trend_id: i64) -> StoreResult<Vec<TrendEntity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT e.entity_id, e.entity_name, e.entity_type, te.relevance_score \
             FROM entity_profiles e JOIN trend_entities te ON e.entity_id = te.entity_id \
             WHERE te.trend_id = ?1 ORDER BY te.relevance_score DESC, e.entity_id ASC",
        )?;
        let rows = stmt
            .query_map(params![trend_id], |row| {
                Ok(TrendEntity {
                    entity_id: row.get(0)?,
                    entity_name: row.get(1)?,
                    entity_type: row.get(2)?,
                    relevance_score: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Exemplar operations ──

    pub fn create_exemplar_tx(
        conn: &Connection,
        category: &str,
        pattern_name: &str,
        pattern_description: Option<&str>,
        success_score: f64,
    ) -> StoreResult<i64> {
        conn.execute(
            "INSERT INTO exemplar_groups (category, pattern_name, pattern_description, success_score) \
             VALUES (?1, ?2, ?3, ?4)",
            params![category, pattern_name, pattern_description, success_score],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_article_to_exemplar_tx(
        conn: &Connection,
        exemplar_id: i64,
        article_id: i64,
    ) -> StoreResult<()> {
        conn.execute(
            "INSERT OR IGNORE INTO exemplar_articles (exemplar_id, article_id) VALUES (?1, ?2)",
            params![exemplar_id, article_id],
        )?;
        Ok(())
    }

    pub fn exemplar_exists(&self, category: &str, pattern_name: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM exemplar_groups WHERE category = ?1 AND pattern_name = ?2",
                params![category, pattern_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// Best exemplars of a category with up to three sample article titles.
    pub fn exemplars_for_category(
        &self,
        category: &str,
        limit: i64,
    ) -> StoreResult<Vec<(String, Option<String>, Vec<String>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT exemplar_id, pattern_name, pattern_description FROM exemplar_groups \
             WHERE category = ?1 ORDER BY success_score DESC LIMIT ?2",
        )?;
        let exemplars = stmt
            .query_map(params![category, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut title_stmt = conn.prepare(
            "SELECT a.title FROM articles a JOIN exemplar_articles ea ON a.id = ea.article_id \
             WHERE ea.exemplar_id = ?1 LIMIT 3",
        )?;
        let mut out = Vec::with_capacity(exemplars.len());
        for (exemplar_id, name, description) in exemplars {
            let titles = title_stmt
                .query_map(params![exemplar_id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            out.push((name, description, titles));
        }
        Ok(out)
    }
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

fn map_article_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArticleEntity> {
    Ok(ArticleEntity {
        entity_id: row.get(0)?,
        entity_name: row.get(1)?,
        entity_type: row.get(2)?,
        relevance_score: row.get(3)?,
    })
}

fn map_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        group_id: row.get(0)?,
        main_topic: row.get(1)?,
        sub_topic: row.get(2)?,
        group_label: row.get(3)?,
        description: row.get(4)?,
        consistency_score: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
