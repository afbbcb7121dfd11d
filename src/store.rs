//! Article storage: content-addressed blobs plus a relational index
//!
//! Blobs live at `<base_dir>/<message_id>` in raw NNTP wire form and are never
//! rewritten once saved. The index tracks newsgroups, per-group article rows,
//! and the dense per-group sequence numbers frontends page by. Index access is
//! synchronous and short; the connection lock is never held across an await.

use crate::error::{NntpdError, Result};
use crate::message::Message;
use crate::validation::is_valid_message_id;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS newsgroups (
    name          TEXT PRIMARY KEY,
    updated       INTEGER NOT NULL,
    article_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS articles (
    message_id TEXT NOT NULL,
    newsgroup  TEXT NOT NULL,
    subject    TEXT,
    name       TEXT,
    email      TEXT,
    refs       TEXT,
    posted_at  INTEGER,
    pubkey     TEXT,
    sig        TEXT,
    posthash   TEXT,
    filename   TEXT,
    imagehash  TEXT,
    PRIMARY KEY (message_id, newsgroup)
);
CREATE TABLE IF NOT EXISTS article_posts (
    newsgroup  TEXT NOT NULL,
    post_id    INTEGER NOT NULL,
    article_id TEXT NOT NULL,
    PRIMARY KEY (newsgroup, post_id)
);
CREATE TABLE IF NOT EXISTS users (
    uid    INTEGER PRIMARY KEY,
    name   TEXT UNIQUE NOT NULL,
    passwd TEXT NOT NULL
);
";

/// Filesystem blob store with a sqlite index
pub struct ArticleStore {
    base_dir: PathBuf,
    db: Mutex<Connection>,
}

impl ArticleStore {
    /// Open the store, creating the blob directory and schema as needed
    ///
    /// `database_url` accepts `sqlite:///<path>` and `sqlite:///:memory:`.
    pub fn open(base_dir: impl AsRef<Path>, database_url: &str) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        if !base_dir.exists() {
            std::fs::create_dir_all(&base_dir)?;
        }
        let db = match sqlite_path(database_url)? {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        db.execute_batch(SCHEMA)?;
        Ok(Self {
            base_dir,
            db: Mutex::new(db),
        })
    }

    fn article_path(&self, article_id: &str) -> Result<PathBuf> {
        if !is_valid_message_id(article_id) {
            return Err(NntpdError::MalformedId(article_id.to_string()));
        }
        Ok(self.base_dir.join(article_id))
    }

    /// True iff a blob exists for this id
    pub fn has_article(&self, article_id: &str) -> Result<bool> {
        Ok(self.article_path(article_id)?.exists())
    }

    /// Moderation hook; nothing is banned by default
    pub fn article_banned(&self, _article_id: &str) -> Result<bool> {
        Ok(false)
    }

    /// Open the blob for an id
    ///
    /// Write mode truncates, read mode opens for line-oriented reading. The
    /// returned handle closes on drop whatever path unwinds it.
    pub fn open_article(&self, article_id: &str, read: bool) -> Result<File> {
        let path = self.article_path(article_id)?;
        let file = if read {
            File::open(path)?
        } else {
            File::create(path)?
        };
        Ok(file)
    }

    /// Unlink the blob if present; index cleanup is left to moderation hooks
    pub fn delete_article(&self, article_id: &str) -> Result<()> {
        let path = self.article_path(article_id)?;
        if path.exists() {
            std::fs::remove_file(path)?;
            debug!("deleted article {}", article_id);
        }
        Ok(())
    }

    /// True if we carry this newsgroup
    pub fn has_group(&self, newsgroup: &str) -> Result<bool> {
        let db = self.db.lock().expect("store mutex poisoned");
        let count: i64 = db.query_row(
            "SELECT COUNT(name) FROM newsgroups WHERE name = ?1",
            params![newsgroup],
            |row| row.get(0),
        )?;
        Ok(count != 0)
    }

    /// `(count, low, high)` for a group; `(0, 0, 0)` when empty or unknown
    pub fn get_group_info(&self, newsgroup: &str) -> Result<(u64, u64, u64)> {
        let db = self.db.lock().expect("store mutex poisoned");
        let count: Option<i64> = db
            .query_row(
                "SELECT article_count FROM newsgroups WHERE name = ?1",
                params![newsgroup],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match count {
            None | Some(0) => (0, 0, 0),
            Some(n) => (n as u64, 1, n as u64),
        })
    }

    /// All carried newsgroup names, materialised per call
    pub fn get_all_groups(&self) -> Result<Vec<String>> {
        let db = self.db.lock().expect("store mutex poisoned");
        let mut stmt = db.prepare("SELECT name FROM newsgroups ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<Vec<String>, _>>()?)
    }

    /// Resolve a per-group sequence number to a message-id
    pub fn get_article_id_for_post(
        &self,
        newsgroup: &str,
        post_id: u64,
    ) -> Result<Option<String>> {
        let db = self.db.lock().expect("store mutex poisoned");
        let id = db
            .query_row(
                "SELECT article_id FROM article_posts WHERE newsgroup = ?1 AND post_id = ?2",
                params![newsgroup, post_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Newsgroups an article was filed under
    pub fn get_groups_for_article(&self, article_id: &str) -> Result<Vec<String>> {
        let db = self.db.lock().expect("store mutex poisoned");
        let mut stmt =
            db.prepare("SELECT newsgroup FROM article_posts WHERE article_id = ?1")?;
        let rows = stmt.query_map(params![article_id], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<Vec<String>, _>>()?)
    }

    /// Enumerate every stored blob with its group set
    ///
    /// Walks the blob directory rather than the index so articles whose index
    /// rows are missing still surface (with an empty group list).
    pub fn yield_all_articles(&self) -> Result<Vec<(String, Vec<String>)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_valid_message_id(name) {
                continue;
            }
            let groups = self.get_groups_for_article(name)?;
            out.push((name.to_string(), groups));
        }
        Ok(out)
    }

    /// Index a parsed message: one articles row and one sequence entry per
    /// group, creating groups on first sight
    ///
    /// The count read, the inserts, and the count update share one
    /// transaction so per-group post ids stay dense and strictly increasing.
    pub fn save_message(&self, msg: &Message) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut db = self.db.lock().expect("store mutex poisoned");
        let tx = db.transaction()?;
        for group in &msg.groups {
            tx.execute(
                "INSERT OR IGNORE INTO newsgroups (name, updated, article_count) VALUES (?1, ?2, 0)",
                params![group, now],
            )?;
            let count: i64 = tx.query_row(
                "SELECT article_count FROM newsgroups WHERE name = ?1",
                params![group],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO articles
                 (message_id, newsgroup, subject, name, email, refs, posted_at,
                  pubkey, sig, posthash, filename, imagehash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    msg.message_id,
                    group,
                    msg.subject,
                    msg.sender,
                    msg.email,
                    msg.parent,
                    msg.sent,
                    msg.pubkey,
                    msg.sig.as_deref().unwrap_or(""),
                    msg.posthash,
                    msg.attachment_name,
                    msg.attachment_hash,
                ],
            )?;
            tx.execute(
                "INSERT INTO article_posts (newsgroup, post_id, article_id) VALUES (?1, ?2, ?3)",
                params![group, count + 1, msg.message_id],
            )?;
            tx.execute(
                "UPDATE newsgroups SET article_count = ?1, updated = ?2 WHERE name = ?3",
                params![count + 1, now, group],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Plaintext credential check used by XSECRET
    pub fn check_user_login(&self, name: &str, passwd: &str) -> Result<bool> {
        let db = self.db.lock().expect("store mutex poisoned");
        let stored: Option<String> = db
            .query_row(
                "SELECT passwd FROM users WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.as_deref() == Some(passwd))
    }

    /// Provision a user for XSECRET
    pub fn add_user(&self, name: &str, passwd: &str) -> Result<()> {
        let db = self.db.lock().expect("store mutex poisoned");
        db.execute(
            "INSERT INTO users (name, passwd) VALUES (?1, ?2)",
            params![name, passwd],
        )?;
        Ok(())
    }
}

fn sqlite_path(url: &str) -> Result<Option<PathBuf>> {
    let target = url.strip_prefix("sqlite:///").unwrap_or(url);
    if target.is_empty() || target == ":memory:" {
        return Ok(None);
    }
    if target.contains("://") {
        return Err(NntpdError::Config(format!(
            "unsupported database url: {}",
            url
        )));
    }
    Ok(Some(PathBuf::from(target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_store() -> (tempfile::TempDir, ArticleStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArticleStore::open(dir.path(), "sqlite:///:memory:").unwrap();
        (dir, store)
    }

    fn message(id: &str, groups: &[&str]) -> Message {
        let mut msg = Message::new(id).unwrap();
        msg.groups = groups.iter().map(|g| g.to_string()).collect();
        msg
    }

    #[test]
    fn test_sqlite_path_parsing() {
        assert_eq!(sqlite_path("sqlite:///:memory:").unwrap(), None);
        assert_eq!(
            sqlite_path("sqlite:///srnd.db").unwrap(),
            Some(PathBuf::from("srnd.db"))
        );
        assert_eq!(
            sqlite_path("/var/lib/srnd.db").unwrap(),
            Some(PathBuf::from("/var/lib/srnd.db"))
        );
        assert!(sqlite_path("postgres://lol").is_err());
    }

    #[test]
    fn test_blob_roundtrip() {
        let (_dir, store) = test_store();
        let id = "<blob@test.tld>";
        assert!(!store.has_article(id).unwrap());
        {
            let mut f = store.open_article(id, false).unwrap();
            f.write_all(b"Subject: hi\n\nbody\n").unwrap();
        }
        assert!(store.has_article(id).unwrap());
        store.delete_article(id).unwrap();
        assert!(!store.has_article(id).unwrap());
        // deleting again is fine
        store.delete_article(id).unwrap();
    }

    #[test]
    fn test_invalid_id_refused() {
        let (_dir, store) = test_store();
        assert!(store.has_article("../../etc/passwd").is_err());
        assert!(store.open_article("no brackets", false).is_err());
    }

    #[test]
    fn test_save_message_assigns_dense_post_ids() {
        let (_dir, store) = test_store();
        for n in 1..=3u64 {
            let id = format!("<post{}@test.tld>", n);
            store
                .save_message(&message(&id, &["overchan.test"]))
                .unwrap();
            assert_eq!(
                store
                    .get_article_id_for_post("overchan.test", n)
                    .unwrap()
                    .as_deref(),
                Some(id.as_str())
            );
        }
        assert_eq!(
            store.get_group_info("overchan.test").unwrap(),
            (3, 1, 3)
        );
    }

    #[test]
    fn test_save_message_multiple_groups() {
        let (_dir, store) = test_store();
        store
            .save_message(&message("<cross@test.tld>", &["overchan.a", "overchan.b"]))
            .unwrap();
        let mut groups = store.get_groups_for_article("<cross@test.tld>").unwrap();
        groups.sort();
        assert_eq!(groups, vec!["overchan.a", "overchan.b"]);
        assert_eq!(store.get_group_info("overchan.a").unwrap(), (1, 1, 1));
        assert_eq!(store.get_group_info("overchan.b").unwrap(), (1, 1, 1));
    }

    #[test]
    fn test_group_creation_implicit() {
        let (_dir, store) = test_store();
        assert!(!store.has_group("overchan.new").unwrap());
        store
            .save_message(&message("<first@test.tld>", &["overchan.new"]))
            .unwrap();
        assert!(store.has_group("overchan.new").unwrap());
        assert_eq!(store.get_all_groups().unwrap(), vec!["overchan.new"]);
    }

    #[test]
    fn test_empty_group_info() {
        let (_dir, store) = test_store();
        assert_eq!(store.get_group_info("overchan.nothing").unwrap(), (0, 0, 0));
    }

    #[test]
    fn test_yield_all_articles() {
        let (_dir, store) = test_store();
        let id = "<walk@test.tld>";
        {
            let mut f = store.open_article(id, false).unwrap();
            f.write_all(b"Newsgroups: overchan.walk\n\nbody\n").unwrap();
        }
        store.save_message(&message(id, &["overchan.walk"])).unwrap();
        let all = store.yield_all_articles().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, id);
        assert_eq!(all[0].1, vec!["overchan.walk"]);
        // restartable: a second walk sees the same thing
        assert_eq!(store.yield_all_articles().unwrap().len(), 1);
    }

    #[test]
    fn test_user_login() {
        let (_dir, store) = test_store();
        store.add_user("mod", "hunter2").unwrap();
        assert!(store.check_user_login("mod", "hunter2").unwrap());
        assert!(!store.check_user_login("mod", "hunter3").unwrap());
        assert!(!store.check_user_login("ghost", "hunter2").unwrap());
    }

    #[test]
    fn test_article_banned_default() {
        let (_dir, store) = test_store();
        assert!(!store.article_banned("<any@test.tld>").unwrap());
    }
}
