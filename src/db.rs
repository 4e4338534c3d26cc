use std::collections::BTreeSet;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub email: String,
    /// Delivery time in UTC, `HH:MM`
    pub time: String,
    pub confirmed: bool,
    /// Weekday numbers, 1 (Monday) to 7 (Sunday)
    pub frequency: BTreeSet<u8>,
    pub news: BTreeSet<String>,
    pub extras: BTreeSet<String>,
    /// Sent in `X-API-KEY` to read the articles feed
    pub api_key: String,
}

/// A validated registration, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub time: String,
    pub frequency: BTreeSet<u8>,
    pub news: BTreeSet<String>,
    pub extras: BTreeSet<String>,
}

#[derive(Debug, Clone, FromRow)]
struct UserRow {
    id: i64,
    email: String,
    time: String,
    confirmed: bool,
    frequency: String,
    news: String,
    extras: String,
    api_key: String,
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row.id,
            email: row.email,
            time: row.time,
            confirmed: row.confirmed,
            frequency: serde_json::from_str(&row.frequency)?,
            news: serde_json::from_str(&row.news)?,
            extras: serde_json::from_str(&row.extras)?,
            api_key: row.api_key,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Writer {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub reasoning: String,
    pub accepted: bool,
    /// Argon2 hash, unset until the writer registers
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewWriter {
    pub email: String,
    pub name: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub content: String,
    pub author: String,
    pub author_email: String,
    /// RFC 3339, UTC
    pub date: String,
}

impl Article {
    pub fn display_date(&self) -> String {
        DateTime::parse_from_rfc3339(&self.date)
            .map(|d| d.format("%B %-d, %Y").to_string())
            .unwrap_or_else(|_| self.date.clone())
    }
}

#[derive(Debug, Clone)]
pub struct NewArticle {
    pub title: String,
    pub description: String,
    pub content: String,
    pub author: String,
    pub author_email: String,
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The collection operations the site needs, independent of the backing store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_user(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn find_user_by_api_key(&self, api_key: &str) -> anyhow::Result<Option<User>>;
    /// Insert, or overwrite the existing record for the same email. Always
    /// leaves the user unconfirmed. A new record gets a fresh API key; an
    /// overwritten one keeps its key.
    async fn upsert_user(&self, user: &NewUser) -> anyhow::Result<()>;
    async fn confirm_user(&self, email: &str) -> anyhow::Result<bool>;
    async fn delete_user(&self, email: &str) -> anyhow::Result<bool>;

    async fn find_writer(&self, email: &str) -> anyhow::Result<Option<Writer>>;
    async fn insert_writer(&self, writer: &NewWriter) -> anyhow::Result<i64>;
    async fn accept_writer(&self, email: &str) -> anyhow::Result<bool>;
    /// Sets the password only for an accepted writer whose password is unset.
    async fn set_writer_password(&self, email: &str, hash: &str) -> anyhow::Result<bool>;

    async fn insert_article(&self, article: &NewArticle) -> anyhow::Result<i64>;
    async fn find_article(&self, id: i64) -> anyhow::Result<Option<Article>>;
    async fn articles_by_author(&self, email: &str) -> anyhow::Result<Vec<Article>>;
    async fn recent_articles(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Article>>;
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// The underlying pool, shared with the session store.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                email TEXT NOT NULL,
                time TEXT NOT NULL,
                confirmed INTEGER NOT NULL DEFAULT 0,
                frequency TEXT NOT NULL DEFAULT '[]',
                news TEXT NOT NULL DEFAULT '[]',
                extras TEXT NOT NULL DEFAULT '[]',
                api_key TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Not unique: concurrent registrations for one email are last-write-wins
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_email ON users(email)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_users_api_key ON users(api_key)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS writers (
                id INTEGER PRIMARY KEY,
                email TEXT NOT NULL,
                name TEXT NOT NULL,
                reasoning TEXT NOT NULL,
                accepted INTEGER NOT NULL DEFAULT 0,
                password TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                content TEXT NOT NULL,
                author TEXT NOT NULL,
                author_email TEXT NOT NULL,
                date TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_articles_author_date
            ON articles(author_email, date DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    async fn find_user(&self, email: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE email = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_user_by_api_key(&self, api_key: &str) -> anyhow::Result<Option<User>> {
        if api_key.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE api_key = ?")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::try_from).transpose()
    }

    async fn upsert_user(&self, user: &NewUser) -> anyhow::Result<()> {
        let frequency = serde_json::to_string(&user.frequency)?;
        let news = serde_json::to_string(&user.news)?;
        let extras = serde_json::to_string(&user.extras)?;

        let updated = sqlx::query(
            r#"
            UPDATE users
            SET time = ?, confirmed = 0, frequency = ?, news = ?, extras = ?
            WHERE email = ?
            "#,
        )
        .bind(&user.time)
        .bind(&frequency)
        .bind(&news)
        .bind(&extras)
        .bind(&user.email)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO users (email, time, confirmed, frequency, news, extras, api_key)
                VALUES (?, ?, 0, ?, ?, ?, ?)
                "#,
            )
            .bind(&user.email)
            .bind(&user.time)
            .bind(&frequency)
            .bind(&news)
            .bind(&extras)
            .bind(generate_api_key())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn confirm_user(&self, email: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE users SET confirmed = 1 WHERE email = ?")
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_user(&self, email: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE email = ?")
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_writer(&self, email: &str) -> anyhow::Result<Option<Writer>> {
        let writer = sqlx::query_as::<_, Writer>(
            "SELECT * FROM writers WHERE email = ? ORDER BY accepted DESC, id LIMIT 1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(writer)
    }

    async fn insert_writer(&self, writer: &NewWriter) -> anyhow::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO writers (email, name, reasoning, accepted, password)
            VALUES (?, ?, ?, 0, NULL)
            "#,
        )
        .bind(&writer.email)
        .bind(&writer.name)
        .bind(&writer.reasoning)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn accept_writer(&self, email: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE writers SET accepted = 1 WHERE email = ?")
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_writer_password(&self, email: &str, hash: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE writers SET password = ?
            WHERE email = ? AND accepted = 1 AND password IS NULL
            "#,
        )
        .bind(hash)
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_article(&self, article: &NewArticle) -> anyhow::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO articles (title, description, content, author, author_email, date)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&article.title)
        .bind(&article.description)
        .bind(&article.content)
        .bind(&article.author)
        .bind(&article.author_email)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn find_article(&self, id: i64) -> anyhow::Result<Option<Article>> {
        let article = sqlx::query_as::<_, Article>("SELECT * FROM articles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(article)
    }

    async fn articles_by_author(&self, email: &str) -> anyhow::Result<Vec<Article>> {
        let articles = sqlx::query_as::<_, Article>(
            "SELECT * FROM articles WHERE author_email = ? ORDER BY date DESC, id DESC",
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }

    async fn recent_articles(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Article>> {
        let articles = sqlx::query_as::<_, Article>(
            "SELECT * FROM articles WHERE date >= ? ORDER BY date DESC, id DESC",
        )
        .bind(timestamp(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }
}
