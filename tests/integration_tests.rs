//! Integration tests for the newsletter site
//!
//! These tests verify the full workflow from configuration loading
//! through database operations and the HTTP surface.

use std::io::Write;
use tempfile::NamedTempFile;

mod common {
    use std::sync::Arc;

    use newsletter::config::Config;
    use newsletter::confirmation::Handshake;
    use newsletter::db::Database;
    use newsletter::mailer::LogMailer;
    use newsletter::news::FeedAggregator;
    use newsletter::routes::{self, AppState};
    use newsletter::session::{session_key, session_layer, session_store};
    use newsletter::token::TokenSigner;
    use newsletter::webhook::Notifier;
    use tempfile::TempDir;

    /// Create a temporary directory for test databases
    pub fn create_temp_dir() -> TempDir {
        tempfile::tempdir().expect("Failed to create temp directory")
    }

    /// Create a test database path
    pub fn create_db_path(temp_dir: &TempDir) -> String {
        let db_path = temp_dir.path().join("test.db");
        format!("sqlite:{}?mode=rwc", db_path.display())
    }

    /// Build the full application the way `main` does, against an in-memory
    /// database and the given feed URL.
    pub async fn create_app(feed_url: &str) -> (axum::Router, Arc<Database>) {
        let config = Config::from_str(&format!(
            r#"
            [[sources]]
            id = "tech"
            name = "Tech News"
            url = "{}"
            "#,
            feed_url
        ))
        .unwrap();

        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(db);
        let sessions = session_layer(
            session_store(db.pool()).await.unwrap(),
            session_key(Some("integration")),
            false,
        );

        let mailer = Arc::new(LogMailer);
        let handshake = Handshake::new(
            db.clone(),
            mailer.clone(),
            TokenSigner::new(b"integration").unwrap(),
            &config.base_url,
            &config.site_name,
        );
        let notifier = Notifier::new(config.webhooks.clone()).unwrap();
        let state = Arc::new(AppState {
            store: db.clone(),
            mailer,
            handshake,
            aggregator: Arc::new(FeedAggregator::new().unwrap()),
            notifier,
            config,
        });

        (routes::router(state, sessions), db)
    }
}

#[cfg(test)]
mod config_integration_tests {
    use super::*;
    use newsletter::config::Config;

    #[test]
    fn test_load_actual_newsletter_config() {
        // Test loading the actual newsletter.toml from the project
        let config = Config::load("newsletter.toml");
        assert!(
            config.is_ok(),
            "Failed to load newsletter.toml: {:?}",
            config.err()
        );

        let config = config.unwrap();
        assert!(
            !config.sources.is_empty(),
            "newsletter.toml should have at least one source"
        );
        assert!(config.source("bbc").is_some());
        assert!(config.secret_key.is_none(), "secrets belong in the environment");
    }

    #[test]
    fn test_source_ids_are_unique() {
        let config = Config::load("newsletter.toml").unwrap();
        let mut ids: Vec<_> = config.sources.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), config.sources.len());
    }

    #[test]
    fn test_config_round_trip() {
        let toml_content = r#"
            site_name = "Morning Bytes"
            extras = ["weather"]

            [mail]
            host = "smtp.example.com"
            username = "bot@example.com"
            from = "bot@example.com"

            [webhooks]
            writer_application = "https://hooks.example.com/writers"

            [[sources]]
            id = "bbc"
            name = "BBC"
            url = "https://feeds.bbci.co.uk/news/technology/rss.xml"

            [[sources]]
            id = "verge"
            name = "The Verge"
            url = "https://www.theverge.com/rss/index.xml"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.site_name, "Morning Bytes");
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[1].name, "The Verge");

        let mail = config.mail.unwrap();
        assert_eq!(mail.port, 587);
        assert!(mail.password.is_empty());

        assert!(config.webhooks.writer_application.is_some());
        assert!(config.webhooks.registration.is_none());
    }
}

#[cfg(test)]
mod database_integration_tests {
    use super::common::*;
    use chrono::Utc;
    use newsletter::db::{Database, NewArticle, NewUser, NewWriter, Store};

    fn subscriber(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            time: "07:00".to_string(),
            frequency: [1, 2, 3, 4, 5].into_iter().collect(),
            news: ["bbc".to_string(), "verge".to_string()].into_iter().collect(),
            extras: ["weather".to_string()].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn test_database_persistence() {
        let temp_dir = create_temp_dir();
        let db_url = create_db_path(&temp_dir);

        // Create database and add data
        {
            let db = Database::new(&db_url).await.unwrap();
            db.initialize().await.unwrap();
            db.upsert_user(&subscriber("a@b.com")).await.unwrap();
            db.confirm_user("a@b.com").await.unwrap();
        }

        // Reopen database and verify data persists
        {
            let db = Database::new(&db_url).await.unwrap();
            db.initialize().await.unwrap();

            let user = db.find_user("a@b.com").await.unwrap().unwrap();
            assert!(user.confirmed);
            assert_eq!(user.time, "07:00");
            assert_eq!(user.frequency.len(), 5);
            assert!(user.news.contains("verge"));
            assert!(user.extras.contains("weather"));
        }
    }

    #[tokio::test]
    async fn test_full_writer_workflow() {
        let temp_dir = create_temp_dir();
        let db = Database::new(&create_db_path(&temp_dir)).await.unwrap();
        db.initialize().await.unwrap();

        db.upsert_user(&subscriber("w@b.com")).await.unwrap();
        db.confirm_user("w@b.com").await.unwrap();

        db.insert_writer(&NewWriter {
            email: "w@b.com".to_string(),
            name: "Ada".to_string(),
            reasoning: "I like writing".to_string(),
        })
        .await
        .unwrap();

        // Pending writers cannot set a password
        assert!(!db.set_writer_password("w@b.com", "hash").await.unwrap());

        assert!(db.accept_writer("w@b.com").await.unwrap());
        assert!(db.set_writer_password("w@b.com", "hash").await.unwrap());
        assert!(!db.set_writer_password("w@b.com", "other").await.unwrap());

        let writer = db.find_writer("w@b.com").await.unwrap().unwrap();
        assert!(writer.accepted);
        assert_eq!(writer.password.as_deref(), Some("hash"));

        for i in 1..=3 {
            db.insert_article(&NewArticle {
                title: format!("Article {}", i),
                description: String::new(),
                content: "Body".to_string(),
                author: writer.name.clone(),
                author_email: writer.email.clone(),
            })
            .await
            .unwrap();
        }

        let articles = db.articles_by_author("w@b.com").await.unwrap();
        assert_eq!(articles.len(), 3);

        let recent = db
            .recent_articles(Utc::now() - chrono::Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(recent.len(), 3);
    }

    #[tokio::test]
    async fn test_reregistration_overwrites_pending_record() {
        let temp_dir = create_temp_dir();
        let db = Database::new(&create_db_path(&temp_dir)).await.unwrap();
        db.initialize().await.unwrap();

        // Simulate repeated signups before confirming
        for hour in ["06:00", "07:00", "08:00"] {
            let mut user = subscriber("a@b.com");
            user.time = hour.to_string();
            db.upsert_user(&user).await.unwrap();
        }

        let user = db.find_user("a@b.com").await.unwrap().unwrap();
        assert_eq!(user.time, "08:00");
        assert!(!user.confirmed);

        assert!(db.delete_user("a@b.com").await.unwrap());
        assert!(db.find_user("a@b.com").await.unwrap().is_none());
    }
}

#[cfg(test)]
mod http_integration_tests {
    use super::common::*;
    use axum::http::{HeaderName, HeaderValue, StatusCode};
    use axum_test::TestServer;
    use newsletter::db::{NewArticle, NewUser, Store};
    use newsletter::routes::API_KEY_HEADER;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <rss version="2.0">
            <channel>
                <title>Tech News</title>
                <link>https://technews.example.com</link>
                <description>Latest tech news</description>
                <item>
                    <title>Breaking: New Technology Announced</title>
                    <link>https://technews.example.com/article/1</link>
                    <pubDate>Mon, 09 Dec 2024 12:00:00 GMT</pubDate>
                </item>
                <item>
                    <title>Review: Latest Gadget</title>
                    <link>https://technews.example.com/article/2</link>
                    <pubDate>Mon, 09 Dec 2024 10:00:00 GMT</pubDate>
                </item>
            </channel>
        </rss>
    "#;

    fn api_key_header() -> HeaderName {
        HeaderName::from_static(API_KEY_HEADER)
    }

    fn subscriber(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            time: "09:00".to_string(),
            frequency: [1].into_iter().collect(),
            news: ["tech".to_string()].into_iter().collect(),
            extras: Default::default(),
        }
    }

    async fn feed_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rss"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_health_and_fallback() {
        let (app, _db) = create_app("http://127.0.0.1:9/rss").await;
        let server = TestServer::new(app).unwrap();

        let response = server.get("/health").await;
        response.assert_status_ok();
        response.assert_text("OK");

        let response = server.get("/nowhere").await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_news_page_from_live_feed() {
        let feed = feed_server().await;
        let (app, _db) = create_app(&format!("{}/rss", feed.uri())).await;
        let server = TestServer::new(app).unwrap();

        let response = server.get("/news").await;
        response.assert_status_ok();
        let body = response.text();
        assert!(body.contains("Breaking: New Technology Announced"));
        assert!(body.contains("Review: Latest Gadget"));
    }

    #[tokio::test]
    async fn test_api_news_requires_a_known_key() {
        let (app, db) = create_app("http://127.0.0.1:9/rss").await;
        let server = TestServer::new(app).unwrap();
        db.upsert_user(&subscriber("a@b.com")).await.unwrap();

        server
            .get("/api/news")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
        server
            .get("/api/news")
            .add_header(api_key_header(), HeaderValue::from_static("wrong"))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_api_news_lists_recent_articles() {
        let (app, db) = create_app("http://127.0.0.1:9/rss").await;
        let server = TestServer::new(app).unwrap();
        db.upsert_user(&subscriber("a@b.com")).await.unwrap();
        db.insert_article(&NewArticle {
            title: "Launch day".to_string(),
            description: "We shipped".to_string(),
            content: "Details".to_string(),
            author: "Ada".to_string(),
            author_email: "w@b.com".to_string(),
        })
        .await
        .unwrap();

        let key = db.find_user("a@b.com").await.unwrap().unwrap().api_key;
        let response = server
            .get("/api/news")
            .add_header(api_key_header(), HeaderValue::from_str(&key).unwrap())
            .await;
        response.assert_status_ok();

        let json = response.json::<serde_json::Value>();
        let articles = json.as_array().unwrap();
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0]["title"], "Launch day");
    }

    #[tokio::test]
    async fn test_news_page_survives_broken_feed() {
        let feed = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&feed)
            .await;
        let (app, _db) = create_app(&format!("{}/rss", feed.uri())).await;
        let server = TestServer::new(app).unwrap();

        let response = server.get("/news").await;
        response.assert_status_ok();
        assert!(response.text().contains("Could not load Tech News"));
    }

    #[tokio::test]
    async fn test_signup_creates_unconfirmed_subscriber() {
        let (app, db) = create_app("http://127.0.0.1:9/rss").await;
        let server = TestServer::new(app).unwrap();

        let response = server
            .post("/register")
            .form(&[
                ("email", "a@b.com"),
                ("time", "09"),
                ("timezone", "-3.30"),
                ("news", "tech"),
            ])
            .await;
        response.assert_status(StatusCode::SEE_OTHER);

        let user = db.find_user("a@b.com").await.unwrap().unwrap();
        assert_eq!(user.time, "12:30");
        assert_eq!(user.frequency.len(), 7);
        assert!(!user.confirmed);
    }

    #[tokio::test]
    async fn test_confirm_link_sends_and_renders() {
        let (app, db) = create_app("http://127.0.0.1:9/rss").await;
        let server = TestServer::new(app).unwrap();

        // Unknown subscriber
        server
            .get("/confirm/a%40b.com")
            .add_query_param("next", "register")
            .await
            .assert_status(StatusCode::NOT_FOUND);

        db.upsert_user(&subscriber("a@b.com")).await.unwrap();

        let response = server
            .get("/confirm/a%40b.com")
            .add_query_param("next", "register")
            .await;
        response.assert_status_ok();
        assert!(response.text().contains("status-sent"));
    }

    #[tokio::test]
    async fn test_leave_unknown_subscriber() {
        let (app, _db) = create_app("http://127.0.0.1:9/rss").await;
        let server = TestServer::new(app).unwrap();

        let response = server
            .post("/leave")
            .form(&[("email", "nobody@b.com")])
            .await;
        response.assert_status_ok();
        assert!(response.text().contains("Email not found"));
    }
}
