use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Name shown in page titles and outgoing mail
    #[serde(default = "default_site_name")]
    pub site_name: String,
    /// Public URL used when building confirmation links
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Token signing secret. Usually supplied through `SECRET_KEY`.
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub secure_cookies: bool,
    #[serde(default)]
    pub mail: Option<MailConfig>,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    /// Extra feature flags a subscriber may opt into
    #[serde(default)]
    pub extras: Vec<String>,
    pub sources: Vec<SourceConfig>,
}

fn default_site_name() -> String {
    "Good Morning Tech".to_string()
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_url() -> String {
    "sqlite:newsletter.db?mode=rwc".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WebhookConfig {
    pub writer_application: Option<String>,
    pub registration: Option<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply `DATABASE_URL`, `SECRET_KEY`, `BASE_URL` and `SMTP_PASSWORD`
    /// from the environment on top of the file values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(secret) = std::env::var("SECRET_KEY") {
            if !secret.is_empty() {
                self.secret_key = Some(secret);
            }
        }
        if let Ok(base_url) = std::env::var("BASE_URL") {
            self.base_url = base_url;
        }
        if let (Some(mail), Ok(password)) = (self.mail.as_mut(), std::env::var("SMTP_PASSWORD")) {
            mail.password = password;
        }
        self
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        assert_eq!(default_base_url(), "http://localhost:3000");
        assert_eq!(default_bind_address(), "0.0.0.0:3000");
        assert_eq!(default_smtp_port(), 587);
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
            site_name = "Morning Bytes"
            base_url = "https://news.example.com"
            extras = ["weather", "quote"]

            [mail]
            host = "smtp.example.com"
            username = "bot"
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
        temp_file.write_all(content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.site_name, "Morning Bytes");
        assert_eq!(config.base_url, "https://news.example.com");
        assert_eq!(config.extras, vec!["weather", "quote"]);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].id, "bbc");
        assert_eq!(config.sources[1].name, "The Verge");

        let mail = config.mail.unwrap();
        assert_eq!(mail.port, 587);
        assert!(mail.password.is_empty());

        assert_eq!(
            config.webhooks.writer_application.as_deref(),
            Some("https://hooks.example.com/writers")
        );
        assert!(config.webhooks.registration.is_none());
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let content = r#"
            [[sources]]
            id = "bbc"
            name = "BBC"
            url = "https://example.com/rss"
        "#;

        let config = Config::from_str(content).unwrap();

        assert_eq!(config.site_name, "Good Morning Tech");
        assert_eq!(config.database_url, "sqlite:newsletter.db?mode=rwc");
        assert!(config.secret_key.is_none());
        assert!(config.mail.is_none());
        assert!(!config.secure_cookies);
        assert!(config.extras.is_empty());
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = Config::load("/nonexistent/path/newsletter.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let content = "this is not valid toml {{{";

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();

        let result = Config::load(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_source_missing_url_is_rejected() {
        let content = r#"
            [[sources]]
            id = "bbc"
            name = "BBC"
        "#;

        assert!(Config::from_str(content).is_err());
    }

    #[test]
    fn test_source_lookup() {
        let content = r#"
            [[sources]]
            id = "bbc"
            name = "BBC"
            url = "https://example.com/rss"
        "#;

        let config = Config::from_str(content).unwrap();
        assert_eq!(config.source("bbc").map(|s| s.name.as_str()), Some("BBC"));
        assert!(config.source("cnn").is_none());
    }
}
