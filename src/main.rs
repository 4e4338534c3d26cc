use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use newsletter::config::Config;
use newsletter::confirmation::Handshake;
use newsletter::db::{Database, Store};
use newsletter::mailer::{LogMailer, Mailer, SmtpMailer};
use newsletter::news::FeedAggregator;
use newsletter::routes::{self, AppState};
use newsletter::session::{session_key, session_layer, session_store, spawn_expired_cleanup};
use newsletter::token::TokenSigner;
use newsletter::webhook::Notifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "newsletter=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("NEWSLETTER_CONFIG").unwrap_or_else(|_| "newsletter.toml".to_string());
    let config = Config::load(&config_path)?.with_env_overrides();
    info!(
        "Loaded {} news sources from {}",
        config.sources.len(),
        config_path
    );

    // Initialize database
    let db = Database::new(&config.database_url).await?;
    db.initialize().await?;
    info!("Database initialized");
    let db = Arc::new(db);

    // `newsletter accept-writer <email>` approves an application and exits
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [command, email] = args.as_slice() {
        if command == "accept-writer" {
            if db.accept_writer(email).await? {
                info!("Accepted writer {}", email);
            } else {
                warn!("No pending application for {}", email);
            }
            return Ok(());
        }
    }

    let signer = match &config.secret_key {
        Some(secret) => TokenSigner::new(secret.as_bytes())?,
        None => {
            warn!("No secret_key configured, confirmation links will not survive a restart");
            TokenSigner::with_random_key()?
        }
    };

    let mailer: Arc<dyn Mailer> = match &config.mail {
        Some(mail) => Arc::new(SmtpMailer::new(mail, &config.site_name)?),
        None => {
            warn!("No [mail] section configured, confirmation emails will only be logged");
            Arc::new(LogMailer)
        }
    };

    // Sessions share the site's database
    let sessions = session_store(db.pool()).await?;
    spawn_expired_cleanup(sessions.clone());
    let sessions = session_layer(
        sessions,
        session_key(config.secret_key.as_deref()),
        config.secure_cookies,
    );

    let store: Arc<dyn Store> = db;
    let handshake = Handshake::new(
        store.clone(),
        mailer.clone(),
        signer,
        &config.base_url,
        &config.site_name,
    );

    // Create app state
    let bind_address = config.bind_address.clone();
    let state = Arc::new(AppState {
        store,
        mailer,
        handshake,
        aggregator: Arc::new(FeedAggregator::new()?),
        notifier: Notifier::new(config.webhooks.clone())?,
        config,
    });

    let app = routes::router(state, sessions);

    // Start server
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Server starting on http://{}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
