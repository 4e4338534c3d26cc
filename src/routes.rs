use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::{Config, SourceConfig};
use crate::confirmation::{ConfirmationError, Consumed, Handshake, Purpose};
use crate::db::{Article, Store};
use crate::mailer::{api_key_email, Mailer};
use crate::news::{NewsAggregator, Post};
use crate::registration::{self, is_valid_email, RegisterForm, RegistrationError};
use crate::session::{SessionContext, SessionLayer};
use crate::webhook::Notifier;
use crate::writers::{self, ApplyForm, ArticleForm, LoginForm, WriterError, WriterRegisterForm};

/// Articles younger than this appear next to the news posts
const RECENT_ARTICLE_HOURS: i64 = 25;

pub const API_KEY_HEADER: &str = "x-api-key";

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub mailer: Arc<dyn Mailer>,
    pub handshake: Handshake,
    pub aggregator: Arc<dyn NewsAggregator>,
    pub notifier: Notifier,
}

pub fn router(state: Arc<AppState>, sessions: SessionLayer) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/register", get(register_page).post(register_submit))
        .route("/leave", get(leave_page).post(leave_submit))
        .route("/confirm/:email", get(confirm_page).post(confirm_submit))
        .route("/news", get(news))
        .route("/api", get(api_page).post(api_key_request))
        .route("/api/news", get(api_news))
        .route("/writers/apply", get(writer_apply_page).post(writer_apply))
        .route("/writers/login", get(writer_login_page).post(writer_login))
        .route(
            "/writers/register",
            get(writer_register_page).post(writer_register),
        )
        .route("/writers/create", get(writer_create_page).post(writer_create))
        .route("/writers/portal", get(writer_portal))
        .route("/writers/logout", post(writer_logout))
        .route("/article/:id", get(article))
        .nest_service("/static", ServeDir::new("static"))
        .fallback(fallback)
        .layer(sessions)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Template structs
#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {}

#[derive(Template)]
#[template(path = "signup.html")]
pub struct SignupTemplate {
    pub error: Option<String>,
    pub hours: Vec<String>,
    pub sources: Vec<SourceConfig>,
    pub extras: Vec<String>,
}

#[derive(Template)]
#[template(path = "leave.html")]
pub struct LeaveTemplate {
    pub error: Option<String>,
}

#[derive(Template)]
#[template(path = "unsubscribed.html")]
pub struct UnsubscribedTemplate {
    pub email: String,
}

#[derive(Template)]
#[template(path = "confirm.html")]
pub struct ConfirmTemplate {
    pub email: String,
    pub sent: bool,
    pub error: Option<String>,
    /// Verifies the token carried in the current link
    pub action: String,
    /// Mails a fresh link
    pub resend: String,
}

#[derive(Template)]
#[template(path = "news.html")]
pub struct NewsTemplate {
    pub sources: Vec<SourceConfig>,
    pub selected: String,
    pub posts: Vec<Post>,
    pub articles: Vec<Article>,
    pub error: Option<String>,
}

#[derive(Template)]
#[template(path = "api.html")]
pub struct ApiTemplate {
    pub error: Option<String>,
    pub sent: bool,
}

#[derive(Template)]
#[template(path = "apply.html")]
pub struct ApplyTemplate {
    pub status: Option<String>,
}

#[derive(Template)]
#[template(path = "writer_login.html")]
pub struct WriterLoginTemplate {
    pub status: Option<String>,
}

#[derive(Template)]
#[template(path = "writer_register.html")]
pub struct WriterRegisterTemplate {
    pub status: Option<String>,
}

#[derive(Template)]
#[template(path = "writer_create.html")]
pub struct WriterCreateTemplate {
    pub status: Option<String>,
    pub article_id: Option<i64>,
}

#[derive(Template)]
#[template(path = "writer_portal.html")]
pub struct WriterPortalTemplate {
    pub email: String,
    pub articles: Vec<Article>,
}

#[derive(Template)]
#[template(path = "article.html")]
pub struct ArticleTemplate {
    pub article: Article,
}

#[derive(Template)]
#[template(path = "404.html")]
pub struct NotFoundTemplate {
    pub path: String,
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

// Custom error type
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Request failed: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error: {}", self.0),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

fn not_found(path: String) -> Response {
    (StatusCode::NOT_FOUND, HtmlTemplate(NotFoundTemplate { path })).into_response()
}

fn confirm_url(email: &str, purpose: Purpose) -> String {
    format!(
        "/confirm/{}?next={}",
        urlencoding::encode(email),
        purpose.as_str()
    )
}

/// Domain errors that belong on the form, as opposed to server failures.
fn writer_message(err: WriterError) -> Result<String, AppError> {
    match err {
        WriterError::Store(e) => Err(AppError(e)),
        e @ WriterError::Hashing(_) => Err(e.into()),
        e => Ok(e.to_string()),
    }
}

// Route handlers
pub async fn index() -> impl IntoResponse {
    HtmlTemplate(IndexTemplate {})
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}

pub async fn fallback(uri: Uri) -> Response {
    not_found(uri.path().to_string())
}

fn signup(state: &AppState, error: Option<String>) -> HtmlTemplate<SignupTemplate> {
    HtmlTemplate(SignupTemplate {
        error,
        hours: (0..24).map(|h| format!("{:02}", h)).collect(),
        sources: state.config.sources.clone(),
        extras: state.config.extras.clone(),
    })
}

pub async fn register_page(
    State(state): State<Arc<AppState>>,
    ctx: SessionContext,
) -> Result<Response, AppError> {
    let pending = ctx.confirmation().await?;
    match state
        .handshake
        .consume_confirmation(Purpose::Register, pending.as_ref())
        .await?
    {
        Consumed::Confirmed(email) => {
            ctx.set_confirmation(&email, Some(Purpose::Register), false)
                .await?;
            Ok(Redirect::to("/news").into_response())
        }
        _ => Ok(signup(&state, None).into_response()),
    }
}

pub async fn register_submit(
    State(state): State<Arc<AppState>>,
    ctx: SessionContext,
    axum_extra::extract::Form(form): axum_extra::extract::Form<RegisterForm>,
) -> Result<Response, AppError> {
    let user = match registration::validate(&form, state.store.as_ref(), &state.config).await {
        Ok(user) => user,
        Err(RegistrationError::Store(e)) => return Err(AppError(e)),
        Err(e) => return Ok(signup(&state, Some(e.to_string())).into_response()),
    };

    state.store.upsert_user(&user).await?;
    ctx.set_confirmation(&user.email, Some(Purpose::Register), false)
        .await?;
    state.notifier.user_registered(&user.email).await;

    Ok(Redirect::to(&confirm_url(&user.email, Purpose::Register)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LeaveForm {
    pub email: String,
}

pub async fn leave_page(
    State(state): State<Arc<AppState>>,
    ctx: SessionContext,
) -> Result<Response, AppError> {
    let pending = ctx.confirmation().await?;
    match state
        .handshake
        .consume_confirmation(Purpose::Leave, pending.as_ref())
        .await?
    {
        Consumed::Unsubscribed(email) => {
            ctx.set_confirmation(&email, Some(Purpose::Leave), false)
                .await?;
            Ok(HtmlTemplate(UnsubscribedTemplate { email }).into_response())
        }
        _ => Ok(HtmlTemplate(LeaveTemplate { error: None }).into_response()),
    }
}

pub async fn leave_submit(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LeaveForm>,
) -> Result<Response, AppError> {
    let email = form.email.trim();
    let error = if !is_valid_email(email) {
        Some("Invalid email")
    } else if state.store.find_user(email).await?.is_none() {
        Some("Email not found")
    } else {
        None
    };

    match error {
        Some(error) => Ok(HtmlTemplate(LeaveTemplate {
            error: Some(error.to_string()),
        })
        .into_response()),
        None => Ok(Redirect::to(&confirm_url(email, Purpose::Leave)).into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfirmQuery {
    pub token: Option<String>,
    pub next: Option<String>,
}

impl ConfirmQuery {
    fn purpose(&self) -> Option<Purpose> {
        self.next.as_deref().and_then(Purpose::parse)
    }

    fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

fn confirm_template(email: &str, query: &ConfirmQuery) -> ConfirmTemplate {
    let base = format!("/confirm/{}", urlencoding::encode(email));
    let next = query
        .purpose()
        .map(|p| format!("next={}", p.as_str()));

    let resend = match &next {
        Some(next) => format!("{}?{}", base, next),
        None => base.clone(),
    };
    let action = match (query.token(), &next) {
        (Some(token), Some(next)) => {
            format!("{}?token={}&{}", base, urlencoding::encode(token), next)
        }
        (Some(token), None) => format!("{}?token={}", base, urlencoding::encode(token)),
        (None, _) => resend.clone(),
    };

    ConfirmTemplate {
        email: email.to_string(),
        sent: false,
        error: None,
        action,
        resend,
    }
}

async fn send_confirmation(
    state: &AppState,
    email: &str,
    query: &ConfirmQuery,
) -> Result<Response, AppError> {
    match state
        .handshake
        .request_confirmation(email, query.purpose())
        .await
    {
        Ok(()) => Ok(HtmlTemplate(ConfirmTemplate {
            sent: true,
            ..confirm_template(email, query)
        })
        .into_response()),
        Err(ConfirmationError::NotFound) => Ok(not_found(format!("/confirm/{}", email))),
        Err(e) => Err(e.into()),
    }
}

/// With a token: show the "Confirm Email" button. Without: mail a new link.
pub async fn confirm_page(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> Result<Response, AppError> {
    if query.token().is_some() {
        return Ok(HtmlTemplate(confirm_template(&email, &query)).into_response());
    }

    send_confirmation(&state, &email, &query).await
}

/// With a token: verify it and hand over to the purpose's route.
pub async fn confirm_submit(
    State(state): State<Arc<AppState>>,
    ctx: SessionContext,
    Path(email): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> Result<Response, AppError> {
    let Some(token) = query.token() else {
        return send_confirmation(&state, &email, &query).await;
    };

    match state.handshake.verify_token(token) {
        Ok(verified) => {
            ctx.set_confirmation(&verified, query.purpose(), true)
                .await?;
            let next = query.purpose().map(|p| p.route()).unwrap_or("/");
            Ok(Redirect::to(next).into_response())
        }
        Err(ConfirmationError::Token(e)) => Ok(HtmlTemplate(ConfirmTemplate {
            error: Some(e.to_string()),
            ..confirm_template(&email, &query)
        })
        .into_response()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct NewsQuery {
    pub source: Option<String>,
}

fn selected_source<'a>(config: &'a Config, query: &NewsQuery) -> Option<&'a SourceConfig> {
    match query.source.as_deref() {
        Some(id) => config.source(id),
        None => config.sources.first(),
    }
}

async fn recent_articles(state: &AppState) -> anyhow::Result<Vec<Article>> {
    state
        .store
        .recent_articles(Utc::now() - chrono::Duration::hours(RECENT_ARTICLE_HOURS))
        .await
}

pub async fn news(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NewsQuery>,
) -> Result<Response, AppError> {
    if query.source.is_some() && selected_source(&state.config, &query).is_none() {
        return Ok(not_found("/news".to_string()));
    }

    let mut posts = Vec::new();
    let mut fetch_error = None;
    let selected = selected_source(&state.config, &query);
    if let Some(source) = selected {
        match state.aggregator.posts(source).await {
            Ok(fetched) => posts = fetched,
            Err(e) => {
                error!("Failed to load news from '{}': {}", source.name, e);
                fetch_error = Some(format!("Could not load {} right now.", source.name));
            }
        }
    }

    let articles = recent_articles(&state).await?;

    Ok(HtmlTemplate(NewsTemplate {
        sources: state.config.sources.clone(),
        selected: selected.map(|s| s.id.clone()).unwrap_or_default(),
        posts,
        articles,
        error: fetch_error,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ApiKeyForm {
    pub email: String,
}

pub async fn api_page() -> impl IntoResponse {
    HtmlTemplate(ApiTemplate {
        error: None,
        sent: false,
    })
}

/// Mails the subscriber their API key.
pub async fn api_key_request(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ApiKeyForm>,
) -> Result<Response, AppError> {
    let email = form.email.trim();
    let Some(user) = state.store.find_user(email).await? else {
        return Ok(HtmlTemplate(ApiTemplate {
            error: Some("User not found".to_string()),
            sent: false,
        })
        .into_response());
    };

    let mail = api_key_email(&user.email, &user.api_key, &state.config.site_name);
    match state.mailer.send(mail).await {
        Ok(()) => info!("API key sent to {}", user.email),
        Err(e) => warn!("Failed to send API key to {}: {}", user.email, e),
    }

    Ok(HtmlTemplate(ApiTemplate {
        error: None,
        sent: true,
    })
    .into_response())
}

/// Articles from the last 25 hours, for holders of a valid `X-API-KEY`.
pub async fn api_news(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty());
    let Some(api_key) = api_key else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    if state.store.find_user_by_api_key(api_key).await?.is_none() {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    }

    let articles = recent_articles(&state).await?;
    Ok(Json(articles).into_response())
}

pub async fn writer_apply_page() -> impl IntoResponse {
    HtmlTemplate(ApplyTemplate { status: None })
}

pub async fn writer_apply(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ApplyForm>,
) -> Result<Response, AppError> {
    let status = match writers::apply(state.store.as_ref(), &state.notifier, &form).await {
        Ok(()) => "Thanks! We received your application and will get back to you.".to_string(),
        Err(e) => writer_message(e)?,
    };
    Ok(HtmlTemplate(ApplyTemplate {
        status: Some(status),
    })
    .into_response())
}

pub async fn writer_login_page() -> impl IntoResponse {
    HtmlTemplate(WriterLoginTemplate { status: None })
}

pub async fn writer_login(
    State(state): State<Arc<AppState>>,
    ctx: SessionContext,
    Form(form): Form<LoginForm>,
) -> Result<Response, AppError> {
    match writers::login(state.store.as_ref(), &form).await {
        Ok(writer) => {
            ctx.log_in_writer(&writer.email).await?;
            Ok(Redirect::to("/writers/portal").into_response())
        }
        Err(e) => Ok(HtmlTemplate(WriterLoginTemplate {
            status: Some(writer_message(e)?),
        })
        .into_response()),
    }
}

pub async fn writer_register_page() -> impl IntoResponse {
    HtmlTemplate(WriterRegisterTemplate { status: None })
}

pub async fn writer_register(
    State(state): State<Arc<AppState>>,
    Form(form): Form<WriterRegisterForm>,
) -> Result<Response, AppError> {
    let status = match writers::register(state.store.as_ref(), &form).await {
        Ok(()) => "You are now registered! You can now login.".to_string(),
        Err(e) => writer_message(e)?,
    };
    Ok(HtmlTemplate(WriterRegisterTemplate {
        status: Some(status),
    })
    .into_response())
}

pub async fn writer_create_page(ctx: SessionContext) -> Result<Response, AppError> {
    if ctx.writer_email().await?.is_none() {
        return Ok(Redirect::to("/writers/login").into_response());
    }
    Ok(HtmlTemplate(WriterCreateTemplate {
        status: None,
        article_id: None,
    })
    .into_response())
}

pub async fn writer_create(
    State(state): State<Arc<AppState>>,
    ctx: SessionContext,
    Form(form): Form<ArticleForm>,
) -> Result<Response, AppError> {
    let Some(email) = ctx.writer_email().await? else {
        return Ok(Redirect::to("/writers/login").into_response());
    };

    let template = match writers::create_article(state.store.as_ref(), &email, &form).await {
        Ok(id) => WriterCreateTemplate {
            status: Some("Article created!".to_string()),
            article_id: Some(id),
        },
        Err(e) => WriterCreateTemplate {
            status: Some(writer_message(e)?),
            article_id: None,
        },
    };
    Ok(HtmlTemplate(template).into_response())
}

pub async fn writer_portal(
    State(state): State<Arc<AppState>>,
    ctx: SessionContext,
) -> Result<Response, AppError> {
    let Some(email) = ctx.writer_email().await? else {
        return Ok(Redirect::to("/writers/login").into_response());
    };

    let articles = state.store.articles_by_author(&email).await?;
    Ok(HtmlTemplate(WriterPortalTemplate { email, articles }).into_response())
}

pub async fn writer_logout(ctx: SessionContext) -> Result<Response, AppError> {
    ctx.log_out_writer().await?;
    Ok(Redirect::to("/writers/login").into_response())
}

pub async fn article(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let article = match id.parse::<i64>() {
        Ok(id) => state.store.find_article(id).await?,
        Err(_) => None,
    };

    match article {
        Some(article) => Ok(HtmlTemplate(ArticleTemplate { article }).into_response()),
        None => Ok(not_found(format!("/article/{}", id))),
    }
}
