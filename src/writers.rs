use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString},
    Argon2, PasswordVerifier,
};
use serde::Deserialize;
use tracing::{error, info};

use crate::db::{NewArticle, NewWriter, Store, Writer};
use crate::webhook::Notifier;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("Please confirm your email first, can be done by registering with this email again.")]
    NotConfirmed,
    #[error("You are already a writer!")]
    AlreadyWriter,
    #[error("You have already applied!")]
    AlreadyApplied,
    #[error("Passwords dont match!")]
    PasswordMismatch,
    #[error("You are not a writer! Please apply first")]
    NotAccepted,
    #[error("You are already registered! Please login")]
    AlreadyRegistered,
    #[error("You are not a writer!")]
    NotWriter,
    #[error("You have not set a password yet! Please register first")]
    NotRegistered,
    #[error("Wrong password!")]
    WrongPassword,
    #[error("Please fill in {0}")]
    MissingField(&'static str),
    #[error("Password hashing failed: {0}")]
    Hashing(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyForm {
    pub email: String,
    pub name: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterRegisterForm {
    pub email: String,
    pub password: String,
    pub password_confirm: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArticleForm {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
}

pub fn hash_password(plain: &str) -> Result<String, WriterError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            WriterError::Hashing(e.to_string())
        })
}

pub fn verify_password(plain: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            error!(error = %e, "argon2 parse hash error");
            false
        }
    }
}

pub async fn apply(
    store: &dyn Store,
    notifier: &Notifier,
    form: &ApplyForm,
) -> Result<(), WriterError> {
    let email = form.email.trim();
    let subscribed = store.find_user(email).await?.is_some_and(|u| u.confirmed);
    if !subscribed {
        return Err(WriterError::NotConfirmed);
    }

    if let Some(writer) = store.find_writer(email).await? {
        return Err(if writer.accepted {
            WriterError::AlreadyWriter
        } else {
            WriterError::AlreadyApplied
        });
    }

    let name = form.name.trim();
    if name.is_empty() {
        return Err(WriterError::MissingField("your name"));
    }

    store
        .insert_writer(&NewWriter {
            email: email.to_string(),
            name: name.to_string(),
            reasoning: form.reasoning.trim().to_string(),
        })
        .await?;
    info!("Writer application received from {}", email);

    notifier.writer_applied(name, email, form.reasoning.trim()).await;
    Ok(())
}

/// Sets the password of an accepted writer, once.
pub async fn register(store: &dyn Store, form: &WriterRegisterForm) -> Result<(), WriterError> {
    if form.password != form.password_confirm {
        return Err(WriterError::PasswordMismatch);
    }
    if form.password.is_empty() {
        return Err(WriterError::MissingField("a password"));
    }

    let email = form.email.trim();
    let writer = accepted_writer(store, email)
        .await?
        .ok_or(WriterError::NotAccepted)?;
    if writer.password.is_some() {
        return Err(WriterError::AlreadyRegistered);
    }

    let hash = hash_password(&form.password)?;
    if !store.set_writer_password(email, &hash).await? {
        // Lost a race with another registration for the same writer
        return Err(WriterError::AlreadyRegistered);
    }
    info!("Writer {} registered", email);
    Ok(())
}

pub async fn login(store: &dyn Store, form: &LoginForm) -> Result<Writer, WriterError> {
    let email = form.email.trim();
    let writer = accepted_writer(store, email)
        .await?
        .ok_or(WriterError::NotWriter)?;
    let hash = writer
        .password
        .as_deref()
        .ok_or(WriterError::NotRegistered)?;

    if !verify_password(&form.password, hash) {
        return Err(WriterError::WrongPassword);
    }
    Ok(writer)
}

/// Publishes an article for the writer logged in as `email`.
pub async fn create_article(
    store: &dyn Store,
    email: &str,
    form: &ArticleForm,
) -> Result<i64, WriterError> {
    let writer = accepted_writer(store, email)
        .await?
        .ok_or(WriterError::NotWriter)?;

    let title = form.title.trim();
    if title.is_empty() {
        return Err(WriterError::MissingField("a title"));
    }
    if form.content.trim().is_empty() {
        return Err(WriterError::MissingField("some content"));
    }

    let id = store
        .insert_article(&NewArticle {
            title: title.to_string(),
            description: form.description.trim().to_string(),
            content: form.content.clone(),
            author: writer.name,
            author_email: writer.email,
        })
        .await?;
    info!("Article {} published by {}", id, email);
    Ok(id)
}

async fn accepted_writer(store: &dyn Store, email: &str) -> anyhow::Result<Option<Writer>> {
    Ok(store.find_writer(email).await?.filter(|w| w.accepted))
}
