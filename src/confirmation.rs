//! Email confirmation handshake.
//!
//! `request_confirmation` mails a signed link, `verify_token` checks the link
//! when the user clicks "Confirm", and `consume_confirmation` applies the
//! pending action on the following request. Only a token younger than
//! [`CONFIRMATION_MAX_AGE_SECS`] can confirm or unsubscribe an address.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::Store;
use crate::mailer::{confirmation_email, Mailer};
use crate::session::ConfirmationState;
use crate::token::{TokenError, TokenSigner, CONFIRMATION_MAX_AGE_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Register,
    Leave,
}

impl Purpose {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "register" => Some(Purpose::Register),
            "leave" => Some(Purpose::Leave),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Register => "register",
            Purpose::Leave => "leave",
        }
    }

    /// Where the browser goes once the token has been verified.
    pub fn route(&self) -> &'static str {
        match self {
            Purpose::Register => "/register",
            Purpose::Leave => "/leave",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfirmationError {
    #[error("No subscriber with that email")]
    NotFound,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What `consume_confirmation` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumed {
    Nothing,
    Confirmed(String),
    Unsubscribed(String),
}

pub struct Handshake {
    store: Arc<dyn Store>,
    mailer: Arc<dyn Mailer>,
    signer: TokenSigner,
    base_url: String,
    site_name: String,
}

impl Handshake {
    pub fn new(
        store: Arc<dyn Store>,
        mailer: Arc<dyn Mailer>,
        signer: TokenSigner,
        base_url: &str,
        site_name: &str,
    ) -> Self {
        Self {
            store,
            mailer,
            signer,
            base_url: base_url.trim_end_matches('/').to_string(),
            site_name: site_name.to_string(),
        }
    }

    pub fn confirmation_link(&self, email: &str, token: &str, purpose: Option<Purpose>) -> String {
        let mut link = format!(
            "{}/confirm/{}?token={}",
            self.base_url,
            urlencoding::encode(email),
            urlencoding::encode(token)
        );
        if let Some(purpose) = purpose {
            link.push_str("&next=");
            link.push_str(purpose.as_str());
        }
        link
    }

    /// Mails a fresh confirmation link. Delivery failures are logged, not
    /// returned.
    pub async fn request_confirmation(
        &self,
        email: &str,
        purpose: Option<Purpose>,
    ) -> Result<(), ConfirmationError> {
        if self.store.find_user(email).await?.is_none() {
            return Err(ConfirmationError::NotFound);
        }

        let token = self.signer.sign(email);
        let link = self.confirmation_link(email, &token, purpose);
        let mail = confirmation_email(email, &link, &self.site_name);

        if let Err(e) = self.mailer.send(mail).await {
            warn!("Failed to send confirmation email to {}: {}", email, e);
        } else {
            info!("Confirmation email sent to {}", email);
        }

        Ok(())
    }

    /// Returns the email bound to a token issued within the last five minutes.
    pub fn verify_token(&self, token: &str) -> Result<String, ConfirmationError> {
        Ok(self.signer.verify(token, CONFIRMATION_MAX_AGE_SECS)?)
    }

    /// Applies a verified confirmation. Does nothing unless `state` carries
    /// `confirmed: true` for this same purpose; the caller resets the flag
    /// when something happened.
    pub async fn consume_confirmation(
        &self,
        purpose: Purpose,
        state: Option<&ConfirmationState>,
    ) -> Result<Consumed, ConfirmationError> {
        let Some(state) = state.filter(|s| s.confirmed && s.purpose == Some(purpose)) else {
            return Ok(Consumed::Nothing);
        };

        match purpose {
            Purpose::Register => {
                if !self.store.confirm_user(&state.email).await? {
                    warn!("Confirmed email {} has no subscriber record", state.email);
                }
                info!("Subscriber {} confirmed", state.email);
                Ok(Consumed::Confirmed(state.email.clone()))
            }
            Purpose::Leave => {
                self.store.delete_user(&state.email).await?;
                info!("Subscriber {} unsubscribed", state.email);
                Ok(Consumed::Unsubscribed(state.email.clone()))
            }
        }
    }
}
