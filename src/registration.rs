use std::collections::BTreeSet;

use chrono::{Duration, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::config::Config;
use crate::db::{NewUser, Store};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$")
        .expect("email regex is valid")
});

const ALL_WEEKDAYS: [u8; 7] = [1, 2, 3, 4, 5, 6, 7];

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Invalid email")]
    InvalidEmail,
    #[error("Email already used")]
    EmailInUse,
    #[error("Invalid time")]
    InvalidTime,
    #[error("Invalid timezone")]
    InvalidTimezone,
    #[error("Please select at least one news source")]
    NoSourceSelected,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Signup form body. Checkbox groups arrive as repeated keys.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterForm {
    pub email: String,
    pub time: String,
    pub timezone: String,
    #[serde(default)]
    pub frequency: Vec<String>,
    #[serde(default)]
    pub news: Vec<String>,
    #[serde(default)]
    pub extras: Vec<String>,
}

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && EMAIL_RE.is_match(email)
}

/// Parses an hour of day in `%H` form: one or two digits, 0 to 23.
pub fn parse_hour(input: &str) -> Option<u32> {
    let input = input.trim();
    if input.is_empty() || input.len() > 2 || !input.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    input.parse::<u32>().ok().filter(|h| *h < 24)
}

/// Parses a UTC offset such as `+1`, `-9`, `0` or `+5.30` into minutes.
/// The part after the dot is minutes, and the sign covers both parts.
pub fn parse_offset(input: &str) -> Option<i64> {
    let input = input.trim();
    let (negative, rest) = match input.as_bytes().first()? {
        b'+' => (false, &input[1..]),
        b'-' => (true, &input[1..]),
        _ => (false, input),
    };

    let (hours, minutes) = match rest.split_once('.') {
        Some((h, m)) => (h, Some(m)),
        None => (rest, None),
    };

    let is_number = |s: &str| !s.is_empty() && s.len() <= 2 && s.bytes().all(|b| b.is_ascii_digit());
    if !is_number(hours) {
        return None;
    }
    let hours = hours.parse::<i64>().ok().filter(|h| *h <= 14)?;

    let minutes: i64 = match minutes {
        Some(m) if is_number(m) => m.parse::<i64>().ok().filter(|m| *m < 60)?,
        Some(_) => return None,
        None => 0,
    };

    let total = hours * 60 + minutes;
    Some(if negative { -total } else { total })
}

/// Converts a local delivery hour at the given offset to a UTC `HH:MM`.
pub fn to_utc(hour: u32, offset_minutes: i64) -> Option<String> {
    let local = NaiveTime::from_hms_opt(hour, 0, 0)?;
    let (utc, _) = local.overflowing_sub_signed(Duration::minutes(offset_minutes));
    Some(utc.format("%H:%M").to_string())
}

/// Validates a signup form, returning the first failure. Nothing is written.
pub async fn validate(
    form: &RegisterForm,
    store: &dyn Store,
    config: &Config,
) -> Result<NewUser, RegistrationError> {
    let email = form.email.trim();
    if !is_valid_email(email) {
        return Err(RegistrationError::InvalidEmail);
    }

    if let Some(existing) = store.find_user(email).await? {
        if existing.confirmed {
            return Err(RegistrationError::EmailInUse);
        }
    }

    let hour = parse_hour(&form.time).ok_or(RegistrationError::InvalidTime)?;
    let offset = parse_offset(&form.timezone).ok_or(RegistrationError::InvalidTimezone)?;
    let time = to_utc(hour, offset).ok_or(RegistrationError::InvalidTime)?;

    let news: BTreeSet<String> = form
        .news
        .iter()
        .filter(|id| config.source(id).is_some())
        .cloned()
        .collect();
    if news.is_empty() {
        return Err(RegistrationError::NoSourceSelected);
    }

    let mut frequency: BTreeSet<u8> = form
        .frequency
        .iter()
        .filter_map(|day| day.trim().parse::<u8>().ok())
        .filter(|day| ALL_WEEKDAYS.contains(day))
        .collect();
    if frequency.is_empty() {
        frequency = ALL_WEEKDAYS.into_iter().collect();
    }

    let extras = form
        .extras
        .iter()
        .filter(|extra| config.extras.contains(extra))
        .cloned()
        .collect();

    Ok(NewUser {
        email: email.to_string(),
        time,
        frequency,
        news,
        extras,
    })
}
