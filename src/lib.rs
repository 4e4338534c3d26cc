//! Good Morning Tech - A newsletter subscription site
//!
//! Subscribers pick a delivery hour, a timezone and a set of news sources,
//! and confirm their address through a signed, short-lived link. Accepted
//! writers can log in and publish articles that show up next to the news.

pub mod config;
pub mod confirmation;
pub mod db;
pub mod mailer;
pub mod news;
pub mod registration;
pub mod routes;
pub mod session;
pub mod token;
pub mod webhook;
pub mod writers;
