//! Live broadcast session control plane
//!
//! Governs who may connect to a live session, what state the session is in,
//! and how chat, moderation and donation events are ordered and fanned out.
//! Media transport itself is out of scope; the transcoder is an external
//! process driven through [`clients::TranscoderBackend`].

pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod security;
pub mod services;
pub mod state;
pub mod websocket;

pub use error::{AppError, Result};
