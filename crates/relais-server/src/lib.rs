#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

//! Relais Server - HTTP pull API for the event pipeline.
//!
//! External consumers pull change events by cursor, acknowledge them, and
//! inspect pipeline statistics and health:
//!
//! | Method / Path | Purpose |
//! |---|---|
//! | `GET\|POST /api/webhooks/pull` | Cursor-based event pull |
//! | `POST /api/webhooks/mark-processed` | Acknowledge event ids |
//! | `GET /api/webhooks/stats` | Aggregate statistics |
//! | `GET /api/webhooks/health` | Liveness + pending backlog |
//! | `OPTIONS /api/webhooks/options` | CORS preflight |
//!
//! Authentication is a shared-secret `X-API-Key` header; the health
//! endpoint is public. All responses are JSON with permissive CORS
//! headers.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::ApiError;
pub use server::{build_router, serve};
pub use state::AppState;
