//! HTTP routes.

pub mod health;
pub mod processed;
pub mod pull;
pub mod stats;

pub use health::{health_handler, options_handler};
pub use processed::mark_processed_handler;
pub use pull::{pull_get_handler, pull_post_handler};
pub use stats::stats_handler;
