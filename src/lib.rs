pub mod activity;
pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod paths;
pub mod record;
pub mod usage;
pub mod util;
pub mod watcher;

pub use activity::{ActivityTokens, ActivityUpdate};
pub use config::EngineSettings;
pub use engine::{PassStats, SessionQuery, UsageEngine};
pub use usage::{TokenUsage, UsageRow};
