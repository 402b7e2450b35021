pub mod config;
pub mod queue;

pub use config::Settings;
pub use queue::{CheckName, CheckStatus, QueueItem, QueueStats};
