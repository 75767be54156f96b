pub mod data;
pub mod error;
pub mod model;
pub mod notify;
pub mod persist;
pub mod report;
pub mod watch;

pub use data::Database;
pub use error::{CoreError, Result};
pub use notify::{DiscordNotifier, Notifier};
pub use persist::{SaveReport, save_scan};
pub use watch::{SchedulerConfig, TickReport, WatchRequest, WatchScheduler};
