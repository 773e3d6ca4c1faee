pub mod classpath;
pub mod client;
pub mod config;
pub mod error;
pub mod platform;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use processing_ls_updater as updater;

pub use client::{LogNotifier, Notifier, ProtocolClient, StreamBridge};
pub use config::{ConfigSource, Configuration};
pub use error::SessionError;
pub use session::{ReloadOutcome, SessionController, SessionStatus};
