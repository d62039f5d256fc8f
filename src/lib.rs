pub mod classifier;
pub mod config;
pub mod credentials;
pub mod detector;
pub mod launcher;
pub mod manager;
pub mod platform;
pub mod probe;
pub mod profile;
pub mod registry;
pub mod session;

#[cfg(feature = "desktop")]
pub mod commands;

#[cfg(test)]
mod testing;

pub use classifier::{Classifier, FailureKind, PatternTable};
pub use config::RdpSettings;
pub use manager::{RdpManager, SessionHandle};
pub use platform::Platform;
pub use profile::ConnectionRequest;
pub use session::{SessionSignal, SessionState, SessionStatus};
