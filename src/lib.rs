//! ghswitch - Git hosting identity switching
//!
//! Switches the machine between named identities (work, personal, ...) so that
//! exactly one SSH key is offered to the hosting platform, Git commits carry the
//! matching author, and each identity's access token stays encrypted on disk.
//!
//! The engine is a library: command routing and presentation belong to the
//! embedding binary, which calls [`init_logging`] once and drives
//! [`switch::IdentitySwitcher`].

pub mod config;
pub mod error;
pub mod git;
pub mod platform;
pub mod process;
pub mod ssh;
pub mod switch;

pub use config::{ConfigFile, ConfigStorage, ConfigStore, Identity};
pub use error::{EngineError, SwitchError};
pub use switch::{DiagnosticReport, IdentitySwitcher, Issue, IssueKind, SwitchReport, SwitchStep};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber (`RUST_LOG`, default `info`)
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
