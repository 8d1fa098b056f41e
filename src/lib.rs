//! SwiftTunnel server selector
//!
//! Chooses which public VPN relay to connect to and keeps trying others when
//! a connection fails. The actual tunnel is driven through
//! [`vpn::TunnelController`]; this crate only decides where to point it.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use swifttunnel_selector::{EngineConfig, VpnConnection};
//! # async fn run(tunnel: Arc<dyn swifttunnel_selector::vpn::TunnelController>) {
//! swifttunnel_selector::init_logging();
//! let (_status_tx, status_rx) = tokio::sync::mpsc::unbounded_channel();
//! let conn = VpnConnection::with_defaults(EngineConfig::default(), tunnel, status_rx).unwrap();
//! match conn.connect().await {
//!     Ok(host) => println!("connected to {host}"),
//!     Err(e) => eprintln!("{e} (code {})", e.code()),
//! }
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod vpn;

pub use config::EngineConfig;
pub use error::SdkError;
pub use events::{EngineEvent, EventBus};
pub use vpn::{ConnectionState, VpnConnection};

/// Initialise the logger (ignore errors if already set).
pub fn init_logging() {
    let _ = env_logger::try_init();
    log::info!(
        "SwiftTunnel selector v{} initialising",
        env!("CARGO_PKG_VERSION")
    );
}
