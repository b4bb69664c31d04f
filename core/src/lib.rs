pub mod api;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod db;
pub mod error;
pub mod peer_client;
pub mod services;
pub mod tls;
pub mod types;
pub mod validation;

pub use config::CoreConfig;
pub use coordinator::{Collaborators, Coordinator};
pub use error::{CoreError, CoreResult};
pub use peer_client::{HttpPeerClient, PeerClient, PeerError};
