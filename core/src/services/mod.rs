pub mod checksum;
pub mod collaborators;
pub mod election;
pub mod heartbeat;
pub mod heartbeat_monitor;
pub mod identity;
pub mod join;
pub mod node_registry;
pub mod reconfigure;
pub mod settings_store;
pub mod status;

pub use election::{ElectionState, LeaderElector};
pub use heartbeat_monitor::heartbeat_monitor;
pub use node_registry::NodeRegistry;
pub use reconfigure::{ApplyMode, ReconfigurationDriver};
pub use settings_store::{SettingsStore, SettingsVersion};
pub use status::StatusAggregator;
