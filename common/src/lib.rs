pub mod bridge;
pub mod config;
pub mod error;
pub mod topics;
pub mod types;

pub use bridge::{BridgeEngine, EngineAction};
pub use config::{BridgeConfig, NetworkConfig, RuntimeConfig};
pub use error::ConfigError;
pub use topics::*;
pub use types::{BridgeMode, BulbCommand, Counters, StatsPayload, SwitchStatus};
