//! # OCPP Bridge
//!
//! OCPP 1.6-J central system that bridges charge points to a backend over Redis
//! lists and HTTP.
//!
//! Charge point traffic is normalized into backend events; backend commands are
//! turned into OCPP calls and sent to the connected charge point.
//!
//! ## Architecture
//!
//! ```text
//! Charge points
//!       │ WebSocket, OCPP 1.6-J
//!       ▼
//! ┌───────────────────────────────────────────┐
//! │    ocpp-bridge                            │
//! │  ┌────────────┐       ┌────────────────┐  │
//! │  │ Central    │──────►│ Normalizer     │──┼──► RPUSH events
//! │  │ System     │       └────────────────┘  │         │
//! │  │ (sessions) │◄──────┌────────────────┐  │    GET /api/transaction/tag/{tag}/
//! │  └────────────┘       │ Dispatcher     │◄─┼──── POST /command/
//! │                       └────────────────┘◄─┼──── BLPOP commands
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Events
//!
//! | OCPP request | Event |
//! |--------------|-------|
//! | StatusNotification | `change_connector_status` |
//! | Heartbeat | `health` |
//! | MeterValues | `meter_value` |
//! | StartTransaction | `start_transaction` |
//! | StopTransaction | `stop_transaction` |
//! | DataTransfer | `data_transfer` |
//! | (connect / disconnect) | `connect_charger` / `disconnect_charger` |
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_bridge::{Bridge, BridgeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::new("http://localhost:8000").with_redis("localhost:6379");
//!
//!     let bridge = Bridge::connect(config).await?;
//!     bridge.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod bridge;
pub mod config;
pub mod domain;
pub mod ocpp;

pub use bridge::{Bridge, BridgeError};
pub use config::{BridgeConfig, ConfigError};

// Re-export key types
pub use backend::{EventPublisher, MemoryChannel, RedisChannel, TransactionLookup};
pub use domain::{CommandError, Event, EventKind, EventPayload, RemoteCommandRequest, RemoteCommandResponse};
pub use ocpp::{Action, Call, CallResult, CentralSystem, CentralSystemConfig, Session, SessionRegistry};
