//! OCPP 1.6-J protocol layer
//!
//! - `types`: OCPP 1.6 payloads and inbound request dispatch
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)
//! - `engine`: session registry and handler seams the bridge is written against
//! - `server`: WebSocket central system implementing those seams

pub mod engine;
pub mod messages;
pub mod server;
pub mod types;

pub use engine::{ChargePointHandler, Session, SessionRegistry};
pub use messages::*;
pub use server::{station_id_from_path, CentralSystem, CentralSystemConfig, OCPP_SUBPROTOCOL};
pub use types::*;
