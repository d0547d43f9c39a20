//! Bridge core
//!
//! - `normalizer`: charge point requests to events and acknowledgements
//! - `validator`: structural checks on backend commands
//! - `dispatcher`: backend commands to charge point calls
//! - `intake`: HTTP command API and command queue consumer
//! - `service`: wiring and lifecycle

pub mod dispatcher;
pub mod intake;
pub mod normalizer;
pub mod service;
pub mod validator;

pub use dispatcher::Dispatcher;
pub use intake::{command_router, CommandQueue};
pub use normalizer::Normalizer;
pub use service::{Bridge, BridgeError};
pub use validator::validate;
