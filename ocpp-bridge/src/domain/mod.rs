//! Backend facing data model
//!
//! - [`events`]: normalized events published on the event channel
//! - [`command`]: remote commands received from the backend

pub mod command;
pub mod events;

pub use command::{
    CommandError, CommandKind, ErrorResponse, QueuedCommand, QueuedPayload, RemoteCommand,
    RemoteCommandRequest, RemoteCommandResponse,
};
pub use events::{
    ChargerPresence, ConnectorStatusChanged, DataTransferReceived, Event, EventKind, EventPayload,
    HealthCheck, MeterValuesReported, TransactionStarted, TransactionStopped,
};
