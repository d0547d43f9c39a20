//! Charge point request normalization
//!
//! Maps every charge point initiated request onto at most one backend event and
//! produces the acknowledgement sent back to the charge point.
//!
//! | OCPP request        | Event                     | Acknowledgement                         |
//! |---------------------|---------------------------|-----------------------------------------|
//! | StatusNotification  | `change_connector_status` | empty                                   |
//! | Authorize           | -                         | `idTagInfo.status = Accepted`           |
//! | BootNotification    | -                         | Accepted, heartbeat interval, time      |
//! | Heartbeat           | `health`                  | current time                            |
//! | MeterValues         | `meter_value`             | empty                                   |
//! | StartTransaction    | `start_transaction`       | Accepted, transaction id from backend   |
//! | StopTransaction     | `stop_transaction`        | Accepted                                |
//! | DataTransfer        | `data_transfer`           | Accepted                                |
//!
//! Connects and disconnects publish `connect_charger` / `disconnect_charger`.
//! Publishing never changes an acknowledgement.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::backend::{EventPublisher, TransactionLookup};
use crate::domain::{
    ChargerPresence, ConnectorStatusChanged, DataTransferReceived, Event, EventPayload,
    HealthCheck, MeterValuesReported, TransactionStarted, TransactionStopped,
};
use crate::ocpp::types::*;
use crate::ocpp::{ChargePointHandler, OcppError, Session};

/// Heartbeat interval handed out in BootNotification replies, in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL: i32 = 60;

/// Stop reason assumed when the charge point omits it
const DEFAULT_STOP_REASON: &str = "Local";

/// Turns charge point traffic into backend events
pub struct Normalizer {
    publisher: Arc<EventPublisher>,
    transactions: Arc<dyn TransactionLookup>,
    heartbeat_interval: i32,
}

impl Normalizer {
    pub fn new(publisher: Arc<EventPublisher>, transactions: Arc<dyn TransactionLookup>) -> Self {
        Self {
            publisher,
            transactions,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, seconds: i32) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    async fn emit(&self, session: &Session, payload: EventPayload) {
        let event = Event::new(session.host.clone(), payload);
        self.publisher.publish(&event).await;
    }

    /// Transaction id the backend opened for `tag`, 0 when unknown
    async fn transaction_id_for(&self, station: &str, tag: &str) -> i32 {
        match self.transactions.lookup_by_tag(tag).await {
            Ok(record) => record.id,
            Err(e) => {
                error!(station = %station, tag = %tag, "Transaction lookup failed: {}", e);
                0
            }
        }
    }

    async fn start_transaction(
        &self,
        session: &Session,
        req: StartTransactionRequest,
    ) -> StartTransactionResponse {
        let charger = session.station_id.clone();
        let transaction_id = self.transaction_id_for(&charger, &req.id_tag).await;

        info!(
            station = %charger,
            connector = req.connector_id,
            tag = %req.id_tag,
            transaction_id,
            "Transaction started"
        );

        self.emit(
            session,
            EventPayload::TransactionStarted(TransactionStarted {
                charger,
                conn: req.connector_id,
                tag: req.id_tag,
                meter_start: req.meter_start,
            }),
        )
        .await;

        StartTransactionResponse {
            id_tag_info: IdTagInfo::accepted(),
            transaction_id,
        }
    }
}

#[async_trait]
impl ChargePointHandler for Normalizer {
    async fn on_connect(&self, session: &Session) {
        self.emit(
            session,
            EventPayload::Connected(ChargerPresence {
                charger: session.station_id.clone(),
            }),
        )
        .await;
    }

    async fn on_disconnect(&self, session: &Session) {
        self.emit(
            session,
            EventPayload::Disconnected(ChargerPresence {
                charger: session.station_id.clone(),
            }),
        )
        .await;
    }

    async fn handle(
        &self,
        session: &Session,
        request: ChargePointRequest,
    ) -> Result<ChargePointResponse, OcppError> {
        let charger = session.station_id.clone();
        debug!(station = %charger, action = %request.action(), "Handling request");

        let response = match request {
            ChargePointRequest::StatusNotification(req) => {
                self.emit(
                    session,
                    EventPayload::ConnectorStatusChanged(ConnectorStatusChanged {
                        charger,
                        conn: req.connector_id,
                        status: req.status.to_string(),
                    }),
                )
                .await;
                ChargePointResponse::StatusNotification(StatusNotificationResponse {})
            }

            ChargePointRequest::Authorize(req) => {
                debug!(station = %charger, tag = %req.id_tag, "Authorize");
                ChargePointResponse::Authorize(AuthorizeResponse {
                    id_tag_info: IdTagInfo::accepted(),
                })
            }

            ChargePointRequest::BootNotification(req) => {
                info!(
                    station = %charger,
                    vendor = %req.charge_point_vendor,
                    model = %req.charge_point_model,
                    "Boot notification"
                );
                ChargePointResponse::BootNotification(BootNotificationResponse {
                    status: RegistrationStatus::Accepted,
                    current_time: Utc::now(),
                    interval: self.heartbeat_interval,
                })
            }

            ChargePointRequest::Heartbeat(_) => {
                self.emit(session, EventPayload::Health(HealthCheck { charger }))
                    .await;
                ChargePointResponse::Heartbeat(HeartbeatResponse {
                    current_time: Utc::now(),
                })
            }

            ChargePointRequest::MeterValues(req) => {
                self.emit(
                    session,
                    EventPayload::MeterValues(MeterValuesReported {
                        charger,
                        conn: req.connector_id,
                        transaction_id: req.transaction_id,
                        meter_value: req.meter_value,
                    }),
                )
                .await;
                ChargePointResponse::MeterValues(MeterValuesResponse {})
            }

            ChargePointRequest::StartTransaction(req) => {
                ChargePointResponse::StartTransaction(self.start_transaction(session, req).await)
            }

            ChargePointRequest::StopTransaction(req) => {
                info!(station = %charger, transaction_id = req.transaction_id, "Transaction stopped");
                self.emit(
                    session,
                    EventPayload::TransactionStopped(TransactionStopped {
                        charger,
                        transaction_id: req.transaction_id,
                        reason: req.reason.unwrap_or_else(|| DEFAULT_STOP_REASON.to_string()),
                        meter_stop: req.meter_stop,
                    }),
                )
                .await;
                ChargePointResponse::StopTransaction(StopTransactionResponse {
                    id_tag_info: Some(IdTagInfo::accepted()),
                })
            }

            ChargePointRequest::DataTransfer(req) => {
                self.emit(
                    session,
                    EventPayload::DataTransfer(DataTransferReceived {
                        charger,
                        vendor_id: req.vendor_id,
                        message_id: req.message_id,
                        data: req.data.unwrap_or(Value::Null),
                    }),
                )
                .await;
                ChargePointResponse::DataTransfer(DataTransferResponse {
                    status: DataTransferStatus::Accepted,
                    data: None,
                })
            }
        };

        Ok(response)
    }
}
