//! Shared lifecycle plumbing every connector composes with (§4.4):
//! status-to-Redis, last-error/last-check tracking, and
//! `connector_status:{id}` publish. Protocol bases hold a `BaseConnector`
//! and delegate their `status_report`/status-transition calls to it rather
//! than reimplementing the bookkeeping.

use jobmesh_common::keys;
use jobmesh_common::model::{ConnectorStatus, ConnectorStatusReport, ProtocolKind};
use redis::AsyncCommands;
use std::sync::RwLock;
use tracing::{debug, warn};

pub struct BaseConnector {
    connector_id: String,
    service_type: String,
    protocol: ProtocolKind,
    redis: redis::Client,
    state: RwLock<ConnectorStatusReport>,
}

impl BaseConnector {
    pub fn new(connector_id: String, service_type: String, protocol: ProtocolKind, redis: redis::Client) -> Self {
        let report = super::new_status_report(&connector_id, &service_type, protocol, ConnectorStatus::Starting);
        BaseConnector { connector_id, service_type, protocol, redis, state: RwLock::new(report) }
    }

    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn report(&self) -> ConnectorStatusReport {
        self.state.read().expect("connector status lock poisoned").clone()
    }

    /// Transition status, persist it to Redis, and publish the change on
    /// `connector_status:{id}` (§4.4 "status changes publish to ...").
    pub async fn set_status(&self, status: ConnectorStatus, last_error: Option<String>) {
        {
            let mut guard = self.state.write().expect("connector status lock poisoned");
            guard.status = status;
            guard.last_error = last_error.clone();
            guard.last_check_ms = super::now_ms();
        }
        self.publish().await;
    }

    pub async fn record_check(&self, healthy: bool) {
        let status = if healthy { ConnectorStatus::Idle } else { ConnectorStatus::Error };
        {
            let mut guard = self.state.write().expect("connector status lock poisoned");
            guard.last_check_ms = super::now_ms();
            if !healthy {
                guard.status = status;
            }
        }
        self.publish().await;
    }

    async fn publish(&self) {
        let report = self.report();
        let body = match serde_json::to_string(&report) {
            Ok(b) => b,
            Err(e) => {
                warn!(connector_id = %self.connector_id, error = %e, "failed to serialize connector status report");
                return;
            }
        };
        let conn = match self.redis.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                warn!(connector_id = %self.connector_id, error = %e, "failed to open redis connection for connector status publish");
                return;
            }
        };
        let mut conn = conn;
        let status_key = format!("connector:status:{}", self.connector_id);
        if let Err(e) = conn.set::<_, _, ()>(&status_key, &body).await {
            warn!(connector_id = %self.connector_id, error = %e, "failed to persist connector status");
        }
        let channel = keys::connector_status_channel(&self.connector_id);
        if let Err(e) = conn.publish::<_, _, i64>(&channel, &body).await {
            debug!(connector_id = %self.connector_id, error = %e, "no subscribers on connector status channel");
        }
    }
}
