//! Connector manager (§ system overview / §4.3 step 4, §4.4 graceful
//! degradation). Holds one connector per service type, resolves a job's
//! `service_required` to a connector instance (with the `sim`/`-sim`
//! fallback rule), and runs `Initialize()` across the fleet at startup,
//! swapping in an `OfflineStubConnector` for any connector that fails to
//! come up so the capability stays visible as present-but-inactive.

use super::offline_stub::OfflineStubConnector;
use super::Connector;
use jobmesh_common::model::ConnectorStatusReport;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ConnectorManager {
    connectors: HashMap<String, Arc<dyn Connector>>,
    redis: redis::Client,
}

impl ConnectorManager {
    pub fn new(redis: redis::Client, connectors: Vec<Arc<dyn Connector>>) -> Self {
        let mut map = HashMap::new();
        for c in connectors {
            map.insert(c.service_type().to_string(), c);
        }
        ConnectorManager { connectors: map, redis }
    }

    /// Calls `Initialize()` on every connector; any failure is replaced by
    /// an offline stub under the same service-type key (§4.4).
    pub async fn initialize_all(&mut self) {
        let keys: Vec<String> = self.connectors.keys().cloned().collect();
        for service_type in keys {
            let connector = self.connectors.get(&service_type).cloned().expect("key just listed");
            match connector.initialize().await {
                Ok(()) => info!(service_type, connector_id = connector.connector_id(), "connector initialized"),
                Err(e) => {
                    warn!(service_type, error = %e, "connector failed to initialize, registering offline stub");
                    let stub = OfflineStubConnector::new(
                        format!("{service_type}-offline"),
                        service_type.clone(),
                        self.redis.clone(),
                        e.to_string(),
                    )
                    .await;
                    self.connectors.insert(service_type, Arc::new(stub));
                }
            }
        }
    }

    /// Resolve a job's `service_required` to a connector, applying the
    /// sim-fallback rule from §4.3 step 4: any service ending in `-sim` or
    /// containing `sim` falls back to a registered `simulation` connector
    /// if no exact match exists.
    pub fn resolve(&self, service_required: &str) -> Option<Arc<dyn Connector>> {
        if let Some(c) = self.connectors.get(service_required) {
            return Some(c.clone());
        }
        let lower = service_required.to_lowercase();
        if lower.ends_with("-sim") || lower.contains("sim") {
            return self.connectors.get("simulation").cloned();
        }
        None
    }

    /// Looked up by the health monitor and timeout sweeper, which track the
    /// active job's connector by id rather than by service type (a service
    /// type may have been remapped to an offline stub since the job was
    /// claimed).
    pub fn resolve_by_connector_id(&self, connector_id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.values().find(|c| c.connector_id() == connector_id).cloned()
    }

    pub fn service_types(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }

    pub fn aggregate_health(&self) -> Vec<ConnectorStatusReport> {
        self.connectors.values().map(|c| c.status_report()).collect()
    }

    pub async fn cleanup_all(&self) {
        for connector in self.connectors.values() {
            connector.cleanup().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::simulation::SimulationConnector;
    use std::time::Duration;

    fn redis_client() -> redis::Client {
        redis::Client::open("redis://127.0.0.1/").unwrap()
    }

    #[test]
    fn resolves_exact_service_type_match() {
        let redis = redis_client();
        let sim: Arc<dyn Connector> =
            Arc::new(SimulationConnector::new("sim-1".to_string(), redis.clone(), Duration::from_millis(1)));
        let manager = ConnectorManager::new(redis, vec![sim]);
        assert!(manager.resolve("simulation").is_some());
    }

    #[test]
    fn falls_back_to_simulation_for_sim_suffixed_or_containing_service_types() {
        let redis = redis_client();
        let sim: Arc<dyn Connector> =
            Arc::new(SimulationConnector::new("sim-1".to_string(), redis.clone(), Duration::from_millis(1)));
        let manager = ConnectorManager::new(redis, vec![sim]);
        assert!(manager.resolve("comfyui-sim").is_some());
        assert!(manager.resolve("simulated-backend").is_some());
        assert!(manager.resolve("openai").is_none());
    }
}
