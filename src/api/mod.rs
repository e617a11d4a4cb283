//! REST and WebSocket API surface.

pub mod routes;

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::{JwtHandler, RevocationRegistry};
use crate::bus::Publisher;
use crate::config::Settings;
use crate::hub::ClientHub;
use crate::orders::OrderEngineHandle;
use crate::pipeline::TickPipeline;
use crate::reconciler::Reconciler;
use crate::registry::InstrumentRegistry;
use crate::store::SubscriptionStore;
use crate::upstream::{ConnectionPool, SessionOrchestrator};

/// Application state shared by every handler.
#[derive(Clone)]
pub struct ApiState {
    pub settings: Arc<Settings>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub registry: Arc<InstrumentRegistry>,
    pub sessions: Arc<SessionOrchestrator>,
    pub pool: Arc<ConnectionPool>,
    pub pipeline: Arc<TickPipeline>,
    pub reconciler: Arc<Reconciler>,
    pub orders: OrderEngineHandle,
    pub hub: Arc<ClientHub>,
    pub publisher: Arc<Publisher>,
    pub jwt: Arc<JwtHandler>,
    pub revocations: Arc<RevocationRegistry>,
    pub prometheus: PrometheusHandle,
}
