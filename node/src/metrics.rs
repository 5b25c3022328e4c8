//! # Prometheus Metrics
//!
//! Operational gauges for a running node, scraped at `/metrics` on the
//! configured metrics port.
//!
//! Nothing in the protocol crate knows about Prometheus. A sampler task
//! asks the [`NodeHandle`] for its numbers every few seconds and copies them
//! into the registry. Scrapes never touch the swarm.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use gatenet_protocol::NodeHandle;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// All Prometheus metric handles for the node, in their own registry.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub connected_peers: IntGauge,
    pub lan_routing_table_size: IntGauge,
    pub wan_routing_table_size: IntGauge,
    pub known_peers: IntGauge,
    /// Follow the validator's own counters by adding the difference on
    /// every sample.
    pub records_validated: IntCounter,
    pub records_rejected: IntCounter,
    pub records_selected: IntCounter,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Raises `counter` to `total`. Never goes backwards.
fn advance(counter: &IntCounter, total: u64) {
    let seen = counter.get();
    if total > seen {
        counter.inc_by(total - seen);
    }
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("gatenet".into()), None)?;

        Ok(Self {
            connected_peers: gauge(
                &registry,
                "connected_peers",
                "Number of peers with at least one open connection",
            )?,
            lan_routing_table_size: gauge(
                &registry,
                "lan_routing_table_size",
                "Peers in the LAN DHT routing table",
            )?,
            wan_routing_table_size: gauge(
                &registry,
                "wan_routing_table_size",
                "Peers in the WAN DHT routing table",
            )?,
            known_peers: gauge(&registry, "known_peers", "Peers in the persistent peerstore")?,
            records_validated: counter(
                &registry,
                "records_validated_total",
                "DHT records passed through the validator",
            )?,
            records_rejected: counter(
                &registry,
                "records_rejected_total",
                "DHT records the validator rejected",
            )?,
            records_selected: counter(
                &registry,
                "records_selected_total",
                "Record selections made among competing values",
            )?,
            registry,
        })
    }

    /// Pulls a fresh set of numbers from the node.
    pub async fn sample(&self, node: &NodeHandle) {
        let peers = node.host().connected_peers().await;
        self.connected_peers.set(peers.len() as i64);

        match node.routing().routing_table_size().await {
            Ok(size) => {
                self.lan_routing_table_size.set(size.lan as i64);
                self.wan_routing_table_size.set(size.wan as i64);
            }
            Err(e) => tracing::debug!(error = %e, "routing table size unavailable"),
        }

        self.known_peers.set(node.peerstore().len() as i64);

        let stats = node.validator_stats();
        advance(&self.records_validated, stats.validate_calls);
        advance(
            &self.records_rejected,
            stats.validate_rejections + stats.select_rejections,
        );
        advance(&self.records_selected, stats.select_calls);
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
