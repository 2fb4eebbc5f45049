//! HTTP statistics endpoint for a running broker
//!
//! Serves read-only views over [`MessageBroker`] for operators and
//! orchestration probes.

use crate::broker::MessageBroker;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// HTTP server exposing broker health and statistics
pub struct StatsServer {
    broker: MessageBroker,
    port: u16,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    running: bool,
    workers_total: usize,
    workers_healthy: usize,
    queue_size: usize,
    queue_warning: bool,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

impl StatsServer {
    pub fn new(broker: MessageBroker, port: u16) -> Self {
        Self { broker, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All routes, without binding a socket
    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let broker = self.broker.clone();
        let with_broker = warp::any().map(move || broker.clone());

        // GET /health - 200 when running with every worker healthy
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_broker.clone())
            .and_then(|broker: MessageBroker| async move {
                let status = health_status(&broker);
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            });

        // GET /stats - full statistics snapshot
        let stats_route = warp::path("stats")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_broker.clone())
            .and_then(|broker: MessageBroker| async move {
                Ok::<_, Infallible>(warp::reply::json(&broker.stats()))
            });

        let dead_letters_route = warp::path("dead-letters")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_broker)
            .and_then(|broker: MessageBroker| async move {
                Ok::<_, Infallible>(warp::reply::json(&broker.dead_letters()))
            });

        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                })
            });

        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints = BTreeMap::from([
                ("/health", "Broker health; 503 when stopped or a worker is unhealthy"),
                ("/stats", "Full statistics snapshot"),
                ("/dead-letters", "Dead-lettered messages, oldest first"),
                ("/live", "Liveness probe"),
            ]);
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        health_route
            .or(stats_route)
            .or(dead_letters_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Serve until the task is dropped
    pub async fn start(self) {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        tracing::info!(port = self.port, "Starting stats server");
        warp::serve(self.routes()).run(addr).await;
    }
}

fn health_status(broker: &MessageBroker) -> HealthStatus {
    let stats = broker.stats();
    let workers_healthy = stats.workers.iter().filter(|w| w.is_healthy).count();
    let healthy = stats.running && stats.all_workers_healthy();

    HealthStatus {
        status: if healthy { "healthy" } else { "degraded" },
        running: stats.running,
        workers_total: stats.workers.len(),
        workers_healthy,
        queue_size: stats.queue_size,
        queue_warning: stats.queue_warning,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use serde_json::Value;

    fn server() -> StatsServer {
        let broker = MessageBroker::new(BrokerConfig::for_testing()).unwrap();
        StatsServer::new(broker, 0)
    }

    #[tokio::test]
    async fn test_health_unavailable_when_stopped() {
        let server = server();
        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&server.routes())
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn test_health_ok_when_running() {
        let server = server();
        server.broker.start().await.unwrap();

        let response = warp::test::request()
            .path("/health")
            .reply(&server.routes())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["workers_total"], 2);
        assert_eq!(body["workers_healthy"], 2);

        server.broker.stop().await;
    }

    #[tokio::test]
    async fn test_stats_endpoint_returns_snapshot() {
        let server = server();
        let response = warp::test::request()
            .path("/stats")
            .reply(&server.routes())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["messages_sent"], 0);
        assert_eq!(body["queue_capacity"], 1000);
    }

    #[tokio::test]
    async fn test_dead_letters_and_live_endpoints() {
        let server = server();

        let response = warp::test::request()
            .path("/dead-letters")
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"[]");

        let response = warp::test::request()
            .path("/live")
            .reply(&server.routes())
            .await;
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["alive"], true);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let server = server();
        let response = warp::test::request()
            .path("/metrics")
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
