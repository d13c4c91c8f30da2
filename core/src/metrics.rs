//! Prometheus-backed metrics and HTTP exporter.
//!
//! Generalized from the teacher's `chain::metrics::prometheus`: same
//! registry/exporter shape, different counters — blocks and operations
//! ingested/rejected, head switches, and block-validation latency instead
//! of ML-authenticity-specific gauges.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming, header, server::conn::http1, service::service_fn, Method, Request, Response,
    StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use prometheus::{self, Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};

/// Ingest-related Prometheus metrics.
#[derive(Clone)]
pub struct IngestMetrics {
    /// Latency of `put_block` (signature + semantic + chain verification), in seconds.
    pub block_validation_seconds: Histogram,
    /// Total blocks accepted by `update_blocks`/`put_block`.
    pub blocks_ingested: IntCounter,
    /// Total blocks rejected during verification or chain checks.
    pub blocks_rejected: IntCounter,
    /// Total operations accepted (persisted via `upsert_operation`).
    pub operations_ingested: IntCounter,
    /// Total operations rejected during verification or chain checks.
    pub operations_rejected: IntCounter,
    /// Total times `identifier::set_head` moved the head to a new block.
    pub head_switches: IntCounter,
}

impl IngestMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let block_validation_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "block_validation_seconds",
                "Time to verify and persist one block, in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )?;
        registry.register(Box::new(block_validation_seconds.clone()))?;

        let blocks_ingested = IntCounter::with_opts(Opts::new(
            "blocks_ingested_total",
            "Total number of blocks accepted into the block tree",
        ))?;
        registry.register(Box::new(blocks_ingested.clone()))?;

        let blocks_rejected = IntCounter::with_opts(Opts::new(
            "blocks_rejected_total",
            "Total number of blocks rejected during verification",
        ))?;
        registry.register(Box::new(blocks_rejected.clone()))?;

        let operations_ingested = IntCounter::with_opts(Opts::new(
            "operations_ingested_total",
            "Total number of operations persisted",
        ))?;
        registry.register(Box::new(operations_ingested.clone()))?;

        let operations_rejected = IntCounter::with_opts(Opts::new(
            "operations_rejected_total",
            "Total number of operations rejected during verification",
        ))?;
        registry.register(Box::new(operations_rejected.clone()))?;

        let head_switches = IntCounter::with_opts(Opts::new(
            "head_switches_total",
            "Total number of times the chain head moved to a different branch",
        ))?;
        registry.register(Box::new(head_switches.clone()))?;

        Ok(Self {
            block_validation_seconds,
            blocks_ingested,
            blocks_rejected,
            operations_ingested,
            operations_rejected,
            head_switches,
        })
    }
}

/// Wrapper around a Prometheus registry and the ingest metrics. Wrap in an
/// `Arc` and share across the daemon's connection tasks.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub ingest: IngestMetrics,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("registry".to_string()), None)?;
        let ingest = IngestMetrics::register(&registry)?;
        Ok(Self { registry, ingest })
    }

    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "failed to encode Prometheus metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Runs an HTTP server exposing `GET /metrics` in the Prometheus text
/// format; all other paths return 404. Intended to be `tokio::spawn`ed.
pub async fn run_prometheus_http_server(
    metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let metrics = metrics.clone();
                handle_request(req, metrics)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                tracing::warn!(error = %err, "metrics HTTP connection ended with an error");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = metrics.gather_text();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(body)))
                .unwrap())
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap()),
    }
}
