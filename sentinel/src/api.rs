use crate::counters::{ClassifierCounters, CounterSource};
use crate::denylist::DenylistStore;
use crate::state::TelemetryState;
use axum::{
    extract::{ws::{Message, WebSocket}, ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use sentinel_common::Outcome;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub telemetry: Arc<TelemetryState>,
    pub denylist: Arc<dyn DenylistStore>,
    /// `None` when no program is loaded.
    pub counters: Option<Arc<dyn CounterSource>>,
    pub start_time: Instant,
}

impl AppState {
    fn classifier_counters(&self) -> Option<ClassifierCounters> {
        let source = self.counters.as_ref()?;
        match source.snapshot() {
            Ok(counters) => Some(counters),
            Err(e) => {
                tracing::error!("Failed to read classifier counters: {:#}", e);
                None
            }
        }
    }
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: String,
}

struct Metrics {
    registry: Registry,
    packets_total: Family<OutcomeLabels, Counter>,
    events_total: Counter,
    malformed_records_total: Counter,
    auto_denylisted_total: Counter,
    denylist_entries: Gauge,
    /// Held while counters are advanced so concurrent scrapes cannot both
    /// apply the same delta.
    sync: Mutex<()>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let packets_total = Family::<OutcomeLabels, Counter>::default();
        let events_total = Counter::default();
        let malformed_records_total = Counter::default();
        let auto_denylisted_total = Counter::default();
        let denylist_entries = Gauge::default();

        registry.register(
            "sentinel_packets",
            "Packets classified, by outcome",
            packets_total.clone(),
        );
        registry.register(
            "sentinel_events",
            "Telemetry events received from the classifier",
            events_total.clone(),
        );
        registry.register(
            "sentinel_malformed_records",
            "Ring buffer records too short to decode",
            malformed_records_total.clone(),
        );
        registry.register(
            "sentinel_auto_denylisted",
            "Sources denylisted by detection rules",
            auto_denylisted_total.clone(),
        );
        registry.register(
            "sentinel_denylist_entries",
            "Current number of denylist entries",
            denylist_entries.clone(),
        );

        Self {
            registry,
            packets_total,
            events_total,
            malformed_records_total,
            auto_denylisted_total,
            denylist_entries,
            sync: Mutex::new(()),
        }
    }

    /// Brings every metric up to date with the agent's absolute totals.
    fn refresh(&self, state: &AppState) {
        let _guard = self.sync.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(counters) = state.classifier_counters() {
            for outcome in Outcome::ALL {
                let labels = OutcomeLabels {
                    outcome: outcome.name().to_string(),
                };
                sync_counter(&self.packets_total.get_or_create(&labels), counters.get(outcome));
            }
        }
        sync_counter(
            &self.events_total,
            state.telemetry.events_total.load(Ordering::Relaxed),
        );
        sync_counter(
            &self.malformed_records_total,
            state.telemetry.malformed_records.load(Ordering::Relaxed),
        );
        sync_counter(
            &self.auto_denylisted_total,
            state.telemetry.auto_denylisted.load(Ordering::Relaxed),
        );
        self.denylist_entries
            .set(state.denylist.len().unwrap_or(0) as i64);
    }
}

/// prometheus-client counters are monotonic, so they are advanced by the
/// delta to the absolute value held elsewhere. Callers hold `Metrics::sync`.
fn sync_counter(counter: &Counter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    program_loaded: bool,
    events_total: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    events_total: u64,
    events_per_second: f64,
    malformed_records: u64,
    auto_denylisted: u64,
    denylist_entries: usize,
    classifier: Option<ClassifierCounters>,
}

#[derive(Deserialize)]
pub struct LimitParams {
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct DenylistRequest {
    addr: String,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/events", get(get_events))
        .route("/api/sources", get(get_sources))
        .route("/api/denylist", get(get_denylist).post(add_denylist))
        .route("/api/denylist/:addr", delete(remove_denylist))
        .route("/api/stream", get(ws_handler))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| match s.parse::<IpNet>() {
                    Ok(net) => Some(net),
                    Err(_) => {
                        tracing::warn!("Ignoring invalid allowed_ips entry {:?}", s);
                        None
                    }
                })
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    // No ConnectInfo means the router was served without connect info; allow.
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        program_loaded: state.counters.is_some(),
        events_total: state.telemetry.events_total.load(Ordering::Relaxed),
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    let events_total = state.telemetry.events_total.load(Ordering::Relaxed);

    let events_per_second = if uptime > 0 {
        events_total as f64 / uptime as f64
    } else {
        0.0
    };

    Json(StatsResponse {
        uptime_seconds: uptime,
        events_total,
        events_per_second,
        malformed_records: state.telemetry.malformed_records.load(Ordering::Relaxed),
        auto_denylisted: state.telemetry.auto_denylisted.load(Ordering::Relaxed),
        denylist_entries: state.denylist.len().unwrap_or(0),
        classifier: state.classifier_counters(),
    })
}

async fn get_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(100).min(1000);
    Json(serde_json::json!(state.telemetry.recent(limit)))
}

async fn get_sources(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut sources: Vec<_> = state
        .telemetry
        .sources
        .iter()
        .map(|entry| (*entry.key(), entry.value().clone()))
        .collect();

    sources.sort_by(|a, b| b.1.events.cmp(&a.1.events));
    sources.truncate(50);

    let sources: Vec<_> = sources
        .into_iter()
        .map(|(addr, stats)| {
            serde_json::json!({
                "source": addr,
                "stats": stats
            })
        })
        .collect();

    Json(serde_json::json!({ "sources": sources }))
}

async fn get_denylist(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.denylist.entries() {
        Ok(entries) => (StatusCode::OK, Json(serde_json::json!({ "entries": entries }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("{e:#}") })),
        ),
    }
}

async fn add_denylist(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DenylistRequest>,
) -> impl IntoResponse {
    let addr: Ipv4Addr = match req.addr.trim().parse() {
        Ok(addr) => addr,
        Err(_) => {
            let error = format!("invalid IPv4 address {:?}", req.addr);
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": error })),
            );
        }
    };
    match state.denylist.insert(addr) {
        Ok(inserted) => {
            if inserted {
                tracing::info!("Denylisted {} (api)", addr);
            }
            let status = if inserted { StatusCode::CREATED } else { StatusCode::OK };
            (status, Json(serde_json::json!({ "addr": addr, "inserted": inserted })))
        }
        Err(e) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": format!("{e:#}") })),
        ),
    }
}

async fn remove_denylist(
    State(state): State<Arc<AppState>>,
    Path(addr): Path<String>,
) -> StatusCode {
    let Ok(addr) = addr.parse::<Ipv4Addr>() else {
        return StatusCode::BAD_REQUEST;
    };
    match state.denylist.remove(addr) {
        Ok(true) => {
            tracing::info!("Removed {} from denylist (api)", addr);
            StatusCode::NO_CONTENT
        }
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!("Failed to remove {} from denylist: {:#}", addr, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    metrics.refresh(&state);

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        tracing::error!("Failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));

    loop {
        interval.tick().await;

        let stats = serde_json::json!({
            "events_total": state.telemetry.events_total.load(Ordering::Relaxed),
            "auto_denylisted": state.telemetry.auto_denylisted.load(Ordering::Relaxed),
            "classifier": state.classifier_counters(),
        });

        if socket
            .send(Message::Text(stats.to_string()))
            .await
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denylist::MemoryDenylist;
    use crate::state::EventRecord;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct FixedCounters(ClassifierCounters);

    impl CounterSource for FixedCounters {
        fn snapshot(&self) -> anyhow::Result<ClassifierCounters> {
            Ok(self.0)
        }
    }

    fn app_state(counters: Option<ClassifierCounters>) -> Arc<AppState> {
        app_state_with_capacity(counters, 10)
    }

    fn app_state_with_capacity(
        counters: Option<ClassifierCounters>,
        recent: usize,
    ) -> Arc<AppState> {
        Arc::new(AppState {
            telemetry: Arc::new(TelemetryState::new(recent)),
            denylist: Arc::new(MemoryDenylist::new()),
            counters: counters.map(|c| Arc::new(FixedCounters(c)) as Arc<dyn CounterSource>),
            start_time: Instant::now(),
        })
    }

    #[tokio::test]
    async fn test_denylist_round_trip_through_handlers() {
        let state = app_state(None);

        let created = add_denylist(
            State(state.clone()),
            Json(DenylistRequest {
                addr: "198.51.100.1".into(),
            }),
        )
        .await
        .into_response();
        assert_eq!(created.status(), StatusCode::CREATED);

        let again = add_denylist(
            State(state.clone()),
            Json(DenylistRequest {
                addr: "198.51.100.1".into(),
            }),
        )
        .await
        .into_response();
        assert_eq!(again.status(), StatusCode::OK);

        assert_eq!(
            state.denylist.entries().unwrap(),
            vec![Ipv4Addr::new(198, 51, 100, 1)]
        );

        let removed = remove_denylist(State(state.clone()), Path("198.51.100.1".into())).await;
        assert_eq!(removed, StatusCode::NO_CONTENT);
        let missing = remove_denylist(State(state.clone()), Path("198.51.100.1".into())).await;
        assert_eq!(missing, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let state = app_state(None);
        let resp = add_denylist(
            State(state.clone()),
            Json(DenylistRequest {
                addr: "not-an-ip".into(),
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            remove_denylist(State(state), Path("::1".into())).await,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_stats_include_classifier_counters() {
        let mut counters = ClassifierCounters::default();
        counters.add(Outcome::Exported, 3);
        let state = app_state(Some(counters));
        state.telemetry.update(&EventRecord {
            timestamp: 0,
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 1,
            dst_port: 2,
        });

        let Json(stats) = get_stats(State(state.clone())).await;
        assert_eq!(stats.events_total, 1);
        assert_eq!(stats.classifier, Some(counters));

        let Json(health) = get_health(State(state)).await;
        assert!(health.program_loaded);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let mut counters = ClassifierCounters::default();
        counters.add(Outcome::Denylisted, 7);
        let state = app_state(Some(counters));
        state
            .denylist
            .insert(Ipv4Addr::new(192, 0, 2, 1))
            .unwrap();

        let resp = get_metrics(state, Arc::new(Metrics::new()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("sentinel_packets_total{outcome=\"denylisted\"} 7"));
        assert!(text.contains("sentinel_denylist_entries 1"));
    }

    fn record(src: u32, src_port: u16) -> EventRecord {
        EventRecord {
            timestamp: 0,
            src_ip: Ipv4Addr::from(src),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port,
            dst_port: 443,
        }
    }

    async fn get_json(app: Router, uri: &str, peer: [u8; 4]) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 40000))));

        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_allowlist_rejects_peers_outside_cidrs() {
        let state = app_state(None);
        let allowed = vec!["10.0.0.0/8".to_string(), "bogus".to_string()];

        let outside = router(state.clone(), &allowed);
        let (status, _) = get_json(outside, "/api/health", [192, 0, 2, 1]).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let inside = router(state, &allowed);
        let (status, health) = get_json(inside, "/api/health", [10, 1, 2, 3]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "ok");
    }

    #[tokio::test]
    async fn test_empty_allowlist_allows_everyone() {
        let app = router(app_state(None), &[]);
        let (status, _) = get_json(app, "/api/health", [203, 0, 113, 5]).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_events_limit_is_capped() {
        let state = app_state_with_capacity(None, 2000);
        for i in 0..1500u32 {
            state.telemetry.update(&record(0x0a00_0001, i as u16));
        }

        let (status, events) =
            get_json(router(state.clone(), &[]), "/api/events?limit=5000", [127, 0, 0, 1]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(events.as_array().unwrap().len(), 1000);

        let (_, events) = get_json(router(state.clone(), &[]), "/api/events", [127, 0, 0, 1]).await;
        assert_eq!(events.as_array().unwrap().len(), 100);

        let (_, events) = get_json(router(state, &[]), "/api/events?limit=3", [127, 0, 0, 1]).await;
        assert_eq!(events.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sources_are_truncated_to_busiest_fifty() {
        let state = app_state(None);
        for i in 0..60u32 {
            // Source i sends i + 1 events.
            for _ in 0..=i {
                state.telemetry.update(&record(0xc633_6400 + i, 1000));
            }
        }

        let (status, body) = get_json(router(state, &[]), "/api/sources", [127, 0, 0, 1]).await;
        assert_eq!(status, StatusCode::OK);
        let sources = body["sources"].as_array().unwrap();
        assert_eq!(sources.len(), 50);
        assert_eq!(sources[0]["source"], "198.51.100.59");
        assert_eq!(sources[0]["stats"]["events"], 60);
        assert_eq!(sources[49]["stats"]["events"], 11);
    }

    #[test]
    fn test_concurrent_refresh_does_not_double_count() {
        let mut counters = ClassifierCounters::default();
        counters.add(Outcome::Exported, 1000);
        let state = app_state(Some(counters));
        let metrics = Metrics::new();

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..200 {
                        metrics.refresh(&state);
                    }
                });
            }
        });

        let labels = OutcomeLabels {
            outcome: Outcome::Exported.name().to_string(),
        };
        assert_eq!(metrics.packets_total.get_or_create(&labels).get(), 1000);
    }
}
