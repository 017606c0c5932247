use crate::{
    alert::{manager::AlertManager, provider::MemoryMetricStore, AdvancedAlertRule},
    config::CentralizedLoggingConfig,
    entry::LogEntry,
    hub,
    index::SearchQuery,
    logger::CentralizedLogger,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use slog::{info, Logger};
use std::{
    convert::Infallible,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::runtime::Runtime;
use warp::{http::StatusCode, Filter, Reply};

/// Everything the API layer needs a handle on.
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<CentralizedLogger>,
    pub alerts: Arc<AlertManager>,
    pub metric_store: Arc<MemoryMetricStore>,
}

fn with_state(
    state: ApiState,
) -> impl Filter<Extract = (ApiState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn error_body(message: &str) -> warp::reply::Json {
    warp::reply::json(&serde_json::json!({"error": message}))
}

/// Starts the HTTP/WebSocket API on the given port. On success, returns a
/// Runtime value that the caller must keep live for as long as the server
/// should run.
pub fn start_api_server(state: ApiState, port: u16, logger: &Logger) -> Result<Runtime> {
    let runtime = Runtime::new().context("failed to create runtime for API server")?;

    let hub = Arc::clone(state.pipeline.hub());
    runtime.spawn(hub.run());

    info!(logger, "serving API on 0.0.0.0:{}", port);
    let filter = routes(state);
    runtime.spawn(async move {
        warp::serve(filter)
            .run(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port))
            .await;
    });

    Ok(runtime)
}

/// The complete route tree.
pub fn routes(
    state: ApiState,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let health = warp::get()
        .and(warp::path!("health"))
        .map(|| warp::reply::json(&serde_json::json!({"status": "ok"})));

    let ingest = warp::post()
        .and(warp::path!("api" / "v1" / "logging" / "ingest"))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .map(|state: ApiState, entry: LogEntry| {
            state.pipeline.log(entry);
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"status": "accepted"})),
                StatusCode::OK,
            )
        });

    let ingest_batch = warp::post()
        .and(warp::path!("api" / "v1" / "logging" / "ingest" / "batch"))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .map(|state: ApiState, entries: Vec<serde_json::Value>| {
            let total = entries.len();
            let mut processed = 0usize;
            let mut failed = 0usize;
            for value in entries {
                match serde_json::from_value::<LogEntry>(value) {
                    Ok(entry) => {
                        state.pipeline.log(entry);
                        processed += 1;
                    }
                    Err(_) => failed += 1,
                }
            }
            warp::reply::json(&serde_json::json!({
                "processed": processed,
                "failed": failed,
                "total": total,
            }))
        });

    let stream = warp::get()
        .and(warp::path!("api" / "v1" / "logging" / "stream"))
        .and(with_state(state.clone()))
        .and(warp::ws())
        .map(|state: ApiState, ws: warp::ws::Ws| {
            let hub = Arc::clone(state.pipeline.hub());
            ws.on_upgrade(move |socket| hub::client_connection(socket, hub))
        });

    let get_config = warp::get()
        .and(warp::path!("api" / "v1" / "logging" / "config"))
        .and(with_state(state.clone()))
        .map(|state: ApiState| warp::reply::json(&state.pipeline.config()));

    let put_config = warp::put()
        .and(warp::path!("api" / "v1" / "logging" / "config"))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .map(|state: ApiState, document: CentralizedLoggingConfig| {
            match state.pipeline.apply_config(document) {
                Ok(()) => warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({"status": "applied"})),
                    StatusCode::OK,
                ),
                Err(error) => warp::reply::with_status(
                    error_body(&error.to_string()),
                    StatusCode::BAD_REQUEST,
                ),
            }
        });

    let stats = warp::get()
        .and(warp::path!("api" / "v1" / "logging" / "stats"))
        .and(with_state(state.clone()))
        .map(|state: ApiState| warp::reply::json(&state.pipeline.stats()));

    let outputs = warp::get()
        .and(warp::path!("api" / "v1" / "logging" / "outputs"))
        .and(with_state(state.clone()))
        .map(|state: ApiState| warp::reply::json(&state.pipeline.outputs_info()));

    let flush_output = warp::post()
        .and(warp::path!("api" / "v1" / "logging" / "outputs" / String / "flush"))
        .and(with_state(state.clone()))
        .map(|name: String, state: ApiState| match state.pipeline.flush_output(&name) {
            Ok(true) => warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"status": "flushed"})),
                StatusCode::OK,
            ),
            Ok(false) => warp::reply::with_status(
                error_body(&format!("no output named {:?}", name)),
                StatusCode::NOT_FOUND,
            ),
            Err(error) => warp::reply::with_status(
                error_body(&error.to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        });

    let shippers = warp::get()
        .and(warp::path!("api" / "v1" / "logging" / "shippers"))
        .and(with_state(state.clone()))
        .map(|state: ApiState| warp::reply::json(&state.pipeline.shipper_statuses()));

    let test_shipper = warp::post()
        .and(warp::path!("api" / "v1" / "logging" / "shippers" / String / "test"))
        .and(with_state(state.clone()))
        .map(|name: String, state: ApiState| match state.pipeline.test_shipper(&name) {
            Some(Ok(())) => warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"status": "reachable"})),
                StatusCode::OK,
            ),
            Some(Err(error)) => warp::reply::with_status(
                error_body(&error.to_string()),
                StatusCode::BAD_GATEWAY,
            ),
            None => warp::reply::with_status(
                error_body(&format!("no shipper named {:?}", name)),
                StatusCode::NOT_FOUND,
            ),
        });

    let search = warp::post()
        .and(warp::path!("api" / "v1" / "logging" / "search"))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .map(|state: ApiState, query: SearchQuery| match state.pipeline.search(&query) {
            Some(Ok(result)) => {
                warp::reply::with_status(warp::reply::json(&result), StatusCode::OK)
            }
            Some(Err(error)) => warp::reply::with_status(
                error_body(&error.to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            None => warp::reply::with_status(
                error_body("indexing is disabled"),
                StatusCode::NOT_FOUND,
            ),
        });

    let fields = warp::get()
        .and(warp::path!("api" / "v1" / "logging" / "fields"))
        .and(with_state(state.clone()))
        .map(|state: ApiState| match state.pipeline.index() {
            Some(index) => {
                warp::reply::with_status(warp::reply::json(&index.fields()), StatusCode::OK)
            }
            None => warp::reply::with_status(
                error_body("indexing is disabled"),
                StatusCode::NOT_FOUND,
            ),
        });

    let indices = warp::get()
        .and(warp::path!("api" / "v1" / "logging" / "indices"))
        .and(with_state(state.clone()))
        .map(|state: ApiState| {
            let names: Vec<String> = state
                .pipeline
                .index()
                .map(|index| vec![index.name().to_owned()])
                .unwrap_or_default();
            warp::reply::json(&names)
        });

    let index_stats = warp::get()
        .and(warp::path!("api" / "v1" / "logging" / "indices" / String / "stats"))
        .and(with_state(state.clone()))
        .map(|name: String, state: ApiState| match state.pipeline.index() {
            Some(index) if index.name() == name => {
                warp::reply::with_status(warp::reply::json(&index.stats()), StatusCode::OK)
            }
            _ => warp::reply::with_status(
                error_body(&format!("no index named {:?}", name)),
                StatusCode::NOT_FOUND,
            ),
        });

    let logging_routes = ingest
        .or(ingest_batch)
        .or(stream)
        .or(get_config)
        .or(put_config)
        .or(stats)
        .or(flush_output)
        .or(outputs)
        .or(test_shipper)
        .or(shippers)
        .or(search)
        .or(fields)
        .or(index_stats)
        .or(indices);

    let ingest_metric = warp::post()
        .and(warp::path!("api" / "v1" / "metrics" / "ingest"))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .map(|state: ApiState, sample: MetricIngest| {
            state.metric_store.record(&sample.name, sample.value);
            warp::reply::json(&serde_json::json!({"status": "recorded"}))
        });

    let list_rules = warp::get()
        .and(warp::path!("api" / "v1" / "alerts" / "rules"))
        .and(with_state(state.clone()))
        .map(|state: ApiState| warp::reply::json(&state.alerts.rules()));

    let add_rule = warp::post()
        .and(warp::path!("api" / "v1" / "alerts" / "rules"))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .map(|state: ApiState, rule: AdvancedAlertRule| match state.alerts.add_rule(rule) {
            Ok(()) => warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"status": "registered"})),
                StatusCode::OK,
            ),
            Err(error) => warp::reply::with_status(
                error_body(&error.to_string()),
                StatusCode::BAD_REQUEST,
            ),
        });

    let delete_rule = warp::delete()
        .and(warp::path!("api" / "v1" / "alerts" / "rules" / String))
        .and(with_state(state.clone()))
        .map(|id: String, state: ApiState| {
            if state.alerts.remove_rule(&id) {
                warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({"status": "removed"})),
                    StatusCode::OK,
                )
            } else {
                warp::reply::with_status(
                    error_body(&format!("no rule with id {:?}", id)),
                    StatusCode::NOT_FOUND,
                )
            }
        });

    let list_instances = warp::get()
        .and(warp::path!("api" / "v1" / "alerts" / "instances"))
        .and(with_state(state.clone()))
        .map(|state: ApiState| warp::reply::json(&state.alerts.instances()));

    let transition_instance = warp::post()
        .and(warp::path!("api" / "v1" / "alerts" / "instances" / String / String))
        .and(with_state(state))
        .map(|id: String, action: String, state: ApiState| {
            let result = match action.as_str() {
                "silence" => state.alerts.silence(&id),
                "unsilence" => state.alerts.unsilence(&id),
                "resolve" => state.alerts.resolve(&id),
                _ => {
                    return warp::reply::with_status(
                        error_body(&format!("unknown transition {:?}", action)),
                        StatusCode::NOT_FOUND,
                    )
                }
            };
            match result {
                Ok(instance) => {
                    warp::reply::with_status(warp::reply::json(&instance), StatusCode::OK)
                }
                Err(error) => warp::reply::with_status(
                    error_body(&error.to_string()),
                    StatusCode::CONFLICT,
                ),
            }
        });

    let alert_routes = list_rules
        .or(add_rule)
        .or(delete_rule)
        .or(list_instances)
        .or(transition_instance);

    health.or(logging_routes).or(ingest_metric).or(alert_routes)
}

#[derive(Debug, Deserialize)]
struct MetricIngest {
    name: String,
    value: f64,
    #[serde(default)]
    #[allow(dead_code)]
    labels: std::collections::BTreeMap<String, String>,
}
