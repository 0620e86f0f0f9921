//! Local HTTP server for the JSON API, benchmark files and posts.
//!
//! Single-threaded: connections are handled one at a time on the accept loop,
//! and every request goes through the same [`InferenceStore`] so only the
//! quantities affected by the changed knobs are recomputed.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;

use crate::input::{
    parse_accelerator, parse_concurrency, parse_flag, parse_model, parse_precision,
    parse_tensor_parallelism, resolve_precision, InputError, SeqLengthField,
};
use crate::model::{Accelerator, ModelPreset, Precision, WorkloadConfig};
use crate::posts::{self, PostError};
use crate::sidenotes::Sidenotes;
use crate::store::InferenceStore;

/// Everything a request handler needs.
pub struct ServerState {
    base: WorkloadConfig,
    base_model: ModelPreset,
    store: InferenceStore,
    /// Sequence lengths behave as editable fields: the last accepted value
    /// persists across requests and rejected text never reaches the store.
    isl_field: SeqLengthField,
    osl_field: SeqLengthField,
    sidenotes: Sidenotes,
    data_dir: PathBuf,
    posts_dir: PathBuf,
}

impl ServerState {
    pub fn new(base: WorkloadConfig, model: ModelPreset, data_dir: PathBuf, posts_dir: PathBuf) -> Result<Self> {
        let store = InferenceStore::new(&base, &model.spec()).context("building inference graph")?;
        let sidenotes = Sidenotes::new().context("compiling sidenote patterns")?;
        Ok(Self {
            isl_field: SeqLengthField::new(base.input_seq_length),
            osl_field: SeqLengthField::new(base.output_seq_length),
            base,
            base_model: model,
            store,
            sidenotes,
            data_dir,
            posts_dir,
        })
    }
}

/// Run the HTTP server on the specified port.
pub fn run_server(mut state: ServerState, port: u16) -> Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).with_context(|| format!("binding to {}", addr))?;

    println!("=== infercost server ===");
    println!("Server running at: http://{}", addr);
    println!("Press Ctrl+C to stop\n");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => handle_connection(stream, &mut state),
            Err(e) => tracing::warn!(error = %e, "connection error"),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, state: &mut ServerState) {
    let mut buffer = [0; 4096];
    let n = match stream.read(&mut buffer) {
        Ok(n) => n,
        Err(e) => {
            tracing::debug!(error = %e, "failed to read request");
            return;
        }
    };

    let request = String::from_utf8_lossy(&buffer[..n]);
    let first_line = request.lines().next().unwrap_or("");
    let response = route(first_line, state);
    tracing::info!(request = first_line, status = response.status, "handled");

    if let Err(e) = stream
        .write_all(response.to_http().as_bytes())
        .and_then(|_| stream.flush())
    {
        tracing::debug!(error = %e, "failed to write response");
    }
}

/// Status, content type and body of a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Response {
    fn new(status: u16, content_type: &'static str, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(body) => Self::new(200, "application/json", body),
            Err(e) => Self::error(500, &e.to_string()),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::new(status, "application/json", json!({ "error": message }).to_string())
    }

    fn markdown(body: String) -> Self {
        Self::new(200, "text/markdown; charset=utf-8", body)
    }

    pub fn to_http(&self) -> String {
        http_response(self.status, self.content_type, &self.body)
    }
}

/// Dispatch on the request line, e.g. `GET /api/metrics?tp=4 HTTP/1.1`.
pub fn route(request_line: &str, state: &mut ServerState) -> Response {
    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(m), Some(t)) => (m, t),
        _ => return Response::error(400, "malformed request line"),
    };
    if method != "GET" {
        return Response::error(405, "only GET is supported");
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, extract_query(q)),
        None => (target, HashMap::new()),
    };

    if path == "/api/metrics" {
        serve_metrics(&query, state)
    } else if path == "/api/accelerators" {
        serve_accelerators()
    } else if let Some(rest) = path.strip_prefix("/benchmark-data/") {
        serve_benchmark_file(&state.data_dir, rest)
    } else if let Some(slug) = path.strip_prefix("/blog/").and_then(|p| p.strip_suffix("/md")) {
        match posts::load_body(&state.posts_dir, slug) {
            Ok(body) => Response::markdown(body),
            Err(e) => post_error(e),
        }
    } else if let Some(slug) = path.strip_prefix("/blog/") {
        match posts::load_body(&state.posts_dir, slug.trim_end_matches('/')) {
            Ok(body) => Response::markdown(state.sidenotes.transform(&body)),
            Err(e) => post_error(e),
        }
    } else {
        Response::new(404, "text/plain", "Not Found")
    }
}

fn extract_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            params.insert(key.to_string(), value.to_string());
        }
    }
    params
}

/// Base config with every query parameter that is present applied, except
/// the sequence lengths, which go through the fields.
fn config_from_query(
    query: &HashMap<String, String>,
    base: &WorkloadConfig,
    base_model: ModelPreset,
) -> Result<(WorkloadConfig, ModelPreset), InputError> {
    let mut config = base.clone();
    if let Some(v) = query.get("tp") {
        config.tensor_parallelism = parse_tensor_parallelism(v)?;
    }
    if let Some(v) = query.get("conc") {
        config.concurrent_users = parse_concurrency(v)?;
    }
    if let Some(v) = query.get("accelerator") {
        config.accelerator = parse_accelerator(v)?;
    }
    if let Some(v) = query.get("precision") {
        config.precision = parse_precision(v)?;
    }
    if let Some(v) = query.get("chunked") {
        config.chunked_prefill = parse_flag(v)?;
    }
    config.precision = resolve_precision(config.accelerator, config.precision);

    let model = match query.get("model") {
        Some(v) => parse_model(v)?,
        None => base_model,
    };
    Ok((config, model))
}

fn serve_metrics(query: &HashMap<String, String>, state: &mut ServerState) -> Response {
    let (mut config, model) = match config_from_query(query, &state.base, state.base_model) {
        Ok(v) => v,
        Err(e) => return Response::error(400, &e.to_string()),
    };

    let mut rejected = Vec::new();
    for (key, field) in [("isl", &mut state.isl_field), ("osl", &mut state.osl_field)] {
        if let Some(text) = query.get(key) {
            if field.input(text).is_none() {
                rejected.push(key);
            }
        }
    }
    config.input_seq_length = state.isl_field.value();
    config.output_seq_length = state.osl_field.value();
    let fields = json!({
        "isl": { "text": state.isl_field.text(), "invalid": state.isl_field.is_invalid() },
        "osl": { "text": state.osl_field.text(), "invalid": state.osl_field.is_invalid() },
    });
    state.isl_field.blur();
    state.osl_field.blur();

    let updated = state
        .store
        .set_config(&config)
        .and_then(|mut touched| {
            touched.extend(state.store.set_model(&model.spec())?);
            Ok(touched)
        })
        .and_then(|touched| Ok((touched, state.store.config()?, state.store.snapshot()?)));

    match updated {
        Ok((touched, stored, metrics)) => {
            tracing::debug!(invalidated = touched.len(), rejected = ?rejected, "metrics request");
            Response::json(&json!({
                "config": stored,
                "model": model.name(),
                "metrics": metrics,
                "invalidated": touched,
                "fields": fields,
                "rejected": rejected,
            }))
        }
        Err(e) => {
            tracing::error!(error = %e, "inference graph failed");
            Response::error(500, &e.to_string())
        }
    }
}

#[derive(Serialize)]
struct AcceleratorInfo {
    id: &'static str,
    name: &'static str,
    compute_fp4: Option<f64>,
    compute_fp8: f64,
    compute_fp16: f64,
    memory_bandwidth: f64,
    precisions: Vec<&'static str>,
}

fn serve_accelerators() -> Response {
    let items: Vec<AcceleratorInfo> = Accelerator::ALL
        .iter()
        .map(|a| {
            let spec = a.spec();
            AcceleratorInfo {
                id: a.id(),
                name: spec.name,
                compute_fp4: spec.compute_fp4,
                compute_fp8: spec.compute_fp8,
                compute_fp16: spec.compute_fp16,
                memory_bandwidth: spec.memory_bandwidth,
                precisions: a.supported_precisions().iter().map(Precision::name).collect(),
            }
        })
        .collect();
    Response::json(&items)
}

fn serve_benchmark_file(data_dir: &Path, rest: &str) -> Response {
    let safe = !rest.is_empty()
        && rest
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if !safe {
        return Response::error(400, "invalid benchmark path");
    }

    let path = data_dir.join("benchmark-data").join(rest);
    match fs::read_to_string(&path) {
        Ok(body) => Response::new(200, "application/json", body),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Response::new(404, "text/plain", "Not Found"),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read benchmark file");
            Response::error(500, "failed to read benchmark file")
        }
    }
}

fn post_error(e: PostError) -> Response {
    match e {
        PostError::BadSlug(_) => Response::error(400, &e.to_string()),
        PostError::NotFound(_) => Response::new(404, "text/plain", "Not Found"),
        PostError::Io { .. } => {
            tracing::warn!(error = %e, "failed to read post");
            Response::error(500, "failed to read post")
        }
    }
}

fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    };

    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n{}",
        status, status_text, content_type, body.len(), body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{evaluate, Metrics};

    fn state(dir: &Path) -> ServerState {
        ServerState::new(
            WorkloadConfig::default(),
            ModelPreset::Llama70B,
            dir.join("public"),
            dir.join("posts"),
        )
        .unwrap()
    }

    fn get(state: &mut ServerState, target: &str) -> Response {
        route(&format!("GET {} HTTP/1.1", target), state)
    }

    #[test]
    fn test_metrics_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = state(dir.path());
        let resp = get(&mut s, "/api/metrics");
        assert_eq!(resp.status, 200);

        let v: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(v["metrics"]["kv_cache_per_token"], 163_840.0);
        assert_eq!(v["config"]["tensor_parallelism"], 2);
    }

    #[test]
    fn test_metrics_query_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = state(dir.path());
        let resp = get(&mut s, "/api/metrics?tp=4&conc=32&accelerator=b200&precision=fp4&chunked=false");
        assert_eq!(resp.status, 200);

        let config = WorkloadConfig {
            tensor_parallelism: 4,
            concurrent_users: 32,
            accelerator: Accelerator::B200,
            precision: Precision::FP4,
            chunked_prefill: false,
            ..Default::default()
        };
        let expected: Metrics = evaluate(&config, &ModelPreset::Llama70B.spec());
        let v: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        let throughput = v["metrics"]["throughput"].as_f64().unwrap();
        assert!((throughput - expected.throughput).abs() / expected.throughput < 1e-12);
        assert_eq!(v["config"]["precision"], "FP4");
    }

    #[test]
    fn test_metrics_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = state(dir.path());
        let resp = get(&mut s, "/api/metrics?accelerator=tpu");
        assert_eq!(resp.status, 400);
        assert!(resp.body.contains("unknown accelerator"));
        assert_eq!(get(&mut s, "/api/metrics?tp=3").status, 400);
    }

    #[test]
    fn test_invalid_seq_length_keeps_prior_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = state(dir.path());

        let resp = get(&mut s, "/api/metrics?isl=0");
        assert_eq!(resp.status, 200);
        let v: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(v["config"]["input_seq_length"], 1024);
        assert_eq!(v["rejected"], json!(["isl"]));
        assert_eq!(v["fields"]["isl"], json!({ "text": "0", "invalid": true }));

        get(&mut s, "/api/metrics?isl=2048");
        let resp = get(&mut s, "/api/metrics?isl=12abc&osl=512");
        let v: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(v["config"]["input_seq_length"], 2048);
        assert_eq!(v["config"]["output_seq_length"], 512);
        assert_eq!(v["rejected"], json!(["isl"]));

        // The rejected text is gone on the next request.
        let resp = get(&mut s, "/api/metrics");
        let v: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(v["fields"]["isl"], json!({ "text": "2048", "invalid": false }));
        assert_eq!(v["config"]["input_seq_length"], 2048);
        assert_eq!(v["rejected"], json!([]));
    }

    #[test]
    fn test_repeat_request_invalidates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = state(dir.path());
        get(&mut s, "/api/metrics?tp=4");
        let resp = get(&mut s, "/api/metrics?tp=4");
        let v: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(v["invalidated"].as_array().map(|a| a.len()), Some(0));
    }

    #[test]
    fn test_accelerators() {
        let resp = serve_accelerators();
        let v: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        let list = v.as_array().unwrap();
        assert_eq!(list.len(), 6);
        let h100 = list.iter().find(|a| a["id"] == "H100").unwrap();
        assert_eq!(h100["precisions"], json!(["FP8", "FP16"]));
    }

    #[test]
    fn test_benchmark_files() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("public/benchmark-data/1k1k-70b/H100");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("FP8.json"), "[]").unwrap();

        let mut s = state(dir.path());
        let ok = get(&mut s, "/benchmark-data/1k1k-70b/H100/FP8.json");
        assert_eq!((ok.status, ok.body.as_str()), (200, "[]"));
        assert_eq!(get(&mut s, "/benchmark-data/1k1k-70b/B200/FP8.json").status, 404);
        assert_eq!(get(&mut s, "/benchmark-data/../secret").status, 400);
    }

    #[test]
    fn test_blog_routes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("posts")).unwrap();
        fs::write(
            dir.path().join("posts/hello.md"),
            "---\ntitle: Hello\n---\n[>_x]: hello\nSee [>_x] here.",
        )
        .unwrap();
        let mut s = state(dir.path());

        let raw = get(&mut s, "/blog/hello/md");
        assert_eq!(raw.status, 200);
        assert_eq!(raw.content_type, "text/markdown; charset=utf-8");
        assert_eq!(raw.body, "[>_x]: hello\nSee [>_x] here.");

        let rendered = get(&mut s, "/blog/hello");
        assert!(rendered.body.starts_with("See <span class=\"sidenote-unnumbered-wrapper\""));

        assert_eq!(get(&mut s, "/blog/nope/md").status, 404);
    }

    #[test]
    fn test_unknown_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = state(dir.path());
        assert_eq!(get(&mut s, "/nothing").status, 404);
        assert_eq!(route("", &mut s).status, 400);
        assert_eq!(route("POST /api/metrics HTTP/1.1", &mut s).status, 405);
    }

    #[test]
    fn test_http_framing() {
        let text = http_response(200, "text/plain", "hi");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }
}
