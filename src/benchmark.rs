//! Measured benchmark results and their comparison with the cost model.
//!
//! Results are JSON arrays of [`BenchmarkRow`] stored under
//! `/benchmark-data/{seq_config}/{hardware}/{precision}.json`, either behind
//! an HTTP base URL or in a local directory with the same layout.
//!
//! A missing or malformed file never fails a report: it becomes
//! [`Lookup::Unavailable`] with a message for the user.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Metrics, WorkloadConfig};

/// Model tag appended to every sequence config.
pub const MODEL_TAG: &str = "70b";

// ============================================================================
// Data
// ============================================================================

/// One measured (TP, concurrency) point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRow {
    #[serde(rename = "Hardware")]
    pub hardware: String,
    #[serde(rename = "Framework")]
    pub framework: String,
    #[serde(rename = "Precision")]
    pub precision: String,
    #[serde(rename = "TP")]
    pub tp: u32,
    #[serde(rename = "Conc")]
    pub conc: u32,
    #[serde(rename = "TTFT (ms)")]
    pub ttft_ms: f64,
    #[serde(rename = "TPOT (ms)")]
    pub tpot_ms: f64,
    #[serde(rename = "E2EL (s)")]
    pub e2el_s: f64,
    #[serde(rename = "TPUT per GPU")]
    pub tput_per_gpu: f64,
}

impl BenchmarkRow {
    /// Decode-phase throughput per GPU implied by the measured TPOT.
    #[inline]
    pub fn actual_throughput_per_gpu(&self) -> f64 {
        self.conc as f64 / (self.tpot_ms / 1000.0) / self.tp as f64
    }
}

fn format_seq_len(len: u32) -> String {
    if len >= 1000 {
        format!("{}k", (len as f64 / 1000.0).round() as u32)
    } else {
        len.to_string()
    }
}

/// Dataset directory name, e.g. `1k1k-70b`.
pub fn seq_config(input_seq_length: u32, output_seq_length: u32) -> String {
    format!(
        "{}{}-{}",
        format_seq_len(input_seq_length),
        format_seq_len(output_seq_length),
        MODEL_TAG
    )
}

/// Identifies one benchmark file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkKey {
    pub seq_config: String,
    pub hardware: &'static str,
    pub precision: &'static str,
}

impl BenchmarkKey {
    pub fn for_config(config: &WorkloadConfig) -> Self {
        Self {
            seq_config: seq_config(config.input_seq_length, config.output_seq_length),
            hardware: config.accelerator.id(),
            precision: config.precision.name(),
        }
    }

    /// `{seq_config}/{hardware}/{precision}`
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.seq_config, self.hardware, self.precision)
    }

    /// Absolute URL path of the file.
    pub fn path(&self) -> String {
        format!("/benchmark-data/{}.json", self.label())
    }

    fn relative_file(&self) -> PathBuf {
        Path::new(&self.seq_config)
            .join(self.hardware)
            .join(format!("{}.json", self.precision))
    }
}

// ============================================================================
// Sources
// ============================================================================

#[derive(Debug, Error)]
pub enum BenchmarkError {
    #[error("No benchmark data available for {0}")]
    NotFound(String),
    #[error("request for {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed benchmark data for {label}: {source}")]
    Parse {
        label: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Where benchmark files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BenchmarkSource {
    /// Site root; the key path is appended. A request that stalls longer
    /// than `timeout` fails.
    Http { base: String, timeout: Duration },
    /// Directory holding the `{seq_config}/{hardware}/{precision}.json` tree.
    Dir(PathBuf),
}

impl BenchmarkSource {
    pub fn fetch(&self, key: &BenchmarkKey) -> Result<Vec<BenchmarkRow>, BenchmarkError> {
        match self {
            Self::Http { base, timeout } => {
                let url = format!("{}{}", base.trim_end_matches('/'), key.path());
                tracing::debug!(%url, ?timeout, "fetching benchmark data");
                let agent = ureq::AgentBuilder::new().timeout(*timeout).build();
                let resp = match agent.get(&url).call() {
                    Ok(resp) => resp,
                    Err(ureq::Error::Status(code, _)) => {
                        tracing::debug!(code, %url, "benchmark request rejected");
                        return Err(BenchmarkError::NotFound(key.label()));
                    }
                    Err(e) => {
                        return Err(BenchmarkError::Http {
                            url,
                            source: Box::new(e),
                        })
                    }
                };
                serde_json::from_reader(resp.into_reader()).map_err(|source| BenchmarkError::Parse {
                    label: key.label(),
                    source,
                })
            }
            Self::Dir(root) => {
                let path = root.join(key.relative_file());
                tracing::debug!(path = %path.display(), "reading benchmark data");
                let file = match File::open(&path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(BenchmarkError::NotFound(key.label()))
                    }
                    Err(source) => return Err(BenchmarkError::Io { path, source }),
                };
                serde_json::from_reader(BufReader::new(file)).map_err(|source| BenchmarkError::Parse {
                    label: key.label(),
                    source,
                })
            }
        }
    }
}

/// Outcome of a benchmark lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Loaded(Vec<BenchmarkRow>),
    Unavailable(String),
}

impl Lookup {
    pub fn rows(&self) -> Option<&[BenchmarkRow]> {
        match self {
            Self::Loaded(rows) => Some(rows),
            Self::Unavailable(_) => None,
        }
    }

    /// Row measured at the configured TP and concurrency.
    pub fn matching(&self, config: &WorkloadConfig) -> Option<&BenchmarkRow> {
        self.rows()
            .and_then(|rows| matching_row(rows, config.tensor_parallelism, config.concurrent_users))
    }
}

/// Fetch the rows for `config`, folding any failure into `Unavailable`.
pub fn lookup(source: &BenchmarkSource, config: &WorkloadConfig) -> Lookup {
    let key = BenchmarkKey::for_config(config);
    match source.fetch(&key) {
        Ok(rows) => {
            tracing::debug!(key = %key.label(), rows = rows.len(), "benchmark data loaded");
            Lookup::Loaded(rows)
        }
        Err(e) => {
            tracing::warn!(error = %e, "benchmark data unavailable");
            Lookup::Unavailable(e.to_string())
        }
    }
}

pub fn matching_row(rows: &[BenchmarkRow], tp: u32, users: u32) -> Option<&BenchmarkRow> {
    rows.iter().find(|r| r.tp == tp && r.conc == users)
}

// ============================================================================
// Last-Write-Wins Loader
// ============================================================================

/// Handle for one in-flight lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

/// Holds the latest lookup result. Completions that were overtaken by a
/// newer request are dropped.
#[derive(Debug, Default)]
pub struct BenchmarkLoader {
    generation: u64,
    current: Option<Lookup>,
}

impl BenchmarkLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request; invalidates every earlier ticket.
    pub fn begin(&mut self) -> Ticket {
        self.generation += 1;
        Ticket(self.generation)
    }

    /// Store `lookup` if `ticket` is still the latest. Returns whether it was kept.
    pub fn complete(&mut self, ticket: Ticket, lookup: Lookup) -> bool {
        if ticket.0 != self.generation {
            tracing::debug!(ticket = ticket.0, latest = self.generation, "discarding stale benchmark result");
            return false;
        }
        self.current = Some(lookup);
        true
    }

    pub fn current(&self) -> Option<&Lookup> {
        self.current.as_ref()
    }
}

// ============================================================================
// Comparison
// ============================================================================

/// Theoretical vs measured numbers for one configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub framework: String,
    pub tp: u32,
    pub conc: u32,
    pub theoretical_e2e_s: f64,
    pub actual_e2e_s: f64,
    /// Measured latency as a percentage of the theoretical one.
    pub latency_percent: f64,
    pub theoretical_tput_per_gpu: f64,
    pub actual_tput_per_gpu: f64,
    pub throughput_percent: f64,
}

pub fn compare(row: &BenchmarkRow, metrics: &Metrics) -> Comparison {
    let theoretical_e2e_s = metrics.e2e_latency_ms / 1000.0;
    let actual_tput = row.actual_throughput_per_gpu();
    Comparison {
        framework: row.framework.clone(),
        tp: row.tp,
        conc: row.conc,
        theoretical_e2e_s,
        actual_e2e_s: row.e2el_s,
        latency_percent: row.e2el_s / theoretical_e2e_s * 100.0,
        theoretical_tput_per_gpu: metrics.throughput_per_gpu,
        actual_tput_per_gpu: actual_tput,
        throughput_percent: actual_tput / metrics.throughput_per_gpu * 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{evaluate, Accelerator, ModelPreset, Precision};
    use std::fs;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    const SAMPLE: &str = r#"[
        {"Hardware": "H100", "Framework": "vLLM", "Precision": "FP8", "TP": 2, "Conc": 64,
         "TTFT (ms)": 350.0, "TPOT (ms)": 40.0, "E2EL (s)": 41.3, "TPUT per GPU": 780.0},
        {"Hardware": "H100", "Framework": "vLLM", "Precision": "FP8", "TP": 2, "Conc": 32,
         "TTFT (ms)": 200.0, "TPOT (ms)": 30.0, "E2EL (s)": 31.0, "TPUT per GPU": 520.0},
        {"Hardware": "H100", "Framework": "vLLM", "Precision": "FP8", "TP": 4, "Conc": 64,
         "TTFT (ms)": 180.0, "TPOT (ms)": 25.0, "E2EL (s)": 25.8, "TPUT per GPU": 620.0}
    ]"#;

    fn data_dir(body: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("1k1k-70b").join("H100");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("FP8.json"), body).unwrap();
        dir
    }

    #[test]
    fn test_seq_config() {
        assert_eq!(seq_config(1024, 1024), "1k1k-70b");
        assert_eq!(seq_config(8192, 1024), "8k1k-70b");
        assert_eq!(seq_config(1024, 8192), "1k8k-70b");
        assert_eq!(seq_config(999, 1000), "9991k-70b");
        assert_eq!(seq_config(512, 1500), "5122k-70b");
    }

    #[test]
    fn test_key_path() {
        let config = WorkloadConfig {
            accelerator: Accelerator::Mi355x,
            precision: Precision::FP4,
            ..Default::default()
        };
        let key = BenchmarkKey::for_config(&config);
        assert_eq!(key.path(), "/benchmark-data/1k1k-70b/MI355X/FP4.json");
    }

    #[test]
    fn test_actual_throughput_from_tpot() {
        let rows: Vec<BenchmarkRow> = serde_json::from_str(SAMPLE).unwrap();
        // 64 / 0.04 / 2
        assert!((rows[0].actual_throughput_per_gpu() - 800.0).abs() < 1e-9);
    }

    #[test]
    fn test_dir_lookup_and_match() {
        let dir = data_dir(SAMPLE);
        let source = BenchmarkSource::Dir(dir.path().to_path_buf());
        let config = WorkloadConfig::default();

        let result = lookup(&source, &config);
        assert_eq!(result.rows().map(|r| r.len()), Some(3));
        let row = result.matching(&config).unwrap();
        assert_eq!((row.tp, row.conc), (2, 64));
    }

    #[test]
    fn test_no_match_for_other_concurrency() {
        let dir = data_dir(SAMPLE);
        let source = BenchmarkSource::Dir(dir.path().to_path_buf());
        let config = WorkloadConfig { concurrent_users: 100, ..Default::default() };
        let result = lookup(&source, &config);
        assert!(result.rows().is_some());
        assert!(result.matching(&config).is_none());
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let dir = data_dir(SAMPLE);
        let source = BenchmarkSource::Dir(dir.path().to_path_buf());
        let config = WorkloadConfig { accelerator: Accelerator::B200, ..Default::default() };
        match lookup(&source, &config) {
            Lookup::Unavailable(msg) => {
                assert_eq!(msg, "No benchmark data available for 1k1k-70b/B200/FP8")
            }
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_file_is_unavailable() {
        let dir = data_dir("{not json");
        let source = BenchmarkSource::Dir(dir.path().to_path_buf());
        let result = lookup(&source, &WorkloadConfig::default());
        assert!(matches!(result, Lookup::Unavailable(ref m) if m.starts_with("malformed")));
    }

    #[test]
    fn test_stale_ticket_discarded() {
        let mut loader = BenchmarkLoader::new();
        let first = loader.begin();
        let second = loader.begin();
        assert_eq!(loader.current(), None);

        assert!(loader.complete(second, Lookup::Unavailable("newer".into())));
        assert!(!loader.complete(first, Lookup::Loaded(Vec::new())));
        assert_eq!(loader.current(), Some(&Lookup::Unavailable("newer".into())));
    }

    /// Serve one connection with `reply`, or hold it open without replying.
    fn one_shot_server(reply: Option<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            match reply {
                Some(text) => {
                    let _ = stream.write_all(text.as_bytes());
                }
                None => thread::sleep(Duration::from_secs(3)),
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_http_404_is_unavailable() {
        let base = one_shot_server(Some("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"));
        let source = BenchmarkSource::Http { base, timeout: Duration::from_secs(5) };
        match lookup(&source, &WorkloadConfig::default()) {
            Lookup::Unavailable(msg) => {
                assert_eq!(msg, "No benchmark data available for 1k1k-70b/H100/FP8")
            }
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_http_rows_loaded() {
        let body: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                SAMPLE.len(),
                SAMPLE
            )
            .into_boxed_str(),
        );
        let base = one_shot_server(Some(body));
        let source = BenchmarkSource::Http { base, timeout: Duration::from_secs(5) };
        assert_eq!(lookup(&source, &WorkloadConfig::default()).rows().map(|r| r.len()), Some(3));
    }

    #[test]
    fn test_stalled_server_times_out() {
        let base = one_shot_server(None);
        let source = BenchmarkSource::Http { base, timeout: Duration::from_millis(200) };

        let started = Instant::now();
        let result = lookup(&source, &WorkloadConfig::default());
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "lookup took {:?}",
            started.elapsed()
        );
        assert!(matches!(result, Lookup::Unavailable(_)));
    }

    #[test]
    fn test_compare_percentages() {
        let rows: Vec<BenchmarkRow> = serde_json::from_str(SAMPLE).unwrap();
        let metrics = evaluate(&WorkloadConfig::default(), &ModelPreset::Llama70B.spec());
        let c = compare(&rows[0], &metrics);
        assert_eq!(c.actual_e2e_s, 41.3);
        assert!((c.theoretical_e2e_s * 1000.0 - metrics.e2e_latency_ms).abs() < 1e-6);
        let expected = 800.0 / metrics.throughput_per_gpu * 100.0;
        assert!((c.throughput_percent - expected).abs() < 1e-9);
    }
}
