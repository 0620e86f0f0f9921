//! Theoretical throughput and latency across concurrency or tensor parallelism.
//!
//! Each point re-evaluates the cost model with one knob replaced. When
//! benchmark rows are available the sweep follows their axis values and
//! attaches measured numbers and efficiency.

use serde::Serialize;

use crate::benchmark::BenchmarkRow;
use crate::input::InputError;
use crate::model::{evaluate, ModelSpec, WorkloadConfig};

/// Knob varied along the x-axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Axis {
    Concurrency,
    TensorParallelism,
}

impl Axis {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "concurrency" | "conc" | "users" => Some(Self::Concurrency),
            "tp" | "tensor-parallelism" | "tensorparallelism" => Some(Self::TensorParallelism),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Result<Self, InputError> {
        Self::from_str(s).ok_or_else(|| InputError::UnknownAxis(s.to_string()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Concurrency => "Concurrent Users",
            Self::TensorParallelism => "Tensor Parallelism",
        }
    }

    /// `config` with this axis set to `value`.
    pub fn apply(&self, config: &WorkloadConfig, value: u32) -> WorkloadConfig {
        match self {
            Self::Concurrency => WorkloadConfig {
                concurrent_users: value,
                ..config.clone()
            },
            Self::TensorParallelism => WorkloadConfig {
                tensor_parallelism: value,
                ..config.clone()
            },
        }
    }

    fn of_row(&self, row: &BenchmarkRow) -> u32 {
        match self {
            Self::Concurrency => row.conc,
            Self::TensorParallelism => row.tp,
        }
    }
}

/// One x-axis point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    pub tp: u32,
    pub concurrency: u32,
    pub theoretical_tput_per_gpu: f64,
    pub theoretical_e2e_s: f64,
    pub actual_tput_per_gpu: Option<f64>,
    pub actual_e2e_s: Option<f64>,
    /// Measured throughput as a percentage of theoretical.
    pub throughput_efficiency: Option<f64>,
    /// Theoretical latency as a percentage of measured.
    pub latency_efficiency: Option<f64>,
}

impl SweepPoint {
    pub fn csv_header() -> &'static str {
        "tp,concurrency,theory_tput_gpu,theory_e2e_s,actual_tput_gpu,actual_e2e_s,tput_eff%,latency_eff%"
    }

    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{:.1},{:.3},{},{},{},{}",
            self.tp,
            self.concurrency,
            self.theoretical_tput_per_gpu,
            self.theoretical_e2e_s,
            csv_opt(self.actual_tput_per_gpu, 1),
            csv_opt(self.actual_e2e_s, 3),
            csv_opt(self.throughput_efficiency, 1),
            csv_opt(self.latency_efficiency, 1),
        )
    }
}

fn csv_opt(v: Option<f64>, decimals: usize) -> String {
    v.map(|x| format!("{:.*}", decimals, x)).unwrap_or_default()
}

fn point(config: &WorkloadConfig, model: &ModelSpec, row: Option<&BenchmarkRow>) -> SweepPoint {
    let m = evaluate(config, model);
    let theoretical_e2e_s = m.e2e_latency_ms / 1000.0;
    let actual_tput = row.map(BenchmarkRow::actual_throughput_per_gpu);
    let actual_e2e = row.map(|r| r.e2el_s);

    SweepPoint {
        tp: config.tensor_parallelism,
        concurrency: config.concurrent_users,
        theoretical_tput_per_gpu: m.throughput_per_gpu,
        theoretical_e2e_s,
        actual_tput_per_gpu: actual_tput,
        actual_e2e_s: actual_e2e,
        throughput_efficiency: actual_tput.map(|a| a / m.throughput_per_gpu * 100.0),
        latency_efficiency: actual_e2e.map(|a| theoretical_e2e_s / a * 100.0),
    }
}

/// Theoretical series over explicit axis values.
pub fn sweep_values(config: &WorkloadConfig, model: &ModelSpec, axis: Axis, values: &[u32]) -> Vec<SweepPoint> {
    values
        .iter()
        .map(|&v| point(&axis.apply(config, v), model, None))
        .collect()
}

/// Series over benchmark rows: rows at the current TP when sweeping
/// concurrency, or at the current concurrency when sweeping TP, sorted along
/// the axis. Empty when no row matches.
pub fn sweep_rows(
    config: &WorkloadConfig,
    model: &ModelSpec,
    axis: Axis,
    rows: &[BenchmarkRow],
) -> Vec<SweepPoint> {
    let mut selected: Vec<&BenchmarkRow> = rows
        .iter()
        .filter(|r| match axis {
            Axis::Concurrency => r.tp == config.tensor_parallelism,
            Axis::TensorParallelism => r.conc == config.concurrent_users,
        })
        .collect();
    selected.sort_by_key(|r| axis.of_row(r));

    selected
        .into_iter()
        .map(|row| {
            let at = WorkloadConfig {
                tensor_parallelism: row.tp,
                concurrent_users: row.conc,
                ..config.clone()
            };
            point(&at, model, Some(row))
        })
        .collect()
}
