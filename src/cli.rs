//! Command-line interface for the inference cost explorer.
//!
//! Parameters are organized into categories:
//!
//! ## Hardware
//! - `--accelerator`: Accelerator model (sets compute and bandwidth per GPU)
//! - `--tp`: Tensor parallelism degree (1, 2, 4 or 8)
//! - `--precision`: Weight/KV precision; FP4 falls back to FP8 where unsupported
//!
//! ## Workload
//! - `--model`: Model architecture preset
//! - `--users`: Concurrent sequences (1-128)
//! - `--isl`, `--osl`: Input/output sequence lengths, or `--seq` preset
//! - `--no-chunked`: Run prefills back to back instead of chunked
//!
//! ## Modes
//! - default: human-readable report
//! - `--json`, `--sweep`, `--compare`, `--sidenotes FILE`, `--serve PORT`

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::benchmark::BenchmarkSource;
use crate::input::{
    parse_accelerator, parse_concurrency, parse_model, parse_precision, parse_seq_length,
    parse_tensor_parallelism, resolve_precision, InputError, SeqPreset, MAX_CONCURRENCY, TP_OPTIONS,
};
use crate::model::{Accelerator, ModelPreset, Precision, WorkloadConfig};
use crate::sweep::Axis;

fn parse_seq_preset(s: &str) -> Result<SeqPreset, String> {
    SeqPreset::from_str(s).ok_or_else(|| {
        let known: Vec<String> = SeqPreset::ALL.iter().map(SeqPreset::label).collect();
        format!("unknown sequence preset `{}` (expected one of {})", s, known.join(", "))
    })
}

#[derive(Parser, Debug)]
#[command(name = "infercost")]
#[command(author, version, about = "Analytical LLM inference cost model: latency, throughput and KV-cache sizing")]
pub struct Cli {
    // =========================================================================
    // Hardware
    // =========================================================================

    /// Accelerator: mi355x, b200, mi325x, mi300x, h200, h100
    #[arg(long, default_value = "h100", value_parser = parse_accelerator, help_heading = "Hardware")]
    pub accelerator: Accelerator,

    /// Tensor parallelism degree (1, 2, 4 or 8)
    #[arg(long, default_value = "2", value_parser = parse_tensor_parallelism, help_heading = "Hardware")]
    pub tp: u32,

    /// Numeric precision: fp4, fp8, fp16
    #[arg(long, default_value = "fp8", value_parser = parse_precision, help_heading = "Hardware")]
    pub precision: Precision,

    // =========================================================================
    // Workload
    // =========================================================================

    /// Model architecture: 8b, 70b, 405b
    #[arg(long, default_value = "70b", value_parser = parse_model, help_heading = "Workload")]
    pub model: ModelPreset,

    /// Concurrent users (1-128)
    #[arg(long, default_value = "64", value_parser = parse_concurrency, help_heading = "Workload")]
    pub users: u32,

    /// Input sequence length in tokens
    #[arg(long, default_value = "1024", value_parser = parse_seq_length, help_heading = "Workload")]
    pub isl: u32,

    /// Output sequence length in tokens
    #[arg(long, default_value = "1024", value_parser = parse_seq_length, help_heading = "Workload")]
    pub osl: u32,

    /// Sequence preset (overrides --isl/--osl): 1024/1024, 1024/8192, 8192/1024
    #[arg(long, value_parser = parse_seq_preset, help_heading = "Workload")]
    pub seq: Option<SeqPreset>,

    /// Disable chunked prefilling
    #[arg(long, default_value = "false", help_heading = "Workload")]
    pub no_chunked: bool,

    // =========================================================================
    // Benchmark Data
    // =========================================================================

    /// Site root serving /benchmark-data/... (takes precedence over --data-dir)
    #[arg(long, help_heading = "Benchmark Data")]
    pub benchmark_url: Option<String>,

    /// Seconds to wait on a stalled benchmark server
    #[arg(long, default_value = "10", help_heading = "Benchmark Data")]
    pub benchmark_timeout: u64,

    /// Static directory containing benchmark-data/
    #[arg(long, default_value = "public", help_heading = "Benchmark Data")]
    pub data_dir: PathBuf,

    /// Directory of Markdown posts served under /blog
    #[arg(long, default_value = "posts", help_heading = "Benchmark Data")]
    pub posts_dir: PathBuf,

    // =========================================================================
    // Modes
    // =========================================================================

    /// Print configuration and metrics as JSON
    #[arg(long, default_value = "false", help_heading = "Modes")]
    pub json: bool,

    /// Sweep one axis and print CSV
    #[arg(long, default_value = "false", help_heading = "Modes")]
    pub sweep: bool,

    /// Sweep axis: concurrency or tp
    #[arg(long, default_value = "concurrency", value_parser = Axis::parse, help_heading = "Modes")]
    pub axis: Axis,

    /// Axis values to sweep (comma-separated); defaults to benchmark rows if
    /// available, otherwise the full axis range
    #[arg(long, help_heading = "Modes")]
    pub sweep_values: Option<String>,

    /// Compare against measured benchmark data
    #[arg(long, default_value = "false", help_heading = "Modes")]
    pub compare: bool,

    /// Apply the sidenote transform to a Markdown file and print the result
    #[arg(long, help_heading = "Modes")]
    pub sidenotes: Option<PathBuf>,

    /// Serve the JSON API and posts on this port
    #[arg(long, help_heading = "Modes")]
    pub serve: Option<u16>,

    /// Show the full derivation (FLOPs, bytes, chunked-prefill budget) and
    /// which quantities depend on each knob
    #[arg(long, default_value = "false", help_heading = "Modes")]
    pub verbose: bool,
}

impl Cli {
    /// Convert CLI args to a WorkloadConfig.
    pub fn to_config(&self) -> WorkloadConfig {
        let (isl, osl) = match self.seq {
            Some(preset) => preset.lengths(),
            None => (self.isl, self.osl),
        };

        WorkloadConfig {
            tensor_parallelism: self.tp,
            concurrent_users: self.users,
            input_seq_length: isl,
            output_seq_length: osl,
            accelerator: self.accelerator,
            precision: resolve_precision(self.accelerator, self.precision),
            chunked_prefill: !self.no_chunked,
        }
    }

    pub fn benchmark_source(&self) -> BenchmarkSource {
        match &self.benchmark_url {
            Some(url) => BenchmarkSource::Http {
                base: url.clone(),
                timeout: Duration::from_secs(self.benchmark_timeout),
            },
            None => BenchmarkSource::Dir(self.data_dir.join("benchmark-data")),
        }
    }

    /// Explicit sweep values, or the full range of the axis.
    pub fn parse_sweep_values(&self) -> Result<Vec<u32>, InputError> {
        match &self.sweep_values {
            Some(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| match self.axis {
                    Axis::Concurrency => parse_concurrency(s),
                    Axis::TensorParallelism => parse_tensor_parallelism(s),
                })
                .collect(),
            None => Ok(default_axis_values(self.axis)),
        }
    }
}

pub fn default_axis_values(axis: Axis) -> Vec<u32> {
    match axis {
        Axis::Concurrency => std::iter::successors(Some(1u32), |n| Some(n * 2))
            .take_while(|n| *n <= MAX_CONCURRENCY)
            .collect(),
        Axis::TensorParallelism => TP_OPTIONS.to_vec(),
    }
}

// ============================================================================
// Formatting
// ============================================================================

/// Fixed decimals.
pub fn format_number(value: f64, decimals: usize) -> String {
    format!("{:.*}", decimals, value)
}

/// Exponential notation with an explicit exponent sign, e.g. `1.235e+4`.
pub fn format_scientific(value: f64, decimals: usize) -> String {
    let raw = format!("{:.*e}", decimals, value);
    match raw.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
        _ => raw,
    }
}

/// `M.MME<exp>` for values of at least 1000, two decimals otherwise.
pub fn format_large_number(value: f64) -> String {
    if value >= 1e3 {
        let mut exponent = value.log10().floor() as i32;
        let mut mantissa = value / 10f64.powi(exponent);
        if mantissa >= 10.0 {
            exponent += 1;
            mantissa /= 10.0;
        } else if mantissa < 1.0 {
            exponent -= 1;
            mantissa *= 10.0;
        }
        format!("{:.2}E{}", mantissa, exponent)
    } else {
        format!("{:.2}", value)
    }
}

/// Inverse of [`format_large_number`], up to the printed precision.
pub fn parse_large_number(text: &str) -> Option<f64> {
    let text = text.trim();
    match text.split_once('E') {
        Some((mantissa, exp)) => {
            let m: f64 = mantissa.parse().ok()?;
            let e: i32 = exp.parse().ok()?;
            Some(m * 10f64.powi(e))
        }
        None => text.parse().ok(),
    }
}

/// Milliseconds, switching to seconds past 1000 ms.
pub fn format_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2} s", ms / 1000.0)
    } else {
        format!("{:.2} ms", ms)
    }
}

/// Format tokens per second.
pub fn format_tps(tps: f64) -> String {
    if tps >= 1000.0 {
        format!("{:.1}K tok/s", tps / 1000.0)
    } else {
        format!("{:.1} tok/s", tps)
    }
}

pub fn format_bytes(bytes: f64) -> String {
    if bytes >= 1e9 {
        format!("{:.2} GB", bytes / 1e9)
    } else if bytes >= 1e6 {
        format!("{:.2} MB", bytes / 1e6)
    } else if bytes >= 1e3 {
        format!("{:.2} KB", bytes / 1e3)
    } else {
        format!("{:.0} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args_match_default_config() {
        let cli = Cli::parse_from(["infercost"]);
        assert_eq!(cli.to_config(), WorkloadConfig::default());
    }

    #[test]
    fn test_fp4_on_hopper_resolves_to_fp8() {
        let cli = Cli::parse_from(["infercost", "--accelerator", "h200", "--precision", "fp4"]);
        assert_eq!(cli.to_config().precision, Precision::FP8);
        let cli = Cli::parse_from(["infercost", "--accelerator", "b200", "--precision", "fp4"]);
        assert_eq!(cli.to_config().precision, Precision::FP4);
    }

    #[test]
    fn test_seq_preset_overrides_lengths() {
        let cli = Cli::parse_from(["infercost", "--isl", "10", "--seq", "8192/1024"]);
        let config = cli.to_config();
        assert_eq!((config.input_seq_length, config.output_seq_length), (8192, 1024));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Cli::try_parse_from(["infercost", "--isl", "0"]).is_err());
        assert!(Cli::try_parse_from(["infercost", "--tp", "3"]).is_err());
        assert!(Cli::try_parse_from(["infercost", "--users", "500"]).is_err());
        assert!(Cli::try_parse_from(["infercost", "--accelerator", "a100"]).is_err());
    }

    #[test]
    fn test_sweep_values() {
        let cli = Cli::parse_from(["infercost", "--sweep", "--sweep-values", "1, 4,16"]);
        assert_eq!(cli.parse_sweep_values().unwrap(), vec![1, 4, 16]);

        let cli = Cli::parse_from(["infercost", "--sweep", "--axis", "tp"]);
        assert_eq!(cli.parse_sweep_values().unwrap(), vec![1, 2, 4, 8]);

        let cli = Cli::parse_from(["infercost", "--sweep", "--axis", "tp", "--sweep-values", "2,3"]);
        assert!(cli.parse_sweep_values().is_err());
    }

    #[test]
    fn test_default_concurrency_axis() {
        assert_eq!(default_axis_values(Axis::Concurrency), vec![1, 2, 4, 8, 16, 32, 64, 128]);
    }

    #[test]
    fn test_format_large_number() {
        assert_eq!(format_large_number(163_840.0), "1.64E5");
        assert_eq!(format_large_number(3958e12), "3.96E15");
        assert_eq!(format_large_number(1000.0), "1.00E3");
        assert_eq!(format_large_number(999.5), "999.50");
    }

    #[test]
    fn test_parse_large_number() {
        assert!((parse_large_number("1.64E5").unwrap() - 164_000.0).abs() < 1e-6);
        assert_eq!(parse_large_number("12.25"), Some(12.25));
        assert_eq!(parse_large_number("abc"), None);
    }

    #[test]
    fn test_format_scientific() {
        assert_eq!(format_scientific(12346.0, 3), "1.235e+4");
        assert_eq!(format_scientific(0.00123, 2), "1.23e-3");
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_ms(12.5), "12.50 ms");
        assert_eq!(format_ms(2500.0), "2.50 s");
        assert_eq!(format_tps(1500.0), "1.5K tok/s");
        assert_eq!(format_bytes(70e9), "70.00 GB");
        assert_eq!(format_number(1.0 / 3.0, 3), "0.333");
    }
}
