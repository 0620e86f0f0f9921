//! Analytical cost model for LLM inference on a tensor-parallel accelerator group.
//!
//! Converts hardware specs plus a workload configuration into prefill/decode
//! latency, batch time, throughput and KV-cache sizing.
//!
//! # Regimes
//!
//! - **Prefill** is compute-bound: every prompt token touches every parameter
//!   (`2 × params` FLOPs) plus quadratic attention work.
//! - **Decode** is memory-bandwidth-bound: each step streams the model weights
//!   once plus the KV cache of every concurrent sequence.
//!
//! # Chunked Prefilling
//!
//! With a per-step token budget of [`MAX_NUM_BATCHED_TOKENS`], prefill chunks
//! ride along with decode steps. Whatever the budget cannot absorb is charged
//! at compute-bound prefill speed on top of the decode time.
//!
//! Every function here is pure: no allocation, no state, and no guard against
//! division by zero. Out-of-range inputs are rejected by [`crate::input`].

use serde::{Deserialize, Serialize};

/// Per-step token budget used by chunked prefilling (vLLM default).
pub const MAX_NUM_BATCHED_TOKENS: u32 = 8192;

const TERA: f64 = 1e12;
const GIGA: f64 = 1e9;

// ============================================================================
// Numeric Precision
// ============================================================================

/// Numeric format of weights and KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    FP4,
    FP8,
    FP16,
}

impl Precision {
    pub const ALL: [Precision; 3] = [Self::FP4, Self::FP8, Self::FP16];

    /// Parse from string, case-insensitive. Accepts names and byte widths.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fp4" | "0.5" => Some(Self::FP4),
            "fp8" | "1" => Some(Self::FP8),
            "fp16" | "bf16" | "fp16/bf16" | "2" => Some(Self::FP16),
            _ => None,
        }
    }

    #[inline]
    pub fn bytes_per_param(&self) -> f64 {
        match self {
            Self::FP4 => 0.5,
            Self::FP8 => 1.0,
            Self::FP16 => 2.0,
        }
    }

    /// Name used by the benchmark dataset.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FP4 => "FP4",
            Self::FP8 => "FP8",
            Self::FP16 => "FP16",
        }
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self::FP8
    }
}

// ============================================================================
// Accelerator Table
// ============================================================================

/// Static accelerator specification. Compute in dense TFLOPS, bandwidth in TB/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AcceleratorSpec {
    pub name: &'static str,
    pub compute_fp8: f64,
    /// `None` when the part has no native FP4 path.
    pub compute_fp4: Option<f64>,
    pub compute_fp16: f64,
    pub memory_bandwidth: f64,
}

impl AcceleratorSpec {
    /// Peak TFLOPS at `precision`. FP4 falls back to the FP8 rate when the
    /// part has no FP4 units.
    #[inline]
    pub fn compute_tflops(&self, precision: Precision) -> f64 {
        match precision {
            Precision::FP4 => self.compute_fp4.unwrap_or(self.compute_fp8),
            Precision::FP8 => self.compute_fp8,
            Precision::FP16 => self.compute_fp16,
        }
    }

    pub fn supports(&self, precision: Precision) -> bool {
        match precision {
            Precision::FP4 => self.compute_fp4.is_some(),
            Precision::FP8 | Precision::FP16 => true,
        }
    }
}

/// Accelerator identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Accelerator {
    Mi355x,
    B200,
    Mi325x,
    Mi300x,
    H200,
    H100,
}

impl Accelerator {
    pub const ALL: [Accelerator; 6] = [
        Self::Mi355x,
        Self::B200,
        Self::Mi325x,
        Self::Mi300x,
        Self::H200,
        Self::H100,
    ];

    /// Parse from string, case-insensitive.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mi355x" => Some(Self::Mi355x),
            "b200" => Some(Self::B200),
            "mi325x" => Some(Self::Mi325x),
            "mi300x" => Some(Self::Mi300x),
            "h200" => Some(Self::H200),
            "h100" => Some(Self::H100),
            _ => None,
        }
    }

    /// Short identifier, also the hardware name in the benchmark dataset.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Mi355x => "MI355X",
            Self::B200 => "B200",
            Self::Mi325x => "MI325X",
            Self::Mi300x => "MI300X",
            Self::H200 => "H200",
            Self::H100 => "H100",
        }
    }

    pub fn spec(&self) -> AcceleratorSpec {
        match self {
            Self::Mi355x => AcceleratorSpec {
                name: "AMD MI355X",
                compute_fp8: 5000.0,
                compute_fp4: Some(10000.0),
                compute_fp16: 2500.0,
                memory_bandwidth: 8.0,
            },
            Self::B200 => AcceleratorSpec {
                name: "NVIDIA B200",
                compute_fp8: 4500.0,
                compute_fp4: Some(9000.0),
                compute_fp16: 2250.0,
                memory_bandwidth: 8.0,
            },
            Self::Mi325x => AcceleratorSpec {
                name: "AMD MI325X",
                compute_fp8: 2610.0,
                compute_fp4: None,
                compute_fp16: 1305.0,
                memory_bandwidth: 6.0,
            },
            Self::Mi300x => AcceleratorSpec {
                name: "AMD MI300X",
                compute_fp8: 2610.0,
                compute_fp4: None,
                compute_fp16: 1305.0,
                memory_bandwidth: 5.3,
            },
            Self::H200 => AcceleratorSpec {
                name: "NVIDIA H200",
                compute_fp8: 1979.0,
                compute_fp4: None,
                compute_fp16: 989.0,
                memory_bandwidth: 4.8,
            },
            Self::H100 => AcceleratorSpec {
                name: "NVIDIA H100",
                compute_fp8: 1979.0,
                compute_fp4: None,
                compute_fp16: 989.0,
                memory_bandwidth: 3.35,
            },
        }
    }

    /// Precisions offered for this accelerator, lowest first.
    pub fn supported_precisions(&self) -> Vec<Precision> {
        let spec = self.spec();
        Precision::ALL
            .into_iter()
            .filter(|p| spec.supports(*p))
            .collect()
    }
}

/// Precision actually used on `accelerator`: FP4 becomes FP8 on parts
/// without FP4 units, everything else is kept.
#[inline]
pub fn resolve_precision(accelerator: Accelerator, requested: Precision) -> Precision {
    if accelerator.spec().supports(requested) {
        requested
    } else {
        Precision::FP8
    }
}

impl Default for Accelerator {
    fn default() -> Self {
        Self::H100
    }
}

// ============================================================================
// Model Architecture
// ============================================================================

/// Architecture dimensions of a dense decoder-only transformer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Parameter count in billions.
    pub model_size: f64,
    pub head_dim: u32,
    pub hidden_size: u32,
    pub num_kv_heads: u32,
    pub num_attention_heads: u32,
    pub num_layers: u32,
    pub intermediate_size: u32,
    pub vocab_size: u32,
}

impl ModelSpec {
    #[inline]
    pub fn parameters(&self) -> f64 {
        self.model_size * GIGA
    }
}

impl Default for ModelSpec {
    fn default() -> Self {
        ModelPreset::Llama70B.spec()
    }
}

/// Known model architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelPreset {
    /// Llama-3.1 8B
    Llama8B,
    /// Llama-3.3 70B
    Llama70B,
    /// Llama-3.1 405B
    Llama405B,
}

impl ModelPreset {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "llama-8b" | "llama8b" | "8b" => Some(Self::Llama8B),
            "llama-70b" | "llama70b" | "70b" => Some(Self::Llama70B),
            "llama-405b" | "llama405b" | "405b" => Some(Self::Llama405B),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Llama8B => "Llama-3.1 8B",
            Self::Llama70B => "Llama-3.3 70B",
            Self::Llama405B => "Llama-3.1 405B",
        }
    }

    pub fn spec(&self) -> ModelSpec {
        match self {
            Self::Llama8B => ModelSpec {
                model_size: 8.0,
                head_dim: 128,
                hidden_size: 4096,
                num_kv_heads: 8,
                num_attention_heads: 32,
                num_layers: 32,
                intermediate_size: 14336,
                vocab_size: 128256,
            },
            Self::Llama70B => ModelSpec {
                model_size: 70.0,
                head_dim: 128,
                hidden_size: 8192,
                num_kv_heads: 8,
                num_attention_heads: 64,
                num_layers: 80,
                intermediate_size: 28672,
                vocab_size: 128256,
            },
            Self::Llama405B => ModelSpec {
                model_size: 405.0,
                head_dim: 128,
                hidden_size: 16384,
                num_kv_heads: 8,
                num_attention_heads: 128,
                num_layers: 126,
                intermediate_size: 53248,
                vocab_size: 128256,
            },
        }
    }
}

impl Default for ModelPreset {
    fn default() -> Self {
        Self::Llama70B
    }
}

// ============================================================================
// Workload Configuration
// ============================================================================

/// The user-adjustable knobs. Sequence lengths are in tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Number of accelerators the model is split across.
    pub tensor_parallelism: u32,
    /// Sequences decoded together in steady state.
    pub concurrent_users: u32,
    pub input_seq_length: u32,
    pub output_seq_length: u32,
    pub accelerator: Accelerator,
    pub precision: Precision,
    /// Interleave prefill chunks with decode steps.
    pub chunked_prefill: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            tensor_parallelism: 2,
            concurrent_users: 64,
            input_seq_length: 1024,
            output_seq_length: 1024,
            accelerator: Accelerator::H100,
            precision: Precision::FP8,
            chunked_prefill: true,
        }
    }
}

impl WorkloadConfig {
    #[inline]
    pub fn spec(&self) -> AcceleratorSpec {
        self.accelerator.spec()
    }
}

// ============================================================================
// Formulas
// ============================================================================

/// Aggregate FLOP/s across the tensor-parallel group.
#[inline]
pub fn total_compute(tensor_parallelism: u32, tflops_per_gpu: f64) -> f64 {
    tensor_parallelism as f64 * tflops_per_gpu * TERA
}

/// Aggregate memory bandwidth in bytes/s.
#[inline]
pub fn total_memory_bandwidth(tensor_parallelism: u32, tbps_per_gpu: f64) -> f64 {
    tensor_parallelism as f64 * tbps_per_gpu * TERA
}

/// Minimum batch size at which decode matmuls become compute-bound.
///
/// Weights stream at `bandwidth / bytes_per_param` params/s; each param costs
/// 2 FLOPs per sequence in the batch.
#[inline]
pub fn compute_bound_threshold(total_compute: f64, total_bandwidth: f64, bytes_per_param: f64) -> u32 {
    (total_compute / (total_bandwidth / bytes_per_param) / 2.0).round() as u32
}

/// Dense matmul FLOPs for a prompt: 2 FLOPs per parameter per token.
#[inline]
pub fn matmul_flops(input_seq_length: u32, model_size: f64) -> f64 {
    input_seq_length as f64 * 2.0 * model_size * GIGA
}

/// QK^T and scores@V, each `2 × ISL² × D` per layer.
#[inline]
pub fn attention_flops(input_seq_length: u32, hidden_size: u32, num_layers: u32) -> f64 {
    let isl = input_seq_length as f64;
    4.0 * isl * isl * hidden_size as f64 * num_layers as f64
}

/// Time to process `flops` at `compute` FLOP/s, in milliseconds.
#[inline]
pub fn compute_time_ms(flops: f64, compute: f64) -> f64 {
    flops / compute * 1000.0
}

/// Key + value bytes written per token across all layers.
#[inline]
pub fn kv_cache_per_token(model: &ModelSpec, bytes_per_param: f64) -> f64 {
    2.0 * model.num_layers as f64 * model.num_kv_heads as f64 * model.head_dim as f64 * bytes_per_param
}

/// Mean context length over the generation of one sequence.
#[inline]
pub fn avg_seq_length(input_seq_length: u32, output_seq_length: u32) -> f64 {
    input_seq_length as f64 + output_seq_length as f64 / 2.0
}

#[inline]
pub fn model_weight_bytes(model_size: f64, bytes_per_param: f64) -> f64 {
    model_size * GIGA * bytes_per_param
}

/// Time to stream `bytes` at `bandwidth` bytes/s, in milliseconds.
#[inline]
pub fn memory_time_ms(bytes: f64, bandwidth: f64) -> f64 {
    bytes / bandwidth * 1000.0
}

/// Prefill budget left per step after every user's decode token.
#[inline]
pub fn available_tokens_for_prefill(concurrent_users: u32) -> i64 {
    MAX_NUM_BATCHED_TOKENS as i64 - concurrent_users as i64
}

/// Whole prompts that fit in one step's leftover budget.
#[inline]
pub fn complete_prefills_fit(available: i64, input_seq_length: u32) -> i64 {
    available.div_euclid(input_seq_length as i64)
}

/// Whether `output_seq_length` decode steps can absorb every prompt of the cycle.
#[inline]
pub fn can_overlap_prefills(available: i64, output_seq_length: u32, prefill_tokens_needed: u64) -> bool {
    available as i128 * output_seq_length as i128 >= prefill_tokens_needed as i128
}

/// Prefill tokens that cannot hide under memory-bound decode steps.
///
/// Each of the OSL decode steps has `B*` tokens of free compute; the cycle
/// needs `B × (ISL + OSL)` tokens of work.
#[inline]
pub fn non_overlapped_prefill_tokens(
    concurrent_users: u32,
    input_seq_length: u32,
    output_seq_length: u32,
    threshold: u32,
) -> f64 {
    let work = concurrent_users as f64 * (input_seq_length as f64 + output_seq_length as f64);
    let free = output_seq_length as f64 * threshold as f64;
    (work - free).max(0.0)
}

/// Batch time with chunked prefilling. Never worse than running prefills
/// back to back.
#[inline]
pub fn chunked_total_time_ms(
    total_decode_time_ms: f64,
    non_chunked_total_ms: f64,
    can_overlap: bool,
    non_overlapped_prefill_time_ms: f64,
) -> f64 {
    if can_overlap {
        total_decode_time_ms
    } else {
        (total_decode_time_ms + non_overlapped_prefill_time_ms).min(non_chunked_total_ms)
    }
}

/// Output tokens per second over `time_ms`.
#[inline]
pub fn throughput(output_tokens: u64, time_ms: f64) -> f64 {
    output_tokens as f64 / time_ms * 1000.0
}

// ============================================================================
// Evaluation
// ============================================================================

/// Every derived quantity for one configuration snapshot.
/// Times in milliseconds, sizes in bytes, compute in FLOP/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub total_compute: f64,
    pub total_memory_bandwidth: f64,
    pub compute_bound_threshold: u32,

    // Prefill
    pub matmul_flops: f64,
    pub attention_flops: f64,
    pub prefill_flops: f64,
    /// Time to first token.
    pub prefill_time_ms: f64,

    // Decode
    pub kv_cache_per_token: f64,
    pub avg_seq_length: f64,
    pub kv_cache_per_sequence: f64,
    pub model_weight_bytes: f64,
    pub total_bytes_per_decode: f64,
    /// Time per output token.
    pub decode_time_ms: f64,
    pub e2e_latency_ms: f64,

    // Batch
    pub total_prefill_time_ms: f64,
    pub total_decode_time_ms: f64,
    pub total_time_ms: f64,

    // Chunked prefilling
    pub decode_tokens_used: u32,
    pub available_tokens_for_prefill: i64,
    pub complete_prefills_fit: i64,
    pub total_prefill_tokens_needed: u64,
    pub can_overlap_prefills: bool,
    pub non_overlapped_prefill_tokens: f64,
    pub non_overlapped_prefill_time_ms: f64,
    pub total_time_chunked_ms: f64,
    pub total_time_with_mode_ms: f64,

    // Throughput
    pub total_output_tokens: u64,
    pub throughput: f64,
    pub throughput_per_gpu: f64,
    pub prefill_time_percent: f64,
}

/// Evaluate the full cost model for one configuration.
///
/// A precision the accelerator cannot run is evaluated as FP8, for both the
/// compute rate and the bytes per parameter.
///
/// INVARIANT: Deterministic and side-effect free.
pub fn evaluate(config: &WorkloadConfig, model: &ModelSpec) -> Metrics {
    let spec = config.spec();
    let precision = resolve_precision(config.accelerator, config.precision);
    let bytes = precision.bytes_per_param();
    let tp = config.tensor_parallelism;
    let users = config.concurrent_users;
    let isl = config.input_seq_length;
    let osl = config.output_seq_length;

    let total_compute = total_compute(tp, spec.compute_tflops(precision));
    let total_memory_bandwidth = total_memory_bandwidth(tp, spec.memory_bandwidth);
    let threshold = compute_bound_threshold(total_compute, total_memory_bandwidth, bytes);

    let matmul_flops = matmul_flops(isl, model.model_size);
    let attention_flops = attention_flops(isl, model.hidden_size, model.num_layers);
    let prefill_flops = matmul_flops + attention_flops;
    let prefill_time_ms = compute_time_ms(prefill_flops, total_compute);

    let kv_cache_per_token = kv_cache_per_token(model, bytes);
    let avg_seq_length = avg_seq_length(isl, osl);
    let kv_cache_per_sequence = avg_seq_length * kv_cache_per_token;
    let model_weight_bytes = model_weight_bytes(model.model_size, bytes);
    let total_bytes_per_decode = model_weight_bytes + users as f64 * kv_cache_per_sequence;
    let decode_time_ms = memory_time_ms(total_bytes_per_decode, total_memory_bandwidth);
    let e2e_latency_ms = prefill_time_ms + osl as f64 * decode_time_ms;

    let total_prefill_time_ms = users as f64 * prefill_time_ms;
    let total_decode_time_ms = osl as f64 * decode_time_ms;
    let total_time_ms = total_prefill_time_ms + total_decode_time_ms;

    let available = available_tokens_for_prefill(users);
    let needed = users as u64 * isl as u64;
    let can_overlap = can_overlap_prefills(available, osl, needed);
    let leftover_tokens = non_overlapped_prefill_tokens(users, isl, osl, threshold);
    let leftover_time_ms = compute_time_ms(leftover_tokens * 2.0 * model.parameters(), total_compute);
    let total_time_chunked_ms =
        chunked_total_time_ms(total_decode_time_ms, total_time_ms, can_overlap, leftover_time_ms);
    let total_time_with_mode_ms = if config.chunked_prefill {
        total_time_chunked_ms
    } else {
        total_time_ms
    };

    let total_output_tokens = users as u64 * osl as u64;
    let throughput = throughput(total_output_tokens, total_time_with_mode_ms);

    Metrics {
        total_compute,
        total_memory_bandwidth,
        compute_bound_threshold: threshold,
        matmul_flops,
        attention_flops,
        prefill_flops,
        prefill_time_ms,
        kv_cache_per_token,
        avg_seq_length,
        kv_cache_per_sequence,
        model_weight_bytes,
        total_bytes_per_decode,
        decode_time_ms,
        e2e_latency_ms,
        total_prefill_time_ms,
        total_decode_time_ms,
        total_time_ms,
        decode_tokens_used: users,
        available_tokens_for_prefill: available,
        complete_prefills_fit: complete_prefills_fit(available, isl),
        total_prefill_tokens_needed: needed,
        can_overlap_prefills: can_overlap,
        non_overlapped_prefill_tokens: leftover_tokens,
        non_overlapped_prefill_time_ms: leftover_time_ms,
        total_time_chunked_ms,
        total_time_with_mode_ms,
        total_output_tokens,
        throughput,
        throughput_per_gpu: throughput / tp as f64,
        prefill_time_percent: total_prefill_time_ms / total_time_ms * 100.0,
    }
}
