//! The inference cost model wired into a [`Graph`].
//!
//! Configuration fields are atoms; every quantity of [`crate::model::Metrics`]
//! is a derived node that calls the same formula as [`crate::model::evaluate`].
//! Changing one knob recomputes only the quantities downstream of it, on the
//! next read.

use serde::Serialize;

use crate::graph::{Graph, GraphError, NodeId};
use crate::input::resolve_precision;
use crate::model::{self, Accelerator, Metrics, ModelSpec, Precision, WorkloadConfig};

/// Value held by a node of the inference graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Flag(bool),
    Accelerator(Accelerator),
    Precision(Precision),
    Model(ModelSpec),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Flag(_) => "flag",
            Self::Accelerator(_) => "accelerator",
            Self::Precision(_) => "precision",
            Self::Model(_) => "model",
        }
    }

    pub fn number(&self) -> Result<f64, GraphError> {
        match self {
            Self::Number(n) => Ok(*n),
            other => Err(mismatch("number", other)),
        }
    }

    pub fn flag(&self) -> Result<bool, GraphError> {
        match self {
            Self::Flag(b) => Ok(*b),
            other => Err(mismatch("flag", other)),
        }
    }

    pub fn accelerator(&self) -> Result<Accelerator, GraphError> {
        match self {
            Self::Accelerator(a) => Ok(*a),
            other => Err(mismatch("accelerator", other)),
        }
    }

    pub fn precision(&self) -> Result<Precision, GraphError> {
        match self {
            Self::Precision(p) => Ok(*p),
            other => Err(mismatch("precision", other)),
        }
    }

    pub fn model(&self) -> Result<ModelSpec, GraphError> {
        match self {
            Self::Model(m) => Ok(*m),
            other => Err(mismatch("model", other)),
        }
    }

    fn count(&self) -> Result<u32, GraphError> {
        self.number().map(|n| n as u32)
    }
}

fn mismatch(expected: &'static str, found: &Value) -> GraphError {
    GraphError::TypeMismatch {
        expected,
        found: found.kind(),
    }
}

fn num(n: f64) -> Result<Value, GraphError> {
    Ok(Value::Number(n))
}

struct Atoms {
    tensor_parallelism: NodeId,
    concurrent_users: NodeId,
    input_seq_length: NodeId,
    output_seq_length: NodeId,
    accelerator: NodeId,
    precision: NodeId,
    chunked_prefill: NodeId,
    model: NodeId,
}

/// Reactive view of one workload configuration.
pub struct InferenceStore {
    graph: Graph<Value>,
    atoms: Atoms,
}

impl InferenceStore {
    pub fn new(config: &WorkloadConfig, model: &ModelSpec) -> Result<Self, GraphError> {
        let mut g = Graph::new();
        let precision = resolve_precision(config.accelerator, config.precision);

        let atoms = Atoms {
            tensor_parallelism: g.atom("tensor_parallelism", Value::Number(config.tensor_parallelism as f64))?,
            concurrent_users: g.atom("concurrent_users", Value::Number(config.concurrent_users as f64))?,
            input_seq_length: g.atom("input_seq_length", Value::Number(config.input_seq_length as f64))?,
            output_seq_length: g.atom("output_seq_length", Value::Number(config.output_seq_length as f64))?,
            accelerator: g.atom("accelerator", Value::Accelerator(config.accelerator))?,
            precision: g.atom("precision", Value::Precision(precision))?,
            chunked_prefill: g.atom("chunked_prefill", Value::Flag(config.chunked_prefill))?,
            model: g.atom("model", Value::Model(*model))?,
        };
        wire(&mut g, &atoms)?;

        Ok(Self { graph: g, atoms })
    }

    /// Current configuration as stored in the atoms.
    pub fn config(&mut self) -> Result<WorkloadConfig, GraphError> {
        let a = &self.atoms;
        let (tp, users, isl, osl, accel, precision, chunked) = (
            a.tensor_parallelism,
            a.concurrent_users,
            a.input_seq_length,
            a.output_seq_length,
            a.accelerator,
            a.precision,
            a.chunked_prefill,
        );
        Ok(WorkloadConfig {
            tensor_parallelism: self.graph.get(tp)?.count()?,
            concurrent_users: self.graph.get(users)?.count()?,
            input_seq_length: self.graph.get(isl)?.count()?,
            output_seq_length: self.graph.get(osl)?.count()?,
            accelerator: self.graph.get(accel)?.accelerator()?,
            precision: self.graph.get(precision)?.precision()?,
            chunked_prefill: self.graph.get(chunked)?.flag()?,
        })
    }

    pub fn model(&mut self) -> Result<ModelSpec, GraphError> {
        self.graph.get(self.atoms.model)?.model()
    }

    pub fn set_tensor_parallelism(&mut self, tp: u32) -> Result<Vec<String>, GraphError> {
        self.set(self.atoms.tensor_parallelism, Value::Number(tp as f64))
    }

    pub fn set_concurrent_users(&mut self, users: u32) -> Result<Vec<String>, GraphError> {
        self.set(self.atoms.concurrent_users, Value::Number(users as f64))
    }

    pub fn set_input_seq_length(&mut self, isl: u32) -> Result<Vec<String>, GraphError> {
        self.set(self.atoms.input_seq_length, Value::Number(isl as f64))
    }

    pub fn set_output_seq_length(&mut self, osl: u32) -> Result<Vec<String>, GraphError> {
        self.set(self.atoms.output_seq_length, Value::Number(osl as f64))
    }

    pub fn set_chunked_prefill(&mut self, enabled: bool) -> Result<Vec<String>, GraphError> {
        self.set(self.atoms.chunked_prefill, Value::Flag(enabled))
    }

    pub fn set_model(&mut self, model: &ModelSpec) -> Result<Vec<String>, GraphError> {
        self.set(self.atoms.model, Value::Model(*model))
    }

    /// Switch accelerator; a precision it cannot run falls back to FP8.
    pub fn set_accelerator(&mut self, accelerator: Accelerator) -> Result<Vec<String>, GraphError> {
        let mut touched = self.set(self.atoms.accelerator, Value::Accelerator(accelerator))?;
        let current = self.graph.get(self.atoms.precision)?.precision()?;
        let resolved = resolve_precision(accelerator, current);
        if resolved != current {
            tracing::debug!(from = current.name(), to = resolved.name(), "precision unsupported, falling back");
            merge(&mut touched, self.set(self.atoms.precision, Value::Precision(resolved))?);
        }
        Ok(touched)
    }

    pub fn set_precision(&mut self, precision: Precision) -> Result<Vec<String>, GraphError> {
        let accelerator = self.graph.get(self.atoms.accelerator)?.accelerator()?;
        self.set(self.atoms.precision, Value::Precision(resolve_precision(accelerator, precision)))
    }

    /// Apply every field of `config`, returning the union of invalidated nodes.
    pub fn set_config(&mut self, config: &WorkloadConfig) -> Result<Vec<String>, GraphError> {
        let mut touched = Vec::new();
        merge(&mut touched, self.set_tensor_parallelism(config.tensor_parallelism)?);
        merge(&mut touched, self.set_concurrent_users(config.concurrent_users)?);
        merge(&mut touched, self.set_input_seq_length(config.input_seq_length)?);
        merge(&mut touched, self.set_output_seq_length(config.output_seq_length)?);
        merge(&mut touched, self.set_chunked_prefill(config.chunked_prefill)?);
        merge(&mut touched, self.set_accelerator(config.accelerator)?);
        merge(&mut touched, self.set_precision(config.precision)?);
        Ok(touched)
    }

    fn set(&mut self, id: NodeId, value: Value) -> Result<Vec<String>, GraphError> {
        let touched = self.graph.set(id, value)?;
        Ok(touched
            .into_iter()
            .map(|n| self.graph.name(n).to_string())
            .collect())
    }

    /// Read one node by name.
    pub fn get(&mut self, name: &str) -> Result<Value, GraphError> {
        self.graph.get_named(name)
    }

    pub fn number(&mut self, name: &str) -> Result<f64, GraphError> {
        self.get(name)?.number()
    }

    /// Each atom with the derived quantities that depend on it, in
    /// definition order.
    pub fn dependencies(&self) -> Result<Vec<(String, Vec<String>)>, GraphError> {
        let mut out = Vec::new();
        for name in self.graph.names() {
            let id = self.graph.id(name)?;
            if !self.graph.is_atom(id) {
                continue;
            }
            let dependents = self
                .graph
                .downstream(id)
                .into_iter()
                .map(|d| self.graph.name(d).to_string())
                .collect();
            out.push((name.to_string(), dependents));
        }
        Ok(out)
    }

    pub fn recomputations(&self) -> u64 {
        self.graph.recomputations()
    }

    /// Read every derived quantity.
    pub fn snapshot(&mut self) -> Result<Metrics, GraphError> {
        Ok(Metrics {
            total_compute: self.number("total_compute")?,
            total_memory_bandwidth: self.number("total_memory_bandwidth")?,
            compute_bound_threshold: self.number("compute_bound_threshold")? as u32,
            matmul_flops: self.number("matmul_flops")?,
            attention_flops: self.number("attention_flops")?,
            prefill_flops: self.number("prefill_flops")?,
            prefill_time_ms: self.number("prefill_time")?,
            kv_cache_per_token: self.number("kv_cache_per_token")?,
            avg_seq_length: self.number("avg_seq_length")?,
            kv_cache_per_sequence: self.number("kv_cache_per_sequence")?,
            model_weight_bytes: self.number("model_weight_bytes")?,
            total_bytes_per_decode: self.number("total_bytes_per_decode")?,
            decode_time_ms: self.number("decode_time")?,
            e2e_latency_ms: self.number("e2e_latency")?,
            total_prefill_time_ms: self.number("total_prefill_time")?,
            total_decode_time_ms: self.number("total_decode_time")?,
            total_time_ms: self.number("total_time")?,
            decode_tokens_used: self.number("decode_tokens_used")? as u32,
            available_tokens_for_prefill: self.number("available_tokens_for_prefill")? as i64,
            complete_prefills_fit: self.number("complete_prefills_fit")? as i64,
            total_prefill_tokens_needed: self.number("total_prefill_tokens_needed")? as u64,
            can_overlap_prefills: self.get("can_overlap_prefills")?.flag()?,
            non_overlapped_prefill_tokens: self.number("non_overlapped_prefill_tokens")?,
            non_overlapped_prefill_time_ms: self.number("non_overlapped_prefill_time")?,
            total_time_chunked_ms: self.number("total_time_chunked")?,
            total_time_with_mode_ms: self.number("total_time_with_mode")?,
            total_output_tokens: self.number("total_output_tokens")? as u64,
            throughput: self.number("throughput")?,
            throughput_per_gpu: self.number("throughput_per_gpu")?,
            prefill_time_percent: self.number("prefill_time_percent")?,
        })
    }
}

fn merge(into: &mut Vec<String>, more: Vec<String>) {
    for name in more {
        if !into.contains(&name) {
            into.push(name);
        }
    }
}

/// Define every derived node of the cost model.
fn wire(g: &mut Graph<Value>, a: &Atoms) -> Result<(), GraphError> {
    // Hardware
    let compute_per_gpu = g.derived("compute_per_gpu", &[a.accelerator, a.precision], |v| {
        num(v[0].accelerator()?.spec().compute_tflops(v[1].precision()?))
    })?;
    let bandwidth_per_gpu = g.derived("bandwidth_per_gpu", &[a.accelerator], |v| {
        num(v[0].accelerator()?.spec().memory_bandwidth)
    })?;
    let bytes = g.derived("bytes_per_param", &[a.precision], |v| {
        num(v[0].precision()?.bytes_per_param())
    })?;
    let total_compute = g.derived("total_compute", &[a.tensor_parallelism, compute_per_gpu], |v| {
        num(model::total_compute(v[0].count()?, v[1].number()?))
    })?;
    let total_bandwidth = g.derived(
        "total_memory_bandwidth",
        &[a.tensor_parallelism, bandwidth_per_gpu],
        |v| num(model::total_memory_bandwidth(v[0].count()?, v[1].number()?)),
    )?;
    let threshold = g.derived(
        "compute_bound_threshold",
        &[total_compute, total_bandwidth, bytes],
        |v| {
            let t = model::compute_bound_threshold(v[0].number()?, v[1].number()?, v[2].number()?);
            num(t as f64)
        },
    )?;

    // Prefill
    let matmul = g.derived("matmul_flops", &[a.input_seq_length, a.model], |v| {
        num(model::matmul_flops(v[0].count()?, v[1].model()?.model_size))
    })?;
    let attention = g.derived("attention_flops", &[a.input_seq_length, a.model], |v| {
        let m = v[1].model()?;
        num(model::attention_flops(v[0].count()?, m.hidden_size, m.num_layers))
    })?;
    let prefill_flops = g.derived("prefill_flops", &[matmul, attention], |v| {
        num(v[0].number()? + v[1].number()?)
    })?;
    let prefill_time = g.derived("prefill_time", &[prefill_flops, total_compute], |v| {
        num(model::compute_time_ms(v[0].number()?, v[1].number()?))
    })?;

    // Decode
    let kv_per_token = g.derived("kv_cache_per_token", &[a.model, bytes], |v| {
        num(model::kv_cache_per_token(&v[0].model()?, v[1].number()?))
    })?;
    let avg_seq = g.derived("avg_seq_length", &[a.input_seq_length, a.output_seq_length], |v| {
        num(model::avg_seq_length(v[0].count()?, v[1].count()?))
    })?;
    let kv_per_sequence = g.derived("kv_cache_per_sequence", &[avg_seq, kv_per_token], |v| {
        num(v[0].number()? * v[1].number()?)
    })?;
    let weights = g.derived("model_weight_bytes", &[a.model, bytes], |v| {
        num(model::model_weight_bytes(v[0].model()?.model_size, v[1].number()?))
    })?;
    let bytes_per_decode = g.derived(
        "total_bytes_per_decode",
        &[weights, a.concurrent_users, kv_per_sequence],
        |v| num(v[0].number()? + v[1].number()? * v[2].number()?),
    )?;
    let decode_time = g.derived("decode_time", &[bytes_per_decode, total_bandwidth], |v| {
        num(model::memory_time_ms(v[0].number()?, v[1].number()?))
    })?;
    g.derived("e2e_latency", &[prefill_time, a.output_seq_length, decode_time], |v| {
        num(v[0].number()? + v[1].number()? * v[2].number()?)
    })?;

    // Batch
    let total_prefill = g.derived("total_prefill_time", &[a.concurrent_users, prefill_time], |v| {
        num(v[0].number()? * v[1].number()?)
    })?;
    let total_decode = g.derived("total_decode_time", &[a.output_seq_length, decode_time], |v| {
        num(v[0].number()? * v[1].number()?)
    })?;
    let total_time = g.derived("total_time", &[total_prefill, total_decode], |v| {
        num(v[0].number()? + v[1].number()?)
    })?;

    // Chunked prefilling
    g.derived("decode_tokens_used", &[a.concurrent_users], |v| num(v[0].number()?))?;
    let available = g.derived("available_tokens_for_prefill", &[a.concurrent_users], |v| {
        num(model::available_tokens_for_prefill(v[0].count()?) as f64)
    })?;
    g.derived("complete_prefills_fit", &[available, a.input_seq_length], |v| {
        num(model::complete_prefills_fit(v[0].number()? as i64, v[1].count()?) as f64)
    })?;
    let needed = g.derived(
        "total_prefill_tokens_needed",
        &[a.concurrent_users, a.input_seq_length],
        |v| num((v[0].count()? as u64 * v[1].count()? as u64) as f64),
    )?;
    let can_overlap = g.derived(
        "can_overlap_prefills",
        &[available, a.output_seq_length, needed],
        |v| {
            Ok(Value::Flag(model::can_overlap_prefills(
                v[0].number()? as i64,
                v[1].count()?,
                v[2].number()? as u64,
            )))
        },
    )?;
    let leftover_tokens = g.derived(
        "non_overlapped_prefill_tokens",
        &[a.concurrent_users, a.input_seq_length, a.output_seq_length, threshold],
        |v| {
            num(model::non_overlapped_prefill_tokens(
                v[0].count()?,
                v[1].count()?,
                v[2].count()?,
                v[3].count()?,
            ))
        },
    )?;
    let leftover_time = g.derived(
        "non_overlapped_prefill_time",
        &[leftover_tokens, a.model, total_compute],
        |v| {
            let flops = v[0].number()? * 2.0 * v[1].model()?.parameters();
            num(model::compute_time_ms(flops, v[2].number()?))
        },
    )?;
    let chunked_time = g.derived(
        "total_time_chunked",
        &[total_decode, total_time, can_overlap, leftover_time],
        |v| {
            num(model::chunked_total_time_ms(
                v[0].number()?,
                v[1].number()?,
                v[2].flag()?,
                v[3].number()?,
            ))
        },
    )?;
    let time_with_mode = g.derived(
        "total_time_with_mode",
        &[total_time, chunked_time, a.chunked_prefill],
        |v| {
            if v[2].flag()? {
                num(v[1].number()?)
            } else {
                num(v[0].number()?)
            }
        },
    )?;

    // Throughput
    let output_tokens = g.derived(
        "total_output_tokens",
        &[a.concurrent_users, a.output_seq_length],
        |v| num((v[0].count()? as u64 * v[1].count()? as u64) as f64),
    )?;
    let tput = g.derived("throughput", &[output_tokens, time_with_mode], |v| {
        num(model::throughput(v[0].number()? as u64, v[1].number()?))
    })?;
    g.derived("throughput_per_gpu", &[tput, a.tensor_parallelism], |v| {
        num(v[0].number()? / v[1].number()?)
    })?;
    g.derived("prefill_time_percent", &[total_prefill, total_time], |v| {
        num(v[0].number()? / v[1].number()? * 100.0)
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{evaluate, ModelPreset};

    fn store() -> InferenceStore {
        InferenceStore::new(&WorkloadConfig::default(), &ModelPreset::Llama70B.spec()).unwrap()
    }

    #[test]
    fn test_snapshot_matches_evaluate() {
        let mut s = store();
        let expected = evaluate(&WorkloadConfig::default(), &ModelPreset::Llama70B.spec());
        assert_eq!(s.snapshot().unwrap(), expected);
    }

    #[test]
    fn test_config_round_trips() {
        let mut s = store();
        assert_eq!(s.config().unwrap(), WorkloadConfig::default());
    }

    #[test]
    fn test_isl_change_leaves_decode_weights_alone() {
        let mut s = store();
        s.snapshot().unwrap();

        let touched = s.set_input_seq_length(2048).unwrap();
        assert!(touched.contains(&"prefill_time".to_string()));
        assert!(touched.contains(&"avg_seq_length".to_string()));
        assert!(!touched.contains(&"model_weight_bytes".to_string()));
        assert!(!touched.contains(&"total_compute".to_string()));
        assert!(!s.graph.is_stale(s.graph.id("total_compute").unwrap()));
        assert!(s.graph.is_stale(s.graph.id("prefill_time").unwrap()));
    }

    #[test]
    fn test_only_downstream_recomputes() {
        let mut s = store();
        s.snapshot().unwrap();
        let before = s.recomputations();

        s.set_chunked_prefill(false).unwrap();
        s.snapshot().unwrap();

        // total_time_with_mode, throughput, throughput_per_gpu
        assert_eq!(s.recomputations() - before, 3);
    }

    #[test]
    fn test_unchanged_value_touches_nothing() {
        let mut s = store();
        s.snapshot().unwrap();
        assert!(s.set_tensor_parallelism(2).unwrap().is_empty());
    }

    #[test]
    fn test_accelerator_switch_drops_unsupported_fp4() {
        let config = WorkloadConfig {
            accelerator: Accelerator::B200,
            precision: Precision::FP4,
            ..Default::default()
        };
        let mut s = InferenceStore::new(&config, &ModelPreset::Llama70B.spec()).unwrap();
        assert_eq!(s.config().unwrap().precision, Precision::FP4);

        let touched = s.set_accelerator(Accelerator::H100).unwrap();
        assert_eq!(s.config().unwrap().precision, Precision::FP8);
        assert!(touched.contains(&"bytes_per_param".to_string()));
    }

    #[test]
    fn test_fp4_request_on_hopper_resolves_to_fp8() {
        let mut s = store();
        s.set_precision(Precision::FP4).unwrap();
        assert_eq!(s.config().unwrap().precision, Precision::FP8);
    }

    #[test]
    fn test_set_config_tracks_evaluate() {
        let mut s = store();
        let model = ModelPreset::Llama70B.spec();
        let configs = [
            WorkloadConfig { tensor_parallelism: 8, concurrent_users: 128, ..Default::default() },
            WorkloadConfig { accelerator: Accelerator::Mi355x, precision: Precision::FP4, ..Default::default() },
            WorkloadConfig {
                input_seq_length: 8192,
                output_seq_length: 1024,
                chunked_prefill: false,
                ..Default::default()
            },
        ];
        for config in &configs {
            s.set_config(config).unwrap();
            assert_eq!(s.snapshot().unwrap(), evaluate(config, &model));
        }
    }

    #[test]
    fn test_model_swap() {
        let mut s = store();
        let small = ModelPreset::Llama8B.spec();
        s.set_model(&small).unwrap();
        assert_eq!(s.model().unwrap(), small);
        assert_eq!(s.snapshot().unwrap(), evaluate(&WorkloadConfig::default(), &small));
    }

    #[test]
    fn test_dependencies_per_atom() {
        let s = store();
        let deps = s.dependencies().unwrap();
        let atoms: Vec<&str> = deps.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(
            atoms,
            vec![
                "tensor_parallelism",
                "concurrent_users",
                "input_seq_length",
                "output_seq_length",
                "accelerator",
                "precision",
                "chunked_prefill",
                "model",
            ]
        );

        let of = |atom: &str| deps.iter().find(|(a, _)| a == atom).map(|(_, d)| d.clone()).unwrap();
        assert_eq!(of("chunked_prefill"), vec!["total_time_with_mode", "throughput", "throughput_per_gpu"]);
        assert!(of("input_seq_length").contains(&"prefill_time".to_string()));
        assert!(!of("input_seq_length").contains(&"model_weight_bytes".to_string()));
    }

    #[test]
    fn test_type_mismatch_reports_kinds() {
        let err = Value::Flag(true).number().unwrap_err();
        assert_eq!(err, GraphError::TypeMismatch { expected: "number", found: "flag" });
    }
}
