//! LLM Inference Cost Explorer
//!
//! Estimates time to first token, time per output token, end-to-end latency
//! and throughput for a model served on a tensor-parallel accelerator group,
//! and compares the estimate against measured benchmark data.

mod benchmark;
mod cli;
mod graph;
mod input;
mod model;
mod posts;
mod server;
mod sidenotes;
mod store;
mod sweep;


use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use benchmark::{compare, BenchmarkLoader, Lookup};
use cli::{format_bytes, format_large_number, format_ms, format_number, format_scientific, format_tps, Cli};
use model::{Metrics, WorkloadConfig, MAX_NUM_BATCHED_TOKENS};
use store::InferenceStore;
use sweep::SweepPoint;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    if let Some(path) = &args.sidenotes {
        return run_sidenotes(path);
    }

    if let Some(port) = args.serve {
        let state = server::ServerState::new(
            args.to_config(),
            args.model,
            args.data_dir.clone(),
            args.posts_dir.clone(),
        )?;
        return server::run_server(state, port);
    }

    if args.sweep {
        return run_sweep(&args);
    }

    if args.compare {
        return run_compare(&args);
    }

    if args.json {
        return run_json(&args);
    }

    run_report(&args)
}

fn run_sidenotes(path: &std::path::Path) -> Result<()> {
    let markdown = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let html = sidenotes::transform(&markdown).context("compiling sidenote patterns")?;
    println!("{}", html);
    Ok(())
}

fn run_json(args: &Cli) -> Result<()> {
    let config = args.to_config();
    let model = args.model.spec();
    let mut store = InferenceStore::new(&config, &model)?;
    let metrics = store.snapshot()?;

    let out = serde_json::json!({
        "config": config,
        "model": { "name": args.model.name(), "spec": store.model()? },
        "metrics": metrics,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn run_sweep(args: &Cli) -> Result<()> {
    let config = args.to_config();
    let model = args.model.spec();

    let mut points: Vec<SweepPoint> = Vec::new();
    if args.sweep_values.is_none() {
        let lookup = benchmark::lookup(&args.benchmark_source(), &config);
        if let Some(rows) = lookup.rows() {
            points = sweep::sweep_rows(&config, &model, args.axis, rows);
        }
    }
    if points.is_empty() {
        let values = args.parse_sweep_values()?;
        points = sweep::sweep_values(&config, &model, args.axis, &values);
    }

    eprintln!("Sweeping {} ({} points)", args.axis.label(), points.len());
    println!("{}", SweepPoint::csv_header());
    for p in &points {
        println!("{}", p.to_csv());
    }
    Ok(())
}

fn run_compare(args: &Cli) -> Result<()> {
    let config = args.to_config();
    let model = args.model.spec();
    let mut store = InferenceStore::new(&config, &model)?;
    let metrics = store.snapshot()?;

    println!("=== Theoretical vs Actual ===\n");
    print_config(args, &config);

    let mut loader = BenchmarkLoader::new();
    let ticket = loader.begin();
    loader.complete(ticket, benchmark::lookup(&args.benchmark_source(), &config));
    match loader.current() {
        Some(Lookup::Unavailable(reason)) => {
            println!("  {}", reason);
        }
        Some(lookup) => match lookup.matching(&config) {
            Some(row) => {
                let c = compare(row, &metrics);
                println!("--- {} (TP={}, Conc={}) ---", c.framework, c.tp, c.conc);
                println!("  {:<22} {:>12} {:>12} {:>8}", "", "Theoretical", "Actual", "%");
                println!(
                    "  {:<22} {:>12} {:>12} {:>7.1}%",
                    "E2E latency (s)",
                    format_number(c.theoretical_e2e_s, 3),
                    format_number(c.actual_e2e_s, 3),
                    c.latency_percent
                );
                println!(
                    "  {:<22} {:>12} {:>12} {:>7.1}%",
                    "Throughput/GPU (tok/s)",
                    format_number(c.theoretical_tput_per_gpu, 1),
                    format_number(c.actual_tput_per_gpu, 1),
                    c.throughput_percent
                );
            }
            None => {
                println!(
                    "  No benchmark data for TP={}, Conc={}",
                    config.tensor_parallelism, config.concurrent_users
                );
            }
        },
        None => {}
    }
    println!();
    Ok(())
}

fn print_config(args: &Cli, config: &WorkloadConfig) {
    let spec = config.spec();
    println!("Configuration:");
    println!("  Model:         {}", args.model.name());
    println!("  Accelerator:   {} x{}", spec.name, config.tensor_parallelism);
    if config.precision != args.precision {
        println!(
            "  Precision:     {} ({} unsupported on {})",
            config.precision.name(),
            args.precision.name(),
            config.accelerator.id()
        );
    } else {
        println!("  Precision:     {}", config.precision.name());
    }
    println!("  Users:         {}", config.concurrent_users);
    println!("  ISL / OSL:     {} / {}", config.input_seq_length, config.output_seq_length);
    println!(
        "  Prefill mode:  {}",
        if config.chunked_prefill { "chunked" } else { "sequential" }
    );
    println!();
}

fn run_report(args: &Cli) -> Result<()> {
    let config = args.to_config();
    let mut store = InferenceStore::new(&config, &args.model.spec())?;
    let m = store.snapshot()?;

    println!("=== LLM Inference Cost Explorer ===\n");
    print_config(args, &config);

    println!("--- Hardware (TP={}) ---", config.tensor_parallelism);
    println!("  Compute:       {} FLOP/s", format_scientific(m.total_compute, 3));
    println!("  Bandwidth:     {}/s", format_bytes(m.total_memory_bandwidth));
    println!("  Compute-bound: batch >= {}", m.compute_bound_threshold);
    println!();

    println!("--- Prefill ---");
    if args.verbose {
        println!("  Matmul FLOPs:  {}", format_large_number(m.matmul_flops));
        println!("  Attn FLOPs:    {}", format_large_number(m.attention_flops));
    }
    println!("  FLOPs:         {}", format_large_number(m.prefill_flops));
    println!("  TTFT:          {}", format_ms(m.prefill_time_ms));
    println!();

    println!("--- Decode ---");
    println!("  KV/token:      {}", format_bytes(m.kv_cache_per_token));
    if args.verbose {
        println!("  Avg context:   {} tokens", format_number(m.avg_seq_length, 1));
        println!("  KV/sequence:   {}", format_bytes(m.kv_cache_per_sequence));
        println!("  Weights:       {}", format_bytes(m.model_weight_bytes));
    }
    println!("  Bytes/step:    {}", format_bytes(m.total_bytes_per_decode));
    println!("  TPOT:          {}", format_ms(m.decode_time_ms));
    println!("  E2E latency:   {}", format_ms(m.e2e_latency_ms));
    println!();

    println!("--- Batch ({} users) ---", config.concurrent_users);
    println!("  All prefills:  {}", format_ms(m.total_prefill_time_ms));
    println!("  All decodes:   {}", format_ms(m.total_decode_time_ms));
    println!("  Sequential:    {}", format_ms(m.total_time_ms));
    println!();

    print_chunked(args, &m);

    println!("--- Throughput ---");
    println!("  Output tokens: {}", m.total_output_tokens);
    println!("  Batch time:    {}", format_ms(m.total_time_with_mode_ms));
    println!("  Total:         {}", format_tps(m.throughput));
    println!("  Per GPU:       {}", format_tps(m.throughput_per_gpu));
    println!("  Prefill share: {}%", format_number(m.prefill_time_percent, 1));
    println!();

    if args.verbose {
        println!("--- Dependencies ---");
        for (atom, dependents) in store.dependencies()? {
            println!("  {:<19} {} quantities", atom, dependents.len());
            println!("      {}", dependents.join(", "));
        }
        println!();
    }

    tracing::debug!(recomputations = store.recomputations(), "report evaluated");
    Ok(())
}

fn print_chunked(args: &Cli, m: &Metrics) {
    println!("--- Chunked Prefilling (budget {} tokens/step) ---", MAX_NUM_BATCHED_TOKENS);
    println!("  Decode tokens: {}", m.decode_tokens_used);
    println!("  Prefill room:  {}", m.available_tokens_for_prefill);
    if args.verbose {
        println!("  Whole prompts: {}", m.complete_prefills_fit);
        println!("  Tokens needed: {}", m.total_prefill_tokens_needed);
    }
    if m.can_overlap_prefills {
        println!("  Prefills fully hidden under decode steps");
    } else {
        println!(
            "  Leftover:      {} tokens ({})",
            format_number(m.non_overlapped_prefill_tokens, 0),
            format_ms(m.non_overlapped_prefill_time_ms)
        );
    }
    println!("  Chunked total: {}", format_ms(m.total_time_chunked_ms));
    if m.total_time_chunked_ms < m.total_time_ms {
        println!(
            "  *** Chunking saves {:.1}% over sequential ***",
            (1.0 - m.total_time_chunked_ms / m.total_time_ms) * 100.0
        );
    }
    println!();
}
