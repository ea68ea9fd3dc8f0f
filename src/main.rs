use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use fold_attention::fused::ScaledReferenceProvider;
use fold_attention::masks::{key_mask_bias, mask_from_lengths};
use fold_attention::{
    setup_device, AttentionDispatcher, AttentionStrategy, Config, RuntimeCapabilities,
};

const BATCH: usize = 1;
const HEAD_DIM: usize = 32;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Compare every attention strategy against direct attention",
    long_about = None
)]
struct Args {
    #[arg(long, value_name = "PATH", help = "TOML attention config; env overrides still apply")]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 256, value_parser = positive, help = "Sequence length")]
    seq: usize,

    #[arg(long, default_value_t = 4, value_parser = positive, help = "Number of heads")]
    heads: usize,

    #[arg(long, default_value_t = 64, value_parser = positive, help = "Query chunk size")]
    q_chunk: usize,

    #[arg(long, default_value_t = 96, value_parser = positive, help = "Key/value chunk size")]
    kv_chunk: usize,
}

fn positive(value: &str) -> std::result::Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be greater than zero".to_string()),
        Ok(parsed) => Ok(parsed),
        Err(err) => Err(format!("expected a positive integer: {err}")),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("failed to load attention config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn max_deviation(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?)
}

fn random_inputs(args: &Args, inf: f64, device: &Device) -> Result<(Tensor, Tensor, Tensor, Vec<Tensor>)> {
    let shape = (BATCH, args.heads, args.seq, HEAD_DIM);
    let scale = 1.0 / (HEAD_DIM as f64).sqrt();
    let q = (Tensor::randn(0f32, 1.0, shape, device)? * scale)?;
    let k = Tensor::randn(0f32, 1.0, shape, device)?;
    let v = Tensor::randn(0f32, 1.0, shape, device)?;

    // Pad the last quarter of keys and add a dense per-head pair bias.
    let real = args.seq - args.seq / 4;
    let mask = mask_from_lengths(device, &[real], args.seq)?;
    let key_bias = key_mask_bias(&mask, inf)?.unsqueeze(1)?;
    let pair_bias = Tensor::randn(0f32, 1.0, (BATCH, args.heads, args.seq, args.seq), device)?;
    Ok((q, k, v, vec![key_bias, pair_bias]))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let device = setup_device()?;

    println!("Attention strategy parity");
    println!("=========================\n");
    println!(
        "seq={} heads={} head_dim={} q_chunk={} kv_chunk={} precision={:?}",
        args.seq, args.heads, HEAD_DIM, args.q_chunk, args.kv_chunk, config.precision
    );
    println!("configured strategy: {}\n", config.resolved_strategy()?);

    let dispatcher = AttentionDispatcher::new(
        config.clone(),
        RuntimeCapabilities::with_fused(Arc::new(ScaledReferenceProvider)),
    )?;
    let (q, k, v, biases) = random_inputs(&args, config.inf, &device)?;

    let start = Instant::now();
    let direct = dispatcher.run(AttentionStrategy::Direct, &q, &k, &v, &biases)?;
    println!("{:<16} {:>12} {:>10.2?}", "direct", "-", start.elapsed());

    let unscaled_q = (&q * (HEAD_DIM as f64).sqrt())?;
    let strategies = [
        AttentionStrategy::ChunkedRecompute {
            chunk_size: args.q_chunk,
        },
        AttentionStrategy::LowMemory {
            q_chunk_size: args.q_chunk,
            kv_chunk_size: args.kv_chunk,
        },
        AttentionStrategy::Fused,
    ];
    let mut worst = 0f32;
    for strategy in strategies {
        let query = if strategy.scales_internally() { &unscaled_q } else { &q };
        let start = Instant::now();
        let out = dispatcher.run(strategy, query, &k, &v, &biases)?;
        let elapsed = start.elapsed();
        let deviation = max_deviation(&out, &direct)?;
        worst = worst.max(deviation);
        println!("{:<16} {:>12.3e} {:>10.2?}", strategy.name(), deviation, elapsed);
    }

    println!("\nmax deviation from direct: {worst:.3e}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_fall_back_to_defaults() {
        let args = Args::try_parse_from(["attn-parity", "--seq", "32", "--q-chunk=8"]).unwrap();
        assert_eq!((args.seq, args.heads, args.q_chunk, args.kv_chunk), (32, 4, 8, 96));
        assert!(args.config.is_none());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(Args::try_parse_from(["attn-parity", "--heads", "0"]).is_err());
        assert!(Args::try_parse_from(["attn-parity", "--kv-chunk", "many"]).is_err());
    }
}
