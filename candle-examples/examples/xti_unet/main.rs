//! XTI UNet example.
//!
//! Runs a single denoising step of a Stable Diffusion UNet where every
//! cross-attention layer reads its own embedding, as produced by extended
//! textual inversion training.
//!
//! ```bash
//! # Download the SD 1.5 UNet and run with zero per-layer conditioning
//! cargo run --example xti_unet --release -- --height 512 --width 512
//!
//! # Use learned XTI embeddings, a safetensors file keyed IN01, IN02, ..., MID, ..., OUT11
//! cargo run --example xti_unet --release -- --embeddings my_token_xti.safetensors
//!
//! # Local weights, gradient checkpointing and a chrome trace
//! cargo run --example xti_unet --release -- \
//!     --unet-weights unet.safetensors --config unet_config.json \
//!     --gradient-checkpointing --tracing
//! ```

#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use anyhow::{Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use clap::Parser;
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::PathBuf;

use candle_xti::models::xti_unet::{
    debug::tensor_stats, Conditioning, UNet2DConditionModel, UNet2DConditionModelConfig,
    XtiLayout,
};

const VAE_SCALE_FACTOR: usize = 8;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stable Diffusion UNet with per-layer XTI conditioning")]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// Run in f32 rather than f16.
    #[arg(long)]
    use_f32: bool,

    /// HuggingFace repo holding a diffusers `unet/` directory.
    #[arg(long, default_value = "stable-diffusion-v1-5/stable-diffusion-v1-5")]
    model_id: String,

    /// Local UNet weights (safetensors). Downloaded from `--model-id` when absent.
    #[arg(long)]
    unet_weights: Option<PathBuf>,

    /// Local diffusers `unet/config.json`. Defaults to the SD 1.5 layout with
    /// `--unet-weights`, and to the downloaded config otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Image height in pixels, the latent is 8 times smaller.
    #[arg(long, default_value_t = 512)]
    height: usize,

    /// Image width in pixels, the latent is 8 times smaller.
    #[arg(long, default_value_t = 512)]
    width: usize,

    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Token count of the conditioning.
    #[arg(long, default_value_t = 77)]
    seq_len: usize,

    #[arg(long, default_value_t = 999.)]
    timestep: f64,

    /// Per-layer embeddings keyed by XTI layer name, each `[seq, dim]` or `[batch, seq, dim]`.
    #[arg(long)]
    embeddings: Option<PathBuf>,

    /// Feed one context to every cross-attention layer (the `MID` embedding when
    /// `--embeddings` is set, zeros otherwise).
    #[arg(long)]
    shared: bool,

    /// Run in training mode with gradient checkpointing.
    #[arg(long)]
    gradient_checkpointing: bool,
}

fn load_model_files(args: &Args) -> Result<(PathBuf, UNet2DConditionModelConfig)> {
    let local_config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Some(UNet2DConditionModelConfig::from_diffusers_json(&json)?)
        }
        None => None,
    };
    if let Some(weights) = &args.unet_weights {
        let config = local_config.unwrap_or_else(UNet2DConditionModelConfig::sd_v1_5);
        return Ok((weights.clone(), config));
    }
    let api = Api::new()?;
    let repo = api.repo(Repo::new(args.model_id.clone(), RepoType::Model));
    let weights = repo.get("unet/diffusion_pytorch_model.safetensors")?;
    let config = match local_config {
        Some(config) => config,
        None => {
            let path = repo.get("unet/config.json")?;
            let json = std::fs::read_to_string(path)?;
            UNet2DConditionModelConfig::from_diffusers_json(&json)?
        }
    };
    Ok((weights, config))
}

/// Bring a `[seq, dim]` or `[batch, seq, dim]` embedding to `[batch, seq, dim]`.
fn to_batched(t: Tensor, batch: usize, dtype: DType) -> Result<Tensor> {
    let t = match t.rank() {
        2 => t.unsqueeze(0)?,
        3 => t,
        rank => anyhow::bail!("expected an embedding of rank 2 or 3, got rank {rank}"),
    };
    let (_, seq, dim) = t.dims3()?;
    let t = if t.dim(0)? == batch {
        t
    } else {
        t.broadcast_as((batch, seq, dim))?.contiguous()?
    };
    Ok(t.to_dtype(dtype)?)
}

fn build_conditioning(
    args: &Args,
    layout: &XtiLayout,
    cross_attention_dim: usize,
    device: &Device,
    dtype: DType,
) -> Result<Conditioning> {
    let shape = (args.batch, args.seq_len, cross_attention_dim);
    let Some(path) = &args.embeddings else {
        return if args.shared {
            Ok(Conditioning::Shared(Tensor::zeros(shape, dtype, device)?))
        } else {
            Ok(Conditioning::zeros(layout, shape, dtype, device)?)
        };
    };
    let mut named = candle_xti_examples::load_tensor_map(path, device)?;
    for t in named.values_mut() {
        *t = to_batched(t.clone(), args.batch, dtype)?;
    }
    println!("loaded {} embeddings from {}", named.len(), path.display());
    if args.shared {
        let mid = named
            .get("MID")
            .context("--shared needs a MID embedding in the embeddings file")?;
        return Ok(Conditioning::Shared(mid.clone()));
    }
    Ok(Conditioning::from_named(&named, layout)?)
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };

    let device = candle_xti_examples::device(args.cpu)?;
    let dtype = if args.use_f32 || device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    };

    let (weights, config) = load_model_files(&args)?;
    let cross_attention_dim = config.cross_attention_dim;
    let in_channels = config.in_channels;
    let start = std::time::Instant::now();
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, &device)? };
    let mut unet = UNet2DConditionModel::new(vb, config)?;
    println!("loaded the unet in {:?}", start.elapsed());
    if args.gradient_checkpointing {
        unet.set_training(true);
        unet.set_gradient_checkpointing(true);
    }

    let layout = unet.xti_layout();
    println!(
        "{} cross-attention sites: {}",
        layout.len(),
        layout.names().collect::<Vec<_>>().join(" ")
    );
    let conditioning =
        build_conditioning(&args, layout, cross_attention_dim, &device, dtype)?;

    let (h, w) = (args.height / VAE_SCALE_FACTOR, args.width / VAE_SCALE_FACTOR);
    let latents = Tensor::randn(0f32, 1., (args.batch, in_channels, h, w), &device)?
        .to_dtype(dtype)?;

    let start = std::time::Instant::now();
    let out = unet.forward_output(&latents, args.timestep, &conditioning, true)?;
    let sample = out.sample();
    println!("forward pass in {:?}", start.elapsed());
    let (mean, std, min, max) = tensor_stats(sample)?;
    println!(
        "output {:?}: mean={mean:.5} std={std:.5} min={min:.5} max={max:.5}",
        sample.dims()
    );
    Ok(())
}
