//! Configuration for the conditional UNet.
//!
//! The defaults describe the Stable Diffusion 1.x UNet, whose cross-attention
//! topology yields the 16 per-layer embeddings used by XTI checkpoints.

use serde::Deserialize;

/// Configuration of one down block and its mirrored up block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BlockConfig {
    /// Output channels of the block.
    pub out_channels: usize,
    /// When `Some(depth)`, the block interleaves a spatial transformer with
    /// `depth` transformer layers after each resnet.
    pub use_cross_attn: Option<usize>,
    /// Number of attention heads in the block's transformers.
    pub num_attention_heads: usize,
}

/// Configuration for [`super::UNet2DConditionModel`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UNet2DConditionModelConfig {
    /// Latent channels fed to `conv_in` (default: 4).
    #[serde(default = "default_latent_channels")]
    pub in_channels: usize,

    /// Channels produced by `conv_out` (default: 4).
    #[serde(default = "default_latent_channels")]
    pub out_channels: usize,

    /// Map the input sample from [0, 1] to [-1, 1] before `conv_in` (default: false).
    #[serde(default)]
    pub center_input_sample: bool,

    /// Emit `[cos, sin]` instead of `[sin, cos]` in the timestep projection (default: true).
    #[serde(default = "default_true")]
    pub flip_sin_to_cos: bool,

    /// Frequency shift of the timestep projection (default: 0).
    #[serde(default)]
    pub freq_shift: f64,

    /// Down blocks in order; up blocks mirror them in reverse.
    #[serde(default = "default_blocks")]
    pub blocks: Vec<BlockConfig>,

    /// Resnets per down block; up blocks use one more (default: 2).
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,

    /// Padding of the strided downsampling convolutions (default: 1).
    #[serde(default = "default_downsample_padding")]
    pub downsample_padding: usize,

    /// Output scale factor of the mid block resnets (default: 1).
    #[serde(default = "default_mid_block_scale_factor")]
    pub mid_block_scale_factor: f64,

    /// Group count of every group norm (default: 32).
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,

    /// Epsilon of every group norm (default: 1e-5).
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,

    /// Feature size of the encoder hidden states (default: 768).
    #[serde(default = "default_cross_attention_dim")]
    pub cross_attention_dim: usize,

    /// Compute attention in slices of this many heads to bound memory.
    #[serde(default)]
    pub sliced_attention_size: Option<usize>,

    /// Use linear instead of 1x1 conv projections around the transformers.
    #[serde(default)]
    pub use_linear_projection: bool,
}

fn default_latent_channels() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_blocks() -> Vec<BlockConfig> {
    UNet2DConditionModelConfig::sd_v1_5().blocks
}
fn default_layers_per_block() -> usize {
    2
}
fn default_downsample_padding() -> usize {
    1
}
fn default_mid_block_scale_factor() -> f64 {
    1.
}
fn default_norm_num_groups() -> usize {
    32
}
fn default_norm_eps() -> f64 {
    1e-5
}
fn default_cross_attention_dim() -> usize {
    768
}

impl Default for UNet2DConditionModelConfig {
    fn default() -> Self {
        Self::sd_v1_5()
    }
}

impl UNet2DConditionModelConfig {
    /// Stable Diffusion 1.5 UNet.
    pub fn sd_v1_5() -> Self {
        let bc = |out_channels, use_cross_attn| BlockConfig {
            out_channels,
            use_cross_attn,
            num_attention_heads: 8,
        };
        Self {
            in_channels: 4,
            out_channels: 4,
            center_input_sample: false,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            blocks: vec![
                bc(320, Some(1)),
                bc(640, Some(1)),
                bc(1280, Some(1)),
                bc(1280, None),
            ],
            layers_per_block: 2,
            downsample_padding: 1,
            mid_block_scale_factor: 1.,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            cross_attention_dim: 768,
            sliced_attention_size: None,
            use_linear_projection: false,
        }
    }

    /// Stable Diffusion 2.1 UNet (OpenCLIP context, linear projections).
    pub fn sd_v2_1() -> Self {
        let bc = |out_channels, use_cross_attn, num_attention_heads| BlockConfig {
            out_channels,
            use_cross_attn,
            num_attention_heads,
        };
        Self {
            blocks: vec![
                bc(320, Some(1), 5),
                bc(640, Some(1), 10),
                bc(1280, Some(1), 20),
                bc(1280, None, 20),
            ],
            cross_attention_dim: 1024,
            use_linear_projection: true,
            ..Self::sd_v1_5()
        }
    }

    /// Number of upsampling layers, i.e. the log2 of the overall resolution factor.
    pub fn num_upsamplers(&self) -> usize {
        self.blocks.len().saturating_sub(1)
    }

    /// Spatial sizes divisible by this factor need no upsample-size forwarding.
    pub fn default_overall_up_factor(&self) -> usize {
        1 << self.num_upsamplers()
    }

    /// Parse a diffusers `unet/config.json`.
    pub fn from_diffusers_json(json: &str) -> candle::Result<Self> {
        let cfg: DiffusersUNetConfig =
            serde_json::from_str(json).map_err(|e| candle::Error::Msg(e.to_string()))?;
        cfg.into_config()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum HeadSpec {
    Uniform(usize),
    PerBlock(Vec<usize>),
}

/// The subset of diffusers' UNet2DConditionModel config this crate understands.
#[derive(Debug, Clone, Deserialize)]
struct DiffusersUNetConfig {
    #[serde(default = "default_latent_channels")]
    in_channels: usize,
    #[serde(default = "default_latent_channels")]
    out_channels: usize,
    #[serde(default)]
    center_input_sample: bool,
    #[serde(default = "default_true")]
    flip_sin_to_cos: bool,
    #[serde(default)]
    freq_shift: f64,
    down_block_types: Vec<String>,
    block_out_channels: Vec<usize>,
    #[serde(default = "default_layers_per_block")]
    layers_per_block: usize,
    #[serde(default = "default_downsample_padding")]
    downsample_padding: usize,
    #[serde(default = "default_mid_block_scale_factor")]
    mid_block_scale_factor: f64,
    #[serde(default = "default_norm_num_groups")]
    norm_num_groups: usize,
    #[serde(default = "default_norm_eps")]
    norm_eps: f64,
    #[serde(default = "default_cross_attention_dim")]
    cross_attention_dim: usize,
    // diffusers stores the head count of SD 1.x/2.x under this name.
    attention_head_dim: HeadSpec,
    #[serde(default)]
    use_linear_projection: bool,
    #[serde(default)]
    transformer_layers_per_block: Option<HeadSpec>,
}

impl DiffusersUNetConfig {
    fn into_config(self) -> candle::Result<UNet2DConditionModelConfig> {
        let n_blocks = self.block_out_channels.len();
        if self.down_block_types.len() != n_blocks {
            candle::bail!(
                "down_block_types has {} entries but block_out_channels has {}",
                self.down_block_types.len(),
                n_blocks
            );
        }
        let per_block = |spec: &HeadSpec, what: &str| -> candle::Result<Vec<usize>> {
            match spec {
                HeadSpec::Uniform(v) => Ok(vec![*v; n_blocks]),
                HeadSpec::PerBlock(v) if v.len() == n_blocks => Ok(v.clone()),
                HeadSpec::PerBlock(v) => {
                    candle::bail!("{what} has {} entries, expected {n_blocks}", v.len())
                }
            }
        };
        let heads = per_block(&self.attention_head_dim, "attention_head_dim")?;
        let depths = match &self.transformer_layers_per_block {
            Some(spec) => per_block(spec, "transformer_layers_per_block")?,
            None => vec![1; n_blocks],
        };
        let mut blocks = Vec::with_capacity(n_blocks);
        for (i, block_type) in self.down_block_types.iter().enumerate() {
            let use_cross_attn = match block_type.as_str() {
                "CrossAttnDownBlock2D" => Some(depths[i]),
                "DownBlock2D" => None,
                other => candle::bail!("unsupported down block type {other}"),
            };
            blocks.push(BlockConfig {
                out_channels: self.block_out_channels[i],
                use_cross_attn,
                num_attention_heads: heads[i],
            });
        }
        Ok(UNet2DConditionModelConfig {
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            center_input_sample: self.center_input_sample,
            flip_sin_to_cos: self.flip_sin_to_cos,
            freq_shift: self.freq_shift,
            blocks,
            layers_per_block: self.layers_per_block,
            downsample_padding: self.downsample_padding,
            mid_block_scale_factor: self.mid_block_scale_factor,
            norm_num_groups: self.norm_num_groups,
            norm_eps: self.norm_eps,
            cross_attention_dim: self.cross_attention_dim,
            sliced_attention_size: None,
            use_linear_projection: self.use_linear_projection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SD15_UNET_JSON: &str = r#"{
        "_class_name": "UNet2DConditionModel",
        "_diffusers_version": "0.6.0",
        "act_fn": "silu",
        "attention_head_dim": 8,
        "block_out_channels": [320, 640, 1280, 1280],
        "center_input_sample": false,
        "cross_attention_dim": 768,
        "down_block_types": [
            "CrossAttnDownBlock2D",
            "CrossAttnDownBlock2D",
            "CrossAttnDownBlock2D",
            "DownBlock2D"
        ],
        "downsample_padding": 1,
        "flip_sin_to_cos": true,
        "freq_shift": 0,
        "in_channels": 4,
        "layers_per_block": 2,
        "mid_block_scale_factor": 1,
        "norm_eps": 1e-05,
        "norm_num_groups": 32,
        "out_channels": 4,
        "sample_size": 64,
        "up_block_types": [
            "UpBlock2D",
            "CrossAttnUpBlock2D",
            "CrossAttnUpBlock2D",
            "CrossAttnUpBlock2D"
        ]
    }"#;

    #[test]
    fn test_diffusers_sd15_matches_preset() -> candle::Result<()> {
        let cfg = UNet2DConditionModelConfig::from_diffusers_json(SD15_UNET_JSON)?;
        assert_eq!(cfg, UNet2DConditionModelConfig::sd_v1_5());
        assert_eq!(cfg.num_upsamplers(), 3);
        assert_eq!(cfg.default_overall_up_factor(), 8);
        Ok(())
    }

    #[test]
    fn test_diffusers_per_block_heads() -> candle::Result<()> {
        let json = SD15_UNET_JSON
            .replace("\"attention_head_dim\": 8", "\"attention_head_dim\": [5, 10, 20, 20]")
            .replace("\"cross_attention_dim\": 768", "\"cross_attention_dim\": 1024")
            .replace(
                "\"act_fn\": \"silu\"",
                "\"act_fn\": \"silu\", \"use_linear_projection\": true",
            );
        let cfg = UNet2DConditionModelConfig::from_diffusers_json(&json)?;
        assert_eq!(cfg, UNet2DConditionModelConfig::sd_v2_1());
        Ok(())
    }

    #[test]
    fn test_diffusers_rejects_unknown_block() {
        let json = SD15_UNET_JSON.replace("\"DownBlock2D\"\n", "\"AttnDownBlock2D\"\n");
        assert!(UNet2DConditionModelConfig::from_diffusers_json(&json).is_err());
    }

    #[test]
    fn test_serde_defaults_are_sd15() {
        let cfg: UNet2DConditionModelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, UNet2DConditionModelConfig::sd_v1_5());
    }
}
