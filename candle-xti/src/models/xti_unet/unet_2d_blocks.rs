//! 2D UNet building blocks.
//!
//! Every cross-attention block receives a [`ConditioningSlice`] covering its own
//! sites and hands the `i`-th embedding of that slice to its `i`-th spatial
//! transformer. With shared conditioning every site reads the same tensor.
//!
//! When both `training` and `gradient_checkpointing` are set on a block, its
//! resnets and transformers run through [`checkpoint`].
use std::sync::Arc;

use super::attention::{SpatialTransformer, SpatialTransformerConfig};
use super::checkpoint::checkpoint;
use super::resnet::{ResnetBlock2D, ResnetBlock2DConfig};
use super::xti::ConditioningSlice;
use crate::models::with_tracing::{conv2d, Conv2d};
use candle::{Module, Result, Tensor, D};
use candle_nn as nn;

fn resnet_forward(
    resnet: &Arc<ResnetBlock2D>,
    xs: &Tensor,
    temb: Option<&Tensor>,
    use_checkpoint: bool,
) -> Result<Tensor> {
    if use_checkpoint {
        checkpoint(resnet, xs, temb)
    } else {
        resnet.forward(xs, temb)
    }
}

fn attention_forward(
    attn: &Arc<SpatialTransformer>,
    xs: &Tensor,
    encoder_hidden_states: &Tensor,
    use_checkpoint: bool,
) -> Result<Tensor> {
    if use_checkpoint {
        checkpoint(attn, xs, Some(encoder_hidden_states))
    } else {
        attn.forward(xs, Some(encoder_hidden_states))
    }
}

#[derive(Debug)]
struct Downsample2D {
    conv: Option<Conv2d>,
    padding: usize,
    span: tracing::Span,
}

impl Downsample2D {
    fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        use_conv: bool,
        out_channels: usize,
        padding: usize,
    ) -> Result<Self> {
        let conv = if use_conv {
            let config = nn::Conv2dConfig {
                stride: 2,
                padding,
                ..Default::default()
            };
            let conv = conv2d(in_channels, out_channels, 3, config, vs.pp("conv"))?;
            Some(conv)
        } else {
            None
        };
        let span = tracing::span!(tracing::Level::TRACE, "downsample2d");
        Ok(Self {
            conv,
            padding,
            span,
        })
    }
}

impl Module for Downsample2D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        match &self.conv {
            None => xs.avg_pool2d(2),
            Some(conv) => {
                if self.padding == 0 {
                    let xs = xs
                        .pad_with_zeros(D::Minus1, 0, 1)?
                        .pad_with_zeros(D::Minus2, 0, 1)?;
                    conv.forward(&xs)
                } else {
                    conv.forward(xs)
                }
            }
        }
    }
}

// This does not support the conv-transpose mode.
#[derive(Debug)]
struct Upsample2D {
    conv: Conv2d,
    span: tracing::Span,
}

impl Upsample2D {
    fn new(vs: nn::VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        let config = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = conv2d(in_channels, out_channels, 3, config, vs.pp("conv"))?;
        let span = tracing::span!(tracing::Level::TRACE, "upsample2d");
        Ok(Self { conv, span })
    }

    /// Nearest-neighbour upsampling to `size`, or by a factor 2 when no size is forwarded.
    fn forward(&self, xs: &Tensor, size: Option<(usize, usize)>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = match size {
            None => {
                let (_bsize, _channels, h, w) = xs.dims4()?;
                xs.upsample_nearest2d(2 * h, 2 * w)?
            }
            Some((h, w)) => xs.upsample_nearest2d(h, w)?,
        };
        self.conv.forward(&xs)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UNetMidBlock2DCrossAttnConfig {
    pub num_layers: usize,
    pub resnet_eps: f64,
    pub resnet_groups: Option<usize>,
    pub attn_num_head_channels: usize,
    pub output_scale_factor: f64,
    pub cross_attn_dim: usize,
    pub sliced_attention_size: Option<usize>,
    pub use_linear_projection: bool,
    pub transformer_layers_per_block: usize,
}

impl Default for UNetMidBlock2DCrossAttnConfig {
    fn default() -> Self {
        Self {
            num_layers: 1,
            resnet_eps: 1e-6,
            resnet_groups: Some(32),
            attn_num_head_channels: 1,
            output_scale_factor: 1.,
            cross_attn_dim: 1280,
            sliced_attention_size: None,
            use_linear_projection: false,
            transformer_layers_per_block: 1,
        }
    }
}

#[derive(Debug)]
pub struct UNetMidBlock2DCrossAttn {
    resnet: Arc<ResnetBlock2D>,
    attn_resnets: Vec<(Arc<SpatialTransformer>, Arc<ResnetBlock2D>)>,
    pub training: bool,
    pub gradient_checkpointing: bool,
    span: tracing::Span,
    pub config: UNetMidBlock2DCrossAttnConfig,
}

impl UNetMidBlock2DCrossAttn {
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        temb_channels: Option<usize>,
        config: UNetMidBlock2DCrossAttnConfig,
    ) -> Result<Self> {
        let vs_resnets = vs.pp("resnets");
        let vs_attns = vs.pp("attentions");
        let resnet_groups = config
            .resnet_groups
            .unwrap_or_else(|| usize::min(in_channels / 4, 32));
        let resnet_cfg = ResnetBlock2DConfig {
            eps: config.resnet_eps,
            groups: resnet_groups,
            output_scale_factor: config.output_scale_factor,
            temb_channels,
            ..Default::default()
        };
        let resnet = ResnetBlock2D::new(vs_resnets.pp("0"), in_channels, resnet_cfg)?;
        let n_heads = config.attn_num_head_channels;
        let attn_cfg = SpatialTransformerConfig {
            depth: config.transformer_layers_per_block,
            num_groups: resnet_groups,
            context_dim: Some(config.cross_attn_dim),
            sliced_attention_size: config.sliced_attention_size,
            use_linear_projection: config.use_linear_projection,
        };
        let mut attn_resnets = Vec::with_capacity(config.num_layers);
        for index in 0..config.num_layers {
            let attn = SpatialTransformer::new(
                vs_attns.pp(index),
                in_channels,
                n_heads,
                in_channels / n_heads,
                attn_cfg,
            )?;
            let resnet = ResnetBlock2D::new(vs_resnets.pp(index + 1), in_channels, resnet_cfg)?;
            attn_resnets.push((Arc::new(attn), Arc::new(resnet)))
        }
        let span = tracing::span!(tracing::Level::TRACE, "xa-mid2d");
        Ok(Self {
            resnet: Arc::new(resnet),
            attn_resnets,
            training: false,
            gradient_checkpointing: false,
            span,
            config,
        })
    }

    /// Number of cross-attention sites, i.e. embeddings consumed per forward.
    pub fn num_sites(&self) -> usize {
        self.attn_resnets.len()
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        temb: Option<&Tensor>,
        encoder_hidden_states: ConditioningSlice<'_>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let use_checkpoint = self.training && self.gradient_checkpointing;
        let mut xs = resnet_forward(&self.resnet, xs, temb, use_checkpoint)?;
        for (i, (attn, resnet)) in self.attn_resnets.iter().enumerate() {
            let context = encoder_hidden_states.get(i)?;
            xs = attention_forward(attn, &xs, context, use_checkpoint)?;
            xs = resnet_forward(resnet, &xs, temb, use_checkpoint)?;
        }
        Ok(xs)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DownBlock2DConfig {
    pub num_layers: usize,
    pub resnet_eps: f64,
    pub resnet_groups: usize,
    pub output_scale_factor: f64,
    pub add_downsample: bool,
    pub downsample_padding: usize,
}

impl Default for DownBlock2DConfig {
    fn default() -> Self {
        Self {
            num_layers: 1,
            resnet_eps: 1e-6,
            resnet_groups: 32,
            output_scale_factor: 1.,
            add_downsample: true,
            downsample_padding: 1,
        }
    }
}

#[derive(Debug)]
pub struct DownBlock2D {
    resnets: Vec<Arc<ResnetBlock2D>>,
    downsampler: Option<Downsample2D>,
    pub training: bool,
    pub gradient_checkpointing: bool,
    span: tracing::Span,
    pub config: DownBlock2DConfig,
}

impl DownBlock2D {
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        out_channels: usize,
        temb_channels: Option<usize>,
        config: DownBlock2DConfig,
    ) -> Result<Self> {
        let vs_resnets = vs.pp("resnets");
        let resnet_cfg = ResnetBlock2DConfig {
            out_channels: Some(out_channels),
            eps: config.resnet_eps,
            groups: config.resnet_groups,
            output_scale_factor: config.output_scale_factor,
            temb_channels,
            ..Default::default()
        };
        let resnets = (0..config.num_layers)
            .map(|i| {
                let in_channels = if i == 0 { in_channels } else { out_channels };
                ResnetBlock2D::new(vs_resnets.pp(i), in_channels, resnet_cfg).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        let downsampler = if config.add_downsample {
            let downsampler = Downsample2D::new(
                vs.pp("downsamplers").pp("0"),
                out_channels,
                true,
                out_channels,
                config.downsample_padding,
            )?;
            Some(downsampler)
        } else {
            None
        };
        let span = tracing::span!(tracing::Level::TRACE, "down2d");
        Ok(Self {
            resnets,
            downsampler,
            training: false,
            gradient_checkpointing: false,
            span,
            config,
        })
    }

    /// Number of skip tensors pushed by `forward`.
    pub fn num_outputs(&self) -> usize {
        self.resnets.len() + usize::from(self.downsampler.is_some())
    }

    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>) -> Result<(Tensor, Vec<Tensor>)> {
        let _enter = self.span.enter();
        let use_checkpoint = self.training && self.gradient_checkpointing;
        let mut xs = xs.clone();
        let mut output_states = Vec::with_capacity(self.num_outputs());
        for resnet in self.resnets.iter() {
            xs = resnet_forward(resnet, &xs, temb, use_checkpoint)?;
            output_states.push(xs.clone());
        }
        let xs = match &self.downsampler {
            Some(downsampler) => {
                let xs = downsampler.forward(&xs)?;
                output_states.push(xs.clone());
                xs
            }
            None => xs,
        };
        Ok((xs, output_states))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CrossAttnDownBlock2DConfig {
    pub downblock: DownBlock2DConfig,
    pub attn_num_head_channels: usize,
    pub cross_attention_dim: usize,
    pub sliced_attention_size: Option<usize>,
    pub use_linear_projection: bool,
    pub transformer_layers_per_block: usize,
}

impl Default for CrossAttnDownBlock2DConfig {
    fn default() -> Self {
        Self {
            downblock: Default::default(),
            attn_num_head_channels: 1,
            cross_attention_dim: 1280,
            sliced_attention_size: None,
            use_linear_projection: false,
            transformer_layers_per_block: 1,
        }
    }
}

#[derive(Debug)]
pub struct CrossAttnDownBlock2D {
    downblock: DownBlock2D,
    attentions: Vec<Arc<SpatialTransformer>>,
    pub training: bool,
    pub gradient_checkpointing: bool,
    span: tracing::Span,
    pub config: CrossAttnDownBlock2DConfig,
}

impl CrossAttnDownBlock2D {
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        out_channels: usize,
        temb_channels: Option<usize>,
        config: CrossAttnDownBlock2DConfig,
    ) -> Result<Self> {
        let downblock = DownBlock2D::new(
            vs.clone(),
            in_channels,
            out_channels,
            temb_channels,
            config.downblock,
        )?;
        let n_heads = config.attn_num_head_channels;
        let cfg = SpatialTransformerConfig {
            depth: config.transformer_layers_per_block,
            context_dim: Some(config.cross_attention_dim),
            num_groups: config.downblock.resnet_groups,
            sliced_attention_size: config.sliced_attention_size,
            use_linear_projection: config.use_linear_projection,
        };
        let vs_attn = vs.pp("attentions");
        let attentions = (0..config.downblock.num_layers)
            .map(|i| {
                SpatialTransformer::new(
                    vs_attn.pp(i),
                    out_channels,
                    n_heads,
                    out_channels / n_heads,
                    cfg,
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        let span = tracing::span!(tracing::Level::TRACE, "xa-down2d");
        Ok(Self {
            downblock,
            attentions,
            training: false,
            gradient_checkpointing: false,
            span,
            config,
        })
    }

    /// Number of cross-attention sites, i.e. embeddings consumed per forward.
    pub fn num_sites(&self) -> usize {
        self.attentions.len()
    }

    /// Number of skip tensors pushed by `forward`.
    pub fn num_outputs(&self) -> usize {
        self.downblock.num_outputs()
    }

    /// Runs each (resnet, attention) pair, the `i`-th attention reading
    /// `encoder_hidden_states.get(i)`.
    pub fn forward(
        &self,
        xs: &Tensor,
        temb: Option<&Tensor>,
        encoder_hidden_states: ConditioningSlice<'_>,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let _enter = self.span.enter();
        let use_checkpoint = self.training && self.gradient_checkpointing;
        let mut output_states = Vec::with_capacity(self.num_outputs());
        let mut xs = xs.clone();
        for (i, (resnet, attn)) in self
            .downblock
            .resnets
            .iter()
            .zip(self.attentions.iter())
            .enumerate()
        {
            let context = encoder_hidden_states.get(i)?;
            xs = resnet_forward(resnet, &xs, temb, use_checkpoint)?;
            xs = attention_forward(attn, &xs, context, use_checkpoint)?;
            output_states.push(xs.clone());
        }
        let xs = match &self.downblock.downsampler {
            Some(downsampler) => {
                let xs = downsampler.forward(&xs)?;
                output_states.push(xs.clone());
                xs
            }
            None => xs,
        };
        Ok((xs, output_states))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpBlock2DConfig {
    pub num_layers: usize,
    pub resnet_eps: f64,
    pub resnet_groups: usize,
    pub output_scale_factor: f64,
    pub add_upsample: bool,
}

impl Default for UpBlock2DConfig {
    fn default() -> Self {
        Self {
            num_layers: 1,
            resnet_eps: 1e-6,
            resnet_groups: 32,
            output_scale_factor: 1.,
            add_upsample: true,
        }
    }
}

#[derive(Debug)]
pub struct UpBlock2D {
    resnets: Vec<Arc<ResnetBlock2D>>,
    upsampler: Option<Upsample2D>,
    pub training: bool,
    pub gradient_checkpointing: bool,
    span: tracing::Span,
    pub config: UpBlock2DConfig,
}

impl UpBlock2D {
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        prev_output_channels: usize,
        out_channels: usize,
        temb_channels: Option<usize>,
        config: UpBlock2DConfig,
    ) -> Result<Self> {
        let vs_resnets = vs.pp("resnets");
        let resnet_cfg = ResnetBlock2DConfig {
            out_channels: Some(out_channels),
            temb_channels,
            eps: config.resnet_eps,
            groups: config.resnet_groups,
            output_scale_factor: config.output_scale_factor,
            ..Default::default()
        };
        let resnets = (0..config.num_layers)
            .map(|i| {
                let res_skip_channels = if i == config.num_layers - 1 {
                    in_channels
                } else {
                    out_channels
                };
                let resnet_in_channels = if i == 0 {
                    prev_output_channels
                } else {
                    out_channels
                };
                let in_channels = resnet_in_channels + res_skip_channels;
                ResnetBlock2D::new(vs_resnets.pp(i), in_channels, resnet_cfg).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        let upsampler = if config.add_upsample {
            let upsampler =
                Upsample2D::new(vs.pp("upsamplers").pp("0"), out_channels, out_channels)?;
            Some(upsampler)
        } else {
            None
        };
        let span = tracing::span!(tracing::Level::TRACE, "up2d");
        Ok(Self {
            resnets,
            upsampler,
            training: false,
            gradient_checkpointing: false,
            span,
            config,
        })
    }

    /// Number of skip tensors popped by `forward`.
    pub fn num_resnets(&self) -> usize {
        self.resnets.len()
    }

    /// `res_xs` holds this block's skip tensors, the most recent one last.
    pub fn forward(
        &self,
        xs: &Tensor,
        res_xs: &[Tensor],
        temb: Option<&Tensor>,
        upsample_size: Option<(usize, usize)>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let use_checkpoint = self.training && self.gradient_checkpointing;
        let mut xs = xs.clone();
        for (index, resnet) in self.resnets.iter().enumerate() {
            xs = Tensor::cat(&[&xs, pop_skip(res_xs, index)?], 1)?;
            xs = xs.contiguous()?;
            xs = resnet_forward(resnet, &xs, temb, use_checkpoint)?;
        }
        match &self.upsampler {
            Some(upsampler) => upsampler.forward(&xs, upsample_size),
            None => Ok(xs),
        }
    }
}

/// The skip tensor consumed by the `index`-th resnet of an up block.
fn pop_skip(res_xs: &[Tensor], index: usize) -> Result<&Tensor> {
    match res_xs.len().checked_sub(index + 1) {
        Some(i) => Ok(&res_xs[i]),
        None => candle::bail!(
            "up block resnet {index} has no skip connection left ({} provided)",
            res_xs.len()
        ),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CrossAttnUpBlock2DConfig {
    pub upblock: UpBlock2DConfig,
    pub attn_num_head_channels: usize,
    pub cross_attention_dim: usize,
    pub sliced_attention_size: Option<usize>,
    pub use_linear_projection: bool,
    pub transformer_layers_per_block: usize,
}

impl Default for CrossAttnUpBlock2DConfig {
    fn default() -> Self {
        Self {
            upblock: Default::default(),
            attn_num_head_channels: 1,
            cross_attention_dim: 1280,
            sliced_attention_size: None,
            use_linear_projection: false,
            transformer_layers_per_block: 1,
        }
    }
}

#[derive(Debug)]
pub struct CrossAttnUpBlock2D {
    upblock: UpBlock2D,
    attentions: Vec<Arc<SpatialTransformer>>,
    pub training: bool,
    pub gradient_checkpointing: bool,
    span: tracing::Span,
    pub config: CrossAttnUpBlock2DConfig,
}

impl CrossAttnUpBlock2D {
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        prev_output_channels: usize,
        out_channels: usize,
        temb_channels: Option<usize>,
        config: CrossAttnUpBlock2DConfig,
    ) -> Result<Self> {
        let upblock = UpBlock2D::new(
            vs.clone(),
            in_channels,
            prev_output_channels,
            out_channels,
            temb_channels,
            config.upblock,
        )?;
        let n_heads = config.attn_num_head_channels;
        let cfg = SpatialTransformerConfig {
            depth: config.transformer_layers_per_block,
            context_dim: Some(config.cross_attention_dim),
            num_groups: config.upblock.resnet_groups,
            sliced_attention_size: config.sliced_attention_size,
            use_linear_projection: config.use_linear_projection,
        };
        let vs_attn = vs.pp("attentions");
        let attentions = (0..config.upblock.num_layers)
            .map(|i| {
                SpatialTransformer::new(
                    vs_attn.pp(i),
                    out_channels,
                    n_heads,
                    out_channels / n_heads,
                    cfg,
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        let span = tracing::span!(tracing::Level::TRACE, "xa-up2d");
        Ok(Self {
            upblock,
            attentions,
            training: false,
            gradient_checkpointing: false,
            span,
            config,
        })
    }

    /// Number of cross-attention sites, i.e. embeddings consumed per forward.
    pub fn num_sites(&self) -> usize {
        self.attentions.len()
    }

    /// Number of skip tensors popped by `forward`.
    pub fn num_resnets(&self) -> usize {
        self.upblock.num_resnets()
    }

    /// For each (resnet, attention) pair: pop the latest skip tensor, concatenate
    /// it on the channel dim, then run the resnet and the attention, the `i`-th
    /// attention reading `encoder_hidden_states.get(i)`.
    pub fn forward(
        &self,
        xs: &Tensor,
        res_xs: &[Tensor],
        temb: Option<&Tensor>,
        upsample_size: Option<(usize, usize)>,
        encoder_hidden_states: ConditioningSlice<'_>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let use_checkpoint = self.training && self.gradient_checkpointing;
        let mut xs = xs.clone();
        for (index, (resnet, attn)) in self
            .upblock
            .resnets
            .iter()
            .zip(self.attentions.iter())
            .enumerate()
        {
            let context = encoder_hidden_states.get(index)?;
            xs = Tensor::cat(&[&xs, pop_skip(res_xs, index)?], 1)?;
            xs = xs.contiguous()?;
            xs = resnet_forward(resnet, &xs, temb, use_checkpoint)?;
            xs = attention_forward(attn, &xs, context, use_checkpoint)?;
        }
        match &self.upblock.upsampler {
            Some(upsampler) => upsampler.forward(&xs, upsample_size),
            None => Ok(xs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::xti_unet::xti::Conditioning;
    use candle::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn cross_down_block(vb: VarBuilder) -> Result<CrossAttnDownBlock2D> {
        let config = CrossAttnDownBlock2DConfig {
            downblock: DownBlock2DConfig {
                num_layers: 2,
                resnet_groups: 4,
                ..Default::default()
            },
            attn_num_head_channels: 2,
            cross_attention_dim: 6,
            ..Default::default()
        };
        CrossAttnDownBlock2D::new(vb, 8, 8, Some(16), config)
    }

    #[test]
    fn test_down_block_reads_its_own_sites() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let block = cross_down_block(vb)?;
        assert_eq!(block.num_sites(), 2);
        assert_eq!(block.num_outputs(), 3);

        let xs = Tensor::randn(0f32, 1., (1, 8, 8, 8), &dev)?;
        let temb = Tensor::randn(0f32, 1., (1, 16), &dev)?;
        let a = Tensor::randn(0f32, 1., (1, 3, 6), &dev)?;
        let b = Tensor::randn(0f32, 1., (1, 3, 6), &dev)?;
        let c = Tensor::randn(0f32, 1., (1, 3, 6), &dev)?;

        // Sites 1 and 2 of [a, b, c] must behave like a per-block conditioning [b, c].
        let cond = Conditioning::per_layer(vec![a.clone(), b.clone(), c.clone()]);
        let (out, states) = block.forward(&xs, Some(&temb), cond.slice(1, 2)?)?;
        let local = Conditioning::per_layer(vec![b, c]);
        let (expected, _) = block.forward(&xs, Some(&temb), local.slice(0, 2)?)?;
        assert_eq!(states.len(), 3);
        assert_eq!(out.dims(), &[1, 8, 4, 4]);
        let diff = (out - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.);

        // A single-site slice leaves the second attention without an embedding.
        let short = Conditioning::per_layer(vec![a]);
        assert!(block.forward(&xs, Some(&temb), short.slice(0, 1)?).is_err());
        Ok(())
    }

    #[test]
    fn test_up_block_pops_skips_latest_first() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let config = UpBlock2DConfig {
            num_layers: 2,
            resnet_groups: 4,
            add_upsample: true,
            ..Default::default()
        };
        // Skip channels: the last resnet reads `in_channels`, the others `out_channels`.
        let block = UpBlock2D::new(vb, 4, 8, 8, Some(16), config)?;
        let xs = Tensor::randn(0f32, 1., (1, 8, 5, 5), &dev)?;
        let temb = Tensor::randn(0f32, 1., (1, 16), &dev)?;
        let skips = [
            Tensor::randn(0f32, 1., (1, 4, 5, 5), &dev)?,
            Tensor::randn(0f32, 1., (1, 8, 5, 5), &dev)?,
        ];
        let out = block.forward(&xs, &skips, Some(&temb), Some((9, 11)))?;
        assert_eq!(out.dims(), &[1, 8, 9, 11]);
        let out = block.forward(&xs, &skips, Some(&temb), None)?;
        assert_eq!(out.dims(), &[1, 8, 10, 10]);
        assert!(block
            .forward(&xs, &skips[1..], Some(&temb), None)
            .is_err());
        Ok(())
    }
}
