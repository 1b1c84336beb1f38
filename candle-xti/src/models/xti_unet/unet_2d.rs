//! Conditional UNet with per-layer (XTI) cross-attention conditioning.
//!
//! The model predicts the noise of a latent sample given a timestep and the
//! encoder hidden states. Each cross-attention site reads the embedding the
//! [`Conditioning`] assigns to it, in the order laid out by [`XtiLayout`].
use super::config::UNet2DConditionModelConfig;
use super::debug::{block_label, debug_tensor};
use super::embeddings::{Timestep, TimestepEmbedding, Timesteps};
use super::unet_2d_blocks::*;
use super::xti::{Conditioning, XtiLayout};
use crate::models::with_tracing::{conv2d, Conv2d};
use candle::{Module, Result, Tensor};
use candle_nn as nn;

#[derive(Debug)]
enum UNetDownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

impl UNetDownBlock {
    fn num_outputs(&self) -> usize {
        match self {
            Self::Basic(b) => b.num_outputs(),
            Self::CrossAttn(b) => b.num_outputs(),
        }
    }

    fn set_flags(&mut self, training: bool, gradient_checkpointing: bool) {
        match self {
            Self::Basic(b) => {
                b.training = training;
                b.gradient_checkpointing = gradient_checkpointing;
            }
            Self::CrossAttn(b) => {
                b.training = training;
                b.gradient_checkpointing = gradient_checkpointing;
            }
        }
    }
}

#[derive(Debug)]
enum UNetUpBlock {
    Basic(UpBlock2D),
    CrossAttn(CrossAttnUpBlock2D),
}

impl UNetUpBlock {
    fn num_resnets(&self) -> usize {
        match self {
            Self::Basic(b) => b.num_resnets(),
            Self::CrossAttn(b) => b.num_resnets(),
        }
    }

    fn set_flags(&mut self, training: bool, gradient_checkpointing: bool) {
        match self {
            Self::Basic(b) => {
                b.training = training;
                b.gradient_checkpointing = gradient_checkpointing;
            }
            Self::CrossAttn(b) => {
                b.training = training;
                b.gradient_checkpointing = gradient_checkpointing;
            }
        }
    }
}

/// Named result of a UNet forward pass.
#[derive(Debug, Clone)]
pub struct UNet2DConditionOutput {
    pub sample: Tensor,
}

/// What [`UNet2DConditionModel::forward_output`] returns, selected by `return_dict`.
#[derive(Debug, Clone)]
pub enum UNetForwardOutput {
    Dict(UNet2DConditionOutput),
    Tuple((Tensor,)),
}

impl UNetForwardOutput {
    pub fn sample(&self) -> &Tensor {
        match self {
            Self::Dict(out) => &out.sample,
            Self::Tuple((sample,)) => sample,
        }
    }

    pub fn into_sample(self) -> Tensor {
        match self {
            Self::Dict(out) => out.sample,
            Self::Tuple((sample,)) => sample,
        }
    }
}

#[derive(Debug)]
pub struct UNet2DConditionModel {
    conv_in: Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<UNetDownBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    up_blocks: Vec<UNetUpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: Conv2d,
    layout: XtiLayout,
    training: bool,
    gradient_checkpointing: bool,
    span: tracing::Span,
    config: UNet2DConditionModelConfig,
}

impl UNet2DConditionModel {
    pub fn new(vs: nn::VarBuilder, config: UNet2DConditionModelConfig) -> Result<Self> {
        let n_blocks = config.blocks.len();
        if n_blocks == 0 {
            candle::bail!("the unet config has no blocks")
        }
        let b_channels = config.blocks[0].out_channels;
        let bl_channels = config.blocks[n_blocks - 1].out_channels;
        let bl_attention_heads = config.blocks[n_blocks - 1].num_attention_heads;
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = conv2d(config.in_channels, b_channels, 3, conv_cfg, vs.pp("conv_in"))?;

        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;

        let vs_db = vs.pp("down_blocks");
        let down_blocks = (0..n_blocks)
            .map(|i| {
                let block = config.blocks[i];
                let in_channels = if i > 0 {
                    config.blocks[i - 1].out_channels
                } else {
                    b_channels
                };
                let db_cfg = DownBlock2DConfig {
                    num_layers: config.layers_per_block,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_downsample: i < n_blocks - 1,
                    downsample_padding: config.downsample_padding,
                    ..Default::default()
                };
                match block.use_cross_attn {
                    Some(transformer_layers_per_block) => {
                        let config = CrossAttnDownBlock2DConfig {
                            downblock: db_cfg,
                            attn_num_head_channels: block.num_attention_heads,
                            cross_attention_dim: config.cross_attention_dim,
                            sliced_attention_size: config.sliced_attention_size,
                            use_linear_projection: config.use_linear_projection,
                            transformer_layers_per_block,
                        };
                        let block = CrossAttnDownBlock2D::new(
                            vs_db.pp(i),
                            in_channels,
                            block.out_channels,
                            Some(time_embed_dim),
                            config,
                        )?;
                        Ok(UNetDownBlock::CrossAttn(block))
                    }
                    None => {
                        let block = DownBlock2D::new(
                            vs_db.pp(i),
                            in_channels,
                            block.out_channels,
                            Some(time_embed_dim),
                            db_cfg,
                        )?;
                        Ok(UNetDownBlock::Basic(block))
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mid_transformer_layers_per_block = config.blocks[n_blocks - 1]
            .use_cross_attn
            .unwrap_or(1);
        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            output_scale_factor: config.mid_block_scale_factor,
            cross_attn_dim: config.cross_attention_dim,
            attn_num_head_channels: bl_attention_heads,
            resnet_groups: Some(config.norm_num_groups),
            sliced_attention_size: config.sliced_attention_size,
            use_linear_projection: config.use_linear_projection,
            transformer_layers_per_block: mid_transformer_layers_per_block,
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vs.pp("mid_block"),
            bl_channels,
            Some(time_embed_dim),
            mid_cfg,
        )?;

        let vs_ub = vs.pp("up_blocks");
        let up_blocks = (0..n_blocks)
            .map(|i| {
                // Up block `i` mirrors down block `n_blocks - 1 - i`.
                let block = config.blocks[n_blocks - 1 - i];
                let prev_out_channels = if i > 0 {
                    config.blocks[n_blocks - i].out_channels
                } else {
                    bl_channels
                };
                let in_channels = {
                    let index = if i == n_blocks - 1 { 0 } else { n_blocks - i - 2 };
                    config.blocks[index].out_channels
                };
                let ub_cfg = UpBlock2DConfig {
                    num_layers: config.layers_per_block + 1,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_upsample: i < n_blocks - 1,
                    ..Default::default()
                };
                match block.use_cross_attn {
                    Some(transformer_layers_per_block) => {
                        let config = CrossAttnUpBlock2DConfig {
                            upblock: ub_cfg,
                            attn_num_head_channels: block.num_attention_heads,
                            cross_attention_dim: config.cross_attention_dim,
                            sliced_attention_size: config.sliced_attention_size,
                            use_linear_projection: config.use_linear_projection,
                            transformer_layers_per_block,
                        };
                        let block = CrossAttnUpBlock2D::new(
                            vs_ub.pp(i),
                            in_channels,
                            prev_out_channels,
                            block.out_channels,
                            Some(time_embed_dim),
                            config,
                        )?;
                        Ok(UNetUpBlock::CrossAttn(block))
                    }
                    None => {
                        let block = UpBlock2D::new(
                            vs_ub.pp(i),
                            in_channels,
                            prev_out_channels,
                            block.out_channels,
                            Some(time_embed_dim),
                            ub_cfg,
                        )?;
                        Ok(UNetUpBlock::Basic(block))
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let conv_norm_out = nn::group_norm(
            config.norm_num_groups,
            b_channels,
            config.norm_eps,
            vs.pp("conv_norm_out"),
        )?;
        let conv_out = conv2d(b_channels, config.out_channels, 3, conv_cfg, vs.pp("conv_out"))?;
        let layout = XtiLayout::from_config(&config);
        let span = tracing::span!(tracing::Level::TRACE, "unet2d");
        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            layout,
            training: false,
            gradient_checkpointing: false,
            span,
            config,
        })
    }

    pub fn config(&self) -> &UNet2DConditionModelConfig {
        &self.config
    }

    /// The cross-attention sites a per-layer conditioning has to cover.
    pub fn xti_layout(&self) -> &XtiLayout {
        &self.layout
    }

    /// Skip tensors produced by `conv_in` and the down path, and skip tensors
    /// consumed by the up path. The two are equal for a well-formed model.
    pub fn skip_connection_counts(&self) -> (usize, usize) {
        let produced = 1 + self
            .down_blocks
            .iter()
            .map(|b| b.num_outputs())
            .sum::<usize>();
        let consumed = self.up_blocks.iter().map(|b| b.num_resnets()).sum();
        (produced, consumed)
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn is_gradient_checkpointing(&self) -> bool {
        self.gradient_checkpointing
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.propagate_flags();
    }

    /// Recompute block activations during backward instead of storing them.
    /// Only takes effect while the model is in training mode. Checkpointed
    /// blocks propagate gradients to their inputs, the conditioning included,
    /// but not to the UNet weights.
    pub fn set_gradient_checkpointing(&mut self, enabled: bool) {
        self.gradient_checkpointing = enabled;
        self.propagate_flags();
    }

    fn propagate_flags(&mut self) {
        let (training, ckpt) = (self.training, self.gradient_checkpointing);
        for block in self.down_blocks.iter_mut() {
            block.set_flags(training, ckpt);
        }
        self.mid_block.training = training;
        self.mid_block.gradient_checkpointing = ckpt;
        for block in self.up_blocks.iter_mut() {
            block.set_flags(training, ckpt);
        }
    }

    /// Predict the noise residual of `sample`, a `[batch, in_channels, height, width]` latent.
    pub fn forward(
        &self,
        sample: &Tensor,
        timestep: impl Into<Timestep>,
        conditioning: &Conditioning,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let timestep = timestep.into();
        self.forward_inner(sample, &timestep, conditioning)
    }

    /// Same as [`Self::forward`], wrapping the sample in a named output when
    /// `return_dict` is set and in a one-element tuple otherwise.
    pub fn forward_output(
        &self,
        sample: &Tensor,
        timestep: impl Into<Timestep>,
        conditioning: &Conditioning,
        return_dict: bool,
    ) -> Result<UNetForwardOutput> {
        let sample = self.forward(sample, timestep, conditioning)?;
        if return_dict {
            Ok(UNetForwardOutput::Dict(UNet2DConditionOutput { sample }))
        } else {
            Ok(UNetForwardOutput::Tuple((sample,)))
        }
    }

    fn forward_inner(
        &self,
        xs: &Tensor,
        timestep: &Timestep,
        conditioning: &Conditioning,
    ) -> Result<Tensor> {
        self.layout.validate(conditioning)?;
        let (bsize, _channels, height, width) = xs.dims4()?;
        let device = xs.device();

        // Sizes that are not a multiple of the overall up factor need the
        // upsamplers to target the size of the matching skip tensor.
        let up_factor = self.config.default_overall_up_factor();
        let forward_upsample_size = height % up_factor != 0 || width % up_factor != 0;
        if forward_upsample_size {
            tracing::debug!(height, width, up_factor, "forwarding upsample size");
        }

        // 1. time
        let t_emb = timestep.to_batch(bsize, device)?;
        let emb = self.time_proj.forward(&t_emb)?.to_dtype(xs.dtype())?;
        let emb = self.time_embedding.forward(&emb)?;

        // 2. pre-process
        let xs = if self.config.center_input_sample {
            ((xs * 2.0)? - 1.0)?
        } else {
            xs.clone()
        };
        let xs = self.conv_in.forward(&xs)?;
        debug_tensor("conv_in", &xs);

        // 3. down
        let mut site = 0;
        let mut down_block_res_xs = vec![xs.clone()];
        let mut xs = xs;
        for (i, down_block) in self.down_blocks.iter().enumerate() {
            let first_site = site;
            let (_xs, res_xs) = match down_block {
                UNetDownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                UNetDownBlock::CrossAttn(b) => {
                    let ctx = conditioning.slice(site, b.num_sites())?;
                    site += b.num_sites();
                    b.forward(&xs, Some(&emb), ctx)?
                }
            };
            down_block_res_xs.extend(res_xs);
            xs = _xs;
            debug_tensor(&block_label(&format!("down_blocks.{i}"), first_site..site), &xs);
        }

        // 4. mid
        let first_site = site;
        let ctx = conditioning.slice(site, self.mid_block.num_sites())?;
        site += self.mid_block.num_sites();
        let xs = self.mid_block.forward(&xs, Some(&emb), ctx)?;
        debug_tensor(&block_label("mid_block", first_site..site), &xs);

        // 5. up
        let n_up_blocks = self.up_blocks.len();
        let mut xs = xs;
        let mut upsample_size = None;
        for (i, up_block) in self.up_blocks.iter().enumerate() {
            let first_site = site;
            let n_resnets = up_block.num_resnets();
            let Some(split) = down_block_res_xs.len().checked_sub(n_resnets) else {
                candle::bail!(
                    "up block {i} needs {n_resnets} skip connections, {} left",
                    down_block_res_xs.len()
                )
            };
            let res_xs = down_block_res_xs.split_off(split);
            let is_final_block = i == n_up_blocks - 1;
            if !is_final_block && forward_upsample_size {
                match down_block_res_xs.last() {
                    Some(last) => {
                        let (_, _, h, w) = last.dims4()?;
                        upsample_size = Some((h, w));
                    }
                    None => candle::bail!("no skip connection left to size up block {i}"),
                }
            }
            xs = match up_block {
                UNetUpBlock::Basic(b) => b.forward(&xs, &res_xs, Some(&emb), upsample_size)?,
                UNetUpBlock::CrossAttn(b) => {
                    let ctx = conditioning.slice(site, b.num_sites())?;
                    site += b.num_sites();
                    b.forward(&xs, &res_xs, Some(&emb), upsample_size, ctx)?
                }
            };
            debug_tensor(&block_label(&format!("up_blocks.{i}"), first_site..site), &xs);
        }
        if !down_block_res_xs.is_empty() {
            candle::bail!(
                "{} skip connections left unconsumed after the up path",
                down_block_res_xs.len()
            )
        }
        debug_assert_eq!(site, self.layout.len());

        // 6. post-process
        let xs = self.conv_norm_out.forward(&xs)?.silu()?;
        let xs = self.conv_out.forward(&xs)?;
        debug_tensor("conv_out", &xs);
        Ok(xs)
    }
}
