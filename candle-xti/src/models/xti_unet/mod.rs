//! Stable Diffusion UNet with extended textual inversion (XTI).
//!
//! Extended textual inversion learns a separate token embedding for each
//! cross-attention layer of the UNet. [`UNet2DConditionModel`] accepts either a
//! shared context or one context per cross-attention site, see [`Conditioning`]
//! and [`XtiLayout`].
//!
//! ```no_run
//! use candle::{DType, Device, Tensor};
//! use candle_xti::models::xti_unet::{Conditioning, UNet2DConditionModel, UNet2DConditionModelConfig};
//!
//! # fn main() -> candle::Result<()> {
//! let device = Device::Cpu;
//! let varmap = candle_nn::VarMap::new();
//! let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let unet = UNet2DConditionModel::new(vb, UNet2DConditionModelConfig::sd_v1_5())?;
//! let cond = Conditioning::zeros(unet.xti_layout(), (1, 77, 768), DType::F32, &device)?;
//! let latents = Tensor::randn(0f32, 1., (1, 4, 64, 64), &device)?;
//! let noise_pred = unet.forward(&latents, 999f64, &cond)?;
//! # Ok(())
//! # }
//! ```
pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod debug;
pub mod embeddings;
pub mod resnet;
pub mod unet_2d;
pub mod unet_2d_blocks;
pub mod xti;

pub use config::{BlockConfig, UNet2DConditionModelConfig};
pub use embeddings::Timestep;
pub use unet_2d::{UNet2DConditionModel, UNet2DConditionOutput, UNetForwardOutput};
pub use xti::{Conditioning, ConditioningSlice, CrossAttentionSite, Stage, XtiLayout, SD_V1_XTI_LAYERS};
