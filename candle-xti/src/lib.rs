//! Stable Diffusion UNet with extended textual inversion (XTI) support.
//!
//! The UNet in [`models::xti_unet`] accepts either a single encoder-hidden-states
//! tensor shared by every cross-attention layer, or one embedding per
//! cross-attention site as used by per-layer textual inversion.

pub mod models;
