//! Candle implementations of the supported models.

pub mod with_tracing;
pub mod xti_unet;
