//! Timestep handling: user-facing timestep values, sinusoidal projection and the
//! MLP that turns the projection into the time embedding.

use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn as nn;

use crate::models::with_tracing::{linear, Linear};

/// A diffusion timestep given as a tensor, a float or an integer.
#[derive(Debug, Clone)]
pub enum Timestep {
    Scalar(f64),
    Tensor(Tensor),
}

impl From<f64> for Timestep {
    fn from(t: f64) -> Self {
        Self::Scalar(t)
    }
}

impl From<f32> for Timestep {
    fn from(t: f32) -> Self {
        Self::Scalar(t as f64)
    }
}

impl From<i64> for Timestep {
    fn from(t: i64) -> Self {
        Self::Scalar(t as f64)
    }
}

impl From<u32> for Timestep {
    fn from(t: u32) -> Self {
        Self::Scalar(t as f64)
    }
}

impl From<usize> for Timestep {
    fn from(t: usize) -> Self {
        Self::Scalar(t as f64)
    }
}

impl From<Tensor> for Timestep {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<&Tensor> for Timestep {
    fn from(t: &Tensor) -> Self {
        Self::Tensor(t.clone())
    }
}

impl Timestep {
    /// Expand to a `[batch]` f32 tensor on `device`.
    ///
    /// Scalars, 0-d tensors and single-element tensors are broadcast over the
    /// batch, a `[batch]` tensor is used as is.
    pub fn to_batch(&self, batch: usize, device: &Device) -> Result<Tensor> {
        match self {
            Self::Scalar(t) => Tensor::full(*t as f32, batch, device),
            Self::Tensor(t) => {
                let t = t.to_device(device)?.to_dtype(DType::F32)?;
                match t.dims() {
                    [] => t.reshape(1)?.broadcast_as(batch)?.contiguous(),
                    [1] => t.broadcast_as(batch)?.contiguous(),
                    [n] if *n == batch => Ok(t),
                    dims => candle::bail!(
                        "timestep of shape {dims:?} cannot be broadcast to a batch of {batch}"
                    ),
                }
            }
        }
    }
}

/// Sinusoidal projection of the timesteps.
#[derive(Debug, Clone, Copy)]
pub struct Timesteps {
    num_channels: usize,
    flip_sin_to_cos: bool,
    downscale_freq_shift: f64,
}

impl Timesteps {
    pub fn new(num_channels: usize, flip_sin_to_cos: bool, downscale_freq_shift: f64) -> Self {
        Self {
            num_channels,
            flip_sin_to_cos,
            downscale_freq_shift,
        }
    }
}

impl Module for Timesteps {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let half_dim = (self.num_channels / 2) as u32;
        let exponent = (Tensor::arange(0, half_dim, xs.device())?.to_dtype(DType::F32)?
            * -f64::ln(10000.))?;
        let exponent = (exponent / (half_dim as f64 - self.downscale_freq_shift))?;
        let emb = exponent.exp()?.to_dtype(xs.dtype())?;
        // emb = timesteps[:, None] * exp(exponent)[None, :]
        let emb = xs.unsqueeze(D::Minus1)?.broadcast_mul(&emb.unsqueeze(0)?)?;
        let (cos, sin) = (emb.cos()?, emb.sin()?);
        if self.flip_sin_to_cos {
            Tensor::cat(&[&cos, &sin], D::Minus1)
        } else {
            Tensor::cat(&[&sin, &cos], D::Minus1)
        }
    }
}

/// Two-layer MLP over the sinusoidal projection.
#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    linear_1: Linear,
    linear_2: Linear,
}

impl TimestepEmbedding {
    pub fn new(vs: nn::VarBuilder, channel: usize, time_embed_dim: usize) -> Result<Self> {
        let linear_1 = linear(channel, time_embed_dim, vs.pp("linear_1"))?;
        let linear_2 = linear(time_embed_dim, time_embed_dim, vs.pp("linear_2"))?;
        Ok(Self { linear_1, linear_2 })
    }
}

impl Module for TimestepEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.apply(&self.linear_1)?.silu()?;
        self.linear_2.forward(&xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestep_broadcast() -> Result<()> {
        let dev = Device::Cpu;
        let t = Timestep::from(999i64).to_batch(3, &dev)?;
        assert_eq!(t.to_vec1::<f32>()?, [999., 999., 999.]);

        let t = Timestep::from(Tensor::new(5f64, &dev)?).to_batch(2, &dev)?;
        assert_eq!(t.to_vec1::<f32>()?, [5., 5.]);

        let t = Timestep::from(Tensor::new(&[7u32], &dev)?).to_batch(2, &dev)?;
        assert_eq!(t.to_vec1::<f32>()?, [7., 7.]);

        let t = Timestep::from(Tensor::new(&[1f32, 2.], &dev)?).to_batch(2, &dev)?;
        assert_eq!(t.to_vec1::<f32>()?, [1., 2.]);

        assert!(Timestep::from(Tensor::new(&[1f32, 2., 3.], &dev)?)
            .to_batch(2, &dev)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_timesteps_projection() -> Result<()> {
        let dev = Device::Cpu;
        let proj = Timesteps::new(8, true, 0.);
        let t = Tensor::new(&[0f32, 10.], &dev)?;
        let emb = proj.forward(&t)?;
        assert_eq!(emb.dims(), &[2, 8]);

        // t = 0 gives cos = 1 followed by sin = 0.
        let row = emb.get(0)?.to_vec1::<f32>()?;
        assert_eq!(row, [1., 1., 1., 1., 0., 0., 0., 0.]);

        // The first frequency is exp(0) = 1.
        let row = emb.get(1)?.to_vec1::<f32>()?;
        assert!((row[0] - 10f32.cos()).abs() < 1e-5);
        assert!((row[4] - 10f32.sin()).abs() < 1e-5);

        let unflipped = Timesteps::new(8, false, 0.).forward(&t)?.get(1)?.to_vec1::<f32>()?;
        assert!((unflipped[0] - 10f32.sin()).abs() < 1e-5);
        Ok(())
    }
}
