//! Gradient checkpointing for UNet segments.
//!
//! [`checkpoint`] evaluates a segment on detached inputs so that none of the
//! segment's intermediate activations are kept alive by the autograd graph.
//! The result is re-attached to the graph through a custom op whose backward
//! pass recomputes the segment from fresh variables and returns the gradients
//! with respect to the segment inputs.
//!
//! Only the inputs receive gradients: the weights of a checkpointed segment are
//! treated as frozen. This is what textual inversion training needs, where the
//! UNet is fixed and the learned embeddings reach the network as the
//! cross-attention context.

use std::sync::{Arc, Mutex};

use candle::backend::BackendStorage;
use candle::{CpuStorage, CustomOp1, CustomOp2, Layout, Result, Shape, Tensor, Var};

use super::attention::SpatialTransformer;
use super::resnet::ResnetBlock2D;

/// A recomputable piece of the network with a main input and an optional
/// auxiliary input (time embedding or cross-attention context).
pub trait CheckpointSegment: Send + Sync + 'static {
    fn run(&self, xs: &Tensor, aux: Option<&Tensor>) -> Result<Tensor>;
}

impl CheckpointSegment for ResnetBlock2D {
    fn run(&self, xs: &Tensor, temb: Option<&Tensor>) -> Result<Tensor> {
        self.forward(xs, temb)
    }
}

impl CheckpointSegment for SpatialTransformer {
    fn run(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        self.forward(xs, context)
    }
}

/// Run `segment` on `(xs, aux)` without retaining its activations for backward.
///
/// The returned tensor has the same values as `segment.run(xs, aux)`.
pub fn checkpoint<S: CheckpointSegment>(
    segment: &Arc<S>,
    xs: &Tensor,
    aux: Option<&Tensor>,
) -> Result<Tensor> {
    let span = tracing::span!(tracing::Level::TRACE, "checkpoint");
    let _enter = span.enter();
    let aux_detached = aux.map(|a| a.detach());
    let output = segment.run(&xs.detach(), aux_detached.as_ref())?.detach();
    let output = if output.layout().is_contiguous() && output.layout().start_offset() == 0 {
        output
    } else {
        output.affine(1., 0.)?
    };
    let op = Checkpoint::new(segment.clone(), output);
    match aux {
        Some(aux) => xs.apply_op2(aux, op),
        None => xs.apply_op1(op),
    }
}

struct Checkpoint<S> {
    segment: Arc<S>,
    // Precomputed result, contiguous and starting at offset zero. Taken by the
    // forward kernel so that only the op's result holds the activation.
    output: Mutex<Option<Tensor>>,
}

impl<S: CheckpointSegment> Checkpoint<S> {
    fn new(segment: Arc<S>, output: Tensor) -> Self {
        Self {
            segment,
            output: Mutex::new(Some(output)),
        }
    }

    fn take_output(&self) -> Result<Tensor> {
        let mut output = self
            .output
            .lock()
            .map_err(|e| candle::Error::Msg(format!("checkpoint output lock poisoned: {e}")))?;
        match output.take() {
            Some(output) => Ok(output),
            None => candle::bail!("checkpointed output was already consumed"),
        }
    }

    fn cpu_output(&self) -> Result<(CpuStorage, Shape)> {
        let output = self.take_output()?;
        let (storage, layout) = output.storage_and_layout();
        match &*storage {
            candle::Storage::Cpu(s) => Ok((s.try_clone(layout)?, layout.shape().clone())),
            _ => candle::bail!("checkpointed output is not on the cpu"),
        }
    }

    #[cfg(feature = "cuda")]
    fn cuda_output(&self) -> Result<(candle::CudaStorage, Shape)> {
        let output = self.take_output()?;
        let (storage, layout) = output.storage_and_layout();
        match &*storage {
            candle::Storage::Cuda(s) => Ok((s.try_clone(layout)?, layout.shape().clone())),
            _ => candle::bail!("checkpointed output is not on a cuda device"),
        }
    }

    #[cfg(feature = "metal")]
    fn metal_output(&self) -> Result<(candle::MetalStorage, Shape)> {
        let output = self.take_output()?;
        let (storage, layout) = output.storage_and_layout();
        match &*storage {
            candle::Storage::Metal(s) => Ok((s.try_clone(layout)?, layout.shape().clone())),
            _ => candle::bail!("checkpointed output is not on a metal device"),
        }
    }

    /// Recompute the segment and backpropagate `grad_res` to its inputs.
    fn recompute(
        &self,
        xs: &Tensor,
        aux: Option<&Tensor>,
        grad_res: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>)> {
        tracing::debug!(shape = ?xs.dims(), "recomputing checkpointed segment");
        let xs = Var::from_tensor(&xs.detach())?;
        let aux = aux.map(|a| Var::from_tensor(&a.detach())).transpose()?;
        let output = self
            .segment
            .run(xs.as_tensor(), aux.as_ref().map(|a| a.as_tensor()))?;
        let grads = (output * grad_res.detach())?.sum_all()?.backward()?;
        let grad_xs = grads.get(xs.as_tensor()).cloned();
        let grad_aux = aux.and_then(|a| grads.get(a.as_tensor()).cloned());
        Ok((grad_xs, grad_aux))
    }
}

impl<S: CheckpointSegment> CustomOp1 for Checkpoint<S> {
    fn name(&self) -> &'static str {
        "xti-checkpoint"
    }

    fn cpu_fwd(&self, _: &CpuStorage, _: &Layout) -> Result<(CpuStorage, Shape)> {
        self.cpu_output()
    }

    #[cfg(feature = "cuda")]
    fn cuda_fwd(&self, _: &candle::CudaStorage, _: &Layout) -> Result<(candle::CudaStorage, Shape)> {
        self.cuda_output()
    }

    #[cfg(feature = "metal")]
    fn metal_fwd(
        &self,
        _: &candle::MetalStorage,
        _: &Layout,
    ) -> Result<(candle::MetalStorage, Shape)> {
        self.metal_output()
    }

    fn bwd(&self, arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let (grad_xs, _) = self.recompute(arg, None, grad_res)?;
        Ok(grad_xs)
    }
}

impl<S: CheckpointSegment> CustomOp2 for Checkpoint<S> {
    fn name(&self) -> &'static str {
        "xti-checkpoint"
    }

    fn cpu_fwd(
        &self,
        _: &CpuStorage,
        _: &Layout,
        _: &CpuStorage,
        _: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        self.cpu_output()
    }

    #[cfg(feature = "cuda")]
    fn cuda_fwd(
        &self,
        _: &candle::CudaStorage,
        _: &Layout,
        _: &candle::CudaStorage,
        _: &Layout,
    ) -> Result<(candle::CudaStorage, Shape)> {
        self.cuda_output()
    }

    #[cfg(feature = "metal")]
    fn metal_fwd(
        &self,
        _: &candle::MetalStorage,
        _: &Layout,
        _: &candle::MetalStorage,
        _: &Layout,
    ) -> Result<(candle::MetalStorage, Shape)> {
        self.metal_output()
    }

    fn bwd(
        &self,
        arg1: &Tensor,
        arg2: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>)> {
        self.recompute(arg1, Some(arg2), grad_res)
    }
}
