//! Debug utilities for the XTI UNet.
//!
//! Set `XTI_DEBUG=1` to print tensor statistics at every block boundary of the
//! forward pass, tagged with the block and the conditioning sites it read.

use candle::{DType, Result, Tensor};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static DEBUG_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Check if debug mode is enabled (via the XTI_DEBUG environment variable).
pub fn is_debug_mode() -> bool {
    if !DEBUG_INITIALIZED.load(Ordering::Relaxed) {
        let enabled = std::env::var("XTI_DEBUG").is_ok();
        DEBUG_MODE.store(enabled, Ordering::Relaxed);
        DEBUG_INITIALIZED.store(true, Ordering::Relaxed);
    }
    DEBUG_MODE.load(Ordering::Relaxed)
}

/// Mean, std, min and max of a tensor, computed in f32.
pub fn tensor_stats(t: &Tensor) -> Result<(f32, f32, f32, f32)> {
    let t_f32 = t.to_dtype(DType::F32)?.flatten_all()?;
    let mean = t_f32.mean_all()?;
    let var = t_f32.broadcast_sub(&mean)?.sqr()?.mean_all()?.to_scalar::<f32>()?;
    let min = t_f32.min(0)?.to_scalar::<f32>()?;
    let max = t_f32.max(0)?.to_scalar::<f32>()?;
    Ok((mean.to_scalar::<f32>()?, var.sqrt(), min, max))
}

/// Name of a block boundary, with the conditioning sites the block read.
pub fn block_label(block: &str, sites: Range<usize>) -> String {
    if sites.is_empty() {
        block.to_string()
    } else {
        format!("{block} sites {}..{}", sites.start, sites.end)
    }
}

/// Print tensor statistics, only when `XTI_DEBUG` is set.
pub fn debug_tensor(name: &str, t: &Tensor) {
    if !is_debug_mode() {
        return;
    }
    match tensor_stats(t) {
        Ok((mean, std, min, max)) => println!(
            "[XTI] {name}: shape={:?}, mean={mean:.6}, std={std:.6}, min={min:.6}, max={max:.6}",
            t.dims()
        ),
        Err(e) => println!("[XTI] {name}: shape={:?}, stats error: {e}", t.dims()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn test_tensor_stats() -> Result<()> {
        let t = Tensor::new(&[1f32, 3., 5., 7.], &Device::Cpu)?;
        let (mean, std, min, max) = tensor_stats(&t)?;
        assert_eq!((mean, min, max), (4., 1., 7.));
        assert!((std - 5f32.sqrt()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_block_label() {
        assert_eq!(block_label("down_blocks.1", 2..4), "down_blocks.1 sites 2..4");
        assert_eq!(block_label("mid_block", 6..7), "mid_block sites 6..7");
        assert_eq!(block_label("up_blocks.0", 7..7), "up_blocks.0");
    }
}
