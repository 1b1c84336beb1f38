//! Per-layer conditioning for extended textual inversion (XTI).
//!
//! XTI learns one embedding per cross-attention layer of the UNet instead of a
//! single embedding shared by all of them. The layers are addressed by the
//! latent-diffusion block numbering (`IN01`, …, `MID`, …, `OUT11`) and consumed
//! in the order the UNet visits its cross-attention sites:
//!
//! ```text
//! down blocks   : layers_per_block sites per cross-attention block
//! mid block     : 1 site
//! up blocks     : layers_per_block + 1 sites per cross-attention block
//! ```
//!
//! For Stable Diffusion 1.x this gives 16 sites: indices 0..6 for the down path
//! (two per block), 6 for the mid block and 7..16 for the up path (three per block).

use std::collections::HashMap;

use candle::{DType, Device, Result, Shape, Tensor};

use super::config::UNet2DConditionModelConfig;

/// XTI layer names of the Stable Diffusion 1.x UNet, in consumption order.
pub const SD_V1_XTI_LAYERS: [&str; 16] = [
    "IN01", "IN02", "IN04", "IN05", "IN07", "IN08", "MID", "OUT03", "OUT04", "OUT05", "OUT06",
    "OUT07", "OUT08", "OUT09", "OUT10", "OUT11",
];

/// Where a cross-attention site sits in the UNet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Down { block: usize, layer: usize },
    Mid,
    Up { block: usize, layer: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossAttentionSite {
    /// Position in the conditioning sequence.
    pub index: usize,
    pub stage: Stage,
    /// Latent-diffusion style layer name, e.g. `IN04` or `OUT10`.
    pub name: String,
}

/// Ordered list of the cross-attention sites of a UNet configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XtiLayout {
    sites: Vec<CrossAttentionSite>,
    down_offsets: Vec<Option<usize>>,
    mid_offset: usize,
    up_offsets: Vec<Option<usize>>,
}

impl XtiLayout {
    pub fn from_config(config: &UNet2DConditionModelConfig) -> Self {
        let lpb = config.layers_per_block;
        let n_blocks = config.blocks.len();
        let mut sites = Vec::new();

        let mut down_offsets = Vec::with_capacity(n_blocks);
        for (block, cfg) in config.blocks.iter().enumerate() {
            if cfg.use_cross_attn.is_none() {
                down_offsets.push(None);
                continue;
            }
            down_offsets.push(Some(sites.len()));
            for layer in 0..lpb {
                sites.push(CrossAttentionSite {
                    index: sites.len(),
                    stage: Stage::Down { block, layer },
                    name: format!("IN{:02}", 1 + block * (lpb + 1) + layer),
                });
            }
        }

        let mid_offset = sites.len();
        sites.push(CrossAttentionSite {
            index: mid_offset,
            stage: Stage::Mid,
            name: "MID".to_string(),
        });

        // Up block `i` mirrors down block `n_blocks - 1 - i`.
        let mut up_offsets = Vec::with_capacity(n_blocks);
        for block in 0..n_blocks {
            if config.blocks[n_blocks - 1 - block].use_cross_attn.is_none() {
                up_offsets.push(None);
                continue;
            }
            up_offsets.push(Some(sites.len()));
            for layer in 0..=lpb {
                sites.push(CrossAttentionSite {
                    index: sites.len(),
                    stage: Stage::Up { block, layer },
                    name: format!("OUT{:02}", block * (lpb + 1) + layer),
                });
            }
        }

        Self {
            sites,
            down_offsets,
            mid_offset,
            up_offsets,
        }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn sites(&self) -> &[CrossAttentionSite] {
        &self.sites
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sites.iter().map(|s| s.name.as_str())
    }

    /// First site index of down block `block`, `None` when it has no cross-attention.
    pub fn down_offset(&self, block: usize) -> Option<usize> {
        self.down_offsets.get(block).copied().flatten()
    }

    pub fn mid_offset(&self) -> usize {
        self.mid_offset
    }

    /// First site index of up block `block`, `None` when it has no cross-attention.
    pub fn up_offset(&self, block: usize) -> Option<usize> {
        self.up_offsets.get(block).copied().flatten()
    }

    /// Check that `conditioning` provides exactly one embedding per site.
    pub fn validate(&self, conditioning: &Conditioning) -> Result<()> {
        let Conditioning::PerLayer(layers) = conditioning else {
            return Ok(());
        };
        if layers.len() < self.sites.len() {
            let site = &self.sites[layers.len()];
            candle::bail!(
                "xti conditioning has {} layers but the unet has {} cross-attention sites, \
                 no embedding for site {} ({})",
                layers.len(),
                self.sites.len(),
                site.index,
                site.name
            )
        }
        if layers.len() > self.sites.len() {
            candle::bail!(
                "xti conditioning has {} layers but the unet has only {} cross-attention sites",
                layers.len(),
                self.sites.len()
            )
        }
        Ok(())
    }
}

/// Encoder hidden states fed to the cross-attention layers.
#[derive(Debug, Clone)]
pub enum Conditioning {
    /// One `[batch, seq, dim]` tensor used by every cross-attention site.
    Shared(Tensor),
    /// One `[batch, seq, dim]` tensor per cross-attention site, in traversal order.
    PerLayer(Vec<Tensor>),
}

impl From<Tensor> for Conditioning {
    fn from(t: Tensor) -> Self {
        Self::Shared(t)
    }
}

impl From<&Tensor> for Conditioning {
    fn from(t: &Tensor) -> Self {
        Self::Shared(t.clone())
    }
}

impl From<Vec<Tensor>> for Conditioning {
    fn from(layers: Vec<Tensor>) -> Self {
        Self::PerLayer(layers)
    }
}

impl Conditioning {
    pub fn per_layer(layers: Vec<Tensor>) -> Self {
        Self::PerLayer(layers)
    }

    /// Split a `[layers, batch, seq, dim]` tensor into per-layer conditioning.
    pub fn from_stacked(stacked: &Tensor) -> Result<Self> {
        let (n_layers, _b, _s, _d) = stacked.dims4()?;
        let layers = (0..n_layers)
            .map(|i| stacked.get(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::PerLayer(layers))
    }

    /// Order embeddings keyed by XTI layer name (`IN01`, `MID`, ...) by `layout`.
    pub fn from_named(named: &HashMap<String, Tensor>, layout: &XtiLayout) -> Result<Self> {
        let mut layers = Vec::with_capacity(layout.len());
        for site in layout.sites() {
            match named.get(&site.name) {
                Some(t) => layers.push(t.clone()),
                None => candle::bail!(
                    "no embedding named {} for cross-attention site {}",
                    site.name,
                    site.index
                ),
            }
        }
        Ok(Self::PerLayer(layers))
    }

    /// All-zero per-layer conditioning matching `layout`.
    pub fn zeros<S: Into<Shape>>(
        layout: &XtiLayout,
        shape: S,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let layers = (0..layout.len())
            .map(|_| Tensor::zeros(shape.clone(), dtype, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::PerLayer(layers))
    }

    pub fn is_per_layer(&self) -> bool {
        matches!(self, Self::PerLayer(_))
    }

    /// Number of per-layer embeddings, `None` for shared conditioning.
    pub fn num_layers(&self) -> Option<usize> {
        match self {
            Self::Shared(_) => None,
            Self::PerLayer(layers) => Some(layers.len()),
        }
    }

    /// The embedding read by cross-attention site `index`.
    pub fn site(&self, index: usize) -> Result<&Tensor> {
        match self {
            Self::Shared(t) => Ok(t),
            Self::PerLayer(layers) => match layers.get(index) {
                Some(t) => Ok(t),
                None => candle::bail!(
                    "xti conditioning has {} layers, no embedding for cross-attention site {index}",
                    layers.len()
                ),
            },
        }
    }

    /// View over sites `start..start + len`, handed to a single block.
    pub fn slice(&self, start: usize, len: usize) -> Result<ConditioningSlice<'_>> {
        if let Self::PerLayer(layers) = self {
            if start + len > layers.len() {
                let first_unmet = start.max(layers.len());
                candle::bail!(
                    "xti conditioning has {} layers, no embedding for cross-attention site {first_unmet}",
                    layers.len()
                )
            }
        }
        Ok(ConditioningSlice {
            source: self,
            start,
            len,
        })
    }
}

/// The conditioning sites owned by one block.
#[derive(Debug, Clone, Copy)]
pub struct ConditioningSlice<'a> {
    source: &'a Conditioning,
    start: usize,
    len: usize,
}

impl<'a> ConditioningSlice<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the first site in the full conditioning sequence.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Embedding for the block's `i`-th cross-attention layer.
    pub fn get(&self, i: usize) -> Result<&'a Tensor> {
        if i >= self.len {
            candle::bail!(
                "cross-attention layer {i} out of range for a block with {} sites",
                self.len
            )
        }
        self.source.site(self.start + i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sd15_layout_offsets() {
        let layout = XtiLayout::from_config(&UNet2DConditionModelConfig::sd_v1_5());
        assert_eq!(layout.len(), 16);
        assert_eq!(layout.down_offset(0), Some(0));
        assert_eq!(layout.down_offset(1), Some(2));
        assert_eq!(layout.down_offset(2), Some(4));
        assert_eq!(layout.down_offset(3), None);
        assert_eq!(layout.mid_offset(), 6);
        assert_eq!(layout.up_offset(0), None);
        assert_eq!(layout.up_offset(1), Some(7));
        assert_eq!(layout.up_offset(2), Some(10));
        assert_eq!(layout.up_offset(3), Some(13));
        assert_eq!(layout.names().collect::<Vec<_>>(), SD_V1_XTI_LAYERS);
        for (i, site) in layout.sites().iter().enumerate() {
            assert_eq!(site.index, i);
        }
        assert_eq!(layout.sites()[6].stage, Stage::Mid);
        assert_eq!(layout.sites()[15].stage, Stage::Up { block: 3, layer: 2 });
    }

    #[test]
    fn test_layout_follows_topology() {
        let mut cfg = UNet2DConditionModelConfig::sd_v1_5();
        cfg.layers_per_block = 1;
        cfg.blocks[0].use_cross_attn = None;
        let layout = XtiLayout::from_config(&cfg);
        // Down: blocks 1, 2 with one site each; mid; up: blocks 1, 2 with two sites each.
        assert_eq!(layout.len(), 2 + 1 + 4);
        assert_eq!(
            layout.names().collect::<Vec<_>>(),
            ["IN03", "IN05", "MID", "OUT02", "OUT03", "OUT04", "OUT05"]
        );
        assert_eq!(layout.up_offset(3), None);
    }

    #[test]
    fn test_validate_reports_first_unmet_site() -> Result<()> {
        let dev = Device::Cpu;
        let layout = XtiLayout::from_config(&UNet2DConditionModelConfig::sd_v1_5());
        let short = Conditioning::per_layer(
            (0..9)
                .map(|_| Tensor::zeros((1, 2, 3), DType::F32, &dev))
                .collect::<Result<Vec<_>>>()?,
        );
        let err = layout.validate(&short).unwrap_err().to_string();
        assert!(err.contains("site 9 (OUT05)"), "{err}");

        let long = Conditioning::zeros(&layout, (1, 2, 3), DType::F32, &dev)?;
        let Conditioning::PerLayer(mut layers) = long else {
            unreachable!()
        };
        layers.push(layers[0].clone());
        assert!(layout.validate(&Conditioning::PerLayer(layers)).is_err());

        let exact = Conditioning::zeros(&layout, (1, 2, 3), DType::F32, &dev)?;
        layout.validate(&exact)?;
        layout.validate(&Conditioning::Shared(Tensor::zeros((1, 2, 3), DType::F32, &dev)?))?;
        Ok(())
    }

    #[test]
    fn test_slice_bounds() -> Result<()> {
        let dev = Device::Cpu;
        let layers = (0..8)
            .map(|i| Tensor::full(i as f32, (1, 1, 1), &dev))
            .collect::<Result<Vec<_>>>()?;
        let cond = Conditioning::per_layer(layers);

        let ctx = cond.slice(7, 1)?;
        assert_eq!(ctx.get(0)?.flatten_all()?.to_vec1::<f32>()?, [7.]);
        assert!(ctx.get(1).is_err());

        let err = cond.slice(7, 3).unwrap_err().to_string();
        assert!(err.contains("site 8"), "{err}");
        let err = cond.slice(10, 3).unwrap_err().to_string();
        assert!(err.contains("site 10"), "{err}");

        let shared = Conditioning::Shared(Tensor::ones((1, 1, 1), DType::F32, &dev)?);
        assert_eq!(shared.slice(100, 3)?.get(2)?.dims(), &[1, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_from_stacked_and_named() -> Result<()> {
        let dev = Device::Cpu;
        let layout = XtiLayout::from_config(&UNet2DConditionModelConfig::sd_v1_5());
        let stacked = Tensor::arange(0f32, 16., &dev)?.reshape((16, 1, 1, 1))?;
        let cond = Conditioning::from_stacked(&stacked)?;
        assert_eq!(cond.num_layers(), Some(16));
        assert_eq!(cond.site(6)?.flatten_all()?.to_vec1::<f32>()?, [6.]);

        let named: HashMap<String, Tensor> = layout
            .names()
            .enumerate()
            .map(|(i, name)| Ok((name.to_string(), Tensor::full(i as f32, (1, 1, 1), &dev)?)))
            .collect::<Result<_>>()?;
        let cond = Conditioning::from_named(&named, &layout)?;
        assert_eq!(cond.site(13)?.flatten_all()?.to_vec1::<f32>()?, [13.]);

        let mut missing = named.clone();
        missing.remove("OUT07");
        let err = Conditioning::from_named(&missing, &layout)
            .unwrap_err()
            .to_string();
        assert!(err.contains("OUT07"), "{err}");
        Ok(())
    }
}
