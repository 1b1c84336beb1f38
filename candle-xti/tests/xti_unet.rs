#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use candle::{test_device, DType, Device, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use candle_xti::models::xti_unet::{
    BlockConfig, Conditioning, UNet2DConditionModel, UNet2DConditionModelConfig,
    UNetForwardOutput, SD_V1_XTI_LAYERS,
};

const CROSS_DIM: usize = 8;
const SEQ_LEN: usize = 3;

/// SD 1.x block topology with tiny channel counts.
fn tiny_config() -> UNet2DConditionModelConfig {
    let bc = |use_cross_attn| BlockConfig {
        out_channels: 32,
        use_cross_attn,
        num_attention_heads: 2,
    };
    UNet2DConditionModelConfig {
        blocks: vec![bc(Some(1)), bc(Some(1)), bc(Some(1)), bc(None)],
        norm_num_groups: 8,
        cross_attention_dim: CROSS_DIM,
        ..UNet2DConditionModelConfig::sd_v1_5()
    }
}

fn tiny_unet(dev: &Device) -> Result<(VarMap, UNet2DConditionModel)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let unet = UNet2DConditionModel::new(vb, tiny_config())?;
    Ok((varmap, unet))
}

fn random_layers(n: usize, dev: &Device) -> Result<Vec<Tensor>> {
    (0..n)
        .map(|_| Tensor::randn(0f32, 1., (1, SEQ_LEN, CROSS_DIM), dev))
        .collect()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

fn zero_conditioning_keeps_shape(dev: &Device) -> Result<()> {
    let (_varmap, unet) = tiny_unet(dev)?;
    assert_eq!(unet.xti_layout().len(), 16);
    assert_eq!(
        unet.xti_layout().names().collect::<Vec<_>>(),
        SD_V1_XTI_LAYERS
    );
    let cond = Conditioning::zeros(unet.xti_layout(), (2, SEQ_LEN, CROSS_DIM), DType::F32, dev)?;
    let latents = Tensor::randn(0f32, 1., (2, 4, 16, 16), dev)?;
    let out = unet.forward(&latents, 10u32, &cond)?;
    assert_eq!(out.dims(), latents.dims());
    Ok(())
}

fn short_conditioning_names_first_unmet_site(dev: &Device) -> Result<()> {
    let (_varmap, unet) = tiny_unet(dev)?;
    let latents = Tensor::randn(0f32, 1., (1, 4, 16, 16), dev)?;
    let short = Conditioning::per_layer(random_layers(9, dev)?);
    let err = unet.forward(&latents, 10u32, &short).unwrap_err().to_string();
    assert!(err.contains("site 9 (OUT05)"), "{err}");

    let long = Conditioning::per_layer(random_layers(17, dev)?);
    assert!(unet.forward(&latents, 10u32, &long).is_err());
    Ok(())
}

fn skip_connections_balance(dev: &Device) -> Result<()> {
    let (_varmap, unet) = tiny_unet(dev)?;
    assert_eq!(unet.skip_connection_counts(), (12, 12));
    let cond = Conditioning::per_layer(random_layers(16, dev)?);
    for (h, w) in [(8, 8), (16, 24), (24, 8)] {
        let latents = Tensor::randn(0f32, 1., (1, 4, h, w), dev)?;
        let out = unet.forward(&latents, 500f64, &cond)?;
        assert_eq!(out.dims(), &[1, 4, h, w]);
    }
    Ok(())
}

fn odd_sizes_round_trip(dev: &Device) -> Result<()> {
    let (_varmap, unet) = tiny_unet(dev)?;
    assert_eq!(unet.config().default_overall_up_factor(), 8);
    let cond = Conditioning::per_layer(random_layers(16, dev)?);
    for (h, w) in [(20, 12), (9, 13)] {
        let latents = Tensor::randn(0f32, 1., (1, 4, h, w), dev)?;
        let out = unet.forward(&latents, 1f64, &cond)?;
        assert_eq!(out.dims(), &[1, 4, h, w]);
    }
    Ok(())
}

fn shared_matches_repeated_layers(dev: &Device) -> Result<()> {
    let (_varmap, unet) = tiny_unet(dev)?;
    let context = Tensor::randn(0f32, 1., (1, SEQ_LEN, CROSS_DIM), dev)?;
    let latents = Tensor::randn(0f32, 1., (1, 4, 16, 16), dev)?;
    let shared = unet.forward(&latents, 250u32, &Conditioning::from(&context))?;
    let repeated = Conditioning::per_layer(vec![context; 16]);
    let per_layer = unet.forward(&latents, 250u32, &repeated)?;
    assert_eq!(max_abs_diff(&shared, &per_layer)?, 0.);

    // Different per-layer embeddings must change the prediction.
    let distinct = Conditioning::per_layer(random_layers(16, dev)?);
    let other = unet.forward(&latents, 250u32, &distinct)?;
    assert!(max_abs_diff(&shared, &other)? > 0.);
    Ok(())
}

fn return_dict_variants(dev: &Device) -> Result<()> {
    let (_varmap, unet) = tiny_unet(dev)?;
    let cond = Conditioning::per_layer(random_layers(16, dev)?);
    let latents = Tensor::randn(0f32, 1., (1, 4, 8, 8), dev)?;
    let timestep = Tensor::new(&[42f32], dev)?;

    let dict = unet.forward_output(&latents, &timestep, &cond, true)?;
    assert!(matches!(dict, UNetForwardOutput::Dict(_)));
    let tuple = unet.forward_output(&latents, &timestep, &cond, false)?;
    let UNetForwardOutput::Tuple((sample,)) = &tuple else {
        panic!("expected a tuple output")
    };
    assert_eq!(max_abs_diff(dict.sample(), sample)?, 0.);
    assert_eq!(tuple.into_sample().dims(), latents.dims());
    Ok(())
}

fn checkpointing_matches_direct(dev: &Device) -> Result<()> {
    let (varmap, mut unet) = tiny_unet(dev)?;
    let conv1 = varmap
        .data()
        .lock()
        .expect("varmap lock")
        .get("down_blocks.0.resnets.0.conv1.weight")
        .expect("conv1 weight")
        .clone();
    let layers = random_layers(16, dev)?
        .iter()
        .map(Var::from_tensor)
        .collect::<Result<Vec<_>>>()?;
    let cond = Conditioning::per_layer(layers.iter().map(|v| v.as_tensor().clone()).collect());
    let latents = Tensor::randn(0f32, 1., (1, 4, 8, 8), dev)?;

    unet.set_training(true);
    let direct = unet.forward(&latents, 100u32, &cond)?;
    let direct_grads = direct.sqr()?.mean_all()?.backward()?;

    unet.set_gradient_checkpointing(true);
    assert!(unet.is_training() && unet.is_gradient_checkpointing());
    let ckpt = unet.forward(&latents, 100u32, &cond)?;
    assert_eq!(max_abs_diff(&direct, &ckpt)?, 0.);
    let ckpt_grads = ckpt.sqr()?.mean_all()?.backward()?;

    for (i, layer) in layers.iter().enumerate() {
        let a = direct_grads.get(layer.as_tensor()).expect("direct grad");
        let b = ckpt_grads.get(layer.as_tensor()).expect("checkpoint grad");
        let scale = a.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        let diff = max_abs_diff(a, b)?;
        assert!(scale > 0., "no gradient reached site {i}");
        assert!(diff <= 1e-3 * scale, "site {i}: grad diff {diff} (scale {scale})");
    }
    // Checkpointed blocks treat the UNet weights as frozen.
    assert!(direct_grads.get(conv1.as_tensor()).is_some());
    assert!(ckpt_grads.get(conv1.as_tensor()).is_none());
    Ok(())
}

fn center_input_and_head_layout(dev: &Device) -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let config = UNet2DConditionModelConfig {
        center_input_sample: true,
        layers_per_block: 1,
        use_linear_projection: true,
        ..tiny_config()
    };
    let unet = UNet2DConditionModel::new(vb, config)?;
    // One site per down block, the mid site and two per up block.
    assert_eq!(unet.xti_layout().len(), 3 + 1 + 6);
    assert_eq!(unet.skip_connection_counts(), (8, 8));
    let cond = Conditioning::per_layer(random_layers(10, dev)?);
    let latents = Tensor::rand(0f32, 1., (1, 4, 16, 8), dev)?;
    let out = unet.forward(&latents, 3i64, &cond)?;
    assert_eq!(out.dims(), &[1, 4, 16, 8]);
    Ok(())
}

fn sliced_attention_matches_full(dev: &Device) -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let full = UNet2DConditionModel::new(vb.clone(), tiny_config())?;
    let sliced_config = UNet2DConditionModelConfig {
        sliced_attention_size: Some(1),
        ..tiny_config()
    };
    // Same VarMap, so both models share their weights.
    let sliced = UNet2DConditionModel::new(vb, sliced_config)?;
    let cond = Conditioning::per_layer(
        (0..16)
            .map(|_| Tensor::randn(0f32, 1., (2, SEQ_LEN, CROSS_DIM), dev))
            .collect::<Result<Vec<_>>>()?,
    );
    let latents = Tensor::randn(0f32, 1., (2, 4, 8, 8), dev)?;
    let expected = full.forward(&latents, 20u32, &cond)?;
    let out = sliced.forward(&latents, 20u32, &cond)?;
    assert_eq!(out.dims(), expected.dims());
    let diff = max_abs_diff(&out, &expected)?;
    assert!(diff < 1e-5, "sliced attention diverges by {diff}");
    Ok(())
}

fn half_precision_forward(dev: &Device) -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F16, dev);
    let unet = UNet2DConditionModel::new(vb, tiny_config())?;
    let cond = Conditioning::zeros(unet.xti_layout(), (1, SEQ_LEN, CROSS_DIM), DType::F16, dev)?;
    let latents = Tensor::randn(0f32, 1., (1, 4, 9, 13), dev)?.to_dtype(DType::F16)?;
    let timestep = Tensor::new(&[3i64], dev)?;
    let out = unet.forward(&latents, &timestep, &cond)?;
    assert_eq!(out.dtype(), DType::F16);
    assert_eq!(out.dims(), &[1, 4, 9, 13]);
    Ok(())
}

test_device!(
    zero_conditioning_keeps_shape,
    zero_conditioning_keeps_shape_cpu,
    zero_conditioning_keeps_shape_gpu,
    zero_conditioning_keeps_shape_metal
);
test_device!(
    short_conditioning_names_first_unmet_site,
    short_conditioning_names_first_unmet_site_cpu,
    short_conditioning_names_first_unmet_site_gpu,
    short_conditioning_names_first_unmet_site_metal
);
test_device!(
    skip_connections_balance,
    skip_connections_balance_cpu,
    skip_connections_balance_gpu,
    skip_connections_balance_metal
);
test_device!(
    odd_sizes_round_trip,
    odd_sizes_round_trip_cpu,
    odd_sizes_round_trip_gpu,
    odd_sizes_round_trip_metal
);
test_device!(
    shared_matches_repeated_layers,
    shared_matches_repeated_layers_cpu,
    shared_matches_repeated_layers_gpu,
    shared_matches_repeated_layers_metal
);
test_device!(
    return_dict_variants,
    return_dict_variants_cpu,
    return_dict_variants_gpu,
    return_dict_variants_metal
);
test_device!(
    checkpointing_matches_direct,
    checkpointing_matches_direct_cpu,
    checkpointing_matches_direct_gpu,
    checkpointing_matches_direct_metal
);
test_device!(
    center_input_and_head_layout,
    center_input_and_head_layout_cpu,
    center_input_and_head_layout_gpu,
    center_input_and_head_layout_metal
);
test_device!(
    sliced_attention_matches_full,
    sliced_attention_matches_full_cpu,
    sliced_attention_matches_full_gpu,
    sliced_attention_matches_full_metal
);
test_device!(
    half_precision_forward,
    half_precision_forward_cpu,
    half_precision_forward_gpu,
    half_precision_forward_metal
);
