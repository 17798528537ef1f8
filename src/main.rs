// file: src/main.rs
// description: CLI entrypoint to load or synthesize an MXFP4 linear layer, finalize it, and run the forward dispatch.
// author: cipher-rc5
// created: 2026-02-21
// modified: 2026-10-19

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use clap::{ArgAction, Parser};
use oxidized_mxfp4::benchmark::{Benchmark, DispatchMetrics};
use oxidized_mxfp4::utils::{checksum, pseudo_random};
use oxidized_mxfp4::{
    HostPlatform, KernelRegistry, LayerRuntime, LinearLayer, LinearScheme, ModelCheckpoint,
    Platform, QuantizationReport, QuantizedLinearWeights, SchemeConfig, W4A4Mxfp4Scheme,
    OCP_MX_BLOCK_SIZE,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(author, version, about = "W4A4 MXFP4 linear layer runner")]
struct Args {
    #[arg(long, help = "Path to a Quark-exported MXFP4 checkpoint directory")]
    model_path: Option<PathBuf>,

    #[arg(long, help = "Linear layer prefix, e.g. model.layers.0.mlp.down_proj")]
    layer: Option<String>,

    #[arg(long, help = "Quantize a random dense layer instead of loading one")]
    synthetic: bool,

    #[arg(long, default_value_t = 1024)]
    out_features: usize,

    #[arg(long, default_value_t = 1024)]
    in_features: usize,

    #[arg(long, default_value_t = 4)]
    batch: usize,

    #[arg(long, action = ArgAction::SetTrue, help = "Treat the host as natively MX-capable")]
    native_mx: bool,

    #[arg(long, action = ArgAction::SetTrue, help = "Keep packed weights and dequantize per call")]
    mem_opt: bool,

    #[arg(long, action = ArgAction::SetTrue, help = "Use shuffled scales with the preshuffled/asm GEMMs")]
    use_asm: bool,

    #[arg(long, help = "List checkpoint tensors and exit")]
    list_tensors: bool,

    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    #[arg(long, action = ArgAction::SetTrue)]
    bench: bool,

    #[arg(long, default_value_t = 10)]
    bench_iters: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .init();

    if args.list_tensors {
        let model_path = args
            .model_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--list-tensors requires --model-path"))?;
        let checkpoint = ModelCheckpoint::open(model_path, &Device::Cpu)?;
        for name in checkpoint.names() {
            let tensor = checkpoint.raw_tensor(&name)?;
            println!("{}\t{:?}\t{:?}", name, tensor.dims(), tensor.dtype());
        }
        return Ok(());
    }

    let env = SchemeConfig::global();
    let config = SchemeConfig {
        emu_mem_opt: args.mem_opt || env.emu_mem_opt,
        use_asm_gemm: args.use_asm || env.use_asm_gemm,
        ..env
    }
    .with_out_dtype(DType::F32);
    let platform = HostPlatform::new(args.native_mx);
    let kernels = KernelRegistry::probe();

    let finalize = Benchmark::new("load + finalize");
    let runtime = if args.synthetic {
        synthetic_runtime(&args, platform.clone(), kernels, config)?
    } else {
        let (Some(model_path), Some(layer)) = (args.model_path.as_deref(), args.layer.as_deref())
        else {
            anyhow::bail!("pass --model-path and --layer, or --synthetic");
        };
        LayerRuntime::from_checkpoint(model_path, layer, platform.clone(), kernels, config)?
    };
    finalize.finish();

    let in_features = runtime.layer.input_size_per_partition();
    let x = Tensor::from_vec(
        pseudo_random(args.batch * in_features, 7, 1.0),
        (args.batch, in_features),
        &Device::Cpu,
    )?;

    let dispatch = Benchmark::new("forward");
    let y = runtime.forward(&x)?;
    dispatch.finish_with_rows(args.batch);

    let values = y.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    println!("mode={:?}", runtime.scheme.mode());
    println!("output_shape={:?}", y.dims());
    println!("checksum={:.6}", checksum(&values));
    platform.memory().print_memory_summary();

    if args.bench {
        let iters = args.bench_iters.max(1);
        let start = Instant::now();
        for _ in 0..iters {
            runtime.forward(&x)?;
        }
        DispatchMetrics::new(iters, args.batch, start.elapsed()).print();
    }
    Ok(())
}

fn synthetic_runtime(
    args: &Args,
    platform: std::sync::Arc<HostPlatform>,
    kernels: KernelRegistry,
    config: SchemeConfig,
) -> Result<LayerRuntime> {
    let (n, k) = (args.out_features, args.in_features);
    let device = platform.device().clone();
    let dense = Tensor::from_vec(pseudo_random(n * k, 1, 2.0), (n, k), &device)?;
    let weights = QuantizedLinearWeights::from_dense("synthetic", &dense, OCP_MX_BLOCK_SIZE)?
        .with_bias(Tensor::from_vec(pseudo_random(n, 3, 0.1), n, &device)?);
    QuantizationReport::measure(&dense, &weights)?.print();

    let scheme = W4A4Mxfp4Scheme::ocp(platform, kernels, config)?;
    let mut layer = LinearLayer::new("synthetic", &device);
    scheme.create_weights(&mut layer, &[n], k, config.out_dtype)?;
    layer.load_weight("weight", &weights.weight, None)?;
    layer.load_weight("weight_scale", &weights.weight_scale, None)?;
    scheme.process_weights_after_loading(&mut layer)?;
    info!("synthetic layer {n}x{k} ready");

    Ok(LayerRuntime {
        scheme,
        layer,
        bias: weights.bias,
    })
}
