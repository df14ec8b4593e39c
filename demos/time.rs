use briny_conv::backend::{ExecPolicy, set_default_policy};
use briny_conv::tensors::Tensor;
use briny_conv::{ConvLayer, EmulatedAccelerator, ExecOptions, HyperParams};
use std::{hint::black_box, time::Duration, time::Instant};
use tracing_subscriber::EnvFilter;

const AVG: u32 = 64;

const BATCH: usize = 1;
const CHANNELS: usize = 3;
const SIZE: usize = 64;
const FILTERS: usize = 48;
const KERNEL: usize = 9;

fn ramp(shape: [usize; 4]) -> Tensor<f32> {
    let len: usize = shape.iter().product();
    Tensor::new(
        shape.to_vec(),
        (0..len).map(|i| (i % 29) as f32 / 29.0 - 0.5).collect(),
    )
}

fn time(layer: &ConvLayer, input: &Tensor<f32>, label: &str) {
    let mut output = Tensor::empty();
    let mut transform = Duration::ZERO;
    let mut multiply = Duration::ZERO;

    let start = Instant::now();
    for _ in 0..AVG {
        let report = layer
            .execute(&[black_box(input)], &mut output, &ExecOptions::default())
            .expect("convolution failed");
        transform += report.transform_elapsed;
        multiply += report.multiply_elapsed;
    }
    let elapsed = start.elapsed() / AVG;

    println!(
        "{label}={elapsed:?} (transform={:?}, multiply={:?}) -> {:?}",
        transform / AVG,
        multiply / AVG,
        output.shape
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let params: HyperParams = "stride=4 pool=true".parse().expect("valid options");
    let mut layer = ConvLayer::setup(&params)
        .expect("valid layer")
        .with_device(EmulatedAccelerator::new());
    layer.set_weights(ramp([FILTERS, CHANNELS, KERNEL, KERNEL]));
    let input = ramp([BATCH, CHANNELS, SIZE, SIZE]);

    set_default_policy(ExecPolicy::Host);
    time(&layer, &input, "HOST");

    set_default_policy(ExecPolicy::Accelerator);
    time(&layer, &input, "EMULATED");

    #[cfg(feature = "wgpu")]
    {
        match briny_conv::ops::wgpu::WgpuAccelerator::new() {
            Ok(device) => {
                let mut gpu = ConvLayer::setup(&params).expect("valid layer").with_device(device);
                gpu.set_weights(ramp([FILTERS, CHANNELS, KERNEL, KERNEL]));
                time(&gpu, &input, "WGPU");
            }
            Err(e) => println!("WGPU unavailable: {e}"),
        }
    }

    let counts = layer.memory().stats().snapshot();
    println!("POOL_HITS={} BALANCED={}", counts.pool_hits, counts.balanced());
}
