use briny_conv::ops::cpu::{MatDims, matmul};
use briny_conv::ops::im2col::im2col;
use briny_conv::shape::ConvGeometry;
use briny_conv::tensors::Tensor;
use briny_conv::{ConvConfig, ConvLayer, EmulatedAccelerator, ExecOptions, ExecPolicy};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

fn ramp(shape: [usize; 4]) -> Tensor<f32> {
    let len: usize = shape.iter().product();
    Tensor::new(
        shape.to_vec(),
        (0..len).map(|i| (i % 31) as f32 / 31.0 - 0.5).collect(),
    )
}

/// First layer of a small face detector: 3 → 48 channels, 9×9 kernels.
const CASES: [([usize; 4], [usize; 4], usize); 3] = [
    ([1, 3, 64, 64], [48, 3, 9, 9], 4),
    ([1, 16, 32, 32], [32, 16, 3, 3], 1),
    ([1, 64, 14, 14], [64, 64, 1, 1], 1),
];

fn bench_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv_forward");
    for (in_shape, w_shape, stride) in CASES {
        let mut layer = ConvLayer::from_config(ConvConfig::with_stride(stride).unwrap())
            .with_device(EmulatedAccelerator::new());
        layer.set_weights(ramp(w_shape));
        let input = ramp(in_shape);
        let id = format!("{in_shape:?}x{w_shape:?}/{stride}");

        for policy in [ExecPolicy::Host, ExecPolicy::Accelerator] {
            let opts = ExecOptions::with_policy(policy);
            group.bench_with_input(BenchmarkId::new(format!("{policy:?}"), &id), &input, |b, x| {
                let mut out = Tensor::empty();
                b.iter(|| layer.execute(&[black_box(x)], &mut out, &opts).unwrap());
            });
        }
    }
    group.finish();
}

fn bench_phases(c: &mut Criterion) {
    let (in_shape, w_shape, stride) = CASES[0];
    let input = ramp(in_shape);
    let weight = ramp(w_shape);
    let geom = ConvGeometry::from_shapes(&input, &weight, stride, stride).unwrap();
    let mut mat = vec![0.0; geom.im2col_len()];
    let mut out = vec![0.0; geom.output_len()];

    c.bench_function("im2col", |b| {
        b.iter(|| im2col(black_box(&input.data), &geom, &mut mat));
    });

    im2col(&input.data, &geom, &mut mat);
    let dims = MatDims {
        m: geom.out_channels,
        n: geom.positions(),
        k: geom.kernel_size(),
    };
    c.bench_function("matmul_trans_b", |b| {
        b.iter(|| matmul(black_box(&weight.data), &mat, &mut out, dims, false, true));
    });
}

criterion_group!(benches, bench_paths, bench_phases);
criterion_main!(benches);
