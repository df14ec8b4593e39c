use briny_conv::cancel::CancelToken;
use briny_conv::memory::MemoryDomain;
use briny_conv::ops::device::AcceleratorBackend;
use briny_conv::ops::dispatch::ConvBackend;
use briny_conv::ops::emulated::DeviceOp;
use briny_conv::tensors::Tensor;
use briny_conv::{ConvConfig, ConvError, ConvLayer, EmulatedAccelerator, ExecOptions, ExecPolicy};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Emulated = AcceleratorBackend<EmulatedAccelerator>;

/// A layer plus a handle on its emulated device.
fn fixture(pooling: bool) -> (ConvLayer, Arc<Emulated>) {
    let backend = Arc::new(if pooling {
        AcceleratorBackend::pooled(EmulatedAccelerator::new())
    } else {
        AcceleratorBackend::new(EmulatedAccelerator::new())
    });
    let shared: Arc<dyn ConvBackend> = backend.clone();

    let mut cfg = ConvConfig::with_stride(1).unwrap();
    cfg.pooling = pooling;
    let mut layer = ConvLayer::from_config(cfg).with_accelerator(shared);
    layer.set_weights(Tensor::filled(vec![3, 2, 3, 3], 0.25));
    (layer, backend)
}

fn input() -> Tensor<f32> {
    Tensor::new(vec![2, 2, 6, 6], (0..144).map(|v| (v % 13) as f32).collect())
}

fn sites_per_call(layer: &ConvLayer, policy: ExecPolicy) -> usize {
    let faults = layer.memory().faults();
    faults.arm(usize::MAX - 1);
    let mut out = Tensor::empty();
    layer
        .execute(&[&input()], &mut out, &ExecOptions::with_policy(policy))
        .unwrap();
    let seen = faults.sites_seen();
    faults.disarm();
    seen
}

#[test]
fn test_every_allocation_site_releases_on_failure() {
    for policy in [ExecPolicy::Host, ExecPolicy::Accelerator] {
        let (layer, backend) = fixture(false);
        let sites = sites_per_call(&layer, policy);
        assert!(sites >= 2, "{policy:?} allocated only {sites} buffers");

        for site in 0..sites {
            layer.memory().faults().arm(site);
            let mut out = Tensor::filled(vec![1], -1.0);
            let err = layer
                .execute(&[&input()], &mut out, &ExecOptions::with_policy(policy))
                .unwrap_err();
            layer.memory().faults().disarm();

            assert!(err.is_recoverable());
            assert!(matches!(err, ConvError::OutOfMemory { .. }), "{policy:?} site {site}: {err}");
            assert_eq!(out.data, vec![-1.0], "no partial output");

            let counts = layer.memory().stats().snapshot();
            assert!(counts.balanced(), "{policy:?} site {site}: {counts:?}");
            assert_eq!(backend.device().live_buffers(), 0);
        }

        // The layer is still usable after every failure.
        let mut out = Tensor::empty();
        layer
            .execute(&[&input()], &mut out, &ExecOptions::with_policy(policy))
            .unwrap();
        assert!(layer.memory().stats().snapshot().balanced());
    }
}

#[test]
fn test_accelerator_path_counts_device_buffers() {
    let (layer, backend) = fixture(false);
    let mut out = Tensor::empty();
    layer
        .execute(&[&input()], &mut out, &ExecOptions::with_policy(ExecPolicy::Accelerator))
        .unwrap();
    let counts = layer.memory().stats().snapshot();
    assert_eq!(counts.device_acquired, 3);
    assert_eq!(counts.host_acquired, 1);
    assert!(counts.balanced());
    assert_eq!(backend.device().launches(), 2);
    assert_eq!(backend.device().live_buffers(), 0);
}

#[test]
fn test_device_failures_surface_and_release() {
    let ops = [
        DeviceOp::Upload,
        DeviceOp::Launch,
        DeviceOp::Synchronize,
        DeviceOp::Download,
    ];
    for op in ops {
        let (layer, backend) = fixture(false);
        backend.device().fail_on(op);

        let mut out = Tensor::empty();
        let err = layer
            .execute(&[&input()], &mut out, &ExecOptions::with_policy(ExecPolicy::Accelerator))
            .unwrap_err();
        assert!(matches!(err, ConvError::Device(_)), "{op:?}: {err}");
        assert!(out.data.is_empty());
        assert!(layer.memory().stats().snapshot().balanced());
        assert_eq!(backend.device().live_buffers(), 0);
    }
}

#[test]
fn test_device_alloc_failure_is_out_of_memory() {
    let (layer, backend) = fixture(false);
    backend.device().fail_on(DeviceOp::Alloc);
    let err = layer
        .execute(&[&input()], &mut Tensor::empty(), &ExecOptions::with_policy(ExecPolicy::Accelerator))
        .unwrap_err();
    assert!(matches!(
        err,
        ConvError::OutOfMemory {
            domain: MemoryDomain::Device,
            ..
        }
    ));
    assert!(layer.memory().stats().snapshot().balanced());
}

#[test]
fn test_device_errors_are_not_retried() {
    let (layer, backend) = fixture(false);
    backend.device().fail_on(DeviceOp::Synchronize);
    let opts = ExecOptions::with_policy(ExecPolicy::Accelerator);
    assert!(layer.execute(&[&input()], &mut Tensor::empty(), &opts).is_err());
    assert_eq!(backend.device().launches(), 1);
}

#[test]
fn test_cancelled_call_releases_buffers() {
    for policy in [ExecPolicy::Host, ExecPolicy::Accelerator] {
        let (layer, backend) = fixture(false);
        let token = CancelToken::new();
        token.cancel();
        let opts = ExecOptions {
            policy: Some(policy),
            cancel: Some(token),
            deadline: None,
        };
        let mut out = Tensor::empty();
        let err = layer.execute(&[&input()], &mut out, &opts).unwrap_err();
        assert!(matches!(err, ConvError::Cancelled));
        assert!(out.data.is_empty());
        assert!(layer.memory().stats().snapshot().balanced());
        assert_eq!(backend.device().launches(), 0);
    }
}

#[test]
fn test_cancel_during_launch_stops_before_synchronize() {
    let (layer, backend) = fixture(false);
    let token = CancelToken::new();
    backend.device().cancel_after_launch(token.clone());
    let opts = ExecOptions {
        policy: Some(ExecPolicy::Accelerator),
        cancel: Some(token),
        deadline: None,
    };

    let mut out = Tensor::empty();
    let err = layer.execute(&[&input()], &mut out, &opts).unwrap_err();
    assert!(matches!(err, ConvError::Cancelled));
    assert_eq!(backend.device().launches(), 1);
    assert_eq!(backend.device().synchronizations(), 0);
    assert!(out.data.is_empty());
    assert_eq!(backend.device().live_buffers(), 0);
    assert!(layer.memory().stats().snapshot().balanced());
}

#[test]
fn test_expired_deadline() {
    let (layer, backend) = fixture(false);
    let opts = ExecOptions {
        policy: Some(ExecPolicy::Accelerator),
        cancel: None,
        deadline: Instant::now().checked_sub(Duration::from_millis(1)),
    };
    if opts.deadline.is_none() {
        return;
    }
    let err = layer.execute(&[&input()], &mut Tensor::empty(), &opts).unwrap_err();
    assert!(matches!(err, ConvError::DeadlineExceeded));
    assert_eq!(backend.device().live_buffers(), 0);
    assert!(layer.memory().stats().snapshot().balanced());
}

#[test]
fn test_pooling_reuses_exact_sizes() {
    let (layer, backend) = fixture(true);
    let opts = ExecOptions::with_policy(ExecPolicy::Accelerator);

    let mut first = Tensor::empty();
    layer.execute(&[&input()], &mut first, &opts).unwrap();
    assert_eq!(layer.memory().stats().snapshot().pool_hits, 0);

    let mut second = Tensor::empty();
    layer.execute(&[&input()], &mut second, &opts).unwrap();
    let counts = layer.memory().stats().snapshot();
    assert_eq!(counts.pool_hits, 4);
    assert!(counts.balanced());
    assert_eq!(first, second);

    // Idle buffers belong to the pools, not to a call.
    assert_eq!(backend.pool().map(|p| p.idle()), Some(3));
    assert_eq!(backend.device().live_buffers(), 3);
    backend.pool().unwrap().clear();
    assert_eq!(backend.device().live_buffers(), 0);

    // A different shape never receives a mis-sized buffer.
    let small = Tensor::filled(vec![1, 2, 4, 4], 1.0);
    let mut out = Tensor::empty();
    layer.execute(&[&small], &mut out, &opts).unwrap();
    assert_eq!(out.shape, vec![1, 3, 2, 2]);
    assert!(out.data.iter().all(|&v| v == 4.5));
}
