//! Kept in its own test binary: it changes process-wide state.

use briny_conv::backend::{default_policy, set_default_policy};
use briny_conv::tensors::Tensor;
use briny_conv::{ConvConfig, ConvLayer, EmulatedAccelerator, ExecOptions, ExecPath, ExecPolicy};

#[test]
fn test_global_default_policy_applies_to_unconfigured_layers() {
    assert_eq!(default_policy(), ExecPolicy::Host);

    let mut layer = ConvLayer::from_config(ConvConfig::with_stride(1).unwrap())
        .with_device(EmulatedAccelerator::new());
    layer.set_weights(Tensor::filled(vec![1, 1, 2, 2], 1.0));
    let input = Tensor::filled(vec![1, 1, 3, 3], 1.0);
    let mut out = Tensor::empty();

    let report = layer.execute(&[&input], &mut out, &ExecOptions::default()).unwrap();
    assert_eq!(report.path, ExecPath::Host);

    set_default_policy(ExecPolicy::Accelerator);
    let report = layer.execute(&[&input], &mut out, &ExecOptions::default()).unwrap();
    assert_eq!(report.path, ExecPath::Accelerator);

    // A call-level policy still wins.
    let report = layer
        .execute(&[&input], &mut out, &ExecOptions::with_policy(ExecPolicy::Host))
        .unwrap();
    assert_eq!(report.path, ExecPath::Host);

    set_default_policy(ExecPolicy::Host);
}
