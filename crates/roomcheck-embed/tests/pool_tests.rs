use candle_core::{DType, Device, Tensor};
use roomcheck_core::config::DeviceKind;
use roomcheck_embed::{mean_pool_l2, select_device};

#[test]
fn masked_tokens_do_not_contribute() {
    let dev = Device::Cpu;
    // one row, two tokens of width 4; the second token is padding
    let h = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], (1, 2, 4), &dev).unwrap();
    let mask = Tensor::from_slice(&[1u32, 0u32], (1, 2), &dev).unwrap().to_dtype(DType::F32).unwrap();
    let out: Vec<Vec<f32>> = mean_pool_l2(&h, &mask).unwrap().to_vec2().unwrap();
    let norm: f32 = 30f32.sqrt();
    for (a, b) in out[0].iter().zip([1.0 / norm, 2.0 / norm, 3.0 / norm, 4.0 / norm]) {
        assert!((a - b).abs() < 1e-5, "a={a} b={b}");
    }
}

#[test]
fn rows_are_pooled_independently() {
    let dev = Device::Cpu;
    let h = Tensor::from_slice(&[3.0f32, 4.0, 0.0, 0.0, 0.0, 2.0, 0.0, 2.0], (2, 2, 2), &dev).unwrap();
    let mask = Tensor::from_slice(&[1u32, 0, 1, 1], (2, 2), &dev).unwrap();
    let out: Vec<Vec<f32>> = mean_pool_l2(&h, &mask).unwrap().to_vec2().unwrap();
    assert!((out[0][0] - 0.6).abs() < 1e-5 && (out[0][1] - 0.8).abs() < 1e-5);
    assert!(out[1][0].abs() < 1e-5 && (out[1][1] - 1.0).abs() < 1e-5);
}

#[test]
fn fully_masked_row_pools_to_zero() {
    let dev = Device::Cpu;
    let h = Tensor::from_slice(&[1.0f32, 1.0, 1.0, 1.0], (1, 2, 2), &dev).unwrap();
    let mask = Tensor::from_slice(&[0u32, 0], (1, 2), &dev).unwrap();
    let out: Vec<Vec<f32>> = mean_pool_l2(&h, &mask).unwrap().to_vec2().unwrap();
    assert!(out[0].iter().all(|x| *x == 0.0));
}

#[test]
fn rank_two_input_is_rejected() {
    let dev = Device::Cpu;
    let h = Tensor::zeros((2, 4), DType::F32, &dev).unwrap();
    let mask = Tensor::ones((2, 4), DType::F32, &dev).unwrap();
    assert!(mean_pool_l2(&h, &mask).is_err());
}

#[test]
fn cpu_is_always_available() {
    assert!(select_device(DeviceKind::Cpu).unwrap().is_cpu());
    assert!(select_device(DeviceKind::Auto).is_ok());
}

#[cfg(not(feature = "metal"))]
#[test]
fn explicit_metal_without_feature_fails() {
    assert!(select_device(DeviceKind::Metal).is_err());
}
