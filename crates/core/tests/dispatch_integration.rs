//! Integration tests for dense `forward` calls: epilogues, LoRA masking,
//! strided inputs and execute-mode behaviour.

mod common;

use std::sync::Arc;

use candle_core::{Device, IndexOp, Tensor};
use gemm_core::{
    CandleBackend, DispatchError, LinearDispatch, LoraInput, LowRankAdapter, OperationKind,
    StridedView, WeightDescriptor,
};

use common::{det, dense_weight, max_abs_diff, rows, zeros, MockBackend};

fn candle_dispatch() -> LinearDispatch {
    LinearDispatch::new(Arc::new(CandleBackend::cpu()))
}

// ─── Epilogues ───────────────────────────────────────────────────────────────

#[test]
fn test_gemm_and_fused_add_agree_on_zero_output() {
    let dispatch = candle_dispatch();
    let w = dense_weight(6, 8, 1);
    let x = det(5, 8, 2);

    let mut gemm = zeros(5, 6);
    dispatch
        .forward(&mut gemm, StridedView::new(&x), 5, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap();
    let mut added = zeros(5, 6);
    dispatch
        .forward(&mut added, StridedView::new(&x), 5, &w, OperationKind::FusedAdd, LoraInput::none())
        .unwrap();

    assert!(max_abs_diff(&gemm, &added) < 1e-5);
}

#[test]
fn test_fused_add_accumulates() {
    let dispatch = candle_dispatch();
    let w = dense_weight(4, 8, 1);
    let x = det(3, 8, 2);
    let expected = (x.matmul(&w.tensor().t().unwrap()).unwrap() + 1.0).unwrap();

    let mut out = Tensor::ones((3, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
    dispatch
        .forward(&mut out, StridedView::new(&x), 3, &w, OperationKind::FusedAdd, LoraInput::none())
        .unwrap();
    assert!(max_abs_diff(&out, &expected) < 1e-5);
}

#[test]
fn test_fused_silu_ffn_gates_halves() {
    let dispatch = candle_dispatch();
    let w = dense_weight(8, 6, 3);
    let x = det(2, 6, 4);

    let mut out = zeros(2, 4);
    dispatch
        .forward(&mut out, StridedView::new(&x), 2, &w, OperationKind::FusedSiluFfn, LoraInput::none())
        .unwrap();

    let product = x.matmul(&w.tensor().t().unwrap()).unwrap();
    let gate = product.narrow(1, 0, 4).unwrap();
    let up = product.narrow(1, 4, 4).unwrap();
    let expected = candle_nn::ops::silu(&gate).unwrap().mul(&up).unwrap();
    assert!(max_abs_diff(&out, &expected) < 1e-5);
}

// ─── LoRA ────────────────────────────────────────────────────────────────────

#[test]
fn test_masked_out_single_row_equals_plain_call() {
    let dispatch = candle_dispatch();
    let w = dense_weight(4, 8, 1);
    let x = det(1, 8, 5);
    let delta = det(1, 4, 6);
    let mask = Tensor::new(&[0u8], &Device::Cpu).unwrap();

    let mut plain = zeros(1, 4);
    dispatch
        .forward(&mut plain, StridedView::new(&x), 1, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap();
    let mut masked = zeros(1, 4);
    dispatch
        .forward(
            &mut masked,
            StridedView::new(&x),
            1,
            &w,
            OperationKind::Gemm,
            LoraInput::masked(&delta, &mask),
        )
        .unwrap();

    assert_eq!(rows(&plain), rows(&masked));
}

#[test]
fn test_lora_mask_selects_rows() {
    let dispatch = candle_dispatch();
    let w = dense_weight(4, 8, 1);
    let x = det(3, 8, 2);
    let a = det(2, 8, 7);
    let b = det(4, 2, 8);
    let adapter = LowRankAdapter::new(a, b, 4.0).unwrap();
    let delta = adapter.delta(&x).unwrap();
    let mask = Tensor::new(&[1u32, 0, 1], &Device::Cpu).unwrap();

    let mut plain = zeros(3, 4);
    dispatch
        .forward(&mut plain, StridedView::new(&x), 3, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap();
    let mut adapted = zeros(3, 4);
    dispatch
        .forward(
            &mut adapted,
            StridedView::new(&x),
            3,
            &w,
            OperationKind::Gemm,
            LoraInput::masked(&delta, &mask),
        )
        .unwrap();

    let expected_row0 = (plain.i(0).unwrap() + delta.i(0).unwrap()).unwrap();
    assert!(max_abs_diff(&adapted.i(0).unwrap(), &expected_row0) < 1e-5);
    assert_eq!(rows(&adapted)[1], rows(&plain)[1]);
}

#[test]
fn test_lora_delta_shape_is_checked() {
    let dispatch = candle_dispatch();
    let w = dense_weight(4, 8, 1);
    let x = det(2, 8, 2);
    let delta = det(3, 4, 6);
    let mut out = zeros(2, 4);
    let err = dispatch
        .forward(&mut out, StridedView::new(&x), 2, &w, OperationKind::Gemm, LoraInput::all_rows(&delta))
        .unwrap_err();
    assert!(matches!(err, DispatchError::ShapeMismatch(_)));
}

// ─── Strided input ───────────────────────────────────────────────────────────

#[test]
fn test_pitched_input_matches_contiguous() {
    let dispatch = candle_dispatch();
    let w = dense_weight(4, 6, 1);
    let x = det(3, 6, 2);

    // Same rows, padded to a pitch of 10.
    let padding = zeros(3, 4);
    let padded = Tensor::cat(&[&x, &padding], 1).unwrap();
    assert_eq!(padded.dims(), &[3, 10]);
    let flat = padded.flatten_all().unwrap();

    let mut contiguous = zeros(3, 4);
    dispatch
        .forward(&mut contiguous, StridedView::new(&x), 3, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap();
    let mut strided = zeros(3, 4);
    dispatch
        .forward(
            &mut strided,
            StridedView::with_pitch(&flat, 10),
            3,
            &w,
            OperationKind::Gemm,
            LoraInput::none(),
        )
        .unwrap();

    assert!(max_abs_diff(&contiguous, &strided) < 1e-6);
}

#[test]
fn test_input_width_mismatch() {
    let dispatch = candle_dispatch();
    let w = dense_weight(4, 8, 1);
    let x = det(2, 6, 2);
    let mut out = zeros(2, 4);
    let err = dispatch
        .forward(&mut out, StridedView::new(&x), 2, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap_err();
    assert!(matches!(err, DispatchError::ShapeMismatch(_)));
    assert_eq!(w.input_dim(), 8);
}

#[test]
fn test_zero_batch_rejected() {
    let dispatch = candle_dispatch();
    let w = dense_weight(4, 8, 1);
    let x = det(2, 8, 2);
    let mut out = zeros(2, 4);
    let err = dispatch
        .forward(&mut out, StridedView::new(&x), 0, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap_err();
    assert!(matches!(err, DispatchError::ShapeMismatch(_)));
}

#[test]
fn test_batch_smaller_than_buffer_uses_leading_rows() {
    let dispatch = candle_dispatch();
    let w = dense_weight(4, 8, 1);
    let x = det(4, 8, 2);

    let mut full = zeros(4, 4);
    dispatch
        .forward(&mut full, StridedView::new(&x), 4, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap();
    let mut head = zeros(2, 4);
    dispatch
        .forward(&mut head, StridedView::new(&x), 2, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap();
    assert!(max_abs_diff(&head, &full.narrow(0, 0, 2).unwrap()) < 1e-6);
}

// ─── Execute mode ────────────────────────────────────────────────────────────

#[test]
fn test_execute_mode_is_idempotent_and_read_only() {
    let backend = Arc::new(MockBackend::new());
    let dispatch = LinearDispatch::new(backend.clone());
    let w = dense_weight(6, 8, 1);
    let x = det(4, 8, 2);

    let mut first = zeros(4, 6);
    dispatch
        .forward(&mut first, StridedView::new(&x), 4, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap();
    let mut second = zeros(4, 6);
    dispatch
        .forward(&mut second, StridedView::new(&x), 4, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap();

    assert_eq!(rows(&first), rows(&second));
    assert!(dispatch.records().is_empty());
    assert_eq!(dispatch.cache_stats().misses, 2);
    assert_eq!(backend.executions(), 2);
}

#[test]
fn test_measurement_does_not_change_numerics() {
    let backend = Arc::new(MockBackend::new());
    let dispatch = LinearDispatch::new(backend.clone());
    let w = dense_weight(6, 8, 1);
    let x = det(20, 8, 2);

    let mut executed = zeros(20, 6);
    dispatch
        .forward(&mut executed, StridedView::new(&x), 20, &w, OperationKind::FusedAdd, LoraInput::none())
        .unwrap();

    dispatch.set_measure(true);
    let mut measured = zeros(20, 6);
    dispatch
        .forward(&mut measured, StridedView::new(&x), 20, &w, OperationKind::FusedAdd, LoraInput::none())
        .unwrap();
    dispatch.set_measure(false);

    assert!(max_abs_diff(&executed, &measured) < 1e-5);
    // Three unfused and three fused-add candidates were benchmarked.
    assert_eq!(backend.executions(), 1 + 6);
}

#[test]
fn test_unsupported_cached_variant_falls_back_to_default() {
    use gemm_core::{Fusion, KernelVariant, TileShape};

    let large = KernelVariant::new(Fusion::Unfused, TileShape::Large);
    let tuned = LinearDispatch::new(Arc::new(MockBackend::new().with_cost(large, 1.0)));
    let w = dense_weight(4, 8, 1);
    let x = det(2, 8, 2);
    let mut out = zeros(2, 4);
    tuned.set_measure(true);
    tuned
        .forward(&mut out, StridedView::new(&x), 2, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap();
    let mut file = Vec::new();
    tuned.export(&mut file).unwrap();

    let backend = Arc::new(MockBackend::new().without(large));
    let serving = LinearDispatch::new(backend.clone());
    serving.import(&mut file.as_slice()).unwrap();
    serving
        .forward(&mut out, StridedView::new(&x), 2, &w, OperationKind::Gemm, LoraInput::none())
        .unwrap();
    assert_eq!(backend.executed(), vec![KernelVariant::DEFAULT]);
}
