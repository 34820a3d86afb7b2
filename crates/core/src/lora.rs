//! Low-rank adapter weights and the delta they contribute to a product.

use candle_core::Tensor;

use crate::error::{DispatchError, Result};

/// A LoRA adapter for one linear layer.
///
/// ```text
/// delta = scale * (x @ lora_a.T @ lora_b.T)
/// ```
///
/// - `lora_a`: `[rank, input_dim]`
/// - `lora_b`: `[output_dim, rank]`
/// - `scale`: `alpha / rank`, or `alpha / sqrt(rank)` for rank-stabilized
///   adapters
#[derive(Debug, Clone)]
pub struct LowRankAdapter {
    pub lora_a: Tensor,
    pub lora_b: Tensor,
    pub rank: usize,
    pub alpha: f32,
    pub scale: f32,
}

impl LowRankAdapter {
    pub fn new(lora_a: Tensor, lora_b: Tensor, alpha: f32) -> Result<Self> {
        let (rank, _) = lora_a.dims2()?;
        let (_, b_rank) = lora_b.dims2()?;
        if rank == 0 || rank != b_rank {
            return Err(DispatchError::shape(format!(
                "lora_a is {:?} and lora_b is {:?}; ranks must agree and be > 0",
                lora_a.dims(),
                lora_b.dims()
            )));
        }
        Ok(Self {
            lora_a,
            lora_b,
            rank,
            alpha,
            scale: alpha / rank as f32,
        })
    }

    /// Same as [`LowRankAdapter::new`] with `alpha / sqrt(rank)` scaling.
    pub fn rank_stabilized(lora_a: Tensor, lora_b: Tensor, alpha: f32) -> Result<Self> {
        let mut adapter = Self::new(lora_a, lora_b, alpha)?;
        adapter.scale = alpha / (adapter.rank as f32).sqrt();
        Ok(adapter)
    }

    pub fn input_dim(&self) -> usize {
        self.lora_a.dims()[1]
    }

    pub fn output_dim(&self) -> usize {
        self.lora_b.dims()[0]
    }

    /// The `[batch, output_dim]` contribution for `[batch, input_dim]` rows.
    pub fn delta(&self, x: &Tensor) -> Result<Tensor> {
        let (_, k) = x.dims2()?;
        if k != self.input_dim() {
            return Err(DispatchError::shape(format!(
                "adapter expects {} input features, got {k}",
                self.input_dim()
            )));
        }
        let a = self.lora_a.to_dtype(x.dtype())?;
        let b = self.lora_b.to_dtype(x.dtype())?;
        let down = x.matmul(&a.t()?)?;
        let up = down.matmul(&b.t()?)?;
        Ok((up * self.scale as f64)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_scale() {
        let a = Tensor::zeros((8, 64), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((32, 8), DType::F32, &Device::Cpu).unwrap();
        let adapter = LowRankAdapter::new(a.clone(), b.clone(), 16.0).unwrap();
        assert_eq!(adapter.rank, 8);
        assert!((adapter.scale - 2.0).abs() < 1e-6);

        let rs = LowRankAdapter::rank_stabilized(a, b, 16.0).unwrap();
        assert!((rs.scale - 16.0 / 8f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_delta_with_ones() {
        // x = 1, A = 1, B = 1: each output is in_dim * rank * scale.
        let device = Device::Cpu;
        let x = Tensor::ones((2, 16), DType::F32, &device).unwrap();
        let a = Tensor::ones((4, 16), DType::F32, &device).unwrap();
        let b = Tensor::ones((8, 4), DType::F32, &device).unwrap();
        let adapter = LowRankAdapter::new(a, b, 8.0).unwrap();

        let delta = adapter.delta(&x).unwrap();
        assert_eq!(delta.dims(), &[2, 8]);
        let values: Vec<f32> = delta.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| (v - 128.0).abs() < 1e-4));
    }

    #[test]
    fn test_rank_mismatch() {
        let a = Tensor::zeros((4, 16), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((8, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(LowRankAdapter::new(a, b, 8.0).is_err());
    }

    #[test]
    fn test_input_width_mismatch() {
        let a = Tensor::zeros((4, 16), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((8, 4), DType::F32, &Device::Cpu).unwrap();
        let adapter = LowRankAdapter::new(a, b, 8.0).unwrap();
        let x = Tensor::zeros((2, 15), DType::F32, &Device::Cpu).unwrap();
        assert!(adapter.delta(&x).is_err());
    }
}
