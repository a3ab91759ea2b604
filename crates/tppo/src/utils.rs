//! Utility functions.

use crate::{Result, TppoError};
use ndarray::{Array3, ArrayBase, Data, Dimension};
use tch::{kind::Element, Device, Kind, Tensor};

/// Seed libtorch's global generator
pub fn set_seed(seed: u64) {
    tch::manual_seed(seed as i64);
}

/// Copy a host array into a tensor of the same shape on `device`
pub fn array_to_tensor<S, D>(array: &ArrayBase<S, D>, device: Device) -> Tensor
where
    S: Data,
    S::Elem: Element + Copy,
    D: Dimension,
{
    let shape: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<S::Elem> = array.iter().copied().collect();
    Tensor::from_slice(&data).reshape(shape.as_slice()).to_device(device)
}

/// Copy a `[d0, d1, d2]` tensor back to the host as `f32`
pub fn tensor_to_array3(tensor: &Tensor) -> Result<Array3<f32>> {
    let size = tensor.size();
    let &[d0, d1, d2] = size.as_slice() else {
        return Err(TppoError::ShapeMismatch {
            expected: vec![3],
            actual: vec![size.len()],
        });
    };
    let flat = tensor
        .detach()
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .flatten(0, -1);
    let data = Vec::<f32>::try_from(&flat)?;
    let shape = (d0 as usize, d1 as usize, d2 as usize);
    Array3::from_shape_vec(shape, data).map_err(|_| TppoError::ShapeMismatch {
        expected: vec![shape.0, shape.1, shape.2],
        actual: vec![flat.numel()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_array_to_tensor_preserves_layout() {
        let array = Array3::from_shape_fn((2, 3, 4), |(a, b, c)| (a * 100 + b * 10 + c) as i64);
        let tensor = array_to_tensor(&array, Device::Cpu);
        assert_eq!(tensor.size(), vec![2, 3, 4]);
        assert_eq!(tensor.int64_value(&[1, 2, 3]), 123);

        let transposed = array.view().reversed_axes();
        let tensor = array_to_tensor(&transposed, Device::Cpu);
        assert_eq!(tensor.size(), vec![4, 3, 2]);
        assert_eq!(tensor.int64_value(&[3, 2, 1]), 123);
    }

    #[test]
    fn test_tensor_to_array3_round_trip() {
        let array = Array3::from_shape_fn((2, 1, 3), |(a, _, c)| a as f32 - c as f32 * 0.5);
        let back = tensor_to_array3(&array_to_tensor(&array, Device::Cpu)).unwrap();
        assert_eq!(back, array);

        let flat = Tensor::zeros([4], (Kind::Float, Device::Cpu));
        assert!(tensor_to_array3(&flat).is_err());
    }
}
