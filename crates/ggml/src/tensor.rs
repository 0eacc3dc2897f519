use crate::{GgmlError, Result};

/// Element storage of a source tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// Dense values in row-major order.
    F32(Vec<f32>),
    /// Integer weights from a training-time grouped quantizer, with one f32
    /// scale per row. For 4-bit weights every byte holds two nibbles.
    Grouped { values: Vec<i8>, scale: Vec<f32> },
}

/// Named weights are handed to the writer as `Tensor`s.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn from_f32(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        check_len(&shape, values.len())?;
        Ok(Self {
            shape,
            data: TensorData::F32(values),
        })
    }

    /// Build a grouped integer tensor. `shape` is the packed 2-D shape and
    /// `scale` must carry one entry per row.
    pub fn grouped(shape: Vec<usize>, values: Vec<i8>, scale: Vec<f32>) -> Result<Self> {
        if shape.len() != 2 {
            return Err(GgmlError::Validation(format!(
                "grouped tensors must be 2-D, got shape {shape:?}"
            )));
        }
        check_len(&shape, values.len())?;
        if scale.len() != shape[0] {
            return Err(GgmlError::ShapeMismatch {
                shape: vec![shape[0]],
                expected: shape[0],
                found: scale.len(),
            });
        }
        Ok(Self {
            shape,
            data: TensorData::Grouped { values, scale },
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Dense values, if the tensor is not grouped.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            TensorData::Grouped { .. } => None,
        }
    }

    pub fn is_grouped(&self) -> bool {
        matches!(self.data, TensorData::Grouped { .. })
    }
}

fn check_len(shape: &[usize], found: usize) -> Result<()> {
    let expected = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| GgmlError::Validation(format!("shape {shape:?} overflows usize")))?;
    if expected != found {
        return Err(GgmlError::ShapeMismatch {
            shape: shape.to_vec(),
            expected,
            found,
        });
    }
    Ok(())
}
