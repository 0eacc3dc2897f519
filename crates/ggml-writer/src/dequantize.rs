use chatglm_ggml::{Tensor, TensorData};

use crate::{Result, WriterError};

/// Restore a grouped integer tensor to dense f32. Dense tensors are returned
/// unchanged.
pub fn dequantize_tensor(name: &str, tensor: &Tensor, bits: Option<u32>) -> Result<Tensor> {
    match tensor.data() {
        TensorData::F32(_) => Ok(tensor.clone()),
        TensorData::Grouped { values, scale } => {
            let [rows, packed_cols] = tensor.shape() else {
                return Err(WriterError::UnsupportedEncoding {
                    name: name.to_string(),
                    reason: format!("grouped weights must be 2-D, got {:?}", tensor.shape()),
                });
            };
            let (values, cols) = dequantize_grouped(name, values, scale, *rows, *packed_cols, bits)?;
            Ok(Tensor::from_f32(vec![*rows, cols], values)?)
        }
    }
}

/// Multiply every row of `values` by its scale. With 4-bit weights each byte
/// expands to two signed nibbles, high nibble first. Returns the values and
/// the unpacked column count.
pub fn dequantize_grouped(
    name: &str,
    values: &[i8],
    scale: &[f32],
    rows: usize,
    packed_cols: usize,
    bits: Option<u32>,
) -> Result<(Vec<f32>, usize)> {
    let expected = rows
        .checked_mul(packed_cols)
        .ok_or(WriterError::ValueOverflow {
            what: "grouped elements",
        })?;
    if values.len() != expected {
        return Err(WriterError::DimensionMismatch {
            name: name.to_string(),
            expected,
            found: values.len(),
        });
    }
    if scale.len() != rows {
        return Err(WriterError::DimensionMismatch {
            name: format!("{name}_scale"),
            expected: rows,
            found: scale.len(),
        });
    }
    match bits {
        Some(8) => {
            let mut out = Vec::with_capacity(expected);
            for (row, &s) in values.chunks_exact(packed_cols.max(1)).zip(scale) {
                out.extend(row.iter().map(|&q| f32::from(q) * s));
            }
            Ok((out, packed_cols))
        }
        Some(4) => {
            let cols = packed_cols * 2;
            let mut out = Vec::with_capacity(expected * 2);
            for (row, &s) in values.chunks_exact(packed_cols.max(1)).zip(scale) {
                for &byte in row {
                    let high = byte >> 4;
                    let low = (byte << 4) >> 4;
                    out.push(f32::from(high) * s);
                    out.push(f32::from(low) * s);
                }
            }
            Ok((out, cols))
        }
        other => Err(WriterError::UnsupportedBitWidth {
            name: name.to_string(),
            bits: other,
        }),
    }
}
