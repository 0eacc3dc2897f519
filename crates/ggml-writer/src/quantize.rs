use chatglm_ggml::{GgmlType, Tensor, TensorData, QK};
use half::f16;
use rayon::prelude::*;

use crate::{Result, WriterError};

const Q8_0_BYTES: usize = 2 + QK;
const Q4_0_BYTES: usize = 2 + QK / 2;
const Q4_1_BYTES: usize = 2 + 2 + QK / 2;
const Q5_0_BYTES: usize = 2 + 4 + QK / 2;
const Q5_1_BYTES: usize = 2 + 2 + 4 + QK / 2;

/// Encode a tensor's dense values as `dtype`. Grouped tensors must be
/// dequantized first.
pub fn quantize_tensor(name: &str, tensor: &Tensor, dtype: GgmlType) -> Result<Vec<u8>> {
    match tensor.data() {
        TensorData::F32(values) => encode_f32(name, values, tensor.shape(), dtype),
        TensorData::Grouped { .. } => Err(WriterError::UnsupportedEncoding {
            name: name.to_string(),
            reason: format!("grouped integer weights cannot be written as {dtype}"),
        }),
    }
}

/// Encode row-major `values` of the given `shape` as `dtype`.
pub fn encode_f32(name: &str, values: &[f32], shape: &[usize], dtype: GgmlType) -> Result<Vec<u8>> {
    let expected: usize = shape.iter().product();
    if values.len() != expected {
        return Err(WriterError::DimensionMismatch {
            name: name.to_string(),
            expected,
            found: values.len(),
        });
    }
    if let Some(block) = dtype.block_size() {
        let last = shape.last().copied().unwrap_or(1);
        if last % block != 0 {
            return Err(WriterError::Shape {
                name: name.to_string(),
                last,
                block,
            });
        }
    }
    let bytes: Vec<u8> = match dtype {
        GgmlType::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        GgmlType::F16 => values
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect(),
        GgmlType::Q8_0 => encode_blocks(values, quantize_block_q8_0),
        GgmlType::Q4_0 => encode_blocks(values, quantize_block_q4_0),
        GgmlType::Q4_1 => encode_blocks(values, quantize_block_q4_1),
        GgmlType::Q5_0 => encode_blocks(values, quantize_block_q5_0),
        GgmlType::Q5_1 => encode_blocks(values, quantize_block_q5_1),
    };
    Ok(bytes)
}

fn encode_blocks<const N: usize>(values: &[f32], encode: fn(&[f32; QK]) -> [u8; N]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() / QK * N];
    out.par_chunks_exact_mut(N)
        .zip(values.par_chunks_exact(QK))
        .for_each(|(dst, src)| {
            let block: &[f32; QK] = src.try_into().expect("chunk of QK values");
            dst.copy_from_slice(&encode(block));
        });
    out
}

/// Signed value of the element with the largest magnitude. The first such
/// element wins on ties.
fn signed_absmax(block: &[f32; QK]) -> f32 {
    let mut best = 0f32;
    for &value in block {
        if value.abs() > best.abs() {
            best = value;
        }
    }
    best
}

fn min_max(block: &[f32; QK]) -> (f32, f32) {
    block
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Symmetric codes `round(v / d + offset)` clamped to `[0, max_code]`.
fn symmetric_codes(block: &[f32; QK], d: f32, offset: f32, max_code: f32) -> [u8; QK] {
    let mut codes = [offset as u8; QK];
    if d != 0.0 {
        for (code, &value) in codes.iter_mut().zip(block) {
            *code = (value / d + offset).round_ties_even().clamp(0.0, max_code) as u8;
        }
    }
    codes
}

/// Asymmetric codes `round((v - min) / d)` clamped to `[0, max_code]`.
fn affine_codes(block: &[f32; QK], min: f32, d: f32, max_code: f32) -> [u8; QK] {
    let mut codes = [0u8; QK];
    if d != 0.0 {
        for (code, &value) in codes.iter_mut().zip(block) {
            *code = ((value - min) / d).round_ties_even().clamp(0.0, max_code) as u8;
        }
    }
    codes
}

/// Element `j` goes to the low nibble of byte `j`, element `j + 16` to its high nibble.
fn pack_nibbles(codes: &[u8; QK]) -> [u8; QK / 2] {
    let mut qs = [0u8; QK / 2];
    for (j, byte) in qs.iter_mut().enumerate() {
        *byte = (codes[j] & 0x0F) | ((codes[j + QK / 2] & 0x0F) << 4);
    }
    qs
}

fn unpack_nibbles(qs: &[u8]) -> [u8; QK] {
    let mut codes = [0u8; QK];
    for (j, &byte) in qs.iter().take(QK / 2).enumerate() {
        codes[j] = byte & 0x0F;
        codes[j + QK / 2] = byte >> 4;
    }
    codes
}

/// Bit `i` of the mask is bit 4 of code `i`.
fn high_bits(codes: &[u8; QK]) -> u32 {
    codes
        .iter()
        .enumerate()
        .fold(0u32, |mask, (i, &code)| mask | (u32::from((code >> 4) & 1) << i))
}

fn read_f16(bytes: &[u8]) -> f32 {
    f16::from_le_bytes([bytes[0], bytes[1]]).to_f32()
}

pub fn quantize_block_q8_0(block: &[f32; QK]) -> [u8; Q8_0_BYTES] {
    let amax = block.iter().fold(0f32, |acc, v| acc.max(v.abs()));
    let d = amax / 127.0;
    let mut out = [0u8; Q8_0_BYTES];
    out[..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());
    if d != 0.0 {
        for (dst, &value) in out[2..].iter_mut().zip(block) {
            *dst = ((value / d).round_ties_even().clamp(-128.0, 127.0) as i8) as u8;
        }
    }
    out
}

pub fn quantize_block_q4_0(block: &[f32; QK]) -> [u8; Q4_0_BYTES] {
    let d = signed_absmax(block) / -8.0;
    let codes = symmetric_codes(block, d, 8.0, 15.0);
    let mut out = [0u8; Q4_0_BYTES];
    out[..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());
    out[2..].copy_from_slice(&pack_nibbles(&codes));
    out
}

pub fn quantize_block_q4_1(block: &[f32; QK]) -> [u8; Q4_1_BYTES] {
    let (min, max) = min_max(block);
    let d = (max - min) / 15.0;
    let codes = affine_codes(block, min, d, 15.0);
    let mut out = [0u8; Q4_1_BYTES];
    out[..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());
    out[2..4].copy_from_slice(&f16::from_f32(min).to_le_bytes());
    out[4..].copy_from_slice(&pack_nibbles(&codes));
    out
}

pub fn quantize_block_q5_0(block: &[f32; QK]) -> [u8; Q5_0_BYTES] {
    let d = signed_absmax(block) / -16.0;
    let codes = symmetric_codes(block, d, 16.0, 31.0);
    let mut out = [0u8; Q5_0_BYTES];
    out[..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());
    out[2..6].copy_from_slice(&high_bits(&codes).to_le_bytes());
    out[6..].copy_from_slice(&pack_nibbles(&codes));
    out
}

pub fn quantize_block_q5_1(block: &[f32; QK]) -> [u8; Q5_1_BYTES] {
    let (min, max) = min_max(block);
    let d = (max - min) / 31.0;
    let codes = affine_codes(block, min, d, 31.0);
    let mut out = [0u8; Q5_1_BYTES];
    out[..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());
    out[2..4].copy_from_slice(&f16::from_f32(min).to_le_bytes());
    out[4..8].copy_from_slice(&high_bits(&codes).to_le_bytes());
    out[8..].copy_from_slice(&pack_nibbles(&codes));
    out
}

pub fn decode_block_q8_0(bytes: &[u8; Q8_0_BYTES]) -> [f32; QK] {
    let d = read_f16(bytes);
    let mut out = [0f32; QK];
    for (dst, &q) in out.iter_mut().zip(&bytes[2..]) {
        *dst = f32::from(q as i8) * d;
    }
    out
}

pub fn decode_block_q4_0(bytes: &[u8; Q4_0_BYTES]) -> [f32; QK] {
    let d = read_f16(bytes);
    unpack_nibbles(&bytes[2..]).map(|code| (f32::from(code) - 8.0) * d)
}

pub fn decode_block_q4_1(bytes: &[u8; Q4_1_BYTES]) -> [f32; QK] {
    let d = read_f16(bytes);
    let min = read_f16(&bytes[2..]);
    unpack_nibbles(&bytes[4..]).map(|code| f32::from(code) * d + min)
}

pub fn decode_block_q5_0(bytes: &[u8; Q5_0_BYTES]) -> [f32; QK] {
    let d = read_f16(bytes);
    let qh = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    let mut codes = unpack_nibbles(&bytes[6..]);
    for (i, code) in codes.iter_mut().enumerate() {
        *code |= (((qh >> i) & 1) as u8) << 4;
    }
    codes.map(|code| (f32::from(code) - 16.0) * d)
}

pub fn decode_block_q5_1(bytes: &[u8; Q5_1_BYTES]) -> [f32; QK] {
    let d = read_f16(bytes);
    let min = read_f16(&bytes[2..]);
    let qh = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let mut codes = unpack_nibbles(&bytes[8..]);
    for (i, code) in codes.iter_mut().enumerate() {
        *code |= (((qh >> i) & 1) as u8) << 4;
    }
    codes.map(|code| f32::from(code) * d + min)
}

/// Decode an encoded payload back to f32 values.
pub fn decode_payload(dtype: GgmlType, bytes: &[u8]) -> Result<Vec<f32>> {
    let unit = dtype
        .block_bytes()
        .or_else(|| dtype.elem_size_bytes())
        .unwrap_or(1);
    if bytes.len() % unit != 0 {
        return Err(WriterError::UnsupportedEncoding {
            name: "decode_payload".into(),
            reason: format!("{} bytes is not a whole number of {dtype} units", bytes.len()),
        });
    }
    let values: Vec<f32> = match dtype {
        GgmlType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        GgmlType::F16 => bytes.chunks_exact(2).map(read_f16).collect(),
        GgmlType::Q8_0 => decode_blocks(bytes, decode_block_q8_0),
        GgmlType::Q4_0 => decode_blocks(bytes, decode_block_q4_0),
        GgmlType::Q4_1 => decode_blocks(bytes, decode_block_q4_1),
        GgmlType::Q5_0 => decode_blocks(bytes, decode_block_q5_0),
        GgmlType::Q5_1 => decode_blocks(bytes, decode_block_q5_1),
    };
    Ok(values)
}

fn decode_blocks<const N: usize>(bytes: &[u8], decode: fn(&[u8; N]) -> [f32; QK]) -> Vec<f32> {
    bytes
        .chunks_exact(N)
        .flat_map(|chunk| decode(chunk.try_into().expect("chunk of N bytes")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(offset: f32, step: f32) -> [f32; QK] {
        std::array::from_fn(|i| offset + step * i as f32)
    }

    fn max_err(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn q8_0_layout_and_codes() {
        let block = ramp(-3.0, 0.1875);
        let bytes = quantize_block_q8_0(&block);
        let d = 3.0f32 / 127.0;
        assert_eq!(&bytes[..2], &f16::from_f32(d).to_le_bytes());
        assert_eq!(bytes[2] as i8, -127);
        // 0.0 sits at index 16
        assert_eq!(bytes[2 + 16] as i8, 0);
        let decoded = decode_block_q8_0(&bytes);
        assert!(max_err(&decoded, &block) <= d / 2.0 + d * 127.0 * 2f32.powi(-11));
    }

    #[test]
    fn q8_0_rounds_half_to_even() {
        let mut block = [0f32; QK];
        block[0] = 127.0;
        block[1] = 2.5;
        block[2] = 3.5;
        block[3] = -2.5;
        let bytes = quantize_block_q8_0(&block);
        assert_eq!(bytes[3] as i8, 2);
        assert_eq!(bytes[4] as i8, 4);
        assert_eq!(bytes[5] as i8, -2);
    }

    #[test]
    fn q4_0_scale_from_signed_extreme() {
        let mut block = ramp(-1.0, 0.05);
        block[7] = -4.0;
        let bytes = quantize_block_q4_0(&block);
        let d = read_f16(&bytes);
        assert_eq!(d, 0.5);
        // the extreme maps to code 0: low nibble of byte 7
        assert_eq!(bytes[2 + 7] & 0x0F, 0);
    }

    #[test]
    fn q4_0_packs_pairs_across_halves() {
        let mut block = [0f32; QK];
        block[0] = -8.0;
        block[16] = 7.0;
        let bytes = quantize_block_q4_0(&block);
        // d = 1.0: -8 -> code 0, 7 -> code 15, zeros -> code 8
        assert_eq!(bytes[2], 0xF0);
        assert_eq!(bytes[3], 0x88);
    }

    #[test]
    fn q5_0_collects_high_bits() {
        let mut block = [0f32; QK];
        block[0] = -16.0;
        block[31] = 15.0;
        let bytes = quantize_block_q5_0(&block);
        let qh = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        // code 0 at i=0, code 31 at i=31, code 16 elsewhere
        assert_eq!(qh, 0xFFFF_FFFE);
        assert_eq!(bytes[6] & 0x0F, 0);
        assert_eq!(bytes[6 + 15] >> 4, 0x0F);
        let decoded = decode_block_q5_0(&bytes);
        assert_eq!(decoded[0], -16.0);
        assert_eq!(decoded[31], 15.0);
        assert_eq!(decoded[5], 0.0);
    }

    #[test]
    fn symmetric_schemes_flip_scale_under_negation() {
        let block = ramp(-0.7, 0.043);
        let negated = block.map(|v| -v);
        let pos = quantize_block_q5_0(&block);
        let neg = quantize_block_q5_0(&negated);
        assert_eq!(read_f16(&pos), -read_f16(&neg));
        assert_eq!(&pos[2..], &neg[2..]);

        let pos = quantize_block_q4_0(&block);
        let neg = quantize_block_q4_0(&negated);
        assert_eq!(read_f16(&pos), -read_f16(&neg));
        assert_eq!(&pos[2..], &neg[2..]);
    }

    #[test]
    fn affine_schemes_reproduce_min_and_max() {
        let block = ramp(-1.5, 0.125);
        let (min, max) = (-1.5f32, -1.5 + 0.125 * 31.0);
        for decoded in [
            decode_block_q4_1(&quantize_block_q4_1(&block)).to_vec(),
            decode_block_q5_1(&quantize_block_q5_1(&block)).to_vec(),
        ] {
            assert_eq!(decoded[0], min);
            assert!((decoded[31] - max).abs() <= 2.0 * 0.125 * 2f32.powi(-10) * 31.0);
        }
    }

    #[test]
    fn round_trip_stays_within_half_step() {
        let block: [f32; QK] = std::array::from_fn(|i| ((i * 37 % 32) as f32 - 13.3) * 0.071);
        let (min, max) = min_max(&block);
        let amax = block.iter().fold(0f32, |a, v| a.max(v.abs()));
        // f16 scale storage adds a relative error of at most 2^-11 per code step
        let slack = |step: f32, codes: f32| step * codes * 2f32.powi(-11) + 1e-6;

        let step = amax / 127.0;
        let err = max_err(&decode_block_q8_0(&quantize_block_q8_0(&block)), &block);
        assert!(err <= step / 2.0 + slack(step, 128.0), "q8_0 err {err}");

        let step = (max - min) / 15.0;
        let err = max_err(&decode_block_q4_1(&quantize_block_q4_1(&block)), &block);
        assert!(err <= step / 2.0 + slack(step, 15.0) + max.abs() * 2f32.powi(-11), "q4_1 err {err}");

        let step = (max - min) / 31.0;
        let err = max_err(&decode_block_q5_1(&quantize_block_q5_1(&block)), &block);
        assert!(err <= step / 2.0 + slack(step, 31.0) + max.abs() * 2f32.powi(-11), "q5_1 err {err}");

        // the side opposite the extreme may clamp by one code
        let step = amax / 8.0;
        let err = max_err(&decode_block_q4_0(&quantize_block_q4_0(&block)), &block);
        assert!(err <= step + slack(step, 8.0), "q4_0 err {err}");

        let step = amax / 16.0;
        let err = max_err(&decode_block_q5_0(&quantize_block_q5_0(&block)), &block);
        assert!(err <= step + slack(step, 16.0), "q5_0 err {err}");
    }

    #[test]
    fn zero_blocks_decode_to_zero() {
        let block = [0f32; QK];
        for dtype in GgmlType::ALL {
            let bytes = encode_f32("zeros", &block, &[QK], dtype).unwrap();
            let decoded = decode_payload(dtype, &bytes).unwrap();
            assert!(decoded.iter().all(|&v| v == 0.0), "{dtype} decoded {decoded:?}");
        }
    }

    #[test]
    fn rejects_last_dim_not_multiple_of_block() {
        let values = vec![0.5f32; 2 * 33];
        for dtype in [GgmlType::Q8_0, GgmlType::Q4_0, GgmlType::Q5_1] {
            let err = encode_f32("bad", &values, &[2, 33], dtype).unwrap_err();
            assert!(matches!(
                err,
                WriterError::Shape {
                    last: 33,
                    block: 32,
                    ..
                }
            ));
        }
        // dense encodings have no block constraint
        assert!(encode_f32("ok", &values, &[2, 33], GgmlType::F16).is_ok());
    }

    #[test]
    fn two_blocks_per_row_for_width_64() {
        let values: Vec<f32> = (0..3 * 64).map(|i| (i as f32 * 0.37).sin()).collect();
        for dtype in [GgmlType::Q8_0, GgmlType::Q4_0, GgmlType::Q4_1, GgmlType::Q5_0, GgmlType::Q5_1] {
            let bytes = encode_f32("w", &values, &[3, 64], dtype).unwrap();
            let per_block = dtype.block_bytes().unwrap();
            assert_eq!(bytes.len(), 3 * 2 * per_block, "{dtype}");
        }
    }

    #[test]
    fn parallel_encoding_matches_block_order() {
        let values: Vec<f32> = (0..8 * 128).map(|i| (i as f32 * 0.013).cos() * 3.0).collect();
        let bytes = encode_f32("w", &values, &[8, 128], GgmlType::Q5_1).unwrap();
        for (idx, chunk) in values.chunks_exact(QK).enumerate() {
            let block: &[f32; QK] = chunk.try_into().unwrap();
            let expected = quantize_block_q5_1(block);
            assert_eq!(&bytes[idx * 24..(idx + 1) * 24], &expected[..]);
        }
    }

    #[test]
    fn grouped_tensor_requires_dequantization() {
        let tensor = Tensor::grouped(vec![1, 32], vec![1; 32], vec![0.5]).unwrap();
        let err = quantize_tensor("g", &tensor, GgmlType::F32).unwrap_err();
        assert!(matches!(err, WriterError::UnsupportedEncoding { .. }));
    }

    #[test]
    fn dense_payloads_are_little_endian() {
        let values = [1.0f32, -2.5];
        let bytes = encode_f32("d", &values, &[2], GgmlType::F32).unwrap();
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        let half = encode_f32("d", &values, &[2], GgmlType::F16).unwrap();
        assert_eq!(decode_payload(GgmlType::F16, &half).unwrap(), vec![1.0, -2.5]);
    }
}
