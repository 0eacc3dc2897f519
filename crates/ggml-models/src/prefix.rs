use anyhow::{bail, ensure, Context, Result};
use chatglm_ggml::Tensor;

/// Catalog name of the synthesized prefix cache.
pub const PAST_KEY_VALUES: &str = "past_key_values";
/// Checkpoint tensor holding the P-tuning prefix embedding.
pub const PREFIX_ENCODER_WEIGHT: &str = "transformer.prefix_encoder.embedding.weight";

/// Geometry of a P-tuning v2 prefix cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixCache {
    pub pre_seq_len: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
}

impl PrefixCache {
    /// Output shape: `[num_layers * 2, num_kv_heads, pre_seq_len, head_size]`.
    pub fn shape(&self) -> Result<[usize; 4]> {
        let slots = self
            .num_layers
            .checked_mul(2)
            .with_context(|| format!("num_layers {} overflows", self.num_layers))?;
        Ok([slots, self.num_kv_heads, self.pre_seq_len, self.head_size])
    }

    /// Build the cache from the prefix embedding table.
    ///
    /// Rows `0..pre_seq_len` are viewed as
    /// `[pre_seq_len, num_layers * 2, num_kv_heads, head_size]` and permuted so
    /// the sequence axis sits third.
    pub fn build(&self, embedding: &Tensor) -> Result<Tensor> {
        let values = embedding
            .as_f32()
            .context("prefix encoder embedding must be a dense float tensor")?;
        let [rows, width] = embedding.shape() else {
            bail!(
                "prefix encoder embedding must be 2-D, got shape {:?}",
                embedding.shape()
            );
        };
        let shape = self.shape()?;
        let [slots, heads, seq, dim] = shape;
        let expected = slots
            .checked_mul(heads)
            .and_then(|n| n.checked_mul(dim))
            .with_context(|| format!("prefix cache {slots} x {heads} x {dim} overflows"))?;
        ensure!(
            *width == expected,
            "prefix encoder width {width} != {slots} x {heads} x {dim}"
        );
        ensure!(
            *rows >= seq,
            "prefix encoder has {rows} rows, pre_seq_len is {seq}"
        );

        let mut out = Vec::with_capacity(expected * seq);
        for slot in 0..slots {
            for head in 0..heads {
                for pos in 0..seq {
                    let start = ((pos * slots + slot) * heads + head) * dim;
                    out.extend_from_slice(&values[start..start + dim]);
                }
            }
        }
        Ok(Tensor::from_f32(shape.to_vec(), out)?)
    }
}
