use std::{borrow::Cow, collections::HashMap, hash::BuildHasher, io};

use chatglm_ggml::{GgmlError, Tensor};
use thiserror::Error;

mod dequantize;
mod quantize;
mod writer;

pub use dequantize::{dequantize_grouped, dequantize_tensor};
pub use quantize::{
    decode_block_q4_0, decode_block_q4_1, decode_block_q5_0, decode_block_q5_1,
    decode_block_q8_0, decode_payload, encode_f32, quantize_block_q4_0, quantize_block_q4_1,
    quantize_block_q5_0, quantize_block_q5_1, quantize_block_q8_0, quantize_tensor,
};
pub use writer::{
    write_container, ContainerHeader, ContainerWriter, TensorSummary, WriteOptions,
};

/// Errors produced while quantizing tensors or writing a container.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("tensor `{name}` has last dimension {last}, expected a multiple of {block}")]
    Shape {
        name: String,
        last: usize,
        block: usize,
    },
    #[error("tensor `{name}` expected {expected} values, got {found}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("tensor `{name}` cannot be encoded: {reason}")]
    UnsupportedEncoding { name: String, reason: String },
    #[error("tensor `{name}` uses grouped bit width {bits:?}, only 4 and 8 are supported")]
    UnsupportedBitWidth { name: String, bits: Option<u32> },
    #[error("tensor `{0}` is listed in the catalog but missing from the weights")]
    MissingWeight(String),
    #[error("value `{what}` exceeds container limits")]
    ValueOverflow { what: &'static str },
    #[error("failed to load tensor `{name}`: {reason}")]
    Provider { name: String, reason: String },
    #[error(transparent)]
    Format(#[from] GgmlError),
}

pub type Result<T> = std::result::Result<T, WriterError>;

/// Source of named weights consumed while walking a catalog.
///
/// `Ok(None)` means the name is unknown; the writer turns that into
/// [`WriterError::MissingWeight`].
pub trait WeightProvider: Sync {
    fn weight(&self, name: &str) -> Result<Option<Cow<'_, Tensor>>>;
}

impl<S: BuildHasher + Sync> WeightProvider for HashMap<String, Tensor, S> {
    fn weight(&self, name: &str) -> Result<Option<Cow<'_, Tensor>>> {
        Ok(self.get(name).map(Cow::Borrowed))
    }
}
