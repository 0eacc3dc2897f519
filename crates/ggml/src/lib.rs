use std::fmt;

use thiserror::Error;

mod reader;
mod tensor;

pub use reader::{GgmlReader, GgmlRecord};
pub use tensor::{Tensor, TensorData};

/// Leading tag of every container.
pub const GGML_MAGIC: &[u8; 4] = b"ggml";
/// Tensor payloads start on multiples of this many bytes.
pub const GGML_MEM_ALIGN: usize = 16;
/// Number of values covered by one quantized block, shared by every block type.
pub const QK: usize = 32;
/// Version written at the start of the config block.
pub const CONFIG_VERSION: i32 = 2;
/// Byte length of the text config block.
pub const TEXT_CONFIG_LEN: usize = 14 * 4;
/// Byte length of the vision config block appended by vision-language models.
pub const VISION_CONFIG_LEN: usize = 11 * 4;

/// Errors surfaced while reading or validating a GGML container.
#[derive(Debug, Error)]
pub enum GgmlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid container magic: found {found:?}")]
    InvalidMagic { found: [u8; 4] },
    #[error("unsupported tensor dtype code {0}")]
    UnknownDType(i64),
    #[error("unsupported model type code {0}")]
    UnknownModelType(i32),
    #[error("shape {shape:?} describes {expected} values, got {found}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },
    #[error("container malformed: {0}")]
    Format(String),
    #[error("container validation failed: {0}")]
    Validation(String),
    #[error("invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Result alias for container operations.
pub type Result<T> = std::result::Result<T, GgmlError>;

/// On-disk numeric representation of a tensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
}

impl GgmlType {
    pub const ALL: [GgmlType; 7] = [
        Self::F32,
        Self::F16,
        Self::Q4_0,
        Self::Q4_1,
        Self::Q5_0,
        Self::Q5_1,
        Self::Q8_0,
    ];

    pub fn as_i32(self) -> i32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q5_0 => 6,
            Self::Q5_1 => 7,
            Self::Q8_0 => 8,
        }
    }

    /// Values per block, `None` for dense types.
    pub fn block_size(self) -> Option<usize> {
        match self {
            Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 => Some(QK),
            Self::F16 | Self::F32 => None,
        }
    }

    /// Encoded bytes per block, `None` for dense types.
    pub fn block_bytes(self) -> Option<usize> {
        match self {
            Self::Q4_0 => Some(2 + QK / 2),
            Self::Q4_1 => Some(2 + 2 + QK / 2),
            Self::Q5_0 => Some(2 + 4 + QK / 2),
            Self::Q5_1 => Some(2 + 2 + 4 + QK / 2),
            Self::Q8_0 => Some(2 + QK),
            Self::F16 | Self::F32 => None,
        }
    }

    pub fn elem_size_bytes(self) -> Option<usize> {
        match self {
            Self::F16 => Some(2),
            Self::F32 => Some(4),
            _ => None,
        }
    }

    /// Encoded payload length for a tensor of `shape`, or `None` when the
    /// shape violates the block constraint or the length overflows.
    pub fn payload_len(self, shape: &[usize]) -> Option<usize> {
        let elements = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))?;
        match (self.block_size(), self.block_bytes(), self.elem_size_bytes()) {
            (Some(block), Some(bytes), _) => {
                let last = *shape.last()?;
                if last % block != 0 {
                    return None;
                }
                (elements / block).checked_mul(bytes)
            }
            (_, _, Some(elem)) => elements.checked_mul(elem),
            _ => None,
        }
    }
}

impl TryFrom<i32> for GgmlType {
    type Error = GgmlError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::F32),
            1 => Ok(Self::F16),
            2 => Ok(Self::Q4_0),
            3 => Ok(Self::Q4_1),
            6 => Ok(Self::Q5_0),
            7 => Ok(Self::Q5_1),
            8 => Ok(Self::Q8_0),
            other => Err(GgmlError::UnknownDType(other.into())),
        }
    }
}

impl fmt::Display for GgmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => f.write_str("F32"),
            Self::F16 => f.write_str("F16"),
            Self::Q4_0 => f.write_str("Q4_0"),
            Self::Q4_1 => f.write_str("Q4_1"),
            Self::Q5_0 => f.write_str("Q5_0"),
            Self::Q5_1 => f.write_str("Q5_1"),
            Self::Q8_0 => f.write_str("Q8_0"),
        }
    }
}

/// Architecture tag written right after the magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    ChatGlm,
    ChatGlm2,
    ChatGlm3,
    ChatGlm4,
    ChatGlm4V,
}

impl ModelType {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::ChatGlm => 1,
            Self::ChatGlm2 => 2,
            Self::ChatGlm3 => 3,
            Self::ChatGlm4 => 4,
            Self::ChatGlm4V => 1004,
        }
    }

    pub fn has_vision(self) -> bool {
        matches!(self, Self::ChatGlm4V)
    }

    /// Length of the config block that follows the model type tag.
    pub fn config_block_len(self) -> usize {
        if self.has_vision() {
            TEXT_CONFIG_LEN + VISION_CONFIG_LEN
        } else {
            TEXT_CONFIG_LEN
        }
    }
}

impl TryFrom<i32> for ModelType {
    type Error = GgmlError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(Self::ChatGlm),
            2 => Ok(Self::ChatGlm2),
            3 => Ok(Self::ChatGlm3),
            4 => Ok(Self::ChatGlm4),
            1004 => Ok(Self::ChatGlm4V),
            other => Err(GgmlError::UnknownModelType(other)),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChatGlm => f.write_str("ChatGLM"),
            Self::ChatGlm2 => f.write_str("ChatGLM2"),
            Self::ChatGlm3 => f.write_str("ChatGLM3"),
            Self::ChatGlm4 => f.write_str("ChatGLM4"),
            Self::ChatGlm4V => f.write_str("ChatGLM4V"),
        }
    }
}

/// One catalog line: which tensor to emit and how to encode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightEntry {
    pub name: String,
    pub dtype: GgmlType,
}

impl WeightEntry {
    pub fn new(name: impl Into<String>, dtype: GgmlType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Round `pos` up to the next multiple of [`GGML_MEM_ALIGN`].
pub fn align_offset(pos: u64) -> u64 {
    let align = GGML_MEM_ALIGN as u64;
    pos.div_ceil(align) * align
}
