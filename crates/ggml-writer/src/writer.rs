use std::{borrow::Cow, io::Write};

use chatglm_ggml::{align_offset, GgmlType, ModelType, WeightEntry, GGML_MAGIC};
use rayon::prelude::*;
use tracing::debug;

use crate::{dequantize_tensor, quantize_tensor, Result, WeightProvider, WriterError};

const ZEROS: [u8; chatglm_ggml::GGML_MEM_ALIGN] = [0; chatglm_ggml::GGML_MEM_ALIGN];

/// Everything written ahead of the tensor records.
#[derive(Debug, Clone, Copy)]
pub struct ContainerHeader<'a> {
    pub model_type: ModelType,
    /// Serialized config block, copied verbatim.
    pub config: &'a [u8],
    /// Serialized tokenizer block, copied verbatim.
    pub tokenizer: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Bit width of grouped integer weights, when the checkpoint has any.
    pub quantization_bit: Option<u32>,
    /// Catalog entries encoded concurrently before being written in order.
    pub chunk_size: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            quantization_bit: None,
            chunk_size: 1,
        }
    }
}

/// Where a tensor landed in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSummary {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: GgmlType,
    pub offset: u64,
    pub len: u64,
}

struct EncodedTensor {
    name: String,
    shape: Vec<usize>,
    dtype: GgmlType,
    payload: Vec<u8>,
}

/// Append-only container writer tracking the absolute stream position.
#[derive(Debug)]
pub struct ContainerWriter<W: Write> {
    sink: W,
    position: u64,
}

impl<W: Write> ContainerWriter<W> {
    /// Wrap a sink positioned at offset zero.
    pub fn new(sink: W) -> Self {
        Self { sink, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Write magic, model type, config block and tokenizer block.
    pub fn write_header(&mut self, header: &ContainerHeader<'_>) -> Result<()> {
        self.write_bytes(GGML_MAGIC)?;
        self.write_bytes(&header.model_type.as_i32().to_le_bytes())?;
        self.write_bytes(header.config)?;
        self.write_bytes(header.tokenizer)?;
        Ok(())
    }

    /// Write one tensor record: name, shape, dtype, zero padding up to the
    /// next aligned offset, then `payload`.
    pub fn write_tensor(
        &mut self,
        name: &str,
        shape: &[usize],
        dtype: GgmlType,
        payload: &[u8],
    ) -> Result<TensorSummary> {
        let expected = dtype.payload_len(shape).ok_or_else(|| match dtype.block_size() {
            Some(block) => WriterError::Shape {
                name: name.to_string(),
                last: shape.last().copied().unwrap_or(1),
                block,
            },
            None => WriterError::ValueOverflow {
                what: "payload length",
            },
        })?;
        if payload.len() != expected {
            return Err(WriterError::DimensionMismatch {
                name: name.to_string(),
                expected,
                found: payload.len(),
            });
        }
        let header = encode_record_header(name, shape, dtype)?;
        self.write_bytes(&header)?;
        let offset = align_offset(self.position);
        let padding = (offset - self.position) as usize;
        self.write_bytes(&ZEROS[..padding])?;
        self.write_bytes(payload)?;
        Ok(TensorSummary {
            name: name.to_string(),
            shape: shape.to_vec(),
            dtype,
            offset,
            len: payload.len() as u64,
        })
    }

    /// Encode and write every catalog entry in order.
    ///
    /// Entries are encoded `chunk_size` at a time on the current rayon pool;
    /// each chunk is written in catalog order before the next one starts. The
    /// first failing entry stops the write after the entries before it.
    pub fn write_weights<P>(
        &mut self,
        catalog: &[WeightEntry],
        weights: &P,
        options: &WriteOptions,
        mut on_tensor: impl FnMut(&TensorSummary),
    ) -> Result<Vec<TensorSummary>>
    where
        P: WeightProvider + ?Sized,
    {
        let mut summaries = Vec::with_capacity(catalog.len());
        for chunk in catalog.chunks(options.chunk_size.max(1)) {
            let encoded: Vec<Result<EncodedTensor>> = if chunk.len() == 1 {
                vec![encode_entry(&chunk[0], weights, options.quantization_bit)]
            } else {
                chunk
                    .par_iter()
                    .map(|entry| encode_entry(entry, weights, options.quantization_bit))
                    .collect()
            };
            for result in encoded {
                let tensor = result?;
                let summary =
                    self.write_tensor(&tensor.name, &tensor.shape, tensor.dtype, &tensor.payload)?;
                debug!(
                    tensor = %summary.name,
                    shape = ?summary.shape,
                    dtype = %summary.dtype,
                    offset = summary.offset,
                    bytes = summary.len,
                    "wrote tensor"
                );
                on_tensor(&summary);
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    /// Flush and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        self.sink.flush()?;
        Ok(self.sink)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.write_all(bytes)?;
        self.position = self
            .position
            .checked_add(bytes.len() as u64)
            .ok_or(WriterError::ValueOverflow {
                what: "stream position",
            })?;
        Ok(())
    }
}

/// Write a complete container: header, then the catalog's tensors in order.
pub fn write_container<W, P>(
    sink: W,
    header: &ContainerHeader<'_>,
    catalog: &[WeightEntry],
    weights: &P,
    options: &WriteOptions,
) -> Result<(W, Vec<TensorSummary>)>
where
    W: Write,
    P: WeightProvider + ?Sized,
{
    let mut writer = ContainerWriter::new(sink);
    writer.write_header(header)?;
    let summaries = writer.write_weights(catalog, weights, options, |_| {})?;
    Ok((writer.finish()?, summaries))
}

fn encode_entry<P>(entry: &WeightEntry, weights: &P, bits: Option<u32>) -> Result<EncodedTensor>
where
    P: WeightProvider + ?Sized,
{
    let tensor = weights
        .weight(&entry.name)?
        .ok_or_else(|| WriterError::MissingWeight(entry.name.clone()))?;
    let tensor = if tensor.is_grouped() {
        debug!(tensor = %entry.name, bits = ?bits, "dequantizing grouped weight");
        Cow::Owned(dequantize_tensor(&entry.name, &tensor, bits)?)
    } else {
        tensor
    };
    let payload = quantize_tensor(&entry.name, &tensor, entry.dtype)?;
    Ok(EncodedTensor {
        name: entry.name.clone(),
        shape: tensor.shape().to_vec(),
        dtype: entry.dtype,
        payload,
    })
}

fn encode_record_header(name: &str, shape: &[usize], dtype: GgmlType) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(4 * (3 + shape.len()) + name.len());
    let name_len = i32::try_from(name.len()).map_err(|_| WriterError::ValueOverflow {
        what: "tensor name length",
    })?;
    buf.extend_from_slice(&name_len.to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    let ndim =
        i32::try_from(shape.len()).map_err(|_| WriterError::ValueOverflow { what: "ndim" })?;
    buf.extend_from_slice(&ndim.to_le_bytes());
    for &dim in shape {
        let dim =
            i32::try_from(dim).map_err(|_| WriterError::ValueOverflow { what: "dimension" })?;
        buf.extend_from_slice(&dim.to_le_bytes());
    }
    buf.extend_from_slice(&dtype.as_i32().to_le_bytes());
    Ok(buf)
}
