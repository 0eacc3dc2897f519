#![allow(dead_code)]

use std::{collections::HashMap, io::Write};

use chatglm_ggml::{GgmlReader, ModelType, Tensor, TEXT_CONFIG_LEN};
use chatglm_ggml_writer::ContainerHeader;
use tempfile::NamedTempFile;

/// Smooth values in [-1, 1] with a distinct phase per tensor.
pub fn wave(len: usize, phase: f32) -> Vec<f32> {
    (0..len).map(|i| (i as f32 * 0.21 + phase).sin()).collect()
}

pub fn dense(shape: &[usize], phase: f32) -> Tensor {
    let len = shape.iter().product();
    Tensor::from_f32(shape.to_vec(), wave(len, phase)).expect("valid dense tensor")
}

/// Owned header bytes for a text-only container.
pub struct HeaderBytes {
    pub config: Vec<u8>,
    pub tokenizer: Vec<u8>,
}

impl HeaderBytes {
    pub fn new(tokenizer: &[u8]) -> Self {
        let mut config = vec![0u8; TEXT_CONFIG_LEN];
        config[..4].copy_from_slice(&2i32.to_le_bytes());
        let mut block = (tokenizer.len() as i32).to_le_bytes().to_vec();
        block.extend_from_slice(tokenizer);
        Self {
            config,
            tokenizer: block,
        }
    }

    pub fn header(&self) -> ContainerHeader<'_> {
        ContainerHeader {
            model_type: ModelType::ChatGlm2,
            config: &self.config,
            tokenizer: &self.tokenizer,
        }
    }
}

pub fn weights(entries: Vec<(&str, Tensor)>) -> HashMap<String, Tensor> {
    entries
        .into_iter()
        .map(|(name, tensor)| (name.to_string(), tensor))
        .collect()
}

/// Persist `bytes` and open them as a container. The file must outlive the reader.
pub fn open_container(bytes: &[u8]) -> (NamedTempFile, GgmlReader) {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(bytes).expect("write container");
    file.flush().expect("flush container");
    let reader = GgmlReader::open(file.path()).expect("open container");
    (file, reader)
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
