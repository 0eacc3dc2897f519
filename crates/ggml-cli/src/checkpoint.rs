use std::{
    borrow::Cow,
    collections::HashMap,
    fs::{self, File},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use chatglm_ggml::Tensor;
use chatglm_ggml_writer::{WeightProvider, WriterError};
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{tensor::Metadata, Dtype as SafeDType, SafeTensors};
use tracing::debug;

struct Shard {
    path: PathBuf,
    mmap: Mmap,
    /// Offset of the byte buffer that `data_offsets` are relative to.
    data_start: usize,
    metadata: Metadata,
}

/// Memory-mapped safetensors shards of one checkpoint directory.
pub struct Checkpoint {
    shards: Vec<Shard>,
    index: HashMap<String, usize>,
    extras: HashMap<String, Tensor>,
}

impl Checkpoint {
    /// Map every `*.safetensors` file in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("failed to list checkpoint directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "safetensors") {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            bail!("no .safetensors shards found in {}", dir.display());
        }
        paths.sort();
        Self::from_shards(&paths)
    }

    pub fn from_shards(paths: &[PathBuf]) -> Result<Self> {
        let mut shards = Vec::with_capacity(paths.len());
        let mut index = HashMap::new();
        for path in paths {
            let file =
                File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
            let mmap = unsafe { MmapOptions::new().map(&file) }
                .with_context(|| format!("failed to mmap {}", path.display()))?;
            let (header_len, metadata) = SafeTensors::read_metadata(&mmap)
                .with_context(|| format!("failed to parse safetensors {}", path.display()))?;
            let shard_idx = shards.len();
            for name in metadata.tensors().into_keys() {
                if let Some(prev) = index.insert(name.clone(), shard_idx) {
                    bail!(
                        "tensor `{name}` appears in both {} and {}",
                        paths[prev].display(),
                        path.display()
                    );
                }
            }
            debug!(shard = %path.display(), tensors = index.len(), "mapped shard");
            shards.push(Shard {
                path: path.clone(),
                mmap,
                data_start: 8 + header_len,
                metadata,
            });
        }
        Ok(Self {
            shards,
            index,
            extras: HashMap::new(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.extras.contains_key(name) || self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.index.len() + self.extras.len()
    }

    /// Names stored in the shards, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.index.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Register a tensor that does not exist in the shards. It shadows any
    /// stored tensor of the same name.
    pub fn insert_extra(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.extras.insert(name.into(), tensor);
    }

    /// Decode `name` to a [`Tensor`]. Two-dimensional `I8` tensors with a
    /// `<name>_scale` companion come back grouped.
    pub fn load(&self, name: &str) -> Result<Option<Tensor>> {
        let Some((dtype, shape, data)) = self.raw(name)? else {
            return Ok(None);
        };
        let scale_name = format!("{name}_scale");
        if dtype == SafeDType::I8 && shape.len() == 2 && self.index.contains_key(&scale_name) {
            let scale = self
                .load(&scale_name)?
                .with_context(|| format!("tensor `{scale_name}` vanished"))?;
            let scale = scale
                .as_f32()
                .with_context(|| format!("tensor `{scale_name}` must be a float tensor"))?
                .to_vec();
            let values = data.iter().map(|&b| b as i8).collect();
            return Ok(Some(Tensor::grouped(shape, values, scale)?));
        }
        let values = bytes_to_f32(dtype, data)
            .with_context(|| format!("failed to decode tensor `{name}`"))?;
        Ok(Some(Tensor::from_f32(shape, values)?))
    }

    fn raw(&self, name: &str) -> Result<Option<(SafeDType, Vec<usize>, &[u8])>> {
        let Some(&shard_idx) = self.index.get(name) else {
            return Ok(None);
        };
        let shard = &self.shards[shard_idx];
        let info = shard
            .metadata
            .info(name)
            .with_context(|| format!("tensor `{name}` missing from {}", shard.path.display()))?;
        let (begin, end) = info.data_offsets;
        let data = shard
            .mmap
            .get(shard.data_start + begin..shard.data_start + end)
            .with_context(|| {
                format!(
                    "tensor `{name}` data [{begin}, {end}) exceeds {}",
                    shard.path.display()
                )
            })?;
        Ok(Some((info.dtype, info.shape.clone(), data)))
    }
}

impl WeightProvider for Checkpoint {
    fn weight(&self, name: &str) -> chatglm_ggml_writer::Result<Option<Cow<'_, Tensor>>> {
        if let Some(tensor) = self.extras.get(name) {
            return Ok(Some(Cow::Borrowed(tensor)));
        }
        self.load(name)
            .map(|tensor| tensor.map(Cow::Owned))
            .map_err(|err| WriterError::Provider {
                name: name.to_string(),
                reason: format!("{err:#}"),
            })
    }
}

fn bytes_to_f32(dtype: SafeDType, data: &[u8]) -> Result<Vec<f32>> {
    let values: Vec<f32> = match dtype {
        SafeDType::F32 => data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("chunk len 4")))
            .collect(),
        SafeDType::F16 => data
            .chunks_exact(2)
            .map(|chunk| {
                let bits = u16::from_le_bytes(chunk.try_into().expect("chunk len 2"));
                f16::from_bits(bits).to_f32()
            })
            .collect(),
        SafeDType::BF16 => data
            .chunks_exact(2)
            .map(|chunk| {
                let bits = u16::from_le_bytes(chunk.try_into().expect("chunk len 2"));
                bf16::from_bits(bits).to_f32()
            })
            .collect(),
        SafeDType::F64 => data
            .chunks_exact(8)
            .map(|chunk| f64::from_le_bytes(chunk.try_into().expect("chunk len 8")) as f32)
            .collect(),
        other => bail!("tensor dtype {other:?} is not supported for conversion"),
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::{serialize, TensorView};
    use tempfile::TempDir;

    fn write_shard(dir: &Path, file: &str, tensors: &[(&str, SafeDType, Vec<usize>, Vec<u8>)]) {
        let views: Vec<(String, TensorView<'_>)> = tensors
            .iter()
            .map(|(name, dtype, shape, data)| {
                (
                    name.to_string(),
                    TensorView::new(*dtype, shape.clone(), data).expect("valid view"),
                )
            })
            .collect();
        let bytes = serialize(views, &None).expect("serialize shard");
        fs::write(dir.join(file), bytes).expect("write shard");
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn indexes_tensors_across_shards() {
        let dir = TempDir::new().unwrap();
        write_shard(
            dir.path(),
            "model-00001-of-00002.safetensors",
            &[("a", SafeDType::F32, vec![2], f32_bytes(&[1.0, -2.0]))],
        );
        let half_bytes: Vec<u8> = [0.5f32, 4.0]
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_bits().to_le_bytes())
            .collect();
        write_shard(
            dir.path(),
            "model-00002-of-00002.safetensors",
            &[("b", SafeDType::F16, vec![1, 2], half_bytes)],
        );
        fs::write(dir.path().join("config.json"), "{}").unwrap();

        let ckpt = Checkpoint::open(dir.path()).unwrap();
        assert_eq!(ckpt.len(), 2);
        let a = ckpt.load("a").unwrap().unwrap();
        assert_eq!(a.as_f32().unwrap(), &[1.0, -2.0]);
        let b = ckpt.load("b").unwrap().unwrap();
        assert_eq!(b.shape(), &[1, 2]);
        assert_eq!(b.as_f32().unwrap(), &[0.5, 4.0]);
        assert!(ckpt.load("c").unwrap().is_none());
    }

    #[test]
    fn int8_with_scale_loads_grouped() {
        let dir = TempDir::new().unwrap();
        write_shard(
            dir.path(),
            "model.safetensors",
            &[
                ("w", SafeDType::I8, vec![2, 2], vec![1, 0xFF, 2, 3]),
                ("w_scale", SafeDType::F32, vec![2], f32_bytes(&[0.5, 2.0])),
                ("ids", SafeDType::I8, vec![2, 2], vec![0; 4]),
            ],
        );
        let ckpt = Checkpoint::open(dir.path()).unwrap();
        let w = ckpt.load("w").unwrap().unwrap();
        assert!(w.is_grouped());
        match w.data() {
            chatglm_ggml::TensorData::Grouped { values, scale } => {
                assert_eq!(values, &[1, -1, 2, 3]);
                assert_eq!(scale, &[0.5, 2.0]);
            }
            other => panic!("unexpected data {other:?}"),
        }
        // I8 without a scale companion cannot be converted
        assert!(ckpt.load("ids").is_err());
    }

    #[test]
    fn extras_shadow_shards_through_provider() {
        let dir = TempDir::new().unwrap();
        write_shard(
            dir.path(),
            "model.safetensors",
            &[("a", SafeDType::F32, vec![1], f32_bytes(&[1.0]))],
        );
        let mut ckpt = Checkpoint::open(dir.path()).unwrap();
        ckpt.insert_extra("past_key_values", Tensor::from_f32(vec![1], vec![7.0]).unwrap());
        assert!(ckpt.contains("past_key_values"));
        let extra = ckpt.weight("past_key_values").unwrap().unwrap();
        assert!(matches!(extra, Cow::Borrowed(_)));
        assert_eq!(extra.as_f32().unwrap(), &[7.0]);
        assert!(ckpt.weight("missing").unwrap().is_none());
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = Checkpoint::open(dir.path()).err().unwrap();
        assert!(err.to_string().contains("no .safetensors"), "{err}");
    }
}
