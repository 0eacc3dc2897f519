use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{bail, ensure, Context, Result};
use chatglm_ggml::Tensor;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::checkpoint::Checkpoint;

const ADAPTER_CONFIG: &str = "adapter_config.json";
const ADAPTER_WEIGHTS: &str = "adapter_model.safetensors";
const PEFT_PREFIX: &str = "base_model.model.";
const LORA_A_SUFFIX: &str = ".lora_A.weight";
const LORA_B_SUFFIX: &str = ".lora_B.weight";

/// Subset of a PEFT `adapter_config.json` needed to merge.
#[derive(Debug, Clone, Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub lora_alpha: f32,
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub use_rslora: bool,
}

impl LoraConfig {
    pub fn scale(&self) -> f32 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f32).sqrt()
        } else {
            self.lora_alpha / self.r as f32
        }
    }

    fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|target| {
            module == target
                || module
                    .strip_suffix(target.as_str())
                    .is_some_and(|head| head.ends_with('.'))
        })
    }
}

/// A PEFT LoRA adapter directory.
pub struct LoraAdapter {
    pub config: LoraConfig,
    weights: Checkpoint,
}

impl LoraAdapter {
    pub fn open(dir: &Path) -> Result<Self> {
        let config_path = dir.join(ADAPTER_CONFIG);
        let raw = fs::read(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: LoraConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;
        ensure!(config.r > 0, "{} has rank r = 0", config_path.display());
        let weights = Checkpoint::from_shards(&[dir.join(ADAPTER_WEIGHTS)])?;
        Ok(Self { config, weights })
    }

    /// Targeted module paths that carry both `lora_A` and `lora_B`, sorted.
    pub fn modules(&self) -> Result<Vec<String>> {
        let mut pairs: BTreeMap<String, (bool, bool)> = BTreeMap::new();
        for name in self.weights.names() {
            let Some(path) = name.strip_prefix(PEFT_PREFIX) else {
                continue;
            };
            if let Some(module) = path.strip_suffix(LORA_A_SUFFIX) {
                pairs.entry(module.to_string()).or_default().0 = true;
            } else if let Some(module) = path.strip_suffix(LORA_B_SUFFIX) {
                pairs.entry(module.to_string()).or_default().1 = true;
            }
        }
        let mut modules = Vec::with_capacity(pairs.len());
        for (module, (a, b)) in pairs {
            ensure!(a && b, "adapter module `{module}` lacks lora_A or lora_B");
            if self.config.targets(&module) {
                modules.push(module);
            } else {
                warn!(module = %module, "skipping adapter module outside target_modules");
            }
        }
        Ok(modules)
    }

    /// Merge every targeted module into `base`, returning `<module>.weight`
    /// tensors holding `W + scale * B @ A`.
    pub fn merge(&self, base: &Checkpoint) -> Result<Vec<(String, Tensor)>> {
        let scale = self.config.scale();
        let mut merged = Vec::new();
        for module in self.modules()? {
            let name = format!("{module}.weight");
            let weight = base
                .load(&name)?
                .with_context(|| format!("checkpoint has no `{name}` to merge the adapter into"))?;
            let a = self.factor(&module, LORA_A_SUFFIX)?;
            let b = self.factor(&module, LORA_B_SUFFIX)?;
            let tensor = merge_weight(&name, &weight, &a, &b, scale, self.config.fan_in_fan_out)?;
            debug!(tensor = %name, scale, "merged LoRA delta");
            merged.push((name, tensor));
        }
        Ok(merged)
    }

    fn factor(&self, module: &str, suffix: &str) -> Result<Tensor> {
        let name = format!("{PEFT_PREFIX}{module}{suffix}");
        self.weights
            .load(&name)?
            .with_context(|| format!("adapter tensor `{name}` vanished"))
    }
}

/// `weight + scale * (b @ a)`, with the delta transposed for fan-in/fan-out
/// layouts. `a` is `[r, in]`, `b` is `[out, r]`.
fn merge_weight(
    name: &str,
    weight: &Tensor,
    a: &Tensor,
    b: &Tensor,
    scale: f32,
    fan_in_fan_out: bool,
) -> Result<Tensor> {
    let (Some(w), Some(a_vals), Some(b_vals)) = (weight.as_f32(), a.as_f32(), b.as_f32()) else {
        bail!("`{name}`: LoRA merge needs dense float weights");
    };
    let (&[rank, cols], &[rows, b_rank]) = (a.shape(), b.shape()) else {
        bail!(
            "`{name}`: LoRA factors must be 2-D, got {:?} and {:?}",
            a.shape(),
            b.shape()
        );
    };
    ensure!(
        rank == b_rank && rank > 0 && rows > 0 && cols > 0,
        "`{name}`: LoRA factors {:?} and {:?} do not share a nonzero rank",
        a.shape(),
        b.shape()
    );
    let expected = if fan_in_fan_out {
        [cols, rows]
    } else {
        [rows, cols]
    };
    ensure!(
        weight.shape() == &expected[..],
        "`{name}`: weight shape {:?} does not match LoRA delta {expected:?}",
        weight.shape()
    );

    let mut out = w.to_vec();
    out.par_chunks_mut(expected[1])
        .enumerate()
        .for_each(|(i, row)| {
            for (j, value) in row.iter_mut().enumerate() {
                let (r, c) = if fan_in_fan_out { (j, i) } else { (i, j) };
                let delta: f32 = (0..rank)
                    .map(|k| b_vals[r * rank + k] * a_vals[k * cols + c])
                    .sum();
                *value += scale * delta;
            }
        });
    Ok(Tensor::from_f32(expected.to_vec(), out)?)
}
