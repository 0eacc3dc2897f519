use anyhow::{Context, Result};
use chatglm_ggml::{GgmlType, ModelType, WeightEntry};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    adapters::{
        chatglm2::Glm2Config,
        helpers::{has_key, is_chatglm, parse, root_object, Catalog},
    },
    ConvertOptions, ModelAdapter,
};

/// GLM-4V: the GLM-4 decoder behind an EVA-style vision tower.
pub struct ChatGlm4VAdapter;

#[derive(Debug, Deserialize)]
struct VisionConfig {
    hidden_size: usize,
    image_size: usize,
    in_channels: usize,
    intermediate_size: usize,
    layer_norm_eps: f32,
    num_heads: usize,
    num_hidden_layers: usize,
    num_positions: usize,
    patch_size: usize,
    scaling_factor: f32,
}

impl VisionConfig {
    fn load(cfg: &Value) -> Result<Self> {
        let vision = root_object(cfg)?
            .get("vision_config")
            .context("vision_config missing from GLM-4V configuration")?;
        parse(vision, "vision")
    }

    fn push_tower(&self, catalog: &mut Catalog, vision: GgmlType) {
        let dense = GgmlType::F32;
        let half = GgmlType::F16;
        catalog.extend(
            "transformer.vision.patch_embedding",
            &[
                ("cls_embedding", half),
                ("proj.weight", half),
                ("proj.bias", dense),
                ("position_embedding.weight", dense),
            ],
        );
        for i in 0..self.num_hidden_layers {
            catalog.extend(
                &format!("transformer.vision.transformer.layers.{i}"),
                &[
                    ("input_layernorm.weight", dense),
                    ("input_layernorm.bias", dense),
                    ("attention.query_key_value.weight", vision),
                    ("attention.query_key_value.bias", dense),
                    ("attention.dense.weight", vision),
                    ("attention.dense.bias", dense),
                    ("mlp.fc1.weight", vision),
                    ("mlp.fc1.bias", dense),
                    ("mlp.fc2.weight", vision),
                    ("mlp.fc2.bias", dense),
                    ("post_attention_layernorm.weight", dense),
                    ("post_attention_layernorm.bias", dense),
                ],
            );
        }
        catalog.extend(
            "transformer.vision",
            &[
                ("conv.weight", half),
                ("conv.bias", dense),
                ("linear_proj.linear_proj.weight", vision),
                ("linear_proj.norm1.weight", dense),
                ("linear_proj.norm1.bias", dense),
                ("linear_proj.gate_proj.weight", vision),
                ("linear_proj.dense_h_to_4h.weight", vision),
                ("linear_proj.dense_4h_to_h.weight", vision),
                ("boi", half),
                ("eoi", half),
            ],
        );
    }
}

impl ModelAdapter for ChatGlm4VAdapter {
    fn id(&self) -> &'static str {
        "chatglm4v"
    }

    fn model_type(&self) -> ModelType {
        ModelType::ChatGlm4V
    }

    fn supports(&self, cfg: &Value) -> bool {
        is_chatglm(cfg) && has_key(cfg, "multi_query_attention") && has_key(cfg, "vision_config")
    }

    fn tokenizer_file(&self) -> &'static str {
        "tokenizer.model"
    }

    fn config_block(&self, cfg: &Value, opts: &ConvertOptions) -> Result<Vec<u8>> {
        let text = Glm2Config::load(cfg)?;
        let vision = VisionConfig::load(cfg)?;
        let mut block = text.config_block(opts)?;
        block
            .dtype(opts.vision)?
            .usize(vision.hidden_size, "vision_config.hidden_size")?
            .usize(vision.image_size, "vision_config.image_size")?
            .usize(vision.in_channels, "vision_config.in_channels")?
            .usize(vision.intermediate_size, "vision_config.intermediate_size")?
            .f32(vision.layer_norm_eps)?
            .usize(vision.num_heads, "vision_config.num_heads")?
            .usize(vision.num_hidden_layers, "vision_config.num_hidden_layers")?
            .usize(vision.num_positions, "vision_config.num_positions")?
            .usize(vision.patch_size, "vision_config.patch_size")?
            .f32(vision.scaling_factor)?;
        Ok(block.into_bytes())
    }

    fn catalog(&self, cfg: &Value, opts: &ConvertOptions) -> Result<Vec<WeightEntry>> {
        let text = Glm2Config::load(cfg)?;
        let vision = VisionConfig::load(cfg)?;
        let mut catalog = Catalog::default();
        vision.push_tower(&mut catalog, opts.vision);
        text.push_text(&mut catalog, opts.text);
        Ok(catalog.into_entries())
    }
}
