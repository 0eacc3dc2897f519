use anyhow::{ensure, Context, Result};
use chatglm_ggml::{GgmlType, ModelType, WeightEntry};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    adapters::helpers::{has_key, is_chatglm, parse, token_id, Catalog, ConfigBlock, TokenIds},
    ConvertOptions, ModelAdapter,
};

/// First generation ChatGLM-6B: 2-D rotary positions, LayerNorm with biases.
pub struct ChatGlmAdapter;

#[derive(Debug, Deserialize)]
struct ChatGlmConfig {
    vocab_size: usize,
    hidden_size: usize,
    num_attention_heads: usize,
    num_layers: usize,
    inner_hidden_size: usize,
    layernorm_epsilon: f32,
    max_sequence_length: usize,
    #[serde(default)]
    position_encoding_2d: bool,
    #[serde(default)]
    pre_seq_len: Option<usize>,
    #[serde(default)]
    eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pad_token_id: Option<TokenIds>,
}

impl ChatGlmConfig {
    fn load(cfg: &Value) -> Result<Self> {
        let config: Self = parse(cfg, "ChatGLM")?;
        ensure!(
            config.position_encoding_2d,
            "unsupported ChatGLM config: position_encoding_2d must be true"
        );
        let expected_inner = config
            .hidden_size
            .checked_mul(4)
            .context("unsupported ChatGLM config: hidden_size overflows")?;
        ensure!(
            config.inner_hidden_size == expected_inner,
            "unsupported ChatGLM config: inner_hidden_size {} must be 4 times hidden_size {}",
            config.inner_hidden_size,
            config.hidden_size
        );
        Ok(config)
    }
}

impl ModelAdapter for ChatGlmAdapter {
    fn id(&self) -> &'static str {
        "chatglm"
    }

    fn model_type(&self) -> ModelType {
        ModelType::ChatGlm
    }

    fn supports(&self, cfg: &Value) -> bool {
        is_chatglm(cfg) && !has_key(cfg, "multi_query_attention")
    }

    fn tokenizer_file(&self) -> &'static str {
        "ice_text.model"
    }

    fn tied_weights(&self) -> &'static [(&'static str, &'static str)] {
        &[("lm_head.weight", "transformer.word_embeddings.weight")]
    }

    fn config_block(&self, cfg: &Value, opts: &ConvertOptions) -> Result<Vec<u8>> {
        let config = ChatGlmConfig::load(cfg)?;
        let mut block = ConfigBlock::versioned()?;
        block
            .dtype(opts.text)?
            .usize(config.vocab_size, "vocab_size")?
            .usize(config.hidden_size, "hidden_size")?
            .usize(config.num_attention_heads, "num_attention_heads")?
            .usize(config.num_attention_heads, "num_attention_heads")?
            .usize(config.num_layers, "num_layers")?
            .usize(config.inner_hidden_size, "inner_hidden_size")?
            .f32(config.layernorm_epsilon)?
            .usize(config.pre_seq_len.unwrap_or(0), "pre_seq_len")?
            .f32(10000.0)?
            .usize(config.max_sequence_length, "max_sequence_length")?
            .i32(token_id(&config.eos_token_id, "eos_token_id")?)?
            .i32(token_id(&config.pad_token_id, "pad_token_id")?)?;
        Ok(block.into_bytes())
    }

    fn catalog(&self, cfg: &Value, opts: &ConvertOptions) -> Result<Vec<WeightEntry>> {
        let config = ChatGlmConfig::load(cfg)?;
        let text = opts.text;
        let dense = GgmlType::F32;
        let mut catalog = Catalog::default();
        catalog.push("transformer.word_embeddings.weight", text);
        for i in 0..config.num_layers {
            catalog.extend(
                &format!("transformer.layers.{i}"),
                &[
                    ("input_layernorm.weight", dense),
                    ("input_layernorm.bias", dense),
                    ("attention.query_key_value.weight", text),
                    ("attention.query_key_value.bias", dense),
                    ("attention.dense.weight", text),
                    ("attention.dense.bias", dense),
                    ("post_attention_layernorm.weight", dense),
                    ("post_attention_layernorm.bias", dense),
                    ("mlp.dense_h_to_4h.weight", text),
                    ("mlp.dense_h_to_4h.bias", dense),
                    ("mlp.dense_4h_to_h.weight", text),
                    ("mlp.dense_4h_to_h.bias", dense),
                ],
            );
        }
        catalog.extend(
            "transformer.final_layernorm",
            &[("weight", dense), ("bias", dense)],
        );
        Ok(catalog.into_entries())
    }
}
