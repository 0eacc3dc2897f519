use anyhow::{bail, ensure, Result};
use chatglm_ggml::{GgmlType, ModelType, WeightEntry};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    adapters::helpers::{
        get_optional_usize, has_key, is_chatglm, name_hint, parse, root_object, token_id,
        Catalog, ConfigBlock, TokenIds,
    },
    prefix::{PrefixCache, PAST_KEY_VALUES},
    ConvertOptions, ModelAdapter,
};

/// Padded vocabulary of the tiktoken based GLM-4 tokenizer.
const GLM4_PADDED_VOCAB: usize = 151_552;

/// Config shared by ChatGLM2, ChatGLM3 and GLM-4.
#[derive(Debug, Deserialize)]
pub(crate) struct Glm2Config {
    padded_vocab_size: usize,
    hidden_size: usize,
    num_attention_heads: usize,
    multi_query_group_num: usize,
    kv_channels: usize,
    pub(crate) num_layers: usize,
    ffn_hidden_size: usize,
    layernorm_epsilon: f32,
    seq_length: usize,
    #[serde(default = "default_rope_ratio")]
    rope_ratio: f64,
    #[serde(default)]
    pre_seq_len: Option<usize>,
    #[serde(default)]
    prefix_projection: bool,
    #[serde(default)]
    eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pad_token_id: Option<TokenIds>,
    #[serde(default)]
    add_bias_linear: bool,
    #[serde(default)]
    add_qkv_bias: bool,
    #[serde(default)]
    apply_residual_connection_post_layernorm: bool,
    #[serde(default)]
    multi_query_attention: bool,
    #[serde(default)]
    original_rope: bool,
    #[serde(default)]
    post_layer_norm: bool,
    #[serde(default)]
    rmsnorm: bool,
}

fn default_rope_ratio() -> f64 {
    1.0
}

impl Glm2Config {
    pub(crate) fn load(cfg: &Value) -> Result<Self> {
        let config: Self = parse(cfg, "ChatGLM2")?;
        ensure!(!config.add_bias_linear, "unsupported config: add_bias_linear must be false");
        ensure!(config.add_qkv_bias, "unsupported config: add_qkv_bias must be true");
        ensure!(
            !config.apply_residual_connection_post_layernorm,
            "unsupported config: apply_residual_connection_post_layernorm must be false"
        );
        ensure!(
            config.kv_channels.checked_mul(config.num_attention_heads)
                == Some(config.hidden_size),
            "unsupported config: kv_channels {} x num_attention_heads {} != hidden_size {}",
            config.kv_channels,
            config.num_attention_heads,
            config.hidden_size
        );
        ensure!(
            config.multi_query_attention,
            "unsupported config: multi_query_attention must be true"
        );
        ensure!(config.original_rope, "unsupported config: original_rope must be true");
        ensure!(config.post_layer_norm, "unsupported config: post_layer_norm must be true");
        ensure!(config.rmsnorm, "unsupported config: rmsnorm must be true");
        Ok(config)
    }

    fn pre_seq_len(&self) -> usize {
        self.pre_seq_len.unwrap_or(0)
    }

    pub(crate) fn config_block(&self, opts: &ConvertOptions) -> Result<ConfigBlock> {
        let mut block = ConfigBlock::versioned()?;
        block
            .dtype(opts.text)?
            .usize(self.padded_vocab_size, "padded_vocab_size")?
            .usize(self.hidden_size, "hidden_size")?
            .usize(self.num_attention_heads, "num_attention_heads")?
            .usize(self.multi_query_group_num, "multi_query_group_num")?
            .usize(self.num_layers, "num_layers")?
            .usize(self.ffn_hidden_size, "ffn_hidden_size")?
            .f32(self.layernorm_epsilon)?
            .usize(self.pre_seq_len(), "pre_seq_len")?
            .f32((10000.0 * self.rope_ratio) as f32)?
            .usize(self.seq_length, "seq_length")?
            .i32(token_id(&self.eos_token_id, "eos_token_id")?)?
            .i32(token_id(&self.pad_token_id, "pad_token_id")?)?;
        Ok(block)
    }

    pub(crate) fn prefix_cache(&self) -> Result<Option<PrefixCache>> {
        if self.pre_seq_len() == 0 {
            return Ok(None);
        }
        if self.prefix_projection {
            bail!("prefix encoders with prefix_projection are not supported");
        }
        Ok(Some(PrefixCache {
            pre_seq_len: self.pre_seq_len(),
            num_layers: self.num_layers,
            num_kv_heads: self.multi_query_group_num,
            head_size: self.kv_channels,
        }))
    }

    /// Embedding, decoder layers, final norm and output projection.
    pub(crate) fn push_text(&self, catalog: &mut Catalog, text: GgmlType) {
        let dense = GgmlType::F32;
        catalog.push("transformer.embedding.word_embeddings.weight", text);
        for i in 0..self.num_layers {
            catalog.extend(
                &format!("transformer.encoder.layers.{i}"),
                &[
                    ("input_layernorm.weight", dense),
                    ("self_attention.query_key_value.weight", text),
                    ("self_attention.query_key_value.bias", dense),
                    ("self_attention.dense.weight", text),
                    ("post_attention_layernorm.weight", dense),
                    ("mlp.dense_h_to_4h.weight", text),
                    ("mlp.dense_4h_to_h.weight", text),
                ],
            );
        }
        catalog.push("transformer.encoder.final_layernorm.weight", dense);
        catalog.push("transformer.output_layer.weight", text);
    }

    fn catalog(&self, opts: &ConvertOptions) -> Result<Vec<WeightEntry>> {
        let mut catalog = Catalog::default();
        if self.prefix_cache()?.is_some() {
            catalog.push(PAST_KEY_VALUES, GgmlType::F16);
        }
        self.push_text(&mut catalog, opts.text);
        Ok(catalog.into_entries())
    }
}

/// Multi-query GLM architecture without a vision tower.
pub(crate) fn is_text_glm2(cfg: &Value) -> bool {
    is_chatglm(cfg) && has_key(cfg, "multi_query_attention") && !has_key(cfg, "vision_config")
}

fn padded_vocab(cfg: &Value) -> Option<usize> {
    root_object(cfg)
        .ok()
        .and_then(|root| get_optional_usize(root, "padded_vocab_size"))
}

fn hint_excludes(cfg: &Value, other: &str) -> bool {
    name_hint(cfg).map_or(true, |name| !name.contains(other))
}

fn is_sentencepiece_glm(cfg: &Value) -> bool {
    is_text_glm2(cfg) && padded_vocab(cfg).is_some_and(|vocab| vocab < GLM4_PADDED_VOCAB)
}

macro_rules! glm2_family_adapter {
    ($name:ident, $id:literal, $model_type:expr, $tokenizer:literal, $supports:expr) => {
        pub struct $name;

        impl ModelAdapter for $name {
            fn id(&self) -> &'static str {
                $id
            }

            fn model_type(&self) -> ModelType {
                $model_type
            }

            fn supports(&self, cfg: &Value) -> bool {
                let supports: fn(&Value) -> bool = $supports;
                supports(cfg)
            }

            fn tokenizer_file(&self) -> &'static str {
                $tokenizer
            }

            fn config_block(&self, cfg: &Value, opts: &ConvertOptions) -> Result<Vec<u8>> {
                Ok(Glm2Config::load(cfg)?.config_block(opts)?.into_bytes())
            }

            fn catalog(&self, cfg: &Value, opts: &ConvertOptions) -> Result<Vec<WeightEntry>> {
                Glm2Config::load(cfg)?.catalog(opts)
            }

            fn prefix_cache(&self, cfg: &Value) -> Result<Option<PrefixCache>> {
                Glm2Config::load(cfg)?.prefix_cache()
            }
        }
    };
}

glm2_family_adapter!(
    ChatGlm2Adapter,
    "chatglm2",
    ModelType::ChatGlm2,
    "tokenizer.model",
    |cfg| is_sentencepiece_glm(cfg) && hint_excludes(cfg, "chatglm3")
);
glm2_family_adapter!(
    ChatGlm3Adapter,
    "chatglm3",
    ModelType::ChatGlm3,
    "tokenizer.model",
    |cfg| is_sentencepiece_glm(cfg) && hint_excludes(cfg, "chatglm2")
);
glm2_family_adapter!(
    ChatGlm4Adapter,
    "chatglm4",
    ModelType::ChatGlm4,
    "tokenizer.model",
    |cfg| is_text_glm2(cfg) && padded_vocab(cfg).is_some_and(|vocab| vocab >= GLM4_PADDED_VOCAB)
);
