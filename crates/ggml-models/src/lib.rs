use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use chatglm_ggml::{GgmlType, ModelType, WeightEntry};
use serde_json::Value;

mod adapters;
mod prefix;

pub use adapters::{
    ChatGlm2Adapter, ChatGlm3Adapter, ChatGlm4Adapter, ChatGlm4VAdapter, ChatGlmAdapter,
};
pub use prefix::{PrefixCache, PAST_KEY_VALUES, PREFIX_ENCODER_WEIGHT};

/// Encodings requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Encoding of text matmul weights and embeddings.
    pub text: GgmlType,
    /// Encoding of vision tower matmul weights.
    pub vision: GgmlType,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            text: GgmlType::Q4_0,
            vision: GgmlType::F16,
        }
    }
}

/// Everything architecture specific about a conversion.
pub trait ModelAdapter: Sync {
    fn id(&self) -> &'static str;
    fn model_type(&self) -> ModelType;
    fn supports(&self, cfg: &Value) -> bool;
    /// File in the checkpoint directory whose bytes become the tokenizer blob.
    fn tokenizer_file(&self) -> &'static str;
    /// Serialized config block, starting with the version field.
    fn config_block(&self, cfg: &Value, opts: &ConvertOptions) -> Result<Vec<u8>>;
    /// Tensors to emit, in file order.
    fn catalog(&self, cfg: &Value, opts: &ConvertOptions) -> Result<Vec<WeightEntry>>;
    /// Shape of the prefix cache to synthesize, when the checkpoint carries one.
    fn prefix_cache(&self, _cfg: &Value) -> Result<Option<PrefixCache>> {
        Ok(None)
    }
    /// `(tied, source)` checkpoint tensors that must hold identical values
    /// whenever `tied` is present.
    fn tied_weights(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }
}

pub struct AdapterRegistry {
    adapters: &'static [&'static dyn ModelAdapter],
}

impl AdapterRegistry {
    pub const fn new(adapters: &'static [&'static dyn ModelAdapter]) -> Self {
        Self { adapters }
    }

    pub fn global() -> &'static Self {
        &REGISTRY
    }

    pub fn list(&self) -> &'static [&'static dyn ModelAdapter] {
        self.adapters
    }

    pub fn infer_adapter(&self, cfg: &Value) -> Result<&'static dyn ModelAdapter> {
        let matches: Vec<&'static dyn ModelAdapter> = self
            .adapters
            .iter()
            .copied()
            .filter(|adapter| adapter.supports(cfg))
            .collect();
        match matches.len() {
            1 => Ok(matches[0]),
            0 => bail!("no registered adapters support the provided config"),
            _ => {
                let ids = matches
                    .iter()
                    .map(|adapter| adapter.id())
                    .collect::<Vec<_>>()
                    .join(", ");
                bail!("multiple adapters match the provided config ({ids}); please pass --adapter to disambiguate");
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&'static dyn ModelAdapter> {
        self.adapters
            .iter()
            .copied()
            .find(|adapter| adapter.id() == id)
    }
}

/// Length-prefixed tokenizer blob.
pub fn tokenizer_block(bytes: &[u8]) -> Result<Vec<u8>> {
    let len = i32::try_from(bytes.len())
        .with_context(|| format!("tokenizer of {} bytes is too large", bytes.len()))?;
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.write_i32::<LittleEndian>(len)?;
    out.extend_from_slice(bytes);
    Ok(out)
}

/// Bit width of pre-quantized integer weights, if the checkpoint declares one.
pub fn quantization_bit(cfg: &Value) -> Option<u32> {
    cfg.as_object()
        .and_then(|root| adapters::helpers::get_optional_nonzero(root, "quantization_bit"))
        .and_then(|bits| u32::try_from(bits).ok())
}

use adapters::{
    ChatGlm2Adapter as Glm2, ChatGlm3Adapter as Glm3, ChatGlm4Adapter as Glm4,
    ChatGlm4VAdapter as Glm4V, ChatGlmAdapter as Glm,
};

static CHATGLM_ADAPTER: Glm = Glm;
static CHATGLM2_ADAPTER: Glm2 = Glm2;
static CHATGLM3_ADAPTER: Glm3 = Glm3;
static CHATGLM4_ADAPTER: Glm4 = Glm4;
static CHATGLM4V_ADAPTER: Glm4V = Glm4V;
static REGISTERED_ADAPTERS: [&'static dyn ModelAdapter; 5] = [
    &CHATGLM_ADAPTER,
    &CHATGLM2_ADAPTER,
    &CHATGLM3_ADAPTER,
    &CHATGLM4_ADAPTER,
    &CHATGLM4V_ADAPTER,
];
static REGISTRY: AdapterRegistry = AdapterRegistry::new(&REGISTERED_ADAPTERS);


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infers_each_architecture() {
        let registry = AdapterRegistry::global();
        let cases = [
            (test_configs::chatglm(), "chatglm"),
            (test_configs::chatglm2("THUDM/chatglm2-6b"), "chatglm2"),
            (test_configs::chatglm2("THUDM/chatglm3-6b"), "chatglm3"),
            (test_configs::chatglm4(), "chatglm4"),
            (test_configs::chatglm4v(), "chatglm4v"),
        ];
        for (cfg, id) in cases {
            let adapter = registry.infer_adapter(&cfg).expect("infer adapter");
            assert_eq!(adapter.id(), id);
        }
    }

    #[test]
    fn unnamed_sentencepiece_checkpoint_is_ambiguous() {
        let mut cfg = test_configs::chatglm2("");
        cfg.as_object_mut().unwrap().remove("_name_or_path");
        let Err(err) = AdapterRegistry::global().infer_adapter(&cfg) else {
            panic!("expected an ambiguous match");
        };
        let msg = err.to_string();
        assert!(msg.contains("chatglm2") && msg.contains("chatglm3"), "{msg}");
        assert!(msg.contains("--adapter"), "{msg}");
    }

    #[test]
    fn foreign_configs_are_rejected() {
        let cfg = json!({"model_type": "llama", "hidden_size": 8});
        assert!(AdapterRegistry::global().infer_adapter(&cfg).is_err());
    }

    #[test]
    fn registry_lookup_by_id() {
        let registry = AdapterRegistry::global();
        assert_eq!(registry.list().len(), 5);
        let adapter = registry.get("chatglm4v").expect("registered");
        assert_eq!(adapter.model_type(), ModelType::ChatGlm4V);
        assert!(registry.get("glm-5").is_none());
    }

    #[test]
    fn tokenizer_block_is_length_prefixed() {
        let block = tokenizer_block(b"abc").unwrap();
        assert_eq!(block, [3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(tokenizer_block(&[]).unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn quantization_bit_ignores_zero() {
        assert_eq!(quantization_bit(&test_configs::chatglm()), None);
        assert_eq!(quantization_bit(&json!({"quantization_bit": 4})), Some(4));
        assert_eq!(quantization_bit(&json!({})), None);
    }
}
