use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use chatglm_ggml::{GgmlType, WeightEntry, CONFIG_VERSION};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};

pub(crate) fn root_object(value: &Value) -> Result<&Map<String, Value>> {
    value
        .as_object()
        .context("config JSON must contain a top-level object")
}

pub(crate) fn get_optional_usize(map: &Map<String, Value>, key: &str) -> Option<usize> {
    map.get(key).and_then(value_to_usize)
}

pub(crate) fn get_optional_nonzero(map: &Map<String, Value>, key: &str) -> Option<usize> {
    get_optional_usize(map, key).and_then(|value| if value == 0 { None } else { Some(value) })
}

pub(crate) fn value_to_usize(value: &Value) -> Option<usize> {
    match value {
        Value::Number(num) => num.as_u64().map(|v| v as usize).or_else(|| {
            num.as_i64()
                .and_then(|v| if v >= 0 { Some(v as usize) } else { None })
        }),
        Value::String(s) => s.parse::<usize>().ok(),
        _ => None,
    }
}

pub(crate) fn is_chatglm(cfg: &Value) -> bool {
    cfg.as_object()
        .and_then(|root| root.get("model_type"))
        .and_then(Value::as_str)
        .map(|ty| ty.eq_ignore_ascii_case("chatglm"))
        .unwrap_or(false)
}

pub(crate) fn has_key(cfg: &Value, key: &str) -> bool {
    cfg.as_object()
        .and_then(|root| root.get(key))
        .is_some_and(|value| !value.is_null())
}

/// Lower-cased `_name_or_path`, when the checkpoint recorded one.
pub(crate) fn name_hint(cfg: &Value) -> Option<String> {
    cfg.as_object()
        .and_then(|root| root.get("_name_or_path"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_ascii_lowercase)
}

pub(crate) fn parse<T: DeserializeOwned>(cfg: &Value, what: &str) -> Result<T> {
    T::deserialize(cfg).with_context(|| format!("failed to parse {what} config"))
}

pub(crate) fn to_i32(value: usize, field: &str) -> Result<i32> {
    i32::try_from(value).with_context(|| format!("`{field}` = {value} does not fit in i32"))
}

/// Token id fields hold either one id or a list; the first id wins.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum TokenIds {
    One(i64),
    Many(Vec<i64>),
}

pub(crate) fn token_id(ids: &Option<TokenIds>, field: &str) -> Result<i32> {
    let id = match ids {
        None => return Ok(-1),
        Some(TokenIds::One(id)) => *id,
        Some(TokenIds::Many(ids)) => match ids.first() {
            Some(id) => *id,
            None => return Ok(-1),
        },
    };
    i32::try_from(id).with_context(|| format!("`{field}` = {id} does not fit in i32"))
}

/// Little-endian packer for config blocks.
#[derive(Debug, Default)]
pub(crate) struct ConfigBlock {
    buf: Vec<u8>,
}

impl ConfigBlock {
    pub(crate) fn versioned() -> Result<Self> {
        let mut block = Self::default();
        block.i32(CONFIG_VERSION)?;
        Ok(block)
    }

    pub(crate) fn i32(&mut self, value: i32) -> Result<&mut Self> {
        self.buf.write_i32::<LittleEndian>(value)?;
        Ok(self)
    }

    pub(crate) fn usize(&mut self, value: usize, field: &str) -> Result<&mut Self> {
        self.i32(to_i32(value, field)?)
    }

    pub(crate) fn f32(&mut self, value: f32) -> Result<&mut Self> {
        self.buf.write_f32::<LittleEndian>(value)?;
        Ok(self)
    }

    pub(crate) fn dtype(&mut self, dtype: GgmlType) -> Result<&mut Self> {
        self.i32(dtype.as_i32())
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Catalog builder keeping entries in push order.
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    entries: Vec<WeightEntry>,
}

impl Catalog {
    pub(crate) fn push(&mut self, name: impl Into<String>, dtype: GgmlType) {
        self.entries.push(WeightEntry::new(name, dtype));
    }

    /// Push `{prefix}.{suffix}` for each pair.
    pub(crate) fn extend(&mut self, prefix: &str, items: &[(&str, GgmlType)]) {
        for &(suffix, dtype) in items {
            self.push(format!("{prefix}.{suffix}"), dtype);
        }
    }

    pub(crate) fn into_entries(self) -> Vec<WeightEntry> {
        self.entries
    }
}
