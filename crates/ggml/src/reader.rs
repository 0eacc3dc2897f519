use std::{
    collections::HashMap,
    fs::File,
    io::{Cursor, Read},
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;

use crate::{align_offset, GgmlError, GgmlType, ModelType, Result, GGML_MAGIC};

/// Record describing one tensor stored in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgmlRecord {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: GgmlType,
    pub offset: u64,
    pub len: u64,
}

impl GgmlRecord {
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Reader that mmaps a container and exposes zero-copy payload slices.
#[derive(Debug)]
pub struct GgmlReader {
    path: PathBuf,
    data: Arc<Mmap>,
    model_type: ModelType,
    config: Range<usize>,
    tokenizer: Range<usize>,
    records: Vec<GgmlRecord>,
    index: HashMap<String, usize>,
}

impl GgmlReader {
    /// Open a container from disk, validating the prelude and every record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_mmap(path, Arc::new(mmap))
    }

    fn from_mmap(path: PathBuf, data: Arc<Mmap>) -> Result<Self> {
        let ParsedIndex {
            model_type,
            config,
            tokenizer,
            records,
        } = parse_index(&data)?;
        let mut index = HashMap::new();
        for (idx, record) in records.iter().enumerate() {
            if index.insert(record.name.clone(), idx).is_some() {
                return Err(GgmlError::Validation(format!(
                    "duplicate tensor record `{}`",
                    record.name
                )));
            }
        }
        Ok(Self {
            path,
            data,
            model_type,
            config,
            tokenizer,
            records,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    /// Raw config block, including its leading version field.
    pub fn config_bytes(&self) -> &[u8] {
        &self.data[self.config.clone()]
    }

    /// Tokenizer payload without its length prefix.
    pub fn tokenizer_bytes(&self) -> &[u8] {
        &self.data[self.tokenizer.clone()]
    }

    /// All tensor records in file order.
    pub fn records(&self) -> &[GgmlRecord] {
        &self.records
    }

    pub fn tensor(&self, name: &str) -> Option<&GgmlRecord> {
        self.index.get(name).map(|&idx| &self.records[idx])
    }

    pub fn tensor_bytes(&self, record: &GgmlRecord) -> Result<&[u8]> {
        let start = usize::try_from(record.offset).map_err(|_| {
            GgmlError::Validation(format!(
                "offset {} does not fit in platform usize",
                record.offset
            ))
        })?;
        let len = usize::try_from(record.len).map_err(|_| {
            GgmlError::Validation(format!(
                "length {} does not fit in platform usize",
                record.len
            ))
        })?;
        let end = start.checked_add(len).ok_or_else(|| {
            GgmlError::Validation(format!(
                "slice {}+{} overflows usize",
                record.offset, record.len
            ))
        })?;
        self.data.get(start..end).ok_or_else(|| {
            GgmlError::Validation(format!(
                "slice [{start}, {end}) exceeds file size {}",
                self.data.len()
            ))
        })
    }

    pub fn tensor_bytes_by_name(&self, name: &str) -> Result<Option<&[u8]>> {
        match self.tensor(name) {
            Some(record) => self.tensor_bytes(record).map(Some),
            None => Ok(None),
        }
    }
}

struct ParsedIndex {
    model_type: ModelType,
    config: Range<usize>,
    tokenizer: Range<usize>,
    records: Vec<GgmlRecord>,
}

fn parse_index(bytes: &[u8]) -> Result<ParsedIndex> {
    let mut cursor = Cursor::new(bytes);
    let mut magic = [0u8; GGML_MAGIC.len()];
    cursor.read_exact(&mut magic)?;
    if &magic != GGML_MAGIC {
        return Err(GgmlError::InvalidMagic { found: magic });
    }
    let model_type = ModelType::try_from(cursor.read_i32::<LittleEndian>()?)?;

    let config_start = position(&cursor)?;
    let config = config_start..config_start + model_type.config_block_len();
    if config.end > bytes.len() {
        return Err(GgmlError::Format(format!(
            "config block for {model_type} truncated"
        )));
    }
    cursor.set_position(config.end as u64);

    let tokenizer_len = read_len(&mut cursor, "tokenizer")?;
    let tokenizer_start = position(&cursor)?;
    let tokenizer = tokenizer_start..tokenizer_start + tokenizer_len;
    if tokenizer.end > bytes.len() {
        return Err(GgmlError::Format("tokenizer block truncated".into()));
    }
    cursor.set_position(tokenizer.end as u64);

    let mut records = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        let record = parse_record(&mut cursor, bytes.len())?;
        cursor.set_position(record.offset + record.len);
        records.push(record);
    }
    Ok(ParsedIndex {
        model_type,
        config,
        tokenizer,
        records,
    })
}

fn parse_record(cursor: &mut Cursor<&[u8]>, total_len: usize) -> Result<GgmlRecord> {
    let name_len = read_len(cursor, "tensor name")?;
    let mut name_buf = vec![0u8; name_len];
    cursor
        .read_exact(&mut name_buf)
        .map_err(|err| GgmlError::Format(format!("truncated tensor name: {err}")))?;
    let name = String::from_utf8(name_buf)?;
    let ndim = read_len(cursor, "ndim")?;
    let mut shape = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        shape.push(read_len(cursor, "dimension")?);
    }
    let dtype = GgmlType::try_from(cursor.read_i32::<LittleEndian>()?)?;
    let len = dtype.payload_len(&shape).ok_or_else(|| {
        GgmlError::Validation(format!(
            "tensor `{name}` shape {shape:?} is not encodable as {dtype}"
        ))
    })?;
    let offset = align_offset(cursor.position());
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| GgmlError::Validation(format!("tensor `{name}` length overflows")))?;
    if end > total_len as u64 {
        return Err(GgmlError::Validation(format!(
            "tensor `{name}` payload [{offset}, {end}) exceeds file size {total_len}"
        )));
    }
    Ok(GgmlRecord {
        name,
        shape,
        dtype,
        offset,
        len: len as u64,
    })
}

fn read_len(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<usize> {
    let value = cursor.read_i32::<LittleEndian>()?;
    usize::try_from(value)
        .map_err(|_| GgmlError::Format(format!("negative {what} length {value}")))
}

fn position(cursor: &Cursor<&[u8]>) -> Result<usize> {
    usize::try_from(cursor.position())
        .map_err(|_| GgmlError::Format("offset exceeds addressable range".into()))
}
