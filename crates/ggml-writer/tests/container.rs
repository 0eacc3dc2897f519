mod common;

use chatglm_ggml::{GgmlType, ModelType, Tensor, WeightEntry};
use chatglm_ggml_writer::{
    decode_payload, write_container, ContainerWriter, WriteOptions, WriterError,
};
use common::test_utils::{dense, max_abs_diff, open_container, wave, weights, HeaderBytes};

#[test]
fn every_encoding_reads_back_within_tolerance() {
    let cases = [
        ("dense.f32", GgmlType::F32, 0.0),
        ("dense.f16", GgmlType::F16, 1e-3),
        ("proj.q8_0", GgmlType::Q8_0, 0.01),
        ("proj.q4_0", GgmlType::Q4_0, 0.13),
        ("proj.q4_1", GgmlType::Q4_1, 0.075),
        ("proj.q5_0", GgmlType::Q5_0, 0.065),
        ("proj.q5_1", GgmlType::Q5_1, 0.04),
    ];
    let shape = [3, 64];
    let source = weights(
        cases
            .iter()
            .enumerate()
            .map(|(i, (name, _, _))| (*name, dense(&shape, i as f32)))
            .collect(),
    );
    let catalog: Vec<WeightEntry> = cases
        .iter()
        .map(|(name, dtype, _)| WeightEntry::new(*name, *dtype))
        .collect();
    let header = HeaderBytes::new(b"tokenizer-bytes");
    let options = WriteOptions {
        quantization_bit: None,
        chunk_size: 4,
    };
    let (bytes, summaries) =
        write_container(Vec::new(), &header.header(), &catalog, &source, &options).unwrap();
    assert_eq!(summaries.len(), cases.len());

    let (_file, reader) = open_container(&bytes);
    assert_eq!(reader.model_type(), ModelType::ChatGlm2);
    assert_eq!(reader.tokenizer_bytes(), b"tokenizer-bytes");
    assert_eq!(reader.records().len(), cases.len());
    for ((record, summary), (name, dtype, tolerance)) in
        reader.records().iter().zip(&summaries).zip(&cases)
    {
        assert_eq!(record.name, *name);
        assert_eq!(record.dtype, *dtype);
        assert_eq!(record.shape, shape.to_vec());
        assert_eq!(record.offset, summary.offset);
        assert_eq!(record.len, summary.len);
        let decoded = decode_payload(*dtype, reader.tensor_bytes(record).unwrap()).unwrap();
        let original = source[*name].as_f32().unwrap();
        let err = max_abs_diff(&decoded, original);
        assert!(err <= *tolerance, "{name}: max error {err} > {tolerance}");
    }
}

#[test]
fn grouped_checkpoints_are_dequantized() {
    let rows = 2;
    let eight: Vec<i8> = (0..rows * 32).map(|i| (i as i8).wrapping_mul(3)).collect();
    let four: Vec<i8> = (0..rows * 16).map(|i| (i as u8).wrapping_mul(37) as i8).collect();
    let scale = vec![0.5, 0.25];
    let source = weights(vec![
        ("w8", Tensor::grouped(vec![rows, 32], eight.clone(), scale.clone()).unwrap()),
        ("w4", Tensor::grouped(vec![rows, 16], four.clone(), scale.clone()).unwrap()),
    ]);
    let header = HeaderBytes::new(b"");

    let catalog = [WeightEntry::new("w8", GgmlType::F32)];
    let options = WriteOptions {
        quantization_bit: Some(8),
        chunk_size: 1,
    };
    let (bytes, _) =
        write_container(Vec::new(), &header.header(), &catalog, &source, &options).unwrap();
    let (_file, reader) = open_container(&bytes);
    let record = &reader.records()[0];
    assert_eq!(record.shape, vec![rows, 32]);
    let decoded = decode_payload(GgmlType::F32, reader.tensor_bytes(record).unwrap()).unwrap();
    for (i, value) in decoded.iter().enumerate() {
        assert_eq!(*value, f32::from(eight[i]) * scale[i / 32]);
    }

    let catalog = [WeightEntry::new("w4", GgmlType::F32)];
    let options = WriteOptions {
        quantization_bit: Some(4),
        chunk_size: 1,
    };
    let (bytes, _) =
        write_container(Vec::new(), &header.header(), &catalog, &source, &options).unwrap();
    let (_file, reader) = open_container(&bytes);
    let record = &reader.records()[0];
    assert_eq!(record.shape, vec![rows, 32]);
    let decoded = decode_payload(GgmlType::F32, reader.tensor_bytes(record).unwrap()).unwrap();
    for (i, byte) in four.iter().enumerate() {
        let s = scale[i / 16];
        assert_eq!(decoded[2 * i], f32::from(byte >> 4) * s);
        assert_eq!(decoded[2 * i + 1], f32::from((byte << 4) >> 4) * s);
    }
}

#[test]
fn grouped_weights_need_a_supported_bit_width() {
    let source = weights(vec![(
        "w",
        Tensor::grouped(vec![1, 32], vec![1; 32], vec![1.0]).unwrap(),
    )]);
    let header = HeaderBytes::new(b"");
    let catalog = [WeightEntry::new("w", GgmlType::Q8_0)];
    let err = write_container(
        Vec::new(),
        &header.header(),
        &catalog,
        &source,
        &WriteOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        WriterError::UnsupportedBitWidth { bits: None, .. }
    ));
}

#[test]
fn missing_weight_stops_after_earlier_records() {
    let source = weights(vec![
        ("first", dense(&[32], 0.0)),
        ("third", dense(&[32], 1.0)),
    ]);
    let catalog = [
        WeightEntry::new("first", GgmlType::F32),
        WeightEntry::new("second", GgmlType::F32),
        WeightEntry::new("third", GgmlType::F32),
    ];
    let header = HeaderBytes::new(b"tok");
    let options = WriteOptions {
        quantization_bit: None,
        chunk_size: 3,
    };
    let mut writer = ContainerWriter::new(Vec::new());
    writer.write_header(&header.header()).unwrap();
    let mut seen = Vec::new();
    let err = writer
        .write_weights(&catalog, &source, &options, |summary| {
            seen.push(summary.name.clone())
        })
        .unwrap_err();
    assert!(matches!(err, WriterError::MissingWeight(ref name) if name == "second"));
    assert_eq!(seen, ["first"]);

    let bytes = writer.finish().unwrap();
    let (_file, reader) = open_container(&bytes);
    let names: Vec<_> = reader.records().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["first"]);
}

#[test]
fn records_follow_catalog_order_regardless_of_chunking() {
    let names: Vec<String> = (0..11).map(|i| format!("t{i}")).collect();
    let source = weights(
        names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), dense(&[2, 32], i as f32)))
            .collect(),
    );
    let catalog: Vec<WeightEntry> = names
        .iter()
        .rev()
        .map(|name| WeightEntry::new(name.clone(), GgmlType::Q4_1))
        .collect();
    let header = HeaderBytes::new(b"");
    let mut outputs = Vec::new();
    for chunk_size in [1, 3, 32] {
        let options = WriteOptions {
            quantization_bit: None,
            chunk_size,
        };
        let (bytes, summaries) =
            write_container(Vec::new(), &header.header(), &catalog, &source, &options).unwrap();
        let order: Vec<_> = summaries.iter().map(|s| s.name.clone()).collect();
        let expected: Vec<_> = catalog.iter().map(|e| e.name.clone()).collect();
        assert_eq!(order, expected);
        outputs.push(bytes);
    }
    assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn dense_payloads_match_source_bits() {
    let values = wave(32, 0.5);
    let source = weights(vec![(
        "norm",
        Tensor::from_f32(vec![32], values.clone()).unwrap(),
    )]);
    let header = HeaderBytes::new(b"");
    let catalog = [WeightEntry::new("norm", GgmlType::F32)];
    let (bytes, summaries) = write_container(
        Vec::new(),
        &header.header(),
        &catalog,
        &source,
        &WriteOptions::default(),
    )
    .unwrap();
    let start = summaries[0].offset as usize;
    let expected: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    assert_eq!(&bytes[start..start + 128], &expected[..]);
    assert_eq!(bytes.len(), start + 128);
}
