//! On-disk artifact framing (spec §6): `CZA1` header, Brotli-compressed
//! column-oriented row payload, CRC32C + referenceId trailer. Private to this agent
//! and its server, not a general-purpose columnar format (spec §9 design note).

use crate::classify::StreamClass;
use crate::error::{AgentError, Result};
use std::io::{Read, Write};
use uuid::Uuid;

pub const MAGIC: &[u8; 4] = b"CZA1";
pub const VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub ts_ms: i64,
    pub metric_name: String,
    pub node: String,
    pub value: String,
    pub labels: Vec<(String, String)>,
}

fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut out = 0u64;
    let mut shift = 0;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| AgentError::Protocol("truncated varint".to_string()))?;
        *pos += 1;
        out |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(AgentError::Protocol("varint too long".to_string()));
        }
    }
    Ok(out)
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_varint(buf, pos)? as usize;
    let end = *pos + len;
    let bytes = buf
        .get(*pos..end)
        .ok_or_else(|| AgentError::Protocol("truncated string".to_string()))?;
    *pos = end;
    String::from_utf8(bytes.to_vec()).map_err(|err| AgentError::Protocol(err.to_string()))
}

/// Column-oriented: every row's timestamp first, then every row's metric name, and so
/// on, rather than interleaved row-major records — the layout a columnar encoder
/// compresses best under Brotli.
fn encode_columns(rows: &[Row]) -> Vec<u8> {
    let mut buf = Vec::new();
    for row in rows {
        write_varint(&mut buf, row.ts_ms as u64);
    }
    for row in rows {
        write_string(&mut buf, &row.metric_name);
    }
    for row in rows {
        write_string(&mut buf, &row.node);
    }
    for row in rows {
        write_string(&mut buf, &row.value);
    }
    for row in rows {
        write_varint(&mut buf, row.labels.len() as u64);
        for (k, v) in &row.labels {
            write_string(&mut buf, k);
            write_string(&mut buf, v);
        }
    }
    buf
}

fn decode_columns(buf: &[u8], row_count: usize) -> Result<Vec<Row>> {
    let mut pos = 0usize;
    let mut ts = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        ts.push(read_varint(buf, &mut pos)? as i64);
    }
    let mut names = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        names.push(read_string(buf, &mut pos)?);
    }
    let mut nodes = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        nodes.push(read_string(buf, &mut pos)?);
    }
    let mut values = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        values.push(read_string(buf, &mut pos)?);
    }
    let mut labels_per_row = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let n = read_varint(buf, &mut pos)? as usize;
        let mut labels = Vec::with_capacity(n);
        for _ in 0..n {
            let k = read_string(buf, &mut pos)?;
            let v = read_string(buf, &mut pos)?;
            labels.push((k, v));
        }
        labels_per_row.push(labels);
    }

    Ok((0..row_count)
        .map(|i| Row {
            ts_ms: ts[i],
            metric_name: std::mem::take(&mut names[i]),
            node: std::mem::take(&mut nodes[i]),
            value: std::mem::take(&mut values[i]),
            labels: std::mem::take(&mut labels_per_row[i]),
        })
        .collect())
}

pub struct EncodedArtifact {
    pub bytes: Vec<u8>,
    pub uncompressed_size: u64,
    pub fingerprint: u64,
}

/// Build the full on-disk artifact body (header + compressed payload + trailer).
pub fn encode_artifact(class: StreamClass, rows: &[Row], reference_id: Uuid, compression_level: u8) -> Result<EncodedArtifact> {
    if rows.is_empty() {
        return Err(AgentError::Encode("refusing to encode a zero-row artifact".to_string()));
    }
    let columns = encode_columns(rows);
    let uncompressed_size = columns.len() as u64;

    let mut compressed = Vec::new();
    {
        let mut writer = brotli::CompressorWriter::new(&mut compressed, 4096, compression_level as u32, 22);
        writer
            .write_all(&columns)
            .map_err(|err| AgentError::Encode(err.to_string()))?;
        writer.flush().map_err(|err| AgentError::Encode(err.to_string()))?;
    }

    let mut header = Vec::new();
    header.extend_from_slice(MAGIC);
    header.push(VERSION);
    header.push(class_tag(class));
    write_varint(&mut header, rows.len() as u64);
    write_varint(&mut header, uncompressed_size);

    let mut body = header;
    body.extend_from_slice(&compressed);

    let crc = crc32c::crc32c(&body) as u64;
    let mut out = body;
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(reference_id.as_bytes());

    Ok(EncodedArtifact {
        bytes: out,
        uncompressed_size,
        fingerprint: crc,
    })
}

pub struct DecodedArtifact {
    pub class: StreamClass,
    pub rows: Vec<Row>,
    pub reference_id: Uuid,
}

/// Decode a full artifact file, verifying the CRC32C trailer before trusting the
/// payload — a half-written file is detected here rather than corrupting the rest of
/// the pipeline.
pub fn decode_artifact(data: &[u8]) -> Result<DecodedArtifact> {
    if data.len() < 4 + 1 + 1 + 8 + 16 {
        return Err(AgentError::Protocol("artifact shorter than minimum framing".to_string()));
    }
    if &data[0..4] != MAGIC {
        return Err(AgentError::Protocol("bad artifact magic".to_string()));
    }
    let version = data[4];
    if version != VERSION {
        return Err(AgentError::Protocol(format!("unsupported artifact version {version}")));
    }
    let class = class_from_tag(data[5])?;

    let trailer_start = data.len() - 24;
    let body = &data[..trailer_start];
    let crc_bytes: [u8; 8] = data[trailer_start..trailer_start + 8].try_into().unwrap();
    let expected_crc = u64::from_le_bytes(crc_bytes);
    let actual_crc = crc32c::crc32c(body) as u64;
    if actual_crc != expected_crc {
        return Err(AgentError::Protocol("artifact CRC32C mismatch".to_string()));
    }
    let reference_id = Uuid::from_slice(&data[trailer_start + 8..]).map_err(|err| AgentError::Protocol(err.to_string()))?;

    let mut pos = 6usize;
    let row_count = read_varint(body, &mut pos)? as usize;
    let uncompressed_size = read_varint(body, &mut pos)? as usize;
    let compressed = &body[pos..];

    let mut columns = Vec::with_capacity(uncompressed_size);
    let mut reader = brotli::Decompressor::new(compressed, 4096);
    reader
        .read_to_end(&mut columns)
        .map_err(|err| AgentError::Protocol(format!("brotli decompress: {err}")))?;

    let rows = decode_columns(&columns, row_count)?;

    Ok(DecodedArtifact { class, rows, reference_id })
}

fn class_tag(class: StreamClass) -> u8 {
    match class {
        StreamClass::Cost => 0,
        StreamClass::Observability => 1,
    }
}

fn class_from_tag(tag: u8) -> Result<StreamClass> {
    match tag {
        0 => Ok(StreamClass::Cost),
        1 => Ok(StreamClass::Observability),
        other => Err(AgentError::Protocol(format!("unknown stream class tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows() -> Vec<Row> {
        vec![
            Row {
                ts_ms: 1000,
                metric_name: "node_cpu_seconds_total".to_string(),
                node: "node-a".to_string(),
                value: "1.5".to_string(),
                labels: vec![("cpu".to_string(), "0".to_string())],
            },
            Row {
                ts_ms: 2000,
                metric_name: "node_cpu_seconds_total".to_string(),
                node: "node-a".to_string(),
                value: "2.5".to_string(),
                labels: vec![("cpu".to_string(), "1".to_string())],
            },
        ]
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let rows = sample_rows();
        let ref_id = Uuid::new_v4();
        let encoded = encode_artifact(StreamClass::Cost, &rows, ref_id, 5).unwrap();
        let decoded = decode_artifact(&encoded.bytes).unwrap();
        assert_eq!(decoded.class, StreamClass::Cost);
        assert_eq!(decoded.reference_id, ref_id);
        assert_eq!(decoded.rows, rows);
    }

    #[test]
    fn refuses_zero_row_artifact() {
        let ref_id = Uuid::new_v4();
        assert!(encode_artifact(StreamClass::Cost, &[], ref_id, 5).is_err());
    }

    #[test]
    fn corrupted_payload_is_rejected_by_crc() {
        let rows = sample_rows();
        let ref_id = Uuid::new_v4();
        let mut encoded = encode_artifact(StreamClass::Cost, &rows, ref_id, 5).unwrap();
        encoded.bytes[10] ^= 0xff;
        assert!(decode_artifact(&encoded.bytes).is_err());
    }
}
