//! Binary serialization of [`JobRecord`]s.
//!
//! A single MessagePack encoding is used for every read/write so that
//! records written by any conforming producer stay byte-interoperable
//! across implementations and languages. Writes always
//! use the text-keyed encoding; reads try text-keyed first and fall back to
//! a byte-keyed decode, tolerating records written by older or foreign
//! producers that packed map keys as raw bytes.

use bytes::Bytes;

use crate::error::{MlqError, Result};
use crate::job::JobRecord;

/// Encodes a job record as text-keyed MessagePack.
pub fn encode(record: &JobRecord) -> Result<Bytes> {
    let buf = rmp_serde::to_vec_named(record)
        .map_err(|e| MlqError::Decode { key: format!("encode error: {e}") })?;
    Ok(Bytes::from(buf))
}

/// Decodes a job record, trying text-keyed mode first and falling back to
/// byte-keyed mode on failure. `key` is used only to build a diagnostic
/// error if both attempts fail.
pub fn decode(bytes: &[u8], key: &str) -> Result<JobRecord> {
    if let Ok(record) = decode_text(bytes) {
        return Ok(record);
    }
    decode_bytes_fallback(bytes).map_err(|_| MlqError::Decode { key: key.to_string() })
}

/// Decodes assuming the map was packed with string keys (the encoding this
/// crate always writes).
pub fn decode_text(bytes: &[u8]) -> Result<JobRecord> {
    rmp_serde::from_slice(bytes).map_err(|e| MlqError::Decode { key: e.to_string() })
}

/// Decodes a legacy byte-keyed map (msgpack packed with `raw=True`
/// semantics) by walking a generic [`rmpv::Value`] and reading fields by
/// byte-string key instead of relying on serde's string-keyed map
/// deserialization.
pub fn decode_bytes_fallback(bytes: &[u8]) -> Result<JobRecord> {
    let value: rmpv::Value =
        rmpv::decode::read_value(&mut &bytes[..]).map_err(|e| MlqError::Decode { key: e.to_string() })?;

    let map = value
        .as_map()
        .ok_or_else(|| MlqError::Decode { key: "not a map".into() })?;

    let get = |name: &str| -> Option<&rmpv::Value> {
        map.iter().find_map(|(k, v)| {
            let matches = match k {
                rmpv::Value::String(s) => s.as_str() == Some(name),
                rmpv::Value::Binary(b) => b.as_slice() == name.as_bytes(),
                _ => false,
            };
            matches.then_some(v)
        })
    };

    let as_string = |v: &rmpv::Value| -> Option<String> {
        match v {
            rmpv::Value::String(s) => s.as_str().map(|s| s.to_string()),
            rmpv::Value::Binary(b) => Some(String::from_utf8_lossy(b).into_owned()),
            rmpv::Value::Nil => None,
            _ => None,
        }
    };

    let as_f64 = |v: &rmpv::Value| -> Option<f64> { v.as_f64() };
    let as_i64 = |v: &rmpv::Value| -> Option<i64> { v.as_i64() };
    let as_u64 = |v: &rmpv::Value| -> Option<u64> { v.as_u64() };
    let as_json = |v: &rmpv::Value| -> Option<serde_json::Value> {
        if matches!(v, rmpv::Value::Nil) {
            None
        } else {
            rmpv::ext::from_value(v.clone()).ok()
        }
    };

    let id = get("id")
        .and_then(as_string)
        .ok_or_else(|| MlqError::Decode { key: "missing id".into() })?;
    let timestamp = get("timestamp").and_then(as_f64).unwrap_or(0.0);
    let worker = get("worker").and_then(as_string);
    let processing_started = get("processing_started").and_then(as_f64);
    let processing_finished = get("processing_finished").and_then(as_f64);
    let progress = get("progress").and_then(as_i64);
    let short_result = get("short_result").and_then(as_string);
    let result = get("result").and_then(as_json);
    let callback = get("callback").and_then(as_string);
    let retries = get("retries").and_then(as_u64).unwrap_or(0);
    let functions = get("functions").and_then(|v| match v {
        rmpv::Value::Array(items) => Some(items.iter().filter_map(as_string).collect()),
        _ => None,
    });
    let msg = get("msg").and_then(as_json).unwrap_or(serde_json::Value::Null);

    Ok(JobRecord {
        id,
        timestamp,
        worker,
        processing_started,
        processing_finished,
        progress,
        short_result,
        result,
        callback,
        retries,
        functions,
        msg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JobRecord {
        JobRecord {
            id: "42".into(),
            timestamp: 1_700_000_000.5,
            worker: Some("worker-a".into()),
            processing_started: Some(1_700_000_001.0),
            processing_finished: None,
            progress: Some(50),
            short_result: None,
            result: None,
            callback: Some("http://example.com/hook".into()),
            retries: 2,
            functions: Some(vec!["a".into(), "b".into()]),
            msg: serde_json::json!({"hello": "world"}),
        }
    }

    #[test]
    fn round_trips_text_mode() {
        let record = sample();
        let bytes = encode(&record).unwrap();
        let decoded = decode(&bytes, "k").unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn falls_back_to_byte_keys() {
        // Build a byte-keyed map by hand, simulating a foreign producer.
        use rmpv::Value;
        let entries = vec![
            (Value::Binary(b"id".to_vec()), Value::String("7".into())),
            (Value::Binary(b"timestamp".to_vec()), Value::F64(1.0)),
            (Value::Binary(b"worker".to_vec()), Value::Nil),
            (Value::Binary(b"processing_started".to_vec()), Value::Nil),
            (Value::Binary(b"processing_finished".to_vec()), Value::Nil),
            (Value::Binary(b"progress".to_vec()), Value::Nil),
            (Value::Binary(b"short_result".to_vec()), Value::Nil),
            (Value::Binary(b"result".to_vec()), Value::Nil),
            (Value::Binary(b"callback".to_vec()), Value::Nil),
            (Value::Binary(b"retries".to_vec()), Value::from(0u64)),
            (Value::Binary(b"functions".to_vec()), Value::Nil),
            (Value::Binary(b"msg".to_vec()), Value::String("hi".into())),
        ];
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::Map(entries)).unwrap();

        let decoded = decode(&buf, "k").unwrap();
        assert_eq!(decoded.id, "7");
        assert_eq!(decoded.msg, serde_json::Value::String("hi".into()));
    }

    #[test]
    fn corrupt_record_is_rejected() {
        let err = decode(b"not msgpack at all \xff\xff", "mlq_default_progress_9");
        assert!(matches!(err, Err(MlqError::Decode { .. })));
    }
}
