//! Byte-buffer wire generation.
//!
//! A frame is a 4-byte big-endian length prefix followed by a JSON body.
//! Uses LengthDelimitedCodec for framing + serde_json for the body, so it
//! works over any AsyncRead/AsyncWrite as well as on plain buffers.

use bytes::{Bytes, BytesMut};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::CodecError;
use crate::value::Value;

/// Frames above this size are logged at info level.
const LARGE_FRAME_BYTES: usize = 100_000;

/// JSON has no spelling for NaN or the infinities.
fn fits_json(value: &Value) -> bool {
    match value {
        Value::Invalid => false,
        Value::Float64(n) => n.is_finite(),
        _ => true,
    }
}

/// Serializes a value for a JSON body, omitting children JSON cannot carry.
struct JsonBody<'a>(&'a Value);

impl Serialize for JsonBody<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(None)?;
                for item in items.iter().filter(|v| fits_json(v)) {
                    seq.serialize_element(&JsonBody(item))?;
                }
                seq.end()
            }
            Value::Dict(entries) => {
                let mut map = serializer.serialize_map(None)?;
                for (key, value) in entries.iter().filter(|(_, v)| fits_json(v)) {
                    map.serialize_entry(key, &JsonBody(value))?;
                }
                map.end()
            }
            scalar => scalar.serialize(serializer),
        }
    }
}

/// Encode a value as an unframed JSON body.
pub fn encode_bytes(value: &Value) -> Result<Bytes, CodecError> {
    match value {
        Value::Invalid => return Err(CodecError::InvalidTopLevel),
        Value::Float64(n) if !n.is_finite() => return Err(CodecError::NonFiniteFloat(*n)),
        _ => {}
    }
    Ok(Bytes::from(serde_json::to_vec(&JsonBody(value))?))
}

/// Decode an unframed JSON body.
pub fn decode_bytes(bytes: &[u8]) -> Result<Value, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::NonUtf8String)?;
    Ok(serde_json::from_str(text)?)
}

/// Codec that frames values with a length prefix and a JSON body.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(body) => decode_bytes(&body).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Value> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode_bytes(&item)?;
        let body_len = body.len();
        tracing::trace!(json_size_bytes = body_len, "Encoding frame");
        if body_len > LARGE_FRAME_BYTES {
            tracing::info!(
                json_size_bytes = body_len,
                json_size_kb = body_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(body, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn sample() -> Value {
        Value::dict([
            ("a", Value::Int64(1)),
            (
                "b",
                Value::List(vec![Value::Bool(true), Value::Nil, Value::Float64(3.14)]),
            ),
        ])
    }

    #[test]
    fn body_is_plain_json() {
        let body = encode_bytes(&sample()).unwrap();
        insta::assert_snapshot!(std::str::from_utf8(&body).unwrap(), @r#"{"a":1,"b":[true,null,3.14]}"#);
    }

    #[test]
    fn bytes_roundtrip_keeps_number_kinds() {
        let value = Value::List(vec![
            Value::Int64(3),
            Value::Float64(3.0),
            Value::Float64(-2.5),
            Value::Int64(i64::MAX),
            Value::Str("\u{1F980} \"quoted\"".into()),
        ]);
        let body = encode_bytes(&value).unwrap();
        assert_eq!(decode_bytes(&body).unwrap(), value);
    }

    #[test]
    fn duplicate_keys_survive() {
        let value = Value::dict([
            ("k", Value::Int64(1)),
            ("j", Value::Nil),
            ("k", Value::Int64(2)),
        ]);
        let body = encode_bytes(&value).unwrap();
        assert_eq!(decode_bytes(&body).unwrap(), value);
    }

    #[test]
    fn unrepresentable_children_are_omitted() {
        let value = Value::List(vec![
            Value::Int64(1),
            Value::Invalid,
            Value::Float64(f64::NAN),
            Value::dict([("inf", Value::Float64(f64::INFINITY)), ("ok", Value::Bool(false))]),
        ]);
        let body = encode_bytes(&value).unwrap();
        assert_eq!(
            decode_bytes(&body).unwrap(),
            Value::List(vec![Value::Int64(1), Value::dict([("ok", Value::Bool(false))])])
        );
    }

    #[test]
    fn top_level_unrepresentable_fails() {
        assert!(matches!(
            encode_bytes(&Value::Invalid),
            Err(CodecError::InvalidTopLevel)
        ));
        assert!(matches!(
            encode_bytes(&Value::Float64(f64::NEG_INFINITY)),
            Err(CodecError::NonFiniteFloat(n)) if n == f64::NEG_INFINITY
        ));
    }

    #[test]
    fn non_utf8_body_is_reported() {
        assert!(matches!(
            decode_bytes(b"\"\xff\""),
            Err(CodecError::NonUtf8String)
        ));
    }

    #[test]
    fn codec_roundtrip_on_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(sample(), &mut buf).unwrap();
        codec.encode(Value::Nil, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(sample()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Value::Nil));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec.encode(Value::Str("partial".into()), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Value::Str("partial".into()))
        );
    }

    #[tokio::test]
    async fn framed_stream_preserves_order() {
        let (writer, reader) = tokio::io::duplex(64);
        let mut sink = FramedWrite::new(writer, FrameCodec::new());
        let mut stream = FramedRead::new(reader, FrameCodec::new());

        let send = tokio::spawn(async move {
            for i in 0..20 {
                sink.send(Value::Int64(i)).await.unwrap();
            }
        });

        for i in 0..20 {
            let value = stream.next().await.unwrap().unwrap();
            assert_eq!(value, Value::Int64(i));
        }
        send.await.unwrap();
        assert!(stream.next().await.is_none());
    }
}
