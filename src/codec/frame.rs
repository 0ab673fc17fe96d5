//! Keyed multi-field frames
//!
//! Field layout: `[type:1][keylen:1][key][valuelen:4][value]`
//! Frame layout: `[count:1]{[size:4][field]}*`

use uuid::Uuid;

use super::{len_u32, CodecError, Cursor, FrameCodec, TypeTag, Value};

/// Default payload key
pub const DATA_KEY: &str = "d";
/// Pipeline-execution id key
pub const PIPELINE_ID_KEY: &str = "pid";
/// End-of-stream marker key
pub const LAST_KEY: &str = "last";

const MAX_FIELDS: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: String,
    pub value: Value,
}

/// Ordered set of fields with unique keys
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    fields: Vec<Field>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame carrying `value` under the default payload key
    pub fn from_data(value: impl Into<Value>) -> Self {
        Self::new().with_field(DATA_KEY, value)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Insert or replace a field, keeping the original position on replace
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|f| f.key == key) {
            Some(field) => field.value = value,
            None => self.fields.push(Field { key, value }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    pub fn data(&self) -> Option<&Value> {
        self.get(DATA_KEY)
    }

    pub fn pipeline_id(&self) -> Option<&str> {
        self.get(PIPELINE_ID_KEY).and_then(Value::as_str)
    }

    pub fn with_pipeline_id(self, id: impl Into<String>) -> Self {
        self.with_field(PIPELINE_ID_KEY, id.into())
    }

    /// Tag the frame with a fresh pipeline-execution id
    pub fn with_new_pipeline_id(self) -> Self {
        self.with_pipeline_id(Uuid::new_v4().to_string())
    }

    pub fn mark_last(&mut self) {
        self.set(LAST_KEY, Value::U8(1));
    }

    pub fn is_last(&self) -> bool {
        self.get(LAST_KEY)
            .and_then(Value::as_u64)
            .map(|v| v != 0)
            .unwrap_or(false)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FrameCodec {
    pub fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        if frame.fields.len() > MAX_FIELDS {
            return Err(CodecError::TooManyFields(frame.fields.len()));
        }

        let mut out = vec![frame.fields.len() as u8];
        for field in &frame.fields {
            let encoded = self.encode_field(field)?;
            out.extend_from_slice(&len_u32(encoded.len())?.to_le_bytes());
            out.extend_from_slice(&encoded);
        }
        Ok(out)
    }

    pub fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.u8()?;
        let mut frame = Frame::new();
        for _ in 0..count {
            let size = cursor.u32()? as usize;
            let field = self.decode_field(cursor.take(size)?)?;
            frame.fields.push(field);
        }
        if !cursor.is_done() {
            return Err(CodecError::Malformed(format!(
                "{} trailing bytes after {} fields",
                bytes.len() - cursor.pos,
                count
            )));
        }
        Ok(frame)
    }

    fn encode_field(&self, field: &Field) -> Result<Vec<u8>, CodecError> {
        let key = field.key.as_bytes();
        let key_len = u8::try_from(key.len()).map_err(|_| CodecError::KeyTooLong(field.key.clone()))?;
        let tag = field.value.tag();
        let value = self.encode(&field.value, Some(tag))?;

        let mut out = Vec::with_capacity(2 + key.len() + 4 + value.len());
        out.push(tag.id());
        out.push(key_len);
        out.extend_from_slice(key);
        out.extend_from_slice(&len_u32(value.len())?.to_le_bytes());
        out.extend_from_slice(&value);
        Ok(out)
    }

    fn decode_field(&self, bytes: &[u8]) -> Result<Field, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let id = cursor.u8()?;
        let tag = TypeTag::from_id(id).ok_or(CodecError::UnknownType(id))?;
        let key_len = cursor.u8()? as usize;
        let key = std::str::from_utf8(cursor.take(key_len)?)
            .map_err(|e| CodecError::Malformed(format!("field key is not UTF-8: {}", e)))?
            .to_string();
        let value_len = cursor.u32()? as usize;
        let value = self.decode(cursor.take(value_len)?, tag)?;
        Ok(Field { key, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_roundtrip() {
        let codec = FrameCodec::new();
        let mut frame = Frame::from_data(Value::List(vec![Value::U32(1), Value::from("x")]))
            .with_pipeline_id("exec-1")
            .with_field("meta", json!({"source": "camera"}));
        frame.mark_last();

        let bytes = codec.encode_frame(&frame).unwrap();
        assert_eq!(bytes[0], 4);
        let decoded = codec.decode_frame(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.pipeline_id(), Some("exec-1"));
        assert!(decoded.is_last());
    }

    #[test]
    fn test_field_layout() {
        let codec = FrameCodec::new();
        let frame = Frame::from_data(Value::U8(9));
        let bytes = codec.encode_frame(&frame).unwrap();
        // count, field size, tag, keylen, key, valuelen, value
        assert_eq!(bytes, vec![1, 8, 0, 0, 0, 1, 1, b'd', 1, 0, 0, 0, 9]);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut frame = Frame::from_data("a").with_field("x", Value::U8(1));
        frame.set(DATA_KEY, "b");
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.fields()[0].key, DATA_KEY);
        assert_eq!(frame.data().and_then(Value::as_str), Some("b"));
    }

    #[test]
    fn test_too_many_fields() {
        let codec = FrameCodec::new();
        let mut frame = Frame::new();
        for i in 0..256 {
            frame.set(format!("k{}", i), Value::U8(0));
        }
        assert!(matches!(
            codec.encode_frame(&frame),
            Err(CodecError::TooManyFields(256))
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let codec = FrameCodec::new();
        let bytes = codec.encode_frame(&Frame::from_data("hello")).unwrap();
        assert!(codec.decode_frame(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_new_pipeline_ids_are_unique() {
        let a = Frame::from_data("x").with_new_pipeline_id();
        let b = Frame::from_data("x").with_new_pipeline_id();
        assert_ne!(a.pipeline_id(), b.pipeline_id());
    }
}
