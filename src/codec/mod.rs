//! Self-describing binary codec for queue frames
//!
//! Every value crossing a ring queue is encoded as a tagged byte array:
//! - built-in tags cover fixed-width integers, UTF-8 strings, JSON, lists,
//!   tuples and raw bytes
//! - tags in the custom range resolve through a [`TypeRegistry`] of
//!   pluggable handlers
//! - a [`Frame`] is an ordered set of keyed fields encoded with its own
//!   length-prefixed layout

mod frame;
mod registry;

pub use frame::{Field, Frame, DATA_KEY, LAST_KEY, PIPELINE_ID_KEY};
pub use registry::{
    JsonHandler, NdArrayHandler, TypeHandler, TypeRegistry, CUSTOM_TYPE_MAX, CUSTOM_TYPE_MIN,
};

use std::sync::Arc;

use thiserror::Error;

/// Errors raised while encoding or decoding values
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown type tag: {0}")]
    UnknownType(u8),

    #[error("Type id {0} is already registered")]
    TypeAlreadyRegistered(u8),

    #[error("Custom type registry is full ({min}..={max})", min = CUSTOM_TYPE_MIN, max = CUSTOM_TYPE_MAX)]
    RegistryFull,

    #[error(
        "Type id {0} is outside the custom range {min}..={max}",
        min = CUSTOM_TYPE_MIN,
        max = CUSTOM_TYPE_MAX
    )]
    InvalidTypeId(u8),

    #[error("Cannot encode {value} as {tag:?}")]
    TypeMismatch { value: &'static str, tag: TypeTag },

    #[error("Malformed encoding: {0}")]
    Malformed(String),

    #[error("Frame has {0} fields, at most 255 are allowed")]
    TooManyFields(usize),

    #[error("Field key '{0}' is longer than 255 bytes")]
    KeyTooLong(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type tag written in front of every encoded value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    U8,
    U16,
    U32,
    U64,
    /// Signed 64-bit, two's complement little-endian
    I64,
    Str,
    Json,
    List,
    Tuple,
    Bytes,
    /// Handler-defined type from the custom id range
    Custom(u8),
}

impl TypeTag {
    /// Wire id of this tag
    pub fn id(self) -> u8 {
        match self {
            TypeTag::U8 => 1,
            TypeTag::U16 => 2,
            TypeTag::U32 => 3,
            TypeTag::U64 => 4,
            TypeTag::Str => 5,
            TypeTag::Json => 6,
            TypeTag::List => 7,
            TypeTag::Tuple => 8,
            TypeTag::Bytes => 9,
            TypeTag::I64 => 10,
            TypeTag::Custom(id) => id,
        }
    }

    /// Resolve a wire id. Ids in the custom range map to `Custom` whether or
    /// not a handler is registered for them.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(TypeTag::U8),
            2 => Some(TypeTag::U16),
            3 => Some(TypeTag::U32),
            4 => Some(TypeTag::U64),
            5 => Some(TypeTag::Str),
            6 => Some(TypeTag::Json),
            7 => Some(TypeTag::List),
            8 => Some(TypeTag::Tuple),
            9 => Some(TypeTag::Bytes),
            10 => Some(TypeTag::I64),
            CUSTOM_TYPE_MIN..=CUSTOM_TYPE_MAX => Some(TypeTag::Custom(id)),
            _ => None,
        }
    }
}

/// Value carried by a custom handler
#[derive(Debug, Clone, PartialEq)]
pub struct CustomValue {
    pub type_id: u8,
    pub body: serde_json::Value,
}

/// A value that can travel through a ring queue
///
/// Unsigned integers take the narrowest tag given by their variant; any
/// negative integer travels as [`Value::I64`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I64(i64),
    Str(String),
    Json(serde_json::Value),
    List(Vec<Value>),
    Tuple(Vec<serde_json::Value>),
    Bytes(Vec<u8>),
    Custom(CustomValue),
}

impl Value {
    /// Tag inferred for this value when the caller does not supply one
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::U8(_) => TypeTag::U8,
            Value::U16(_) => TypeTag::U16,
            Value::U32(_) => TypeTag::U32,
            Value::U64(_) => TypeTag::U64,
            Value::I64(_) => TypeTag::I64,
            Value::Str(_) => TypeTag::Str,
            Value::Json(_) => TypeTag::Json,
            Value::List(_) => TypeTag::List,
            Value::Tuple(_) => TypeTag::Tuple,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::Custom(c) => TypeTag::Custom(c.type_id),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::U8(_) | Value::U16(_) | Value::U32(_) | Value::U64(_) | Value::I64(_) => {
                "integer"
            }
            Value::Str(_) => "string",
            Value::Json(_) => "json",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Bytes(_) => "bytes",
            Value::Custom(_) => "custom value",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U8(v) => Some(v as u64),
            Value::U16(v) => Some(v as u64),
            Value::U32(v) => Some(v as u64),
            Value::U64(v) => Some(v),
            Value::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I64(v) => Some(v),
            _ => self.as_u64().and_then(|v| i64::try_from(v).ok()),
        }
    }

    /// JSON view used when a value is coerced to the JSON tag
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::U8(v) => J::from(*v),
            Value::U16(v) => J::from(*v),
            Value::U32(v) => J::from(*v),
            Value::U64(v) => J::from(*v),
            Value::I64(v) => J::from(*v),
            Value::Str(s) => J::from(s.as_str()),
            Value::Json(j) => j.clone(),
            Value::List(items) => J::Array(items.iter().map(Value::to_json).collect()),
            Value::Tuple(items) => J::Array(items.clone()),
            Value::Bytes(b) => J::Array(b.iter().map(|x| J::from(*x)).collect()),
            Value::Custom(c) => c.body.clone(),
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::U8(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::U16(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I64(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// Encoder/decoder bound to one type registry
///
/// The registry is an explicit object so that tests, stages and queues can
/// share or isolate handler tables as needed.
#[derive(Clone, Default)]
pub struct FrameCodec {
    registry: Arc<TypeRegistry>,
}

impl FrameCodec {
    /// Codec with an empty custom registry
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Encode a value, inferring its tag when `tag` is `None`
    pub fn encode(&self, value: &Value, tag: Option<TypeTag>) -> Result<Vec<u8>, CodecError> {
        let tag = tag.unwrap_or_else(|| value.tag());
        let mismatch = || CodecError::TypeMismatch {
            value: value.kind(),
            tag,
        };

        match tag {
            TypeTag::U8 => {
                let v = value.as_u64().ok_or_else(mismatch)?;
                let v = u8::try_from(v).map_err(|_| mismatch())?;
                Ok(vec![v])
            }
            TypeTag::U16 => {
                let v = value.as_u64().ok_or_else(mismatch)?;
                let v = u16::try_from(v).map_err(|_| mismatch())?;
                Ok(v.to_le_bytes().to_vec())
            }
            TypeTag::U32 => {
                let v = value.as_u64().ok_or_else(mismatch)?;
                let v = u32::try_from(v).map_err(|_| mismatch())?;
                Ok(v.to_le_bytes().to_vec())
            }
            TypeTag::U64 => {
                let v = value.as_u64().ok_or_else(mismatch)?;
                Ok(v.to_le_bytes().to_vec())
            }
            TypeTag::I64 => {
                let v = value.as_i64().ok_or_else(mismatch)?;
                Ok(v.to_le_bytes().to_vec())
            }
            TypeTag::Str => match value {
                Value::Str(s) => Ok(s.as_bytes().to_vec()),
                _ => Err(mismatch()),
            },
            TypeTag::Json => Ok(serde_json::to_vec(&value.to_json())?),
            TypeTag::List => match value {
                Value::List(items) => self.encode_list(items),
                _ => Err(mismatch()),
            },
            TypeTag::Tuple => match value {
                Value::Tuple(items) => Ok(serde_json::to_vec(items)?),
                Value::Json(serde_json::Value::Array(items)) => Ok(serde_json::to_vec(items)?),
                _ => Err(mismatch()),
            },
            TypeTag::Bytes => match value {
                Value::Bytes(b) => Ok(b.clone()),
                _ => Err(mismatch()),
            },
            TypeTag::Custom(id) => {
                let handler = self.registry.get(id).ok_or(CodecError::UnknownType(id))?;
                match value {
                    Value::Custom(c) if c.type_id == id => handler.encode(&c.body),
                    Value::Custom(_) => Err(mismatch()),
                    other => handler.encode(&other.to_json()),
                }
            }
        }
    }

    /// Decode bytes produced by [`FrameCodec::encode`] with the same tag
    pub fn decode(&self, bytes: &[u8], tag: TypeTag) -> Result<Value, CodecError> {
        match tag {
            TypeTag::U8 => Ok(Value::U8(fixed::<1>(bytes)?[0])),
            TypeTag::U16 => Ok(Value::U16(u16::from_le_bytes(fixed(bytes)?))),
            TypeTag::U32 => Ok(Value::U32(u32::from_le_bytes(fixed(bytes)?))),
            TypeTag::U64 => Ok(Value::U64(u64::from_le_bytes(fixed(bytes)?))),
            TypeTag::I64 => Ok(Value::I64(i64::from_le_bytes(fixed(bytes)?))),
            TypeTag::Str => String::from_utf8(bytes.to_vec())
                .map(Value::Str)
                .map_err(|e| CodecError::Malformed(format!("invalid UTF-8: {}", e))),
            TypeTag::Json => Ok(Value::Json(serde_json::from_slice(bytes)?)),
            TypeTag::List => self.decode_list(bytes),
            TypeTag::Tuple => Ok(Value::Tuple(serde_json::from_slice(bytes)?)),
            TypeTag::Bytes => Ok(Value::Bytes(bytes.to_vec())),
            TypeTag::Custom(id) => {
                let handler = self.registry.get(id).ok_or(CodecError::UnknownType(id))?;
                Ok(Value::Custom(CustomValue {
                    type_id: id,
                    body: handler.decode(bytes)?,
                }))
            }
        }
    }

    /// Decode using a raw wire id, failing with `UnknownType` for ids that
    /// are neither built in nor registered
    pub fn decode_id(&self, bytes: &[u8], id: u8) -> Result<Value, CodecError> {
        let tag = TypeTag::from_id(id).ok_or(CodecError::UnknownType(id))?;
        self.decode(bytes, tag)
    }

    // List layout: {[type:1][size:4][bytes]}*
    fn encode_list(&self, items: &[Value]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        for item in items {
            let tag = item.tag();
            let encoded = self.encode(item, Some(tag))?;
            out.push(tag.id());
            out.extend_from_slice(&len_u32(encoded.len())?.to_le_bytes());
            out.extend_from_slice(&encoded);
        }
        Ok(out)
    }

    fn decode_list(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let mut items = Vec::new();
        let mut cursor = Cursor::new(bytes);
        while !cursor.is_done() {
            let id = cursor.u8()?;
            let size = cursor.u32()? as usize;
            let body = cursor.take(size)?;
            items.push(self.decode_id(body, id)?);
        }
        Ok(Value::List(items))
    }
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("custom_types", &self.registry.len())
            .finish()
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], CodecError> {
    bytes.try_into().map_err(|_| {
        CodecError::Malformed(format!("expected {} bytes, got {}", N, bytes.len()))
    })
}

pub(crate) fn len_u32(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::Malformed(format!("length {} overflows u32", len)))
}

/// Bounds-checked reader over an encoded buffer
pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                CodecError::Malformed(format!(
                    "need {} bytes at offset {}, buffer has {}",
                    n,
                    self.pos,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(fixed(self.take(4)?)?))
    }
}
