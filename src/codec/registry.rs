//! Pluggable handlers for custom value types

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;

use super::{CodecError, Cursor};

/// First id of the reserved custom range
pub const CUSTOM_TYPE_MIN: u8 = 100;
/// Last id of the reserved custom range
pub const CUSTOM_TYPE_MAX: u8 = 200;

/// Converts a custom value body to and from bytes
pub trait TypeHandler: Send + Sync {
    /// Human readable name, used for lookups and logging
    fn name(&self) -> &str;

    fn encode(&self, body: &serde_json::Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError>;
}

/// Table of custom handlers keyed by type id
///
/// Owned by whoever builds the [`super::FrameCodec`]; there is no process
/// wide table.
#[derive(Default)]
pub struct TypeRegistry {
    handlers: RwLock<BTreeMap<u8, Arc<dyn TypeHandler>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the id it was bound to.
    ///
    /// Without an explicit id the lowest free id in the custom range is used.
    pub fn register(
        &self,
        handler: Arc<dyn TypeHandler>,
        id: Option<u8>,
    ) -> Result<u8, CodecError> {
        let mut handlers = self.handlers.write();

        let id = match id {
            Some(id) => {
                if !(CUSTOM_TYPE_MIN..=CUSTOM_TYPE_MAX).contains(&id) {
                    return Err(CodecError::InvalidTypeId(id));
                }
                if handlers.contains_key(&id) {
                    return Err(CodecError::TypeAlreadyRegistered(id));
                }
                id
            }
            None => (CUSTOM_TYPE_MIN..=CUSTOM_TYPE_MAX)
                .find(|candidate| !handlers.contains_key(candidate))
                .ok_or(CodecError::RegistryFull)?,
        };

        tracing::debug!("Registered custom type '{}' as {}", handler.name(), id);
        handlers.insert(id, handler);
        Ok(id)
    }

    pub fn get(&self, id: u8) -> Option<Arc<dyn TypeHandler>> {
        self.handlers.read().get(&id).cloned()
    }

    /// Id of the first handler registered under `name`
    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.handlers
            .read()
            .iter()
            .find(|(_, h)| h.name() == name)
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

/// Stores the body as JSON text under a custom id
pub struct JsonHandler {
    name: String,
}

impl JsonHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TypeHandler for JsonHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, body: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(body)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Packed n-dimensional f64 array.
///
/// Body shape is `{"shape": [d0, d1, ...], "data": [f64, ...]}`; the wire
/// layout is `[ndim:1][dim:4]*[f64 le]*`.
pub struct NdArrayHandler;

impl TypeHandler for NdArrayHandler {
    fn name(&self) -> &str {
        "ndarray"
    }

    fn encode(&self, body: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        let malformed = |msg: &str| CodecError::Malformed(format!("ndarray: {}", msg));

        let shape = body
            .get("shape")
            .and_then(|s| s.as_array())
            .ok_or_else(|| malformed("missing shape"))?;
        let data = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| malformed("missing data"))?;

        let ndim = u8::try_from(shape.len()).map_err(|_| malformed("too many dimensions"))?;
        let mut dims = Vec::with_capacity(shape.len());
        for dim in shape {
            let dim = dim
                .as_u64()
                .and_then(|d| u32::try_from(d).ok())
                .ok_or_else(|| malformed("dimension is not a u32"))?;
            dims.push(dim);
        }

        let expected: u64 = dims.iter().map(|d| *d as u64).product();
        if expected != data.len() as u64 {
            return Err(malformed("data length does not match shape"));
        }

        let mut out = Vec::with_capacity(1 + dims.len() * 4 + data.len() * 8);
        out.push(ndim);
        for dim in dims {
            out.extend_from_slice(&dim.to_le_bytes());
        }
        for x in data {
            let x = x.as_f64().ok_or_else(|| malformed("element is not a number"))?;
            out.extend_from_slice(&x.to_le_bytes());
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let ndim = cursor.u8()? as usize;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            shape.push(cursor.u32()?);
        }

        let count: u64 = shape.iter().map(|d| *d as u64).product();
        let mut data = Vec::new();
        for _ in 0..count {
            let raw: [u8; 8] = cursor
                .take(8)?
                .try_into()
                .map_err(|_| CodecError::Malformed("ndarray: short element".to_string()))?;
            data.push(f64::from_le_bytes(raw));
        }
        if !cursor.is_done() {
            return Err(CodecError::Malformed(
                "ndarray: trailing bytes after data".to_string(),
            ));
        }

        Ok(json!({ "shape": shape, "data": data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_allocates_lowest_free_id() {
        let registry = TypeRegistry::new();
        let a = registry.register(Arc::new(JsonHandler::new("a")), None).unwrap();
        let b = registry.register(Arc::new(JsonHandler::new("b")), None).unwrap();
        assert_eq!(a, CUSTOM_TYPE_MIN);
        assert_eq!(b, CUSTOM_TYPE_MIN + 1);
        assert_eq!(registry.id_of("b"), Some(b));
    }

    #[test]
    fn test_register_collision() {
        let registry = TypeRegistry::new();
        registry
            .register(Arc::new(JsonHandler::new("a")), Some(150))
            .unwrap();
        let err = registry
            .register(Arc::new(JsonHandler::new("b")), Some(150))
            .unwrap_err();
        assert!(matches!(err, CodecError::TypeAlreadyRegistered(150)));
    }

    #[test]
    fn test_register_out_of_range() {
        let registry = TypeRegistry::new();
        let err = registry
            .register(Arc::new(JsonHandler::new("a")), Some(5))
            .unwrap_err();
        assert!(matches!(err, CodecError::InvalidTypeId(5)));
    }

    #[test]
    fn test_registry_full() {
        let registry = TypeRegistry::new();
        for i in CUSTOM_TYPE_MIN..=CUSTOM_TYPE_MAX {
            registry
                .register(Arc::new(JsonHandler::new(format!("t{}", i))), None)
                .unwrap();
        }
        assert_eq!(registry.len(), 101);
        let err = registry
            .register(Arc::new(JsonHandler::new("overflow")), None)
            .unwrap_err();
        assert!(matches!(err, CodecError::RegistryFull));
    }

    #[test]
    fn test_ndarray_shape_mismatch() {
        let err = NdArrayHandler
            .encode(&json!({"shape": [3], "data": [1.0]}))
            .unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }
}
