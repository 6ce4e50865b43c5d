//! Marshalling of user functions and keys

use crate::error::{MapReduceError, MapReduceResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Object serialization used by the grid
pub trait Marshaller: Send + Sync {
    fn object_to_bytes(&self, value: &Value) -> MapReduceResult<Vec<u8>>;

    fn object_from_bytes(&self, bytes: &[u8]) -> MapReduceResult<Value>;
}

/// Marshaller writing compact JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn object_to_bytes(&self, value: &Value) -> MapReduceResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|source| MapReduceError::Marshalling {
            what: "object".to_string(),
            source,
        })
    }

    fn object_from_bytes(&self, bytes: &[u8]) -> MapReduceResult<Value> {
        serde_json::from_slice(bytes).map_err(|source| MapReduceError::Marshalling {
            what: "object".to_string(),
            source,
        })
    }
}

/// Produce an independent copy of `value` by passing it through the marshaller.
///
/// Fails for values that cannot cross the wire, which is how
/// non-serializable user functions are rejected before any dispatch.
pub fn round_trip_copy<T>(marshaller: &dyn Marshaller, what: &str, value: &T) -> MapReduceResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let marshalling = |source| MapReduceError::Marshalling {
        what: what.to_string(),
        source,
    };
    let tree = serde_json::to_value(value).map_err(marshalling)?;
    let bytes = marshaller.object_to_bytes(&tree)?;
    let copy = marshaller.object_from_bytes(&bytes)?;
    serde_json::from_value(copy).map_err(marshalling)
}

/// Marshalled form of a key, as handed to ownership lookups
pub fn key_bytes<K: Serialize>(marshaller: &dyn Marshaller, key: &K) -> MapReduceResult<Vec<u8>> {
    let tree = serde_json::to_value(key).map_err(|source| MapReduceError::Marshalling {
        what: "key".to_string(),
        source,
    })?;
    marshaller.object_to_bytes(&tree)
}
