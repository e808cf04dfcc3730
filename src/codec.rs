//! Argument codecs.
//!
//! Topics carry method arguments as opaque bytes. A codec turns the caller's
//! argument list into those bytes on send and back into values right before
//! the transport sees them.

use crate::error::Result;
use serde_json::Value;

/// Encodes method argument lists to bytes and back.
pub trait ArgsCodec: Send + Sync {
    fn encode(&self, args: &[Value]) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>>;
}

/// JSON array encoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonArgsCodec;

impl ArgsCodec for JsonArgsCodec {
    fn encode(&self, args: &[Value]) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(args)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// MessagePack encoding, more compact than JSON on the wire between
/// processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgPackArgsCodec;

impl ArgsCodec for MsgPackArgsCodec {
    fn encode(&self, args: &[Value]) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(args)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
