use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

/// Bencoded KRPC dictionary as it appears on the wire.
///
/// Every field except `t` and `y` is optional here, validation happens
/// when converting into [super::Message] so that malformed queries can
/// still be answered with the right error code.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTMessage {
    #[serde(rename = "t")]
    pub transaction_id: ByteBuf,

    #[serde(rename = "y")]
    pub message_type: ByteBuf,

    #[serde(default, rename = "v", skip_serializing_if = "Option::is_none")]
    pub version: Option<ByteBuf>,

    #[serde(default, rename = "q", skip_serializing_if = "Option::is_none")]
    pub query: Option<ByteBuf>,

    #[serde(default, rename = "a", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<DHTArguments>,

    #[serde(default, rename = "r", skip_serializing_if = "Option::is_none")]
    pub response: Option<DHTResponse>,

    #[serde(default, rename = "e", skip_serializing_if = "Option::is_none")]
    pub error: Option<Vec<Value>>,
}

impl DHTMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

/// The transaction id of a bencoded dictionary with `y == "q"`, for
/// queries that could not be decoded as a [DHTMessage].
pub fn query_transaction_id(bytes: &[u8]) -> Option<Vec<u8>> {
    let dict = match serde_bencode::from_bytes::<Value>(bytes).ok()? {
        Value::Dict(dict) => dict,
        _ => return None,
    };

    match (dict.get(&b"t"[..]), dict.get(&b"y"[..])) {
        (Some(Value::Bytes(transaction_id)), Some(Value::Bytes(y))) if y.as_slice() == b"q" => {
            Some(transaction_id.clone())
        }
        _ => None,
    }
}

/// Query arguments, kept as raw bencode values so that arguments of the
/// wrong type are reported as invalid arguments instead of undecodable bytes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTArguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implied_port: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
}
