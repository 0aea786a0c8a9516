//! Serialize and deserialize KRPC messages.

mod internal;

use std::convert::TryInto;
use std::net::{Ipv4Addr, SocketAddrV4};

use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use tracing::trace;

use crate::common::{Id, Node, ID_SIZE};
use crate::{Error, Result};

/// Size of a compact node info record, 20 bytes id + 4 bytes ipv4 + 2 bytes port.
pub const NODE_INFO_SIZE: usize = ID_SIZE + PEER_INFO_SIZE;
/// Size of a compact peer info record, 4 bytes ipv4 + 2 bytes port.
pub const PEER_INFO_SIZE: usize = 6;

/// Generic Error
pub const ERROR_GENERIC: i32 = 201;
/// Server Error
pub const ERROR_SERVER: i32 = 202;
/// Protocol Error, such as a malformed packet, invalid arguments, or bad token
pub const ERROR_PROTOCOL: i32 = 203;
/// Method Unknown
pub const ERROR_METHOD_UNKNOWN: i32 = 204;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Raw transaction id, echoed back verbatim in replies.
    pub transaction_id: Vec<u8>,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

impl ErrorSpecific {
    /// Error with the default description for its code.
    pub fn new(code: i32) -> Self {
        let description = match code {
            ERROR_GENERIC => "Generic Error",
            ERROR_SERVER => "Server Error",
            ERROR_PROTOCOL => "Protocol Error",
            ERROR_METHOD_UNKNOWN => "Method Unknown",
            _ => "",
        };

        ErrorSpecific {
            code,
            description: description.to_string(),
        }
    }

    pub fn with_description(code: i32, description: &str) -> Self {
        ErrorSpecific {
            code,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    GetPeers(GetPeersRequestArguments),
    AnnouncePeer(AnnouncePeerRequestArguments),
}

impl RequestTypeSpecific {
    /// The `q` value of this request.
    pub fn method(&self) -> &'static str {
        match self {
            RequestTypeSpecific::Ping => "ping",
            RequestTypeSpecific::FindNode(_) => "find_node",
            RequestTypeSpecific::GetPeers(_) => "get_peers",
            RequestTypeSpecific::AnnouncePeer(_) => "announce_peer",
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetPeersRequestArguments {
    pub info_hash: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct AnnouncePeerRequestArguments {
    pub info_hash: Id,
    /// Ignored by the receiver if `implied_port` is `Some(true)`.
    pub port: u16,
    pub implied_port: Option<bool>,
    pub token: Vec<u8>,
}

/// Reply to any of the four queries.
///
/// Pings and announces reply with only the `responder_id`.
#[derive(Debug, PartialEq, Clone)]
pub struct ResponseSpecific {
    pub responder_id: Id,
    pub nodes: Option<Vec<Node>>,
    pub values: Option<Vec<SocketAddrV4>>,
    pub token: Option<Vec<u8>>,
}

impl ResponseSpecific {
    /// Empty reply, only carrying the responder's Id.
    pub fn empty(responder_id: Id) -> Self {
        ResponseSpecific {
            responder_id,
            nodes: None,
            values: None,
            token: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors decoding a [Message].
pub enum MessageError {
    /// Not a bencoded dictionary, or fields of the wrong type.
    #[error("Failed to parse packet bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// Unknown value for the `y` key.
    #[error("Invalid message type: {0:?}")]
    InvalidMessageType(Vec<u8>),

    /// Query for a method this node does not implement.
    #[error("Method unknown: {method}")]
    MethodUnknown {
        transaction_id: Vec<u8>,
        method: String,
    },

    /// Query with missing or malformed arguments.
    #[error("Invalid arguments: {description}")]
    InvalidArguments {
        transaction_id: Vec<u8>,
        description: &'static str,
    },

    /// Reply without a valid 20 bytes `id`.
    #[error("Response without a valid responder id")]
    InvalidResponderId { transaction_id: Vec<u8> },
}

impl MessageError {
    /// The error reply this node should send back, if the message was a query.
    pub fn to_error_reply(&self) -> Option<(&[u8], ErrorSpecific)> {
        match self {
            MessageError::MethodUnknown { transaction_id, .. } => Some((
                transaction_id.as_slice(),
                ErrorSpecific::new(ERROR_METHOD_UNKNOWN),
            )),
            MessageError::InvalidArguments { transaction_id, .. } => Some((
                transaction_id.as_slice(),
                ErrorSpecific::new(ERROR_PROTOCOL),
            )),
            _ => None,
        }
    }
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        let mut message = internal::DHTMessage {
            transaction_id: ByteBuf::from(self.transaction_id),
            version: self.version.map(ByteBuf::from),
            ..Default::default()
        };

        match self.message_type {
            MessageType::Request(RequestSpecific {
                requester_id,
                request_type,
            }) => {
                message.message_type = ByteBuf::from(b"q".to_vec());
                message.query = Some(ByteBuf::from(request_type.method().as_bytes().to_vec()));

                let mut arguments = internal::DHTArguments {
                    id: Some(Value::Bytes(requester_id.to_vec())),
                    ..Default::default()
                };

                match request_type {
                    RequestTypeSpecific::Ping => {}
                    RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
                        arguments.target = Some(Value::Bytes(target.to_vec()));
                    }
                    RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash }) => {
                        arguments.info_hash = Some(Value::Bytes(info_hash.to_vec()));
                    }
                    RequestTypeSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
                        info_hash,
                        port,
                        implied_port,
                        token,
                    }) => {
                        arguments.info_hash = Some(Value::Bytes(info_hash.to_vec()));
                        arguments.port = Some(Value::Int(port as i64));
                        arguments.implied_port =
                            implied_port.map(|b| Value::Int(if b { 1 } else { 0 }));
                        arguments.token = Some(Value::Bytes(token));
                    }
                }

                message.arguments = Some(arguments);
            }
            MessageType::Response(ResponseSpecific {
                responder_id,
                nodes,
                values,
                token,
            }) => {
                message.message_type = ByteBuf::from(b"r".to_vec());
                message.response = Some(internal::DHTResponse {
                    id: Some(ByteBuf::from(responder_id.to_vec())),
                    nodes: nodes.map(|nodes| ByteBuf::from(nodes4_to_bytes(&nodes))),
                    values: values.map(|values| peers_to_bytes(&values)),
                    token: token.map(ByteBuf::from),
                });
            }
            MessageType::Error(ErrorSpecific { code, description }) => {
                message.message_type = ByteBuf::from(b"e".to_vec());
                message.error = Some(vec![
                    Value::Int(code as i64),
                    Value::Bytes(description.into_bytes()),
                ]);
            }
        };

        message
    }

    fn from_serde_message(msg: internal::DHTMessage) -> std::result::Result<Message, MessageError> {
        let transaction_id = msg.transaction_id.into_vec();

        let message_type = match msg.message_type.as_slice() {
            b"q" => MessageType::Request(request_from_serde(
                &transaction_id,
                msg.query,
                msg.arguments,
            )?),
            b"r" => {
                let response = msg
                    .response
                    .ok_or_else(|| MessageError::InvalidResponderId {
                        transaction_id: transaction_id.clone(),
                    })?;

                MessageType::Response(response_from_serde(&transaction_id, response)?)
            }
            b"e" => MessageType::Error(error_from_serde(msg.error.unwrap_or_default())),
            other => return Err(MessageError::InvalidMessageType(other.to_vec())),
        };

        Ok(Message {
            transaction_id,
            version: msg.version.map(|v| v.into_vec()),
            message_type,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    /// Decode a message.
    ///
    /// A query that is a valid dictionary with a `t` key, but otherwise fails
    /// to decode, is reported as [MessageError::InvalidArguments] so it can
    /// still be answered.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> std::result::Result<Message, MessageError> {
        let bytes = bytes.as_ref();

        match internal::DHTMessage::from_bytes(bytes) {
            Ok(message) => Message::from_serde_message(message),
            Err(error) => match internal::query_transaction_id(bytes) {
                Some(transaction_id) => Err(MessageError::InvalidArguments {
                    transaction_id,
                    description: "malformed query",
                }),
                None => Err(error.into()),
            },
        }
    }

    /// Return the transaction Id as a u16, if it is exactly 2 bytes.
    pub fn transaction_id(&self) -> Result<u16> {
        transaction_id(&self.transaction_id)
    }
}

fn request_from_serde(
    transaction_id: &[u8],
    query: Option<ByteBuf>,
    arguments: Option<internal::DHTArguments>,
) -> std::result::Result<RequestSpecific, MessageError> {
    let invalid = |description: &'static str| MessageError::InvalidArguments {
        transaction_id: transaction_id.to_vec(),
        description,
    };

    let method = query
        .ok_or_else(|| invalid("missing method"))?
        .into_vec();

    match method.as_slice() {
        b"ping" | b"find_node" | b"get_peers" | b"announce_peer" => {}
        _ => {
            return Err(MessageError::MethodUnknown {
                transaction_id: transaction_id.to_vec(),
                method: String::from_utf8_lossy(&method).to_string(),
            })
        }
    }

    let arguments = arguments.ok_or_else(|| invalid("missing arguments"))?;

    let requester_id =
        id_argument(&arguments.id).ok_or_else(|| invalid("missing or invalid requester id"))?;

    let request_type = match method.as_slice() {
        b"ping" => RequestTypeSpecific::Ping,
        b"find_node" => RequestTypeSpecific::FindNode(FindNodeRequestArguments {
            target: id_argument(&arguments.target)
                .ok_or_else(|| invalid("missing or invalid target"))?,
        }),
        b"get_peers" => RequestTypeSpecific::GetPeers(GetPeersRequestArguments {
            info_hash: id_argument(&arguments.info_hash)
                .ok_or_else(|| invalid("missing or invalid info_hash"))?,
        }),
        _ => {
            let info_hash = id_argument(&arguments.info_hash)
                .ok_or_else(|| invalid("missing or invalid info_hash"))?;

            let implied_port = match &arguments.implied_port {
                None => None,
                Some(Value::Int(i)) => Some(*i != 0),
                Some(_) => return Err(invalid("invalid implied_port")),
            };

            let port = match (&arguments.port, implied_port) {
                (Some(Value::Int(port)), _) if (1..=u16::MAX as i64).contains(port) => {
                    *port as u16
                }
                (_, Some(true)) => 0,
                _ => return Err(invalid("missing or invalid port")),
            };

            let token = match arguments.token {
                Some(Value::Bytes(token)) => token,
                _ => return Err(invalid("missing or invalid token")),
            };

            RequestTypeSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
                info_hash,
                port,
                implied_port,
                token,
            })
        }
    };

    Ok(RequestSpecific {
        requester_id,
        request_type,
    })
}

/// A 20 bytes string argument.
fn id_argument(value: &Option<Value>) -> Option<Id> {
    match value {
        Some(Value::Bytes(bytes)) => Id::from_bytes(bytes).ok(),
        _ => None,
    }
}

fn response_from_serde(
    transaction_id: &[u8],
    response: internal::DHTResponse,
) -> std::result::Result<ResponseSpecific, MessageError> {
    let responder_id = response
        .id
        .as_ref()
        .and_then(|id| Id::from_bytes(id).ok())
        .ok_or_else(|| MessageError::InvalidResponderId {
            transaction_id: transaction_id.to_vec(),
        })?;

    let nodes = match response.nodes {
        Some(nodes) => match bytes_to_nodes4(&nodes) {
            Ok(nodes) => Some(nodes),
            Err(error) => {
                trace!(?error, "Ignoring invalid nodes field");
                None
            }
        },
        None => None,
    };

    Ok(ResponseSpecific {
        responder_id,
        nodes,
        values: response.values.map(|values| bytes_to_peers(&values)),
        token: response.token.map(|token| token.into_vec()),
    })
}

fn error_from_serde(values: Vec<Value>) -> ErrorSpecific {
    let mut code = ERROR_GENERIC;
    let mut description = String::new();

    for value in values {
        match value {
            Value::Int(int) => code = int as i32,
            Value::Bytes(bytes) => description = String::from_utf8_lossy(&bytes).to_string(),
            _ => {}
        }
    }

    ErrorSpecific { code, description }
}

/// Return the transaction Id as a u16
pub fn transaction_id<T: AsRef<[u8]>>(bytes: T) -> Result<u16> {
    let bytes = bytes.as_ref();

    if let Ok(array) = bytes.try_into() {
        return Ok(u16::from_be_bytes(array));
    }

    Err(Error::InvalidTransactionId(bytes.to_vec()))
}

fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Option<SocketAddrV4> {
    let bytes = bytes.as_ref();

    if bytes.len() != PEER_INFO_SIZE {
        return None;
    }

    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    Some(SocketAddrV4::new(ip, port))
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddrV4) -> [u8; PEER_INFO_SIZE] {
    let mut bytes = [0_u8; PEER_INFO_SIZE];

    bytes[..4].copy_from_slice(&sockaddr.ip().octets());
    bytes[4..].copy_from_slice(&sockaddr.port().to_be_bytes());

    bytes
}

/// Encode nodes into the compact node info format.
pub fn nodes4_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut vec = Vec::with_capacity(NODE_INFO_SIZE * nodes.len());
    for node in nodes {
        vec.extend_from_slice(node.id.as_bytes());
        vec.extend_from_slice(&sockaddr_to_bytes(&node.address));
    }
    vec
}

/// Decode the compact node info format.
///
/// Fails if the length is not a multiple of 26 bytes.
pub fn bytes_to_nodes4<T: AsRef<[u8]>>(bytes: T) -> Result<Vec<Node>> {
    let bytes = bytes.as_ref();
    if bytes.len() % NODE_INFO_SIZE != 0 {
        return Err(Error::InvalidNodesSize(bytes.len()));
    }

    bytes
        .chunks_exact(NODE_INFO_SIZE)
        .map(|chunk| -> Result<Node> {
            let id = Id::from_bytes(&chunk[..ID_SIZE])?;
            let address = bytes_to_sockaddr(&chunk[ID_SIZE..])
                .ok_or(Error::InvalidNodesSize(bytes.len()))?;

            Ok(Node::new(id, address))
        })
        .collect()
}

/// Encode peers into a list of compact peer info strings.
pub fn peers_to_bytes(peers: &[SocketAddrV4]) -> Vec<ByteBuf> {
    peers
        .iter()
        .map(|p| ByteBuf::from(sockaddr_to_bytes(p).to_vec()))
        .collect()
}

/// Decode compact peer info strings, skipping entries of the wrong size.
pub fn bytes_to_peers<T: AsRef<[ByteBuf]>>(bytes: T) -> Vec<SocketAddrV4> {
    bytes.as_ref().iter().filter_map(bytes_to_sockaddr).collect()
}
