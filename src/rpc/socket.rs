//! UDP socket layer sending and receiving KRPC messages.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use tracing::{debug, trace};

use crate::common::{
    ErrorSpecific, Message, MessageError, MessageType, RequestSpecific, ResponseSpecific,
};

use super::config::Config;

const VERSION: [u8; 4] = [b'K', b'D', 0, 1]; // "KD" version 01
const MTU: usize = 2048;

pub const DEFAULT_PORT: u16 = 6881;
/// The maximum duration to backoff checking the [UdpSocket] buffer after it is empty.
/// Lower values increases CPU usage, but reduces latency, and drains the buffer faster,
/// reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// A UdpSocket wrapper that encodes and decodes KRPC messages.
#[derive(Debug)]
pub struct KrpcSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
}

impl KrpcSocket {
    pub(crate) fn new(config: &Config) -> Result<Self, std::io::Error> {
        let socket = if let Some(port) = config.port {
            UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?
        } else {
            match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))),
            }?
        };

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "KrpcSocket does not support Ipv6",
                ))
            }
        };

        socket.set_nonblocking(true)?;

        Ok(Self { socket, local_addr })
    }

    // === Getters ===

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Send a request with the given transaction id.
    pub fn request(&mut self, address: SocketAddrV4, transaction_id: u16, request: RequestSpecific) {
        let message = Message {
            transaction_id: transaction_id.to_be_bytes().to_vec(),
            version: Some(VERSION.to_vec()),
            message_type: MessageType::Request(request),
        };

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending request message");
        });
    }

    /// Send a response to the given address, echoing the request's transaction id.
    pub fn response(
        &mut self,
        address: SocketAddrV4,
        transaction_id: Vec<u8>,
        response: ResponseSpecific,
    ) {
        let message = Message {
            transaction_id,
            version: Some(VERSION.to_vec()),
            message_type: MessageType::Response(response),
        };

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Send an error to the given address.
    pub fn error(&mut self, address: SocketAddrV4, transaction_id: Vec<u8>, error: ErrorSpecific) {
        let message = Message {
            transaction_id,
            version: Some(VERSION.to_vec()),
            message_type: MessageType::Error(error),
        };

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending error message");
        });
    }

    /// Receives a single krpc message on the socket.
    ///
    /// On success, returns the decoded message, or the reason it could not
    /// be decoded, and the origin. Returns None if nothing was received, or
    /// the datagram is not worth answering.
    pub fn recv_from(&mut self) -> Option<(Result<Message, MessageError>, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Response from port 0"
                    );
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        trace!(
                            context = "socket_message_receiving",
                            ?message,
                            ?from,
                            "Received message"
                        );
                        return Some((Ok(message), from));
                    }
                    Err(MessageError::Bencode(error)) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid Bencode message."
                        );
                    }
                    Err(MessageError::InvalidMessageType(message_type)) => {
                        trace!(
                            context = "socket_validation",
                            ?message_type,
                            ?from,
                            "Received message of unknown type"
                        );
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_validation",
                            ?error,
                            ?from,
                            "Received malformed message"
                        );
                        return Some((Err(error), from));
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(
                    context = "socket_validation",
                    message = "Received IPv6 packet"
                );
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(e) => {
                trace!(
                    context = "socket_error",
                    ?e,
                    "recv_from failed unexpectedly"
                );
            }
        }

        None
    }

    // === Private Methods ===

    /// Send a raw dht message
    fn send(&mut self, address: SocketAddrV4, message: Message) -> crate::Result<()> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", ?address, message = ?message);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use crate::common::{Id, RequestTypeSpecific};

    use super::*;

    fn socket() -> KrpcSocket {
        KrpcSocket::new(&Config {
            port: Some(0),
            ..Default::default()
        })
        .unwrap()
    }

    fn loopback(socket: &KrpcSocket) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), socket.local_addr().port())
    }

    fn recv(socket: &mut KrpcSocket) -> (Result<Message, MessageError>, SocketAddrV4) {
        loop {
            if let Some(received) = socket.recv_from() {
                return received;
            }
        }
    }

    #[test]
    fn request_and_response() {
        let mut server = socket();
        let mut client = socket();

        let server_address = loopback(&server);
        let client_address = loopback(&client);

        let server_id = Id::random();
        let client_id = Id::random();

        let server_thread = thread::spawn(move || {
            let (message, from) = recv(&mut server);
            let message = message.unwrap();

            assert_eq!(from, client_address);
            assert_eq!(message.version, Some(VERSION.to_vec()));
            assert_eq!(
                message.message_type,
                MessageType::Request(RequestSpecific {
                    requester_id: client_id,
                    request_type: RequestTypeSpecific::Ping,
                })
            );

            server.response(
                from,
                message.transaction_id,
                ResponseSpecific::empty(server_id),
            );
        });

        client.request(
            server_address,
            120,
            RequestSpecific {
                requester_id: client_id,
                request_type: RequestTypeSpecific::Ping,
            },
        );

        let (message, from) = recv(&mut client);
        let message = message.unwrap();

        assert_eq!(from, server_address);
        assert_eq!(message.transaction_id().unwrap(), 120);
        assert_eq!(
            message.message_type,
            MessageType::Response(ResponseSpecific::empty(server_id))
        );

        server_thread.join().unwrap();
    }

    #[test]
    fn malformed_query_is_surfaced() {
        let mut server = socket();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();

        client
            .send_to(
                b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:vote1:t2:aa1:y1:qe",
                loopback(&server),
            )
            .unwrap();

        let (message, _) = recv(&mut server);

        assert!(matches!(
            message,
            Err(MessageError::MethodUnknown { .. })
        ));
    }
}
