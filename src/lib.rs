// Copyright 2020 Joyent, Inc.

//! hadoop-ipc: a synchronous client for the Hadoop IPC protocol
//!
//! Hadoop IPC is the protobuf-over-TCP RPC protocol spoken by the YARN
//! resource manager, node managers and the other Hadoop daemons. This crate
//! implements the client side of one call: open a connection, run connection
//! setup, send a single request, read its response, close the connection.
//!
//! Connection setup
//!
//! * Connection header, 7 bytes: the magic `hrpc`, the protocol version
//!   (9), the service class (0) and the auth protocol: 0 for none, 0xDF
//!   (-33) for SASL.
//!
//! * SASL exchange, only when the caller holds a token for the server
//!   address: NEGOTIATE, then INITIATE with a DIGEST-MD5 response, and the
//!   server must answer SUCCESS. These frames carry call id -33 and an empty
//!   client id.
//!
//! * Connection context under call id -3, naming the protocol and, for
//!   unauthenticated connections, the user.
//!
//! Frames
//!
//! Every frame after the connection header is a 4-byte big-endian length
//! followed by that many bytes of varint-delimited protobuf messages.
//!
//! * Request: `RpcRequestHeaderProto`, `RequestHeaderProto` (method name,
//!   protocol name, protocol version) and the request message.
//!
//! * Response: `RpcResponseHeaderProto`, then the response message when the
//!   status is SUCCESS. A response is only accepted if it echoes the client
//!   id and call id of the request.
//!
//! Call ids: ordinary calls draw ids sequentially from a 31-bit space, which
//! keeps them clear of the negative ids reserved for control traffic.

#![allow(missing_docs)]

pub mod client;
pub mod connection;
pub mod error;
pub mod proto;
pub mod protocol;
pub mod sasl;
pub mod security;
pub mod server;

pub use crate::client::{Client, ClientConfig};
pub use crate::error::{AuthError, Error, RemoteError};
pub use crate::security::{TokenStore, User};
