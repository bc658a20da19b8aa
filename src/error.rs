// Copyright 2020 Joyent, Inc.

use std::convert::TryFrom;
use std::fmt;
use std::io;

use thiserror::Error;

use crate::proto::rpc_response_header_proto::{
    RpcErrorCodeProto, RpcStatusProto,
};
use crate::proto::RpcResponseHeaderProto;

const NO_EXCEPTION_CLASS: &str = "ServerDidNotSetExceptionClassName";
const NO_ERROR_MSG: &str = "ServerDidNotSetErrorMsg";
const NO_ERROR_DETAIL: &str = "ServerDidNotSetErrorDetail";

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("IPC I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("IPC framing error: {0}")]
    Framing(String),
    #[error("failed to decode protobuf message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("response client id {actual:02x?} does not match {expected:02x?}")]
    IdentityMismatch { expected: Vec<u8>, actual: Vec<u8> },
    #[error("response call id {actual} does not match request call id {expected}")]
    CallIdMismatch { expected: i32, actual: i32 },
    #[error("SASL negotiation failed: {0}")]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Remote(RemoteError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid token storage: {0}")]
    TokenStorage(String),
}

impl Error {
    /// True when the server processed the call and reported a failure, as
    /// opposed to the call never completing on the wire.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote(_))
    }

    pub fn framing<S: Into<String>>(msg: S) -> Error {
        Error::Framing(msg.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("no supported auth mechanisms offered by server")]
    NoMechanisms,
    #[error("only TOKEN/DIGEST-MD5 is supported, server offered {method}/{mechanism}")]
    UnsupportedMechanism { method: String, mechanism: String },
    #[error("expected SASL {expected}, server replied {actual}")]
    UnexpectedState {
        expected: &'static str,
        actual: String,
    },
    #[error("DIGEST-MD5: {0}")]
    Digest(String),
}

/// A non-SUCCESS response header, as reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub status: String,
    pub exception_class_name: Option<String>,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
}

impl RemoteError {
    pub fn from_header(header: &RpcResponseHeaderProto) -> RemoteError {
        let status = RpcStatusProto::try_from(header.status)
            .map(|s| String::from(s.as_str_name()))
            .unwrap_or_else(|_| format!("UNKNOWN({})", header.status));
        let error_detail = header.error_detail.map(|code| {
            RpcErrorCodeProto::try_from(code)
                .map(|d| String::from(d.as_str_name()))
                .unwrap_or_else(|_| format!("UNKNOWN({})", code))
        });

        RemoteError {
            status,
            exception_class_name: header.exception_class_name.clone(),
            error_message: header.error_msg.clone(),
            error_detail,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.status,
            self.exception_class_name.as_deref().unwrap_or(NO_EXCEPTION_CLASS),
            self.error_message.as_deref().unwrap_or(NO_ERROR_MSG),
            self.error_detail.as_deref().unwrap_or(NO_ERROR_DETAIL)
        )
    }
}

impl std::error::Error for RemoteError {}
