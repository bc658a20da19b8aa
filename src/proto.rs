// Copyright 2020 Joyent, Inc.

//! Protobuf messages from Hadoop's `RpcHeader.proto`,
//! `IpcConnectionContext.proto`, `ProtobufRpcEngine.proto` and
//! `Security.proto` that the IPC engine puts on the wire.

/// Security token identifier
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TokenProto {
    #[prost(bytes = "vec", required, tag = "1")]
    pub identifier: Vec<u8>,
    #[prost(bytes = "vec", required, tag = "2")]
    pub password: Vec<u8>,
    #[prost(string, required, tag = "3")]
    pub kind: String,
    #[prost(string, required, tag = "4")]
    pub service: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CredentialsKvProto {
    #[prost(string, required, tag = "1")]
    pub alias: String,
    #[prost(message, optional, tag = "2")]
    pub token: Option<TokenProto>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub secret: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CredentialsProto {
    #[prost(message, repeated, tag = "1")]
    pub tokens: Vec<CredentialsKvProto>,
    #[prost(message, repeated, tag = "2")]
    pub secrets: Vec<CredentialsKvProto>,
}

/// RpcKind determines the rpc engine and the serialization of the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum RpcKindProto {
    RpcBuiltin = 0,
    RpcWritable = 1,
    RpcProtocolBuffer = 2,
}

/// The header for every request frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequestHeaderProto {
    #[prost(enumeration = "RpcKindProto", optional, tag = "1")]
    pub rpc_kind: Option<i32>,
    #[prost(
        enumeration = "rpc_request_header_proto::OperationProto",
        optional,
        tag = "2"
    )]
    pub rpc_op: Option<i32>,
    /// a sequence number that is sent back in response
    #[prost(sint32, required, tag = "3")]
    pub call_id: i32,
    /// Globally unique client ID
    #[prost(bytes = "vec", required, tag = "4")]
    pub client_id: Vec<u8>,
    /// clientId + callId uniquely identifies a request
    #[prost(sint32, optional, tag = "5", default = "-1")]
    pub retry_count: Option<i32>,
}

pub mod rpc_request_header_proto {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum OperationProto {
        RpcFinalPacket = 0,
        RpcContinuationPacket = 1,
        RpcCloseConnection = 2,
    }
}

/// The header for every response frame. Also used when connection setup
/// fails, in which case it carries a reserved call id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponseHeaderProto {
    /// callId used in Request
    #[prost(uint32, required, tag = "1")]
    pub call_id: u32,
    #[prost(
        enumeration = "rpc_response_header_proto::RpcStatusProto",
        required,
        tag = "2"
    )]
    pub status: i32,
    #[prost(uint32, optional, tag = "3")]
    pub server_ipc_version_num: Option<u32>,
    #[prost(string, optional, tag = "4")]
    pub exception_class_name: Option<String>,
    /// often contains a stack trace
    #[prost(string, optional, tag = "5")]
    pub error_msg: Option<String>,
    #[prost(
        enumeration = "rpc_response_header_proto::RpcErrorCodeProto",
        optional,
        tag = "6"
    )]
    pub error_detail: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub client_id: Option<Vec<u8>>,
    #[prost(sint32, optional, tag = "8", default = "-1")]
    pub retry_count: Option<i32>,
}

pub mod rpc_response_header_proto {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum RpcStatusProto {
        Success = 0,
        /// connection left open for future calls
        Error = 1,
        /// connection closed
        Fatal = 2,
    }

    impl RpcStatusProto {
        pub fn as_str_name(&self) -> &'static str {
            match self {
                RpcStatusProto::Success => "SUCCESS",
                RpcStatusProto::Error => "ERROR",
                RpcStatusProto::Fatal => "FATAL",
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum RpcErrorCodeProto {
        ErrorApplication = 1,
        ErrorNoSuchMethod = 2,
        ErrorNoSuchProtocol = 3,
        ErrorRpcServer = 4,
        ErrorSerializingResponse = 5,
        ErrorRpcVersionMismatch = 6,
        FatalUnknown = 10,
        FatalUnsupportedSerialization = 11,
        FatalInvalidRpcHeader = 12,
        FatalDeserializingRequest = 13,
        FatalVersionMismatch = 14,
        FatalUnauthorized = 15,
    }

    impl RpcErrorCodeProto {
        pub fn as_str_name(&self) -> &'static str {
            match self {
                RpcErrorCodeProto::ErrorApplication => "ERROR_APPLICATION",
                RpcErrorCodeProto::ErrorNoSuchMethod => "ERROR_NO_SUCH_METHOD",
                RpcErrorCodeProto::ErrorNoSuchProtocol => {
                    "ERROR_NO_SUCH_PROTOCOL"
                }
                RpcErrorCodeProto::ErrorRpcServer => "ERROR_RPC_SERVER",
                RpcErrorCodeProto::ErrorSerializingResponse => {
                    "ERROR_SERIALIZING_RESPONSE"
                }
                RpcErrorCodeProto::ErrorRpcVersionMismatch => {
                    "ERROR_RPC_VERSION_MISMATCH"
                }
                RpcErrorCodeProto::FatalUnknown => "FATAL_UNKNOWN",
                RpcErrorCodeProto::FatalUnsupportedSerialization => {
                    "FATAL_UNSUPPORTED_SERIALIZATION"
                }
                RpcErrorCodeProto::FatalInvalidRpcHeader => {
                    "FATAL_INVALID_RPC_HEADER"
                }
                RpcErrorCodeProto::FatalDeserializingRequest => {
                    "FATAL_DESERIALIZING_REQUEST"
                }
                RpcErrorCodeProto::FatalVersionMismatch => {
                    "FATAL_VERSION_MISMATCH"
                }
                RpcErrorCodeProto::FatalUnauthorized => "FATAL_UNAUTHORIZED",
            }
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcSaslProto {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(enumeration = "rpc_sasl_proto::SaslState", required, tag = "2")]
    pub state: i32,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub token: Option<Vec<u8>>,
    #[prost(message, repeated, tag = "4")]
    pub auths: Vec<rpc_sasl_proto::SaslAuth>,
}

pub mod rpc_sasl_proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SaslAuth {
        #[prost(string, required, tag = "1")]
        pub method: String,
        #[prost(string, required, tag = "2")]
        pub mechanism: String,
        #[prost(string, optional, tag = "3")]
        pub protocol: Option<String>,
        #[prost(string, optional, tag = "4")]
        pub server_id: Option<String>,
        #[prost(bytes = "vec", optional, tag = "5")]
        pub challenge: Option<Vec<u8>>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum SaslState {
        Success = 0,
        Negotiate = 1,
        Initiate = 2,
        Challenge = 3,
        Response = 4,
        Wrap = 5,
    }

    impl SaslState {
        pub fn as_str_name(&self) -> &'static str {
            match self {
                SaslState::Success => "SUCCESS",
                SaslState::Negotiate => "NEGOTIATE",
                SaslState::Initiate => "INITIATE",
                SaslState::Challenge => "CHALLENGE",
                SaslState::Response => "RESPONSE",
                SaslState::Wrap => "WRAP",
            }
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserInformationProto {
    #[prost(string, optional, tag = "1")]
    pub effective_user: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub real_user: Option<String>,
}

/// Sent once per connection, before any call. Establishes the context for
/// every call made on the connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpcConnectionContextProto {
    #[prost(message, optional, tag = "2")]
    pub user_info: Option<UserInformationProto>,
    /// Protocol name for the next rpc layer
    #[prost(string, optional, tag = "3")]
    pub protocol: Option<String>,
}

/// Procedure header for the protobuf rpc engine. The serialized request
/// follows it in the same frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestHeaderProto {
    #[prost(string, required, tag = "1")]
    pub method_name: String,
    #[prost(string, required, tag = "2")]
    pub declaring_class_protocol_name: String,
    #[prost(uint64, required, tag = "3")]
    pub client_protocol_version: u64,
}
