// Copyright 2020 Joyent, Inc.

//! A small async IPC server: enough of the server side of connection setup
//! (including TOKEN/DIGEST-MD5 SASL) and call dispatch to stand in for a
//! resource manager or node manager in tests and demos.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use slog::{debug, info, o, warn, Drain, Logger};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::{AuthError, Error};
use crate::proto::rpc_response_header_proto::{
    RpcErrorCodeProto, RpcStatusProto,
};
use crate::proto::rpc_sasl_proto::{SaslAuth, SaslState};
use crate::proto::{
    IpcConnectionContextProto, RequestHeaderProto, RpcRequestHeaderProto,
    RpcResponseHeaderProto, RpcSaslProto, TokenProto,
};
use crate::protocol::{
    AuthProtocol, ConnectionHeader, FrameReader, IpcRpc, ReservedCallId,
    RpcFrame, CONNECTION_HEADER_LEN, DUMMY_CLIENT_ID, RPC_VERSION,
};
use crate::sasl::TOKEN_METHOD;
use crate::security::digest::{self, DigestChallenge, DigestResponse};

pub const IO_EXCEPTION: &str = "java.io.IOException";
pub const ACCESS_CONTROL_EXCEPTION: &str =
    "org.apache.hadoop.security.AccessControlException";
pub const SASL_EXCEPTION: &str = "javax.security.sasl.SaslException";
pub const NO_SUCH_METHOD_EXCEPTION: &str =
    "org.apache.hadoop.ipc.RpcNoSuchMethodException";

/// Passwords for the tokens this server has issued.
#[derive(Debug, Clone, Default)]
pub struct TokenSecretManager {
    pub protocol: String,
    pub server_id: String,
    passwords: HashMap<Vec<u8>, Vec<u8>>,
}

impl TokenSecretManager {
    pub fn new(protocol: &str) -> TokenSecretManager {
        TokenSecretManager {
            protocol: protocol.to_string(),
            server_id: String::from(digest::DEFAULT_REALM),
            passwords: HashMap::new(),
        }
    }

    pub fn add_token(&mut self, token: &TokenProto) {
        self.passwords
            .insert(token.identifier.clone(), token.password.clone());
    }

    fn password(&self, identifier: &[u8]) -> Option<&[u8]> {
        self.passwords.get(identifier).map(|p| p.as_slice())
    }
}

#[derive(Debug, Clone)]
pub enum ServerAuth {
    /// Accept unauthenticated connections only.
    Simple,
    /// Require TOKEN/DIGEST-MD5.
    Token(TokenSecretManager),
}

/// An exception to report back to the caller in the response header.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteException {
    pub class_name: String,
    pub message: String,
    pub code: RpcErrorCodeProto,
}

impl RemoteException {
    pub fn new(class_name: &str, message: &str) -> RemoteException {
        RemoteException {
            class_name: class_name.to_string(),
            message: message.to_string(),
            code: RpcErrorCodeProto::ErrorApplication,
        }
    }

    pub fn io(message: &str) -> RemoteException {
        RemoteException::new(IO_EXCEPTION, message)
    }

    pub fn no_such_method(method: &str) -> RemoteException {
        RemoteException {
            code: RpcErrorCodeProto::ErrorNoSuchMethod,
            ..RemoteException::new(
                NO_SUCH_METHOD_EXCEPTION,
                &format!("Unknown method {} called", method),
            )
        }
    }

    fn is_fatal(&self) -> bool {
        self.code as i32 >= RpcErrorCodeProto::FatalUnknown as i32
    }
}

/// A decoded call, as handed to the server's handler.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call_id: i32,
    pub client_id: Vec<u8>,
    pub retry_count: i32,
    pub procedure: RequestHeaderProto,
    pub payload: Bytes,
    pub user: Option<String>,
    pub token_identifier: Option<Vec<u8>>,
}

impl IncomingCall {
    pub fn method_name(&self) -> &str {
        &self.procedure.method_name
    }

    pub fn decode_request<M: Message + Default>(
        &self,
    ) -> Result<M, RemoteException> {
        M::decode(self.payload.clone()).map_err(|e| RemoteException {
            code: RpcErrorCodeProto::FatalDeserializingRequest,
            ..RemoteException::new(IO_EXCEPTION, &e.to_string())
        })
    }
}

type IpcFramed = Framed<TcpStream, IpcRpc>;

fn response_header(
    call_id: i32,
    client_id: &[u8],
    retry_count: i32,
    status: RpcStatusProto,
) -> RpcResponseHeaderProto {
    RpcResponseHeaderProto {
        call_id: call_id as u32,
        status: status as i32,
        server_ipc_version_num: Some(u32::from(RPC_VERSION)),
        client_id: Some(client_id.to_vec()),
        retry_count: Some(retry_count),
        ..Default::default()
    }
}

pub fn success_frame(
    call_id: i32,
    client_id: &[u8],
    retry_count: i32,
    payload: Vec<u8>,
) -> RpcFrame {
    let header = response_header(
        call_id,
        client_id,
        retry_count,
        RpcStatusProto::Success,
    );
    RpcFrame::new().message(&header).bytes(payload)
}

pub fn error_frame(
    call_id: i32,
    client_id: &[u8],
    retry_count: i32,
    exception: &RemoteException,
) -> RpcFrame {
    let status = if exception.is_fatal() {
        RpcStatusProto::Fatal
    } else {
        RpcStatusProto::Error
    };
    let mut header = response_header(call_id, client_id, retry_count, status);
    header.exception_class_name = Some(exception.class_name.clone());
    header.error_msg = Some(exception.message.clone());
    header.error_detail = Some(exception.code as i32);
    RpcFrame::new().message(&header)
}

fn sasl_frame(message: &RpcSaslProto) -> RpcFrame {
    let header = response_header(
        ReservedCallId::Sasl.id(),
        DUMMY_CLIENT_ID,
        -1,
        RpcStatusProto::Success,
    );
    RpcFrame::new().message(&header).message(message)
}

/// Connection setup is rejected under its own call id, whatever the client
/// was waiting on.
fn setup_error_frame(exception: &RemoteException) -> RpcFrame {
    error_frame(
        ReservedCallId::AuthorizationFailed.id(),
        DUMMY_CLIENT_ID,
        -1,
        exception,
    )
}

async fn next_frame(framed: &mut IpcFramed) -> Result<FrameReader, Error> {
    match framed.next().await {
        Some(frame) => frame,
        None => Err(Error::framing("connection closed by client")),
    }
}

/// Wait for the client to hang up after a fatal reply so that it reads the
/// reply rather than a reset.
async fn drain(framed: &mut IpcFramed) {
    while let Some(Ok(_)) = framed.next().await {}
}

async fn read_sasl_message(
    framed: &mut IpcFramed,
) -> Result<RpcSaslProto, Error> {
    let mut frame = next_frame(framed).await?;
    let header: RpcRequestHeaderProto = frame.next_message()?;
    if header.call_id != ReservedCallId::Sasl.id() {
        return Err(Error::framing(format!(
            "expected SASL message, got call id {}",
            header.call_id
        )));
    }
    frame.next_message()
}

fn expect_state(message: &RpcSaslProto, state: SaslState) -> Result<(), Error> {
    if message.state != state as i32 {
        return Err(AuthError::UnexpectedState {
            expected: state.as_str_name(),
            actual: message.state.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Server half of the SASL exchange. Returns the identifier of the token the
/// client authenticated with.
async fn negotiate_sasl(
    framed: &mut IpcFramed,
    auth: &ServerAuth,
    log: &Logger,
) -> Result<Vec<u8>, Error> {
    let negotiate = read_sasl_message(framed).await?;
    expect_state(&negotiate, SaslState::Negotiate)?;

    let secrets = match auth {
        ServerAuth::Token(secrets) => secrets,
        ServerAuth::Simple => {
            let offer = RpcSaslProto {
                state: SaslState::Negotiate as i32,
                auths: vec![SaslAuth {
                    method: String::from("SIMPLE"),
                    mechanism: String::new(),
                    ..Default::default()
                }],
                ..Default::default()
            };
            framed.send(sasl_frame(&offer)).await?;
            drain(framed).await;
            return Err(AuthError::UnsupportedMechanism {
                method: String::from("SIMPLE"),
                mechanism: String::new(),
            }
            .into());
        }
    };

    let challenge = DigestChallenge::new(digest::DEFAULT_REALM, digest::new_nonce());
    let offer = RpcSaslProto {
        state: SaslState::Negotiate as i32,
        auths: vec![SaslAuth {
            method: String::from(TOKEN_METHOD),
            mechanism: String::from(digest::MECHANISM),
            protocol: Some(secrets.protocol.clone()),
            server_id: Some(secrets.server_id.clone()),
            challenge: Some(challenge.encode()),
        }],
        ..Default::default()
    };
    framed.send(sasl_frame(&offer)).await?;

    let initiate = read_sasl_message(framed).await?;
    expect_state(&initiate, SaslState::Initiate)?;

    match verify_initiate(&initiate, &challenge, secrets) {
        Ok(identifier) => {
            let success = RpcSaslProto {
                state: SaslState::Success as i32,
                ..Default::default()
            };
            framed.send(sasl_frame(&success)).await?;
            debug!(log, "SASL negotiation complete");
            Ok(identifier)
        }
        Err(e) => {
            let mut exception =
                RemoteException::new(SASL_EXCEPTION, &e.to_string());
            exception.code = RpcErrorCodeProto::FatalUnauthorized;
            framed.send(setup_error_frame(&exception)).await?;
            drain(framed).await;
            Err(e)
        }
    }
}

fn verify_initiate(
    initiate: &RpcSaslProto,
    challenge: &DigestChallenge,
    secrets: &TokenSecretManager,
) -> Result<Vec<u8>, Error> {
    let fail = |msg: &str| Error::Auth(AuthError::Digest(msg.to_string()));

    let raw = initiate
        .token
        .as_deref()
        .ok_or_else(|| fail("INITIATE carries no response"))?;
    let response = DigestResponse::parse(raw)?;
    if response.nonce != challenge.nonce {
        return Err(fail("nonce does not match challenge"));
    }
    let expected_uri = digest::digest_uri(&secrets.protocol, &secrets.server_id);
    if response.digest_uri != expected_uri {
        return Err(fail("digest-uri does not name this server"));
    }

    let identifier = digest::decode_identifier(&response.username)?;
    let password = secrets
        .password(&identifier)
        .ok_or_else(|| fail("token is not known to this server"))?;
    if !response.verify(&digest::encode_password(password)) {
        return Err(fail("DIGEST-MD5 response does not match"));
    }
    Ok(identifier)
}

async fn serve<F>(
    mut socket: TcpStream,
    auth: &ServerAuth,
    handler: F,
    log: &Logger,
) -> Result<(), Error>
where
    F: Fn(&IncomingCall, &Logger) -> Result<Vec<u8>, RemoteException>,
{
    let mut preamble = [0u8; CONNECTION_HEADER_LEN];
    socket.read_exact(&mut preamble).await?;
    let header = ConnectionHeader::parse(&preamble)?;
    debug!(log, "connection header"; "auth" => format!("{:?}", header.auth_protocol));

    let mut framed = Framed::new(socket, IpcRpc::default());

    let token_identifier = match (header.auth_protocol, auth) {
        (AuthProtocol::Sasl, _) => {
            Some(negotiate_sasl(&mut framed, auth, log).await?)
        }
        (AuthProtocol::None, ServerAuth::Token(_)) => {
            let mut exception = RemoteException::new(
                ACCESS_CONTROL_EXCEPTION,
                "SIMPLE authentication is not enabled.  Available:[TOKEN]",
            );
            exception.code = RpcErrorCodeProto::FatalUnauthorized;
            framed.send(setup_error_frame(&exception)).await?;
            drain(&mut framed).await;
            return Err(AuthError::UnsupportedMechanism {
                method: String::from("SIMPLE"),
                mechanism: String::new(),
            }
            .into());
        }
        (AuthProtocol::None, ServerAuth::Simple) => None,
    };

    let mut frame = next_frame(&mut framed).await?;
    let context_header: RpcRequestHeaderProto = frame.next_message()?;
    if context_header.call_id != ReservedCallId::ConnectionContext.id() {
        return Err(Error::framing(format!(
            "expected connection context, got call id {}",
            context_header.call_id
        )));
    }
    let context: IpcConnectionContextProto = frame.next_message()?;
    let user = context.user_info.and_then(|u| u.effective_user);
    debug!(log, "connection context";
        "protocol" => context.protocol.unwrap_or_default(),
        "user" => user.clone().unwrap_or_default());

    while let Some(frame) = framed.next().await {
        let mut frame = frame?;
        let rpc_header: RpcRequestHeaderProto = frame.next_message()?;
        if rpc_header.call_id < 0 {
            if rpc_header.call_id == ReservedCallId::Ping.id() {
                continue;
            }
            return Err(Error::framing(format!(
                "unexpected control call id {}",
                rpc_header.call_id
            )));
        }
        let call = IncomingCall {
            call_id: rpc_header.call_id,
            client_id: rpc_header.client_id,
            retry_count: rpc_header.retry_count.unwrap_or(-1),
            procedure: frame.next_message()?,
            payload: frame.next_block()?,
            user: user.clone(),
            token_identifier: token_identifier.clone(),
        };
        debug!(log, "handling call"; "call_id" => call.call_id, "method" => call.method_name());

        let reply = match handler(&call, log) {
            Ok(payload) => success_frame(
                call.call_id,
                &call.client_id,
                call.retry_count,
                payload,
            ),
            Err(exception) => {
                debug!(log, "call raised"; "class" => &exception.class_name);
                error_frame(
                    call.call_id,
                    &call.client_id,
                    call.retry_count,
                    &exception,
                )
            }
        };
        framed.send(reply).await?;
    }

    Ok(())
}

/// Serve one accepted connection until the client hangs up.
pub async fn make_task<F>(
    socket: TcpStream,
    auth: Arc<ServerAuth>,
    handler: F,
    log: Option<&Logger>,
) where
    F: Fn(&IncomingCall, &Logger) -> Result<Vec<u8>, RemoteException>
        + Send
        + Sync,
{
    let peer = socket
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| String::from("unknown"));
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
        .new(o!("peer" => peer));

    match serve(socket, &auth, handler, &log).await {
        Ok(()) => info!(log, "connection closed"),
        Err(e) => warn!(log, "connection failed"; "err" => %e),
    }
}
