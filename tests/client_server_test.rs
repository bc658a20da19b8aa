// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use slog::{debug, info, o, Drain, Level, LevelFilter, Logger};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_test::block_on;
use tokio_util::codec::Framed;

use hadoop_ipc::proto::{
    IpcConnectionContextProto, RequestHeaderProto, RpcResponseHeaderProto,
    TokenProto, UserInformationProto,
};
use hadoop_ipc::protocol::{
    self, AuthProtocol, ConnectionHeader, IpcRpc, ReservedCallId, RpcFrame,
};
use hadoop_ipc::server::{
    self, IncomingCall, RemoteException, ServerAuth, TokenSecretManager,
};
use hadoop_ipc::{AuthError, Client, ClientConfig, Error, User};

const ECHO_PROTOCOL: &str = "org.example.EchoProtocolPB";

#[derive(Clone, PartialEq, prost::Message)]
struct EchoRequestProto {
    #[prost(string, optional, tag = "1")]
    message: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct EchoResponseProto {
    #[prost(string, optional, tag = "1")]
    message: Option<String>,
}

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn echo_handler(
    call: &IncomingCall,
    log: &Logger,
) -> Result<Vec<u8>, RemoteException> {
    debug!(log, "handling echo request");
    let request: EchoRequestProto = call.decode_request()?;
    let response = EchoResponseProto {
        message: request.message,
    };
    Ok(prost::Message::encode_to_vec(&response))
}

fn msg_handler(
    call: &IncomingCall,
    log: &Logger,
) -> Result<Vec<u8>, RemoteException> {
    match call.method_name() {
        "echo" => echo_handler(call, log),
        "whoami" => {
            let response = EchoResponseProto {
                message: call.user.clone(),
            };
            Ok(prost::Message::encode_to_vec(&response))
        }
        "fail" => Err(RemoteException::io("requested failure")),
        other => Err(RemoteException::no_such_method(other)),
    }
}

#[tokio::main]
async fn run_server(auth: ServerAuth, addr_tx: mpsc::Sender<SocketAddr>) {
    let root_log = test_log();
    let auth = Arc::new(auth);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("no local address");
    info!(root_log, "listening for ipc requests"; "address" => addr);

    addr_tx.send(addr).expect("test went away");

    while let Ok((stream, _)) = listener.accept().await {
        let process_log = root_log.clone();
        let auth = Arc::clone(&auth);
        tokio::spawn(async move {
            server::make_task(stream, auth, msg_handler, Some(&process_log))
                .await;
        });
    }
}

fn start_server(auth: ServerAuth) -> String {
    let (tx, rx) = mpsc::channel();
    let _h_server = thread::spawn(move || run_server(auth, tx));
    rx.recv().expect("server failed to start").to_string()
}

fn token_for(address: &str) -> TokenProto {
    TokenProto {
        identifier: b"container_1_0001_01_000001".to_vec(),
        password: b"nm-master-key".to_vec(),
        kind: "NMToken".into(),
        service: address.into(),
    }
}

fn token_server() -> (String, TokenProto) {
    // The token's service has to name the address, which is only known
    // once the server is bound, so the secret manager keys by identifier.
    let mut secrets = TokenSecretManager::new(ECHO_PROTOCOL);
    secrets.add_token(&token_for(""));
    let address = start_server(ServerAuth::Token(secrets));
    let token = token_for(&address);
    (address, token)
}

fn procedure(method: &str) -> RequestHeaderProto {
    RequestHeaderProto {
        method_name: method.into(),
        declaring_class_protocol_name: ECHO_PROTOCOL.into(),
        client_protocol_version: 1,
    }
}

fn echo_request(message: &str) -> EchoRequestProto {
    EchoRequestProto {
        message: Some(message.into()),
    }
}

fn client(address: &str, user: User) -> Client {
    Client::new(ClientConfig::new(address), Arc::new(user), Some(&test_log()))
}

#[test]
fn simple_auth_round_trip() {
    let address = start_server(ServerAuth::Simple);
    let client = client(&address, User::new("alice"));

    for i in 1..20 {
        let message = "a".repeat(i * 1000);
        let mut response = EchoResponseProto::default();
        client
            .call(&procedure("echo"), &echo_request(&message), &mut response)
            .expect("echo call failed");
        assert_eq!(response.message, Some(message));
    }

    let mut response = EchoResponseProto::default();
    client
        .call(&procedure("whoami"), &echo_request(""), &mut response)
        .expect("whoami call failed");
    assert_eq!(response.message.as_deref(), Some("alice"));
}

#[test]
fn token_auth_round_trip() {
    let (address, token) = token_server();
    let mut user = User::new("alice");
    user.add_token(&address, token);
    let client = client(&address, user);

    let mut response = EchoResponseProto::default();
    client
        .call(&procedure("echo"), &echo_request("over sasl"), &mut response)
        .expect("echo call failed");
    assert_eq!(response.message.as_deref(), Some("over sasl"));

    // The SASL exchange establishes the user, so the context carries none.
    let mut response = EchoResponseProto::default();
    client
        .call(&procedure("whoami"), &echo_request(""), &mut response)
        .expect("whoami call failed");
    assert_eq!(response.message, None);
}

#[test]
fn bad_token_password_is_rejected() {
    let (address, mut token) = token_server();
    token.password = b"not-the-key".to_vec();
    let mut user = User::new("alice");
    user.add_token(&address, token);
    let client = client(&address, user);

    let mut response = EchoResponseProto::default();
    match client.call(&procedure("echo"), &echo_request("x"), &mut response) {
        Err(Error::Remote(remote)) => {
            assert_eq!(remote.status, "FATAL");
            assert_eq!(
                remote.exception_class_name.as_deref(),
                Some(server::SASL_EXCEPTION)
            );
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(response, EchoResponseProto::default());
}

#[test]
fn missing_token_is_rejected_by_token_server() {
    let (address, _) = token_server();
    let client = client(&address, User::new("alice"));

    let mut response = EchoResponseProto::default();
    match client.call(&procedure("echo"), &echo_request("x"), &mut response) {
        Err(Error::Remote(remote)) => {
            assert_eq!(remote.status, "FATAL");
            assert_eq!(
                remote.exception_class_name.as_deref(),
                Some(server::ACCESS_CONTROL_EXCEPTION)
            );
            assert_eq!(remote.error_detail.as_deref(), Some("FATAL_UNAUTHORIZED"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn token_for_simple_server_fails_negotiation() {
    let address = start_server(ServerAuth::Simple);
    let mut user = User::new("alice");
    user.add_token(&address, token_for(&address));
    let client = client(&address, user);

    let mut response = EchoResponseProto::default();
    match client.call(&procedure("echo"), &echo_request("x"), &mut response) {
        Err(Error::Auth(AuthError::UnsupportedMechanism { method, .. })) => {
            assert_eq!(method, "SIMPLE")
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn remote_error_leaves_response_untouched() {
    let address = start_server(ServerAuth::Simple);
    let client = client(&address, User::new("alice"));

    let mut response = EchoResponseProto {
        message: Some(String::from("unchanged")),
    };
    let err = client
        .call(&procedure("fail"), &echo_request("x"), &mut response)
        .expect_err("fail call succeeded");
    assert!(err.is_remote());
    assert_eq!(
        err.to_string(),
        "ERROR:java.io.IOException:requested failure:ERROR_APPLICATION"
    );
    assert_eq!(response.message.as_deref(), Some("unchanged"));

    match client.call(&procedure("frobnicate"), &echo_request("x"), &mut response) {
        Err(Error::Remote(remote)) => {
            assert_eq!(remote.error_detail.as_deref(), Some("ERROR_NO_SUCH_METHOD"))
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

async fn raw_client(address: &str) -> Result<EchoResponseProto, Error> {
    let mut stream = TcpStream::connect(address).await?;
    let mut header = BytesMut::new();
    ConnectionHeader::new(AuthProtocol::None).encode(&mut header);
    stream.write_all(&header).await?;

    let client_id = [7u8; protocol::CLIENT_ID_LEN];
    let mut framed = Framed::new(stream, IpcRpc::default());

    let context = IpcConnectionContextProto {
        user_info: Some(UserInformationProto {
            effective_user: Some("bob".into()),
            real_user: None,
        }),
        protocol: Some(ECHO_PROTOCOL.into()),
    };
    let context_header = protocol::request_header(
        ReservedCallId::ConnectionContext.id(),
        &client_id,
        protocol::INVALID_RETRY_COUNT,
    );
    framed
        .send(RpcFrame::new().message(&context_header).message(&context))
        .await?;

    // Pings get no reply.
    let ping = protocol::request_header(
        ReservedCallId::Ping.id(),
        &client_id,
        protocol::INVALID_RETRY_COUNT,
    );
    framed.send(RpcFrame::new().message(&ping)).await?;

    let call_header = protocol::request_header(42, &client_id, 0);
    framed
        .send(
            RpcFrame::new()
                .message(&call_header)
                .message(&procedure("echo"))
                .message(&echo_request("after ping")),
        )
        .await?;

    let mut reply = framed
        .next()
        .await
        .ok_or_else(|| Error::framing("server hung up"))??;
    let header: RpcResponseHeaderProto = reply.next_message()?;
    assert_eq!(header.call_id, 42);
    assert_eq!(header.client_id, Some(client_id.to_vec()));
    assert_eq!(header.retry_count, Some(0));
    assert_eq!(header.server_ipc_version_num, Some(9));
    reply.next_message()
}

#[test]
fn server_skips_pings() {
    let address = start_server(ServerAuth::Simple);
    let response = block_on(raw_client(&address)).expect("raw call failed");
    assert_eq!(response.message.as_deref(), Some("after ping"));
}
