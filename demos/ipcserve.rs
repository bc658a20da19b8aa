// Copyright 2020 Joyent, Inc.

use std::env;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use slog::{debug, error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use hadoop_ipc::security::Credentials;
use hadoop_ipc::server::{
    self, IncomingCall, RemoteException, ServerAuth, TokenSecretManager,
};

static PROTOCOL: &'static str = "org.example.DemoProtocolPB";

#[derive(Clone, PartialEq, prost::Message)]
struct DateResponseProto {
    #[prost(uint64, required, tag = "1")]
    timestamp_ms: u64,
}

fn date_handler(
    _call: &IncomingCall,
    log: &Logger,
) -> Result<Vec<u8>, RemoteException> {
    debug!(log, "handling date request");
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| RemoteException::io(&e.to_string()))?;
    let response = DateResponseProto {
        timestamp_ms: now.as_millis() as u64,
    };
    Ok(prost::Message::encode_to_vec(&response))
}

fn echo_handler(
    call: &IncomingCall,
    log: &Logger,
) -> Result<Vec<u8>, RemoteException> {
    debug!(log, "handling echo request"; "bytes" => call.payload.len());
    Ok(call.payload.to_vec())
}

fn msg_handler(
    call: &IncomingCall,
    log: &Logger,
) -> Result<Vec<u8>, RemoteException> {
    match call.method_name() {
        "date" => date_handler(call, log),
        "echo" => echo_handler(call, log),
        other => Err(RemoteException::no_such_method(other)),
    }
}

/// With a token file, only callers holding one of its tokens are admitted.
fn server_auth(token_file: Option<String>, log: &Logger) -> ServerAuth {
    let path = match token_file {
        Some(path) => path,
        None => return ServerAuth::Simple,
    };
    match Credentials::read_token_storage_file(&path) {
        Ok(credentials) => {
            let mut secrets = TokenSecretManager::new(PROTOCOL);
            for (alias, token) in credentials.tokens() {
                debug!(log, "accepting token"; "alias" => alias, "kind" => &token.kind);
                secrets.add_token(token);
            }
            ServerAuth::Token(secrets)
        }
        Err(e) => {
            error!(log, "failed to load tokens"; "path" => path, "err" => %e);
            std::process::exit(1)
        }
    }
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = env::args().nth(1).unwrap_or("127.0.0.1:8032".to_string());
    let addr = addr.parse::<SocketAddr>().unwrap();
    let auth = Arc::new(server_auth(env::args().nth(2), &root_log));

    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    info!(root_log, "listening for ipc requests"; "address" => addr);

    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                let process_log = root_log.clone();
                let auth = Arc::clone(&auth);
                tokio::spawn(async move {
                    server::make_task(socket, auth, msg_handler, Some(&process_log))
                        .await;
                });
            }
            Err(e) => error!(root_log, "failed to accept socket"; "err" => %e),
        }
    }
}
