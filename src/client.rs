// Copyright 2020 Joyent, Inc.

//! The synchronous IPC client. Every call opens its own connection, runs
//! connection setup, sends one request, reads one response and closes the
//! connection again, whatever the outcome.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use slog::{debug, o, warn, Drain, Logger};

use crate::connection::{
    self, Connection, ConnectionOptions, ConnectionTarget,
};
use crate::error::Error;
use crate::proto::RequestHeaderProto;
use crate::protocol::{self, RpcFrame, CLIENT_ID_LEN, DEFAULT_MAX_FRAME_LENGTH};
use crate::security::TokenStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_address: String,
    pub tcp_no_delay: bool,
    pub connect_timeout_ms: u64,
    pub rw_timeout_ms: u64,
    pub max_response_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_address: String::from("127.0.0.1:8032"),
            tcp_no_delay: true,
            connect_timeout_ms: 10_000,
            rw_timeout_ms: 5_000,
            max_response_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn new(server_address: &str) -> ClientConfig {
        ClientConfig {
            server_address: server_address.to_string(),
            ..ClientConfig::default()
        }
    }

    pub fn from_json(json: &str) -> Result<ClientConfig, Error> {
        let config: ClientConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.server_address.is_empty() {
            return Err(Error::Config(String::from("server_address is empty")));
        }
        if self.connect_timeout_ms == 0 || self.rw_timeout_ms == 0 {
            return Err(Error::Config(String::from(
                "timeouts must be greater than zero",
            )));
        }
        Ok(())
    }

    pub fn with_tcp_no_delay(mut self, tcp_no_delay: bool) -> Self {
        self.tcp_no_delay = tcp_no_delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_rw_timeout(mut self, timeout: Duration) -> Self {
        self.rw_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_response_length(mut self, length: usize) -> Self {
        self.max_response_length = length;
        self
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            rw_timeout: Duration::from_millis(self.rw_timeout_ms),
            tcp_no_delay: self.tcp_no_delay,
            max_frame_length: self.max_response_length,
        }
    }
}

/// A random (version 4 UUID) client id.
pub fn new_client_id() -> [u8; CLIENT_ID_LEN] {
    let mut id = [0u8; CLIENT_ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    id[6] = (id[6] & 0x0f) | 0x40;
    id[8] = (id[8] & 0x3f) | 0x80;
    id
}

/// One request/response exchange.
struct RpcCall<'a, Req> {
    id: i32,
    retry_count: i32,
    procedure: &'a RequestHeaderProto,
    request: &'a Req,
}

pub struct Client {
    client_id: [u8; CLIENT_ID_LEN],
    config: ClientConfig,
    store: Arc<dyn TokenStore>,
    next_call_id: AtomicI32,
    log: Logger,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<clientId:{}, server:{}>",
            hex::encode(self.client_id),
            self.config.server_address
        )
    }
}

impl Client {
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn TokenStore>,
        log: Option<&Logger>,
    ) -> Client {
        let client_id = new_client_id();
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!(
                "server" => config.server_address.clone(),
                "client_id" => hex::encode(client_id)
            ));

        Client {
            client_id,
            config,
            store,
            next_call_id: AtomicI32::new(0),
            log,
        }
    }

    pub fn client_id(&self) -> &[u8] {
        &self.client_id
    }

    pub fn server_address(&self) -> &str {
        &self.config.server_address
    }

    /// Ids for ordinary calls stay in the non-negative range, disjoint from
    /// the reserved control ids.
    fn next_call_id(&self) -> i32 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed) & i32::MAX
    }

    /// Invoke `procedure` with `request`, decoding the reply into
    /// `response`. `response` is only written when the call succeeds.
    pub fn call<Req, Resp>(
        &self,
        procedure: &RequestHeaderProto,
        request: &Req,
        response: &mut Resp,
    ) -> Result<(), Error>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let user = self.store.current_user();
        let target = ConnectionTarget {
            user: user.effective_user.unwrap_or_default(),
            protocol: procedure.declaring_class_protocol_name.clone(),
            address: self.config.server_address.clone(),
            client_id: self.client_id,
        };
        let call = RpcCall {
            id: self.next_call_id(),
            retry_count: 0,
            procedure,
            request,
        };
        let log = self.log.new(o!(
            "call_id" => call.id,
            "method" => procedure.method_name.clone()
        ));

        debug!(log, "connecting"; "protocol" => &target.protocol);
        let mut conn = Connection::open(
            &target.address,
            self.config.connection_options(),
            &log,
        )?;

        let result = connection::handshake(&mut conn, &target, &*self.store)
            .and_then(|_| self.send_request(&mut conn, &call))
            .and_then(|_| self.read_response(&mut conn, &call));

        conn.close();

        match result {
            Ok(decoded) => {
                *response = decoded;
                debug!(log, "call complete");
                Ok(())
            }
            Err(e) => {
                if e.is_remote() {
                    debug!(log, "call returned remote error"; "err" => %e);
                } else {
                    warn!(log, "call failed"; "err" => %e);
                }
                Err(e)
            }
        }
    }

    fn send_request<Req: Message>(
        &self,
        conn: &mut Connection,
        call: &RpcCall<'_, Req>,
    ) -> Result<(), Error> {
        let header =
            protocol::request_header(call.id, &self.client_id, call.retry_count);
        let frame = RpcFrame::new()
            .message(&header)
            .message(call.procedure)
            .message(call.request);
        conn.send_frame(&frame)
    }

    fn read_response<Req, Resp: Message + Default>(
        &self,
        conn: &mut Connection,
        call: &RpcCall<'_, Req>,
    ) -> Result<Resp, Error> {
        let mut reader = conn.read_response(call.id, &self.client_id)?;
        reader.next_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::security::User;

    #[test]
    fn config_defaults_and_json() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.rw_timeout_ms, 5_000);
        assert!(config.tcp_no_delay);

        let config = ClientConfig::from_json(
            r#"{"server_address": "nm1:8041", "tcp_no_delay": false}"#,
        )
        .unwrap();
        assert_eq!(config.server_address, "nm1:8041");
        assert!(!config.tcp_no_delay);
        assert_eq!(config.rw_timeout_ms, 5_000);

        assert!(ClientConfig::from_json(r#"{"rw_timeout_ms": 0}"#).is_err());
        assert!(ClientConfig::from_json("not json").is_err());
    }

    #[test]
    fn client_ids_are_uuid_v4() {
        let a = new_client_id();
        let b = new_client_id();
        assert_ne!(a, b);
        assert_eq!(a[6] >> 4, 4);
        assert_eq!(a[8] >> 6, 2);
    }

    #[test]
    fn call_ids_never_collide_with_reserved() {
        let client = Client::new(
            ClientConfig::default(),
            Arc::new(User::new("alice")),
            None,
        );
        assert_eq!(client.next_call_id(), 0);
        assert_eq!(client.next_call_id(), 1);

        client.next_call_id.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(client.next_call_id(), i32::MAX);
        // wrapped
        assert_eq!(client.next_call_id(), 0);
    }

    #[test]
    fn connect_error_on_refused_address() {
        let config = ClientConfig::new("127.0.0.1:1")
            .with_connect_timeout(Duration::from_millis(500));
        let client = Client::new(config, Arc::new(User::new("alice")), None);
        let procedure = RequestHeaderProto {
            method_name: "ping".into(),
            declaring_class_protocol_name: "test.Protocol".into(),
            client_protocol_version: 1,
        };
        let mut response = ();
        match client.call(&procedure, &(), &mut response) {
            Err(Error::Connect { address, .. }) => {
                assert_eq!(address, "127.0.0.1:1")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
