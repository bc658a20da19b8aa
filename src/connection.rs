// Copyright 2020 Joyent, Inc.

//! A single blocking TCP connection to one IPC server, and the connection
//! setup that runs on it before any call: connection header, optional SASL
//! exchange, connection context.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use slog::{debug, o, trace, warn, Logger};

use crate::error::{Error, RemoteError};
use crate::proto::rpc_response_header_proto::RpcStatusProto;
use crate::proto::{
    IpcConnectionContextProto, RpcResponseHeaderProto, UserInformationProto,
};
use crate::protocol::{
    self, AuthProtocol, ConnectionHeader, FrameReader, ReservedCallId,
    RpcFrame, CLIENT_ID_LEN, INVALID_RETRY_COUNT,
};
use crate::sasl;
use crate::security::TokenStore;

/// Identity of a logical connection: who is calling which protocol on which
/// server. Connections are not pooled, so this only names the connection in
/// logs and in the connection context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionTarget {
    pub user: String,
    pub protocol: String,
    pub address: String,
    pub client_id: [u8; CLIENT_ID_LEN],
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub rw_timeout: Duration,
    pub tcp_no_delay: bool,
    pub max_frame_length: usize,
}

pub struct Connection {
    stream: TcpStream,
    options: ConnectionOptions,
    closed: bool,
    log: Logger,
}

impl Connection {
    pub fn open(
        address: &str,
        options: ConnectionOptions,
        log: &Logger,
    ) -> Result<Connection, Error> {
        let connect_error = |source| Error::Connect {
            address: address.to_string(),
            source,
        };

        let addrs: Vec<SocketAddr> =
            address.to_socket_addrs().map_err(connect_error)?.collect();

        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, options.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!(log, "connect attempt failed"; "addr" => %addr, "err" => %e);
                    last_err = Some(e);
                }
            }
        }

        let stream = match (stream, last_err) {
            (Some(s), _) => s,
            (None, Some(e)) => return Err(connect_error(e)),
            (None, None) => {
                return Err(connect_error(io::Error::new(
                    io::ErrorKind::NotFound,
                    "address resolved to nothing",
                )))
            }
        };
        stream.set_nodelay(options.tcp_no_delay)?;

        let log = log.new(o!("address" => address.to_string()));
        debug!(log, "connected"; "tcp_no_delay" => options.tcp_no_delay);

        Ok(Connection {
            stream,
            options,
            closed: false,
            log,
        })
    }

    /// Deadline for one read or write phase, fixed when the phase starts.
    fn deadline(&self) -> Instant {
        Instant::now() + self.options.rw_timeout
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        let deadline = self.deadline();
        let mut written = 0;
        while written < buf.len() {
            self.stream.set_write_timeout(Some(remaining(deadline)?))?;
            match self.stream.write(&buf[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed while writing",
                    )
                    .into())
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) if is_timeout(&e) => return Err(timed_out().into()),
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Fill `buf` before `deadline`. A peer that closes early surfaces as an
    /// I/O error, never as a partial read.
    fn read_exact_by(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            self.stream.set_read_timeout(Some(remaining(deadline)?))?;
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    )
                    .into())
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) if is_timeout(&e) => return Err(timed_out().into()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn send_frame(&mut self, frame: &RpcFrame) -> Result<(), Error> {
        let buf = frame.to_bytes()?;
        trace!(self.log, "sending frame"; "length" => buf.len() - 4);
        self.write_all(&buf)
    }

    /// Read one whole frame: the length prefix and the body are each a
    /// phase with their own deadline.
    pub fn read_frame(&mut self) -> Result<FrameReader, Error> {
        let mut prefix = [0u8; 4];
        let deadline = self.deadline();
        self.read_exact_by(&mut prefix, deadline)?;
        let length =
            protocol::parse_frame_length(&prefix, self.options.max_frame_length)?;

        let mut body = vec![0u8; length];
        let deadline = self.deadline();
        self.read_exact_by(&mut body, deadline)?;
        trace!(self.log, "received frame"; "length" => length);

        Ok(FrameReader::new(Bytes::from(body)))
    }

    /// Read a response frame and check its header against the call it
    /// answers. On success the reader is left at the response payload.
    pub fn read_response(
        &mut self,
        call_id: i32,
        client_id: &[u8],
    ) -> Result<FrameReader, Error> {
        let mut reader = self.read_frame()?;
        let header: RpcResponseHeaderProto = reader.next_message()?;
        if let Err(e) = check_response_header(&header, call_id, client_id) {
            if let Error::Remote(remote) = &e {
                debug!(self.log, "call failed on server";
                    "call_id" => header.call_id as i32, "status" => %remote.status);
            }
            return Err(e);
        }
        Ok(reader)
    }

    /// Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.stream.shutdown(Shutdown::Both) {
                trace!(self.log, "shutdown failed"; "err" => %e);
            }
            debug!(self.log, "connection closed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn remaining(deadline: Instant) -> Result<Duration, Error> {
    match deadline.checked_duration_since(Instant::now()) {
        Some(left) if left > Duration::from_millis(0) => Ok(left),
        _ => Err(timed_out().into()),
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "IPC deadline expired")
}

fn is_timeout(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut
}

/// A response is only trusted if it names the client that sent the request.
/// An absent client id is tolerated. An empty one only on a failure reply,
/// since servers reject connection setup under the dummy id.
pub fn check_client_id(
    header: &RpcResponseHeaderProto,
    client_id: &[u8],
) -> Result<(), Error> {
    if let Some(actual) = &header.client_id {
        let setup_failure = actual.is_empty()
            && header.status != RpcStatusProto::Success as i32;
        if actual.as_slice() != client_id && !setup_failure {
            return Err(Error::IdentityMismatch {
                expected: client_id.to_vec(),
                actual: actual.clone(),
            });
        }
    }
    Ok(())
}

pub fn check_call_id(
    header: &RpcResponseHeaderProto,
    call_id: i32,
) -> Result<(), Error> {
    // The field is unsigned on the wire; reserved ids come back as their
    // two's complement.
    if header.call_id as i32 != call_id {
        return Err(Error::CallIdMismatch {
            expected: call_id,
            actual: header.call_id as i32,
        });
    }
    Ok(())
}

/// Any non-SUCCESS status from the right client is a remote error, whatever
/// its call id: setup failures arrive under a reserved id rather than the id
/// of the call that was waiting.
pub fn check_response_header(
    header: &RpcResponseHeaderProto,
    call_id: i32,
    client_id: &[u8],
) -> Result<(), Error> {
    check_client_id(header, client_id)?;
    if header.status != RpcStatusProto::Success as i32 {
        return Err(Error::Remote(RemoteError::from_header(header)));
    }
    check_call_id(header, call_id)
}

/// Run connection setup on a freshly opened connection. Returns the auth
/// protocol that was negotiated.
pub fn handshake(
    conn: &mut Connection,
    target: &ConnectionTarget,
    store: &dyn TokenStore,
) -> Result<AuthProtocol, Error> {
    let token = store.token_for_service(&target.address);
    let auth_protocol = match token {
        Some(_) => AuthProtocol::Sasl,
        None => AuthProtocol::None,
    };
    let log = conn.log.new(o!("auth" => format!("{:?}", auth_protocol)));

    let mut header = BytesMut::new();
    ConnectionHeader::new(auth_protocol).encode(&mut header);
    conn.write_all(&header)?;

    if let Some(token) = token {
        debug!(log, "found token for service, negotiating SASL"; "kind" => &token.kind);
        if let Err(e) = sasl::negotiate(conn, store, &token, &log) {
            warn!(log, "SASL negotiation failed"; "err" => %e);
            return Err(e);
        }
    } else {
        debug!(log, "no usable token, proceeding without auth");
    }

    write_connection_context(conn, target, auth_protocol, store)?;
    debug!(log, "connection context sent"; "protocol" => &target.protocol);

    Ok(auth_protocol)
}

fn write_connection_context(
    conn: &mut Connection,
    target: &ConnectionTarget,
    auth_protocol: AuthProtocol,
    store: &dyn TokenStore,
) -> Result<(), Error> {
    // With a token the SASL exchange has already established the user.
    let user_info = match auth_protocol {
        AuthProtocol::None => store.current_user(),
        AuthProtocol::Sasl => UserInformationProto::default(),
    };
    let context = IpcConnectionContextProto {
        user_info: Some(user_info),
        protocol: Some(target.protocol.clone()),
    };
    let header = protocol::request_header(
        ReservedCallId::ConnectionContext.id(),
        &target.client_id,
        INVALID_RETRY_COUNT,
    );

    conn.send_frame(&RpcFrame::new().message(&header).message(&context))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(call_id: u32, client_id: Option<Vec<u8>>) -> RpcResponseHeaderProto {
        RpcResponseHeaderProto {
            call_id,
            status: RpcStatusProto::Success as i32,
            client_id,
            ..Default::default()
        }
    }

    #[test]
    fn response_header_correlation() {
        let id = [3u8; CLIENT_ID_LEN];
        assert!(check_response_header(&header(5, Some(id.to_vec())), 5, &id).is_ok());
        assert!(check_response_header(&header(5, None), 5, &id).is_ok());

        // An empty id on a SUCCESS reply is a foreign client, not an absent one.
        match check_response_header(&header(5, Some(vec![])), 5, &id) {
            Err(Error::IdentityMismatch { actual, .. }) => assert!(actual.is_empty()),
            other => panic!("unexpected result: {:?}", other),
        }

        match check_response_header(&header(5, Some(vec![4u8; 16])), 5, &id) {
            Err(Error::IdentityMismatch { actual, .. }) => {
                assert_eq!(actual, vec![4u8; 16])
            }
            other => panic!("unexpected result: {:?}", other),
        }
        match check_response_header(&header(6, Some(id.to_vec())), 5, &id) {
            Err(Error::CallIdMismatch { expected: 5, actual: 6 }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn reserved_call_id_correlation() {
        let sasl_id = ReservedCallId::Sasl.id();
        let echoed = header(sasl_id as u32, Some(vec![]));
        assert!(check_response_header(&echoed, sasl_id, &[]).is_ok());
        assert!(check_response_header(&echoed, 0, &[]).is_err());
        // Any real client id fails against the SASL dummy id.
        let stray = header(sasl_id as u32, Some(vec![1u8; 16]));
        assert!(check_response_header(&stray, sasl_id, &[]).is_err());
    }

    #[test]
    fn setup_failure_is_remote_error() {
        let id = [3u8; CLIENT_ID_LEN];
        let rejected = RpcResponseHeaderProto {
            call_id: ReservedCallId::AuthorizationFailed.id() as u32,
            status: RpcStatusProto::Fatal as i32,
            client_id: Some(vec![]),
            exception_class_name: Some("javax.security.sasl.SaslException".into()),
            error_msg: Some("DIGEST-MD5: digest response format violation".into()),
            ..Default::default()
        };

        for &(call_id, client_id) in
            &[(ReservedCallId::Sasl.id(), &[][..]), (0, &id[..])]
        {
            match check_response_header(&rejected, call_id, client_id) {
                Err(Error::Remote(remote)) => {
                    assert_eq!(remote.status, "FATAL");
                    assert_eq!(
                        remote.exception_class_name.as_deref(),
                        Some("javax.security.sasl.SaslException")
                    );
                }
                other => panic!("unexpected result: {:?}", other),
            }
        }

        // A failure naming some other client is still an identity error.
        let foreign = RpcResponseHeaderProto {
            client_id: Some(vec![4u8; CLIENT_ID_LEN]),
            ..rejected
        };
        match check_response_header(&foreign, 0, &id) {
            Err(Error::IdentityMismatch { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
