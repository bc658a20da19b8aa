// Copyright 2020 Joyent, Inc.

//! Client half of the SASL exchange that runs after the connection header
//! when the caller holds a token for the server.
//!
//! Two round trips: NEGOTIATE (server lists its mechanisms) then INITIATE
//! (client answers the DIGEST-MD5 challenge), after which the server must
//! report SUCCESS. Only TOKEN/DIGEST-MD5 as the first offered mechanism is
//! accepted.

use std::convert::TryFrom;

use slog::{debug, Logger};

use crate::connection::Connection;
use crate::error::{AuthError, Error};
use crate::proto::rpc_sasl_proto::{SaslAuth, SaslState};
use crate::proto::{RpcSaslProto, TokenProto};
use crate::protocol::{
    request_header, ReservedCallId, RpcFrame, DUMMY_CLIENT_ID,
    INVALID_RETRY_COUNT,
};
use crate::security::digest;
use crate::security::TokenStore;

pub const TOKEN_METHOD: &str = "TOKEN";

fn state_name(state: i32) -> String {
    SaslState::try_from(state)
        .map(|s| String::from(s.as_str_name()))
        .unwrap_or_else(|_| format!("UNKNOWN({})", state))
}

/// The exchange without any I/O: feed it each server reply, send whatever it
/// hands back.
pub struct SaslExchange<'a> {
    state: SaslState,
    store: &'a dyn TokenStore,
    token: &'a TokenProto,
}

impl<'a> SaslExchange<'a> {
    pub fn new(store: &'a dyn TokenStore, token: &'a TokenProto) -> Self {
        SaslExchange {
            state: SaslState::Negotiate,
            store,
            token,
        }
    }

    pub fn state(&self) -> SaslState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == SaslState::Success
    }

    pub fn initial_message(&self) -> RpcSaslProto {
        RpcSaslProto {
            state: SaslState::Negotiate as i32,
            ..Default::default()
        }
    }

    /// Advance on a server reply. Returns the next message to send, or
    /// `None` once the server has reported SUCCESS.
    pub fn step(
        &mut self,
        reply: &RpcSaslProto,
    ) -> Result<Option<RpcSaslProto>, Error> {
        match self.state {
            SaslState::Negotiate => {
                let auth = select_auth(&reply.auths)?;
                let initiate = self.initiate(auth)?;
                self.state = SaslState::Initiate;
                Ok(Some(initiate))
            }
            SaslState::Initiate => {
                if reply.state != SaslState::Success as i32 {
                    return Err(AuthError::UnexpectedState {
                        expected: SaslState::Success.as_str_name(),
                        actual: state_name(reply.state),
                    }
                    .into());
                }
                self.state = SaslState::Success;
                Ok(None)
            }
            other => Err(AuthError::UnexpectedState {
                expected: SaslState::Negotiate.as_str_name(),
                actual: String::from(other.as_str_name()),
            }
            .into()),
        }
    }

    fn initiate(&self, auth: &SaslAuth) -> Result<RpcSaslProto, Error> {
        let protocol = auth.protocol.clone().unwrap_or_default();
        let server_id = auth.server_id.clone().unwrap_or_default();
        let challenge = auth.challenge.as_deref().unwrap_or(&[]);

        let response = self.store.digest_challenge_response(
            &protocol, &server_id, challenge, self.token,
        )?;

        Ok(RpcSaslProto {
            state: SaslState::Initiate as i32,
            token: Some(response),
            auths: vec![SaslAuth {
                method: auth.method.clone(),
                mechanism: auth.mechanism.clone(),
                protocol: Some(protocol),
                server_id: Some(server_id),
                challenge: None,
            }],
            ..Default::default()
        })
    }
}

/// Only the first offered mechanism is considered.
pub fn select_auth(auths: &[SaslAuth]) -> Result<&SaslAuth, AuthError> {
    let auth = auths.first().ok_or(AuthError::NoMechanisms)?;
    if auth.method != TOKEN_METHOD || auth.mechanism != digest::MECHANISM {
        return Err(AuthError::UnsupportedMechanism {
            method: auth.method.clone(),
            mechanism: auth.mechanism.clone(),
        });
    }
    Ok(auth)
}

fn send_sasl_message(
    conn: &mut Connection,
    message: &RpcSaslProto,
) -> Result<(), Error> {
    let header = request_header(
        ReservedCallId::Sasl.id(),
        DUMMY_CLIENT_ID,
        INVALID_RETRY_COUNT,
    );
    conn.send_frame(&RpcFrame::new().message(&header).message(message))
}

fn receive_sasl_message(conn: &mut Connection) -> Result<RpcSaslProto, Error> {
    let mut reader =
        conn.read_response(ReservedCallId::Sasl.id(), DUMMY_CLIENT_ID)?;
    reader.next_message()
}

pub fn negotiate(
    conn: &mut Connection,
    store: &dyn TokenStore,
    token: &TokenProto,
    log: &Logger,
) -> Result<(), Error> {
    let mut exchange = SaslExchange::new(store, token);
    let mut outgoing = Some(exchange.initial_message());

    while let Some(message) = outgoing {
        debug!(log, "sending SASL message"; "state" => state_name(message.state));
        send_sasl_message(conn, &message)?;
        let reply = receive_sasl_message(conn)?;
        debug!(log, "received SASL reply"; "state" => state_name(reply.state),
            "auths" => reply.auths.len());
        outgoing = exchange.step(&reply)?;
    }

    debug!(log, "SASL negotiation complete");
    Ok(())
}
