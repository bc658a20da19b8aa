// Copyright 2020 Joyent, Inc.

//! Delegation tokens and secrets, and Hadoop's token storage file format.
//!
//! A token storage file starts with the magic `HDTS` and a format byte:
//!
//! * 0, Writable: a VInt token count, then per token a `Text` alias and the
//!   token (VInt-prefixed identifier and password, `Text` kind and service);
//!   then a VInt secret count and per secret a `Text` alias and VInt-prefixed
//!   bytes.
//! * 1, Protobuf: a length-delimited `CredentialsProto`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;

use crate::error::Error;
use crate::proto::{CredentialsKvProto, CredentialsProto, TokenProto};

pub const TOKEN_STORAGE_MAGIC: &[u8; 4] = b"HDTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    Writable = 0,
    Protobuf = 1,
}

fn storage_error<S: Into<String>>(msg: S) -> Error {
    Error::TokenStorage(msg.into())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials {
    tokens: BTreeMap<String, TokenProto>,
    secrets: BTreeMap<String, Vec<u8>>,
}

impl Credentials {
    pub fn new() -> Credentials {
        Credentials::default()
    }

    pub fn add_token(&mut self, alias: &str, token: TokenProto) {
        self.tokens.insert(alias.to_string(), token);
    }

    pub fn add_secret(&mut self, alias: &str, secret: Vec<u8>) {
        self.secrets.insert(alias.to_string(), secret);
    }

    pub fn token(&self, alias: &str) -> Option<&TokenProto> {
        self.tokens.get(alias)
    }

    pub fn secret(&self, alias: &str) -> Option<&[u8]> {
        self.secrets.get(alias).map(|s| s.as_slice())
    }

    pub fn tokens(&self) -> impl Iterator<Item = (&str, &TokenProto)> {
        self.tokens.iter().map(|(alias, token)| (alias.as_str(), token))
    }

    /// Tokens are normally stored under their service address; fall back to
    /// the token's own service field when the alias differs.
    pub fn token_for_service(&self, service: &str) -> Option<&TokenProto> {
        self.tokens
            .get(service)
            .or_else(|| self.tokens.values().find(|t| t.service == service))
    }

    pub fn read_token_storage_file<P: AsRef<Path>>(
        path: P,
    ) -> Result<Credentials, Error> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|e| {
            storage_error(format!("reading {}: {}", path.display(), e))
        })?;
        Credentials::from_token_storage(&raw)
    }

    pub fn from_token_storage(raw: &[u8]) -> Result<Credentials, Error> {
        if raw.len() < 5 || &raw[0..4] != TOKEN_STORAGE_MAGIC {
            return Err(storage_error("missing HDTS magic"));
        }
        let mut body = &raw[5..];
        match raw[4] {
            0 => read_writable(&mut body),
            1 => read_protobuf(body),
            other => Err(storage_error(format!(
                "unknown token storage format {}",
                other
            ))),
        }
    }

    pub fn to_token_storage(&self, format: StorageFormat) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_slice(TOKEN_STORAGE_MAGIC);
        buf.put_u8(format as u8);
        match format {
            StorageFormat::Writable => self.write_writable(&mut buf),
            StorageFormat::Protobuf => {
                let proto = self.to_proto();
                buf.put_slice(&proto.encode_length_delimited_to_vec());
            }
        }
        buf.to_vec()
    }

    fn to_proto(&self) -> CredentialsProto {
        CredentialsProto {
            tokens: self
                .tokens
                .iter()
                .map(|(alias, token)| CredentialsKvProto {
                    alias: alias.clone(),
                    token: Some(token.clone()),
                    secret: None,
                })
                .collect(),
            secrets: self
                .secrets
                .iter()
                .map(|(alias, secret)| CredentialsKvProto {
                    alias: alias.clone(),
                    token: None,
                    secret: Some(secret.clone()),
                })
                .collect(),
        }
    }

    fn write_writable(&self, buf: &mut BytesMut) {
        write_vint(self.tokens.len() as i64, buf);
        for (alias, token) in &self.tokens {
            write_bytes(alias.as_bytes(), buf);
            write_bytes(&token.identifier, buf);
            write_bytes(&token.password, buf);
            write_bytes(token.kind.as_bytes(), buf);
            write_bytes(token.service.as_bytes(), buf);
        }
        write_vint(self.secrets.len() as i64, buf);
        for (alias, secret) in &self.secrets {
            write_bytes(alias.as_bytes(), buf);
            write_bytes(secret, buf);
        }
    }
}

fn read_protobuf(body: &[u8]) -> Result<Credentials, Error> {
    let proto = CredentialsProto::decode_length_delimited(body)?;
    let mut creds = Credentials::new();
    for kv in proto.tokens {
        if let Some(token) = kv.token {
            creds.add_token(&kv.alias, token);
        }
    }
    for kv in proto.secrets {
        if let Some(secret) = kv.secret {
            creds.add_secret(&kv.alias, secret);
        }
    }
    Ok(creds)
}

fn read_writable(body: &mut &[u8]) -> Result<Credentials, Error> {
    let mut creds = Credentials::new();

    let num_tokens = read_count(body)?;
    for _ in 0..num_tokens {
        let alias = read_text(body)?;
        let token = TokenProto {
            identifier: read_bytes(body)?,
            password: read_bytes(body)?,
            kind: read_text(body)?,
            service: read_text(body)?,
        };
        creds.add_token(&alias, token);
    }

    let num_secrets = read_count(body)?;
    for _ in 0..num_secrets {
        let alias = read_text(body)?;
        let secret = read_bytes(body)?;
        creds.add_secret(&alias, secret);
    }

    Ok(creds)
}

fn read_count(body: &mut &[u8]) -> Result<usize, Error> {
    let count = read_vint(body)?;
    if count < 0 {
        return Err(storage_error(format!("negative count {}", count)));
    }
    Ok(count as usize)
}

fn read_bytes(body: &mut &[u8]) -> Result<Vec<u8>, Error> {
    let len = read_count(body)?;
    if body.remaining() < len {
        return Err(storage_error(format!(
            "field declares {} bytes, only {} remain",
            len,
            body.remaining()
        )));
    }
    Ok(body.copy_to_bytes(len).to_vec())
}

fn read_text(body: &mut &[u8]) -> Result<String, Error> {
    String::from_utf8(read_bytes(body)?)
        .map_err(|_| storage_error("text field is not UTF-8"))
}

fn write_bytes(value: &[u8], buf: &mut BytesMut) {
    write_vint(value.len() as i64, buf);
    buf.put_slice(value);
}

/// Hadoop's zero-compressed VLong: values in [-112, 127] take one byte,
/// otherwise a marker byte carries sign and length of the big-endian
/// magnitude that follows.
pub fn read_vint(body: &mut &[u8]) -> Result<i64, Error> {
    if !body.has_remaining() {
        return Err(storage_error("truncated VInt"));
    }
    let first = body.get_i8();
    if first >= -112 {
        return Ok(i64::from(first));
    }
    let negative = first < -120;
    let len = if negative {
        -120 - i32::from(first)
    } else {
        -112 - i32::from(first)
    } as usize;
    if body.remaining() < len {
        return Err(storage_error("truncated VInt"));
    }
    let mut value: i64 = 0;
    for _ in 0..len {
        value = (value << 8) | i64::from(body.get_u8());
    }
    Ok(if negative { !value } else { value })
}

pub fn write_vint(value: i64, buf: &mut BytesMut) {
    if value >= -112 && value <= 127 {
        buf.put_i8(value as i8);
        return;
    }
    let (magnitude, base) = if value < 0 { (!value, -120) } else { (value, -112) };
    let len = 8 - (magnitude.leading_zeros() as i32 / 8);
    buf.put_i8((base - len) as i8);
    for idx in (0..len).rev() {
        buf.put_u8((magnitude >> (idx * 8)) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        let mut creds = Credentials::new();
        creds.add_token(
            "10.0.0.1:8041",
            TokenProto {
                identifier: vec![0, 1, 2, 3],
                password: b"pw".to_vec(),
                kind: "NMToken".into(),
                service: "10.0.0.1:8041".into(),
            },
        );
        creds.add_token(
            "rm",
            TokenProto {
                identifier: vec![9; 200],
                password: vec![7; 20],
                kind: "RM_DELEGATION_TOKEN".into(),
                service: "10.0.0.2:8032".into(),
            },
        );
        creds.add_secret("sharedkey", vec![0xaa; 3]);
        creds
    }

    #[test]
    fn vint_encoding_matches_hadoop() {
        let cases: &[(i64, &[u8])] = &[
            (0, &[0x00]),
            (127, &[0x7f]),
            (-112, &[0x90]),
            (128, &[0x8f, 0x80]),
            (200, &[0x8f, 0xc8]),
            (256, &[0x8e, 0x01, 0x00]),
            (-113, &[0x87, 0x70]),
        ];
        for (value, expected) in cases {
            let mut buf = BytesMut::new();
            write_vint(*value, &mut buf);
            assert_eq!(&buf[..], *expected, "encoding {}", value);
            let mut slice = &buf[..];
            assert_eq!(read_vint(&mut slice).unwrap(), *value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn reads_both_storage_formats() {
        let creds = credentials();
        for format in &[StorageFormat::Writable, StorageFormat::Protobuf] {
            let raw = creds.to_token_storage(*format);
            assert_eq!(&raw[0..4], b"HDTS");
            assert_eq!(raw[4], *format as u8);
            assert_eq!(Credentials::from_token_storage(&raw).unwrap(), creds);
        }
    }

    #[test]
    fn token_lookup_by_alias_or_service() {
        let creds = credentials();
        assert_eq!(creds.token_for_service("10.0.0.1:8041").unwrap().kind, "NMToken");
        assert_eq!(
            creds.token_for_service("10.0.0.2:8032").unwrap().kind,
            "RM_DELEGATION_TOKEN"
        );
        assert!(creds.token_for_service("10.0.0.3:8041").is_none());
        assert_eq!(creds.secret("sharedkey"), Some(&[0xaa, 0xaa, 0xaa][..]));
    }

    #[test]
    fn rejects_bad_storage() {
        assert!(Credentials::from_token_storage(b"HDTX\x00").is_err());
        assert!(Credentials::from_token_storage(b"HDTS\x05").is_err());
        // One token declared, nothing follows.
        assert!(Credentials::from_token_storage(b"HDTS\x00\x01").is_err());
    }
}
