// Copyright 2020 Joyent, Inc.

//! DIGEST-MD5 (RFC 2831) as Hadoop uses it for token authentication: the
//! token identifier and password are base64 encoded to form the username and
//! password, only the `auth` quality of protection is negotiated, and the
//! digest-uri is `protocol/serverId`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use rand::RngCore;

use crate::error::{AuthError, Error};
use crate::proto::TokenProto;

pub const MECHANISM: &str = "DIGEST-MD5";
pub const DEFAULT_REALM: &str = "default";

const QOP_AUTH: &str = "auth";
const ALGORITHM: &str = "md5-sess";
const CHARSET: &str = "utf-8";
const NONCE_COUNT: &str = "00000001";
const NONCE_BYTES: usize = 32;

fn digest_error<S: Into<String>>(msg: S) -> Error {
    Error::Auth(AuthError::Digest(msg.into()))
}

/// Split a `key=value,key="quoted value"` directive list.
pub fn parse_directives(input: &str) -> Result<Vec<(String, String)>, Error> {
    let mut directives = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while let Some(&c) = chars.peek() {
            if c == ',' || c.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) => key.push(c),
                None => {
                    return Err(digest_error(format!(
                        "directive '{}' has no value",
                        key.trim()
                    )))
                }
            }
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => break,
                    },
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(digest_error(format!(
                            "unterminated quoted value for '{}'",
                            key.trim()
                        )))
                    }
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        directives.push((key.trim().to_ascii_lowercase(), value));
    }

    Ok(directives)
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn directive<'a>(
    directives: &'a [(String, String)],
    name: &str,
) -> Option<&'a str> {
    directives
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn required<'a>(
    directives: &'a [(String, String)],
    name: &str,
) -> Result<&'a str, Error> {
    directive(directives, name)
        .ok_or_else(|| digest_error(format!("missing '{}' directive", name)))
}

fn utf8(bytes: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(bytes)
        .map_err(|_| digest_error("digest message is not valid UTF-8"))
}

pub fn encode_identifier(identifier: &[u8]) -> String {
    STANDARD.encode(identifier)
}

pub fn encode_password(password: &[u8]) -> String {
    STANDARD.encode(password)
}

pub fn decode_identifier(username: &str) -> Result<Vec<u8>, Error> {
    STANDARD
        .decode(username)
        .map_err(|e| digest_error(format!("username is not base64: {}", e)))
}

pub fn new_nonce() -> String {
    let mut raw = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut raw);
    STANDARD.encode(raw)
}

/// The server's first message.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestChallenge {
    pub realm: Option<String>,
    pub nonce: String,
    pub qop: Vec<String>,
    pub utf8: bool,
}

impl DigestChallenge {
    pub fn new(realm: &str, nonce: String) -> DigestChallenge {
        DigestChallenge {
            realm: Some(realm.to_string()),
            nonce,
            qop: vec![QOP_AUTH.to_string()],
            utf8: true,
        }
    }

    pub fn parse(challenge: &[u8]) -> Result<DigestChallenge, Error> {
        let directives = parse_directives(utf8(challenge)?)?;

        let algorithm = required(&directives, "algorithm")?;
        if !algorithm.eq_ignore_ascii_case(ALGORITHM) {
            return Err(digest_error(format!(
                "unsupported algorithm '{}'",
                algorithm
            )));
        }

        let qop = directive(&directives, "qop")
            .unwrap_or(QOP_AUTH)
            .split(',')
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();

        Ok(DigestChallenge {
            realm: directive(&directives, "realm").map(String::from),
            nonce: required(&directives, "nonce")?.to_string(),
            qop,
            utf8: directive(&directives, "charset")
                .map_or(false, |c| c.eq_ignore_ascii_case(CHARSET)),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut fields = Vec::new();
        if let Some(realm) = &self.realm {
            fields.push(format!("realm={}", quote(realm)));
        }
        fields.push(format!("nonce={}", quote(&self.nonce)));
        fields.push(format!("qop={}", quote(&self.qop.join(","))));
        if self.utf8 {
            fields.push(format!("charset={}", CHARSET));
        }
        fields.push(format!("algorithm={}", ALGORITHM));
        fields.join(",").into_bytes()
    }
}

/// The client's answer to a [`DigestChallenge`].
#[derive(Debug, Clone, PartialEq)]
pub struct DigestResponse {
    pub username: String,
    pub realm: Option<String>,
    pub nonce: String,
    pub cnonce: String,
    pub nc: String,
    pub qop: String,
    pub digest_uri: String,
    pub response: String,
    pub utf8: bool,
}

impl DigestResponse {
    pub fn parse(response: &[u8]) -> Result<DigestResponse, Error> {
        let directives = parse_directives(utf8(response)?)?;

        Ok(DigestResponse {
            username: required(&directives, "username")?.to_string(),
            realm: directive(&directives, "realm").map(String::from),
            nonce: required(&directives, "nonce")?.to_string(),
            cnonce: required(&directives, "cnonce")?.to_string(),
            nc: required(&directives, "nc")?.to_string(),
            qop: directive(&directives, "qop").unwrap_or(QOP_AUTH).to_string(),
            digest_uri: required(&directives, "digest-uri")?.to_string(),
            response: required(&directives, "response")?.to_string(),
            utf8: directive(&directives, "charset")
                .map_or(false, |c| c.eq_ignore_ascii_case(CHARSET)),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut fields = Vec::new();
        if self.utf8 {
            fields.push(format!("charset={}", CHARSET));
        }
        fields.push(format!("username={}", quote(&self.username)));
        if let Some(realm) = &self.realm {
            fields.push(format!("realm={}", quote(realm)));
        }
        fields.push(format!("nonce={}", quote(&self.nonce)));
        fields.push(format!("nc={}", self.nc));
        fields.push(format!("cnonce={}", quote(&self.cnonce)));
        fields.push(format!("digest-uri={}", quote(&self.digest_uri)));
        fields.push(format!("response={}", self.response));
        fields.push(format!("qop={}", self.qop));
        fields.join(",").into_bytes()
    }

    /// Recompute the digest with `password` and compare against the one the
    /// client sent.
    pub fn verify(&self, password: &str) -> bool {
        let expected = response_value(
            &self.username,
            self.realm.as_deref().unwrap_or(""),
            password,
            &self.nonce,
            &self.cnonce,
            &self.nc,
            &self.qop,
            &self.digest_uri,
        );
        expected == self.response
    }
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// `KD(HEX(H(A1)), nonce:nc:cnonce:qop:HEX(H(A2)))` for an `md5-sess`
/// AUTHENTICATE exchange.
#[allow(clippy::too_many_arguments)]
pub fn response_value(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    qop: &str,
    digest_uri: &str,
) -> String {
    let secret = Md5::digest(format!("{}:{}:{}", username, realm, password));
    let mut a1 = secret.to_vec();
    a1.extend_from_slice(format!(":{}:{}", nonce, cnonce).as_bytes());
    let a2 = format!("AUTHENTICATE:{}", digest_uri);

    let kd = format!(
        "{}:{}:{}:{}:{}:{}",
        md5_hex(&a1),
        nonce,
        nc,
        cnonce,
        qop,
        md5_hex(a2.as_bytes())
    );
    md5_hex(kd.as_bytes())
}

pub fn digest_uri(protocol: &str, server_id: &str) -> String {
    format!("{}/{}", protocol, server_id)
}

/// Answer a server challenge with the credentials in `token`, using a fresh
/// client nonce.
pub fn challenge_response(
    protocol: &str,
    server_id: &str,
    challenge: &[u8],
    token: &TokenProto,
) -> Result<Vec<u8>, Error> {
    respond_with_cnonce(protocol, server_id, challenge, token, new_nonce())
}

pub(crate) fn respond_with_cnonce(
    protocol: &str,
    server_id: &str,
    challenge: &[u8],
    token: &TokenProto,
    cnonce: String,
) -> Result<Vec<u8>, Error> {
    let challenge = DigestChallenge::parse(challenge)?;
    if !challenge.qop.iter().any(|q| q == QOP_AUTH) {
        return Err(digest_error(format!(
            "server does not offer qop=auth (offered {:?})",
            challenge.qop
        )));
    }

    let username = encode_identifier(&token.identifier);
    let password = encode_password(&token.password);
    let uri = digest_uri(protocol, server_id);
    let response = response_value(
        &username,
        challenge.realm.as_deref().unwrap_or(""),
        &password,
        &challenge.nonce,
        &cnonce,
        NONCE_COUNT,
        QOP_AUTH,
        &uri,
    );

    Ok(DigestResponse {
        username,
        realm: challenge.realm,
        nonce: challenge.nonce,
        cnonce,
        nc: NONCE_COUNT.to_string(),
        qop: QOP_AUTH.to_string(),
        digest_uri: uri,
        response,
        utf8: challenge.utf8,
    }
    .encode())
}
