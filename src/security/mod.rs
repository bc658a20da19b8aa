// Copyright 2020 Joyent, Inc.

//! Caller identity and delegation tokens consulted when a connection is set
//! up.

pub mod credentials;
pub mod digest;

use std::env;

use crate::error::Error;
use crate::proto::{TokenProto, UserInformationProto};

pub use self::credentials::{Credentials, StorageFormat};

pub const HADOOP_USER_NAME: &str = "HADOOP_USER_NAME";
pub const HADOOP_TOKEN_FILE_LOCATION: &str = "HADOOP_TOKEN_FILE_LOCATION";

/// Read-only view of who the caller is and which tokens it holds. Shared by
/// every connection a client opens.
pub trait TokenStore: Send + Sync {
    fn current_user(&self) -> UserInformationProto;

    /// Token scoped to `service`, a `host:port` server address.
    fn token_for_service(&self, service: &str) -> Option<TokenProto>;

    fn digest_challenge_response(
        &self,
        protocol: &str,
        server_id: &str,
        challenge: &[u8],
        token: &TokenProto,
    ) -> Result<Vec<u8>, Error> {
        digest::challenge_response(protocol, server_id, challenge, token)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    name: String,
    real_user: Option<String>,
    credentials: Credentials,
}

impl User {
    pub fn new(name: &str) -> User {
        User {
            name: name.to_string(),
            real_user: None,
            credentials: Credentials::new(),
        }
    }

    /// The process user: `HADOOP_USER_NAME`, else the login name from the
    /// environment. Tokens are loaded from `HADOOP_TOKEN_FILE_LOCATION` when
    /// it is set.
    pub fn current() -> Result<User, Error> {
        let name = env::var(HADOOP_USER_NAME)
            .or_else(|_| env::var("USER"))
            .or_else(|_| env::var("USERNAME"))
            .map_err(|_| {
                Error::Config(String::from("unable to determine current user"))
            })?;

        let mut user = User::new(&name);
        if let Ok(location) = env::var(HADOOP_TOKEN_FILE_LOCATION) {
            user.credentials = Credentials::read_token_storage_file(location)?;
        }
        Ok(user)
    }

    /// A user acting on behalf of another (`name` is the effective user).
    pub fn proxy(name: &str, real_user: &str) -> User {
        User {
            real_user: Some(real_user.to_string()),
            ..User::new(name)
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> User {
        self.credentials = credentials;
        self
    }

    pub fn add_token(&mut self, alias: &str, token: TokenProto) {
        self.credentials.add_token(alias, token);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

impl TokenStore for User {
    fn current_user(&self) -> UserInformationProto {
        UserInformationProto {
            effective_user: Some(self.name.clone()),
            real_user: self.real_user.clone(),
        }
    }

    fn token_for_service(&self, service: &str) -> Option<TokenProto> {
        self.credentials.token_for_service(service).cloned()
    }
}
