// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client-side Digest authentication (RFC 3261 §22, RFC 7616).
//!
//! When a request bounces with 401/407, the request coordinator hands
//! the challenge response to an [`Authorizer`], which rewrites the
//! request in place: an Authorization (or Proxy-Authorization) header
//! carrying the computed digest, and a bumped CSeq for the retry.

use std::sync::Mutex;

use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sha2::{Digest, Sha256, Sha512};
use sip_core::{cseq, Method, Request, Response};
use smol_str::SmolStr;
use thiserror::Error;

/// Digest algorithm per RFC 7616.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    pub fn from_token(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MD5" => Some(DigestAlgorithm::Md5),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            "SHA-512" | "SHA-512-256" => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }
}

/// Quality of Protection (qop) options per RFC 7616.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

/// Errors raised while answering an authentication challenge.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("response carries no authentication challenge")]
    MissingChallenge,
    #[error("challenge is not a Digest challenge")]
    NotDigest,
    #[error("challenge missing required parameter: {0}")]
    MissingParam(&'static str),
}

/// Parsed WWW-Authenticate / Proxy-Authenticate challenge.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub realm: SmolStr,
    pub nonce: SmolStr,
    pub opaque: Option<SmolStr>,
    pub algorithm: DigestAlgorithm,
    pub qop: Option<Qop>,
}

impl Challenge {
    /// Parses a Digest challenge header value.
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let params = value
            .strip_prefix("Digest ")
            .ok_or(AuthError::NotDigest)?;

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = DigestAlgorithm::Md5;
        let mut qop = None;

        for param in params.split(',') {
            let Some((name, raw)) = param.trim().split_once('=') else {
                continue;
            };
            let value = raw.trim().trim_matches('"');
            match name.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(SmolStr::new(value.to_owned())),
                "nonce" => nonce = Some(SmolStr::new(value.to_owned())),
                "opaque" => opaque = Some(SmolStr::new(value.to_owned())),
                "algorithm" => {
                    if let Some(parsed) = DigestAlgorithm::from_token(value) {
                        algorithm = parsed;
                    }
                }
                // qop may list several tokens; prefer auth-int when offered.
                "qop" => {
                    if value.contains("auth-int") {
                        qop = Some(Qop::AuthInt);
                    } else if value.contains("auth") {
                        qop = Some(Qop::Auth);
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            realm: realm.ok_or(AuthError::MissingParam("realm"))?,
            nonce: nonce.ok_or(AuthError::MissingParam("nonce"))?,
            opaque,
            algorithm,
            qop,
        })
    }
}

/// Computes Authorization header values for Digest challenges.
///
/// Keeps the nonce-count across retries against the same server.
pub struct DigestClient {
    pub username: SmolStr,
    pub password: SmolStr,
    nc: u32,
}

impl DigestClient {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: SmolStr::new(username.to_owned()),
            password: SmolStr::new(password.to_owned()),
            nc: 0,
        }
    }

    /// Generates an Authorization header value for the challenge.
    pub fn generate_authorization(
        &mut self,
        method: &Method,
        uri: &str,
        challenge: &Challenge,
        body: &[u8],
    ) -> String {
        self.nc += 1;
        let nc_str = format!("{:08x}", self.nc);
        let cnonce: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();

        let algorithm = challenge.algorithm;
        let ha1_input = format!("{}:{}:{}", self.username, challenge.realm, self.password);
        let ha1 = hash(algorithm, ha1_input.as_bytes());

        let ha2_input = match challenge.qop {
            Some(Qop::AuthInt) => {
                let body_hash = hash(algorithm, body);
                format!("{}:{}:{}", method.as_str(), uri, body_hash)
            }
            _ => format!("{}:{}", method.as_str(), uri),
        };
        let ha2 = hash(algorithm, ha2_input.as_bytes());

        let response = match challenge.qop {
            Some(qop) => {
                let input = format!(
                    "{}:{}:{}:{}:{}:{}",
                    ha1, challenge.nonce, nc_str, cnonce, qop.as_str(), ha2
                );
                hash(algorithm, input.as_bytes())
            }
            None => {
                let input = format!("{}:{}:{}", ha1, challenge.nonce, ha2);
                hash(algorithm, input.as_bytes())
            }
        };

        let mut auth = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
            self.username, challenge.realm, challenge.nonce, uri, response, algorithm.as_str()
        );

        if let Some(qop) = challenge.qop {
            auth.push_str(&format!(
                ", qop={}, nc={}, cnonce=\"{}\"",
                qop.as_str(),
                nc_str,
                cnonce
            ));
        }
        if let Some(opaque) = &challenge.opaque {
            auth.push_str(&format!(", opaque=\"{}\"", opaque));
        }

        auth
    }
}

fn hash(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    match algorithm {
        DigestAlgorithm::Md5 => format!("{:x}", md5::compute(data)),
        DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        DigestAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
    }
}

/// Rewrites a challenged request with credentials for one retry.
pub trait Authorizer: Send + Sync + 'static {
    /// Mutates `request` in place: adds the Authorization or
    /// Proxy-Authorization header answering `challenge` and bumps the
    /// CSeq sequence number for the retry.
    fn authorize(&self, request: &mut Request, challenge: &Response) -> Result<(), AuthError>;
}

/// [`Authorizer`] backed by a [`DigestClient`].
pub struct ClientAuthorizer {
    client: Mutex<DigestClient>,
}

impl ClientAuthorizer {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            client: Mutex::new(DigestClient::new(username, password)),
        }
    }
}

impl Authorizer for ClientAuthorizer {
    fn authorize(&self, request: &mut Request, challenge: &Response) -> Result<(), AuthError> {
        let is_proxy = challenge.code() == 407;
        let challenge_header = if is_proxy {
            "Proxy-Authenticate"
        } else {
            "WWW-Authenticate"
        };
        let authorization_header = if is_proxy {
            "Proxy-Authorization"
        } else {
            "Authorization"
        };

        let value = challenge
            .headers
            .get(challenge_header)
            .ok_or(AuthError::MissingChallenge)?;
        let parsed = Challenge::parse(value)?;

        let uri = request.start.uri.to_string();
        let auth_value = match self.client.lock() {
            Ok(mut client) => {
                client.generate_authorization(&request.start.method, &uri, &parsed, &request.body)
            }
            Err(_) => return Err(AuthError::MissingChallenge),
        };

        request.headers.replace(authorization_header, auth_value);

        if let Some((num, method)) = cseq(&request.headers) {
            request
                .headers
                .replace("CSeq", format!("{} {}", num + 1, method));
        }

        Ok(())
    }
}
