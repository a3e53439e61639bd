//! I/O-free pieces of a SIP registration client: message model, registrar
//! URI handling, Digest authentication and the REGISTER session state
//! machine. Sockets live in the `sip_agent` crate.

use thiserror::Error;

pub mod auth;
pub mod message;
pub mod registration;
pub mod uri;

pub use auth::{
    generate_cnonce, parse_challenge, parse_challenge_header, DigestAuthorization,
    DigestChallenge, DigestCredentials, DigestEngine, DigestHash, DigestResponse, Md5, Sha256,
};
pub use message::{header_value, parse_message, Header, Message, Method, Request, Response};
pub use registration::{
    build_register, new_branch, ChallengeStatus, DialogIds, RegisterParams, RegisterTarget,
    RegistrationResult, RegistrationSession, RegistrationState,
};
pub use uri::{RegistrarUri, DEFAULT_SIP_PORT};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("invalid message: {0}")]
    Invalid(&'static str),
    #[error("buffer capacity exceeded")]
    Capacity,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("malformed registrar uri: {0}")]
    MalformedRegistrar(String),
    #[error("digest hash unavailable: {0}")]
    HashUnavailable(&'static str),
}

pub type Result<T> = std::result::Result<T, SipError>;
