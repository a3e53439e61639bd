use core::fmt::Write;

use heapless::String as HString;
use log::debug;
use md5::Digest;
use rand::Rng;

use crate::{Header, Result, SipError};

/// Hash primitive behind the digest computation. `hex_digest` returns
/// `None` when no provider is available; the engine turns that into
/// `SipError::HashUnavailable` instead of emitting an empty response.
pub trait DigestHash: core::fmt::Debug + Send {
    /// Value of the `algorithm` parameter in the Authorization header.
    fn algorithm(&self) -> &'static str;
    fn hex_digest(&self, data: &[u8]) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Md5;

impl DigestHash for Md5 {
    fn algorithm(&self) -> &'static str {
        "MD5"
    }

    fn hex_digest(&self, data: &[u8]) -> Option<String> {
        Some(to_hex(&md5::Md5::digest(data)))
    }
}

/// RFC 7616 `SHA-256`, for registrars that accept it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256;

impl DigestHash for Sha256 {
    fn algorithm(&self) -> &'static str {
        "SHA-256"
    }

    fn hex_digest(&self, data: &[u8]) -> Option<String> {
        Some(to_hex(&sha2::Sha256::digest(data)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    /// Sent in `Proxy-Authenticate` (a 407), answered with
    /// `Proxy-Authorization`.
    pub from_proxy: bool,
}

impl DigestChallenge {
    pub fn new(realm: &str, nonce: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonce: nonce.to_string(),
            ..Self::default()
        }
    }

    /// An empty nonce means there is nothing to answer.
    pub fn is_usable(&self) -> bool {
        !self.nonce.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestResponse {
    pub response: String,
    pub nc: HString<8>,
    pub cnonce: HString<64>,
}

/// Extract the Digest challenge from a raw response.
///
/// Looks at the first `WWW-Authenticate` or `Proxy-Authenticate` header
/// (name compared ASCII case-insensitively, folded continuation lines
/// joined). Parameters that are missing come back empty; a missing header
/// yields an all-empty challenge rather than an error.
pub fn parse_challenge(raw: &str) -> DigestChallenge {
    match find_auth_header(raw) {
        Some((from_proxy, value)) => DigestChallenge {
            from_proxy,
            ..parse_challenge_header(&value)
        },
        None => {
            debug!("no WWW-Authenticate header in response");
            DigestChallenge::default()
        }
    }
}

/// Parse the value of an authenticate header (`Digest realm="...", ...`).
pub fn parse_challenge_header(value: &str) -> DigestChallenge {
    let optional = |key| Some(param(value, key)).filter(|v| !v.is_empty());

    DigestChallenge {
        realm: param(value, "realm"),
        nonce: param(value, "nonce"),
        qop: param(value, "qop"),
        opaque: optional("opaque"),
        algorithm: optional("algorithm"),
        from_proxy: false,
    }
}

/// Value of the first authenticate header with its continuation lines
/// unfolded, and whether it was `Proxy-Authenticate`.
fn find_auth_header(raw: &str) -> Option<(bool, String)> {
    let mut lines = raw.lines();
    let (from_proxy, mut value) = lines.by_ref().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        if name.eq_ignore_ascii_case("WWW-Authenticate") {
            Some((false, value.trim().to_string()))
        } else if name.eq_ignore_ascii_case("Proxy-Authenticate") {
            Some((true, value.trim().to_string()))
        } else {
            None
        }
    })?;

    for cont in lines.take_while(|l| l.starts_with([' ', '\t'])) {
        value.push(' ');
        value.push_str(cont.trim());
    }
    Some((from_proxy, value))
}

fn param(header: &str, key: &str) -> String {
    let needle = format!("{key}=");
    let lower = header.to_ascii_lowercase();

    // `nonce=` must not match inside `cnonce=` and the like.
    let Some(start) = lower.match_indices(&needle).find_map(|(idx, _)| {
        let boundary = header[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| c == ',' || c.is_whitespace());
        boundary.then_some(idx + needle.len())
    }) else {
        return String::new();
    };

    let rest = &header[start..];
    if let Some(quoted) = rest.strip_prefix('"') {
        if let Some(end) = quoted.find('"') {
            return quoted[..end].to_string();
        }
        return unquoted_value(quoted).to_string();
    }
    unquoted_value(rest).to_string()
}

fn unquoted_value(rest: &str) -> &str {
    let end = rest
        .find(',')
        .or_else(|| rest.find(' '))
        .unwrap_or(rest.len());
    rest[..end].trim()
}

/// RFC 2617 response calculator. Keeps the nonce-count for the nonce it
/// last answered and restarts it when the registrar hands out a new one.
#[derive(Debug)]
pub struct DigestEngine {
    hash: Box<dyn DigestHash>,
    last_nonce: String,
    nonce_count: u32,
}

impl Default for DigestEngine {
    fn default() -> Self {
        Self::new(Box::new(Md5))
    }
}

impl DigestEngine {
    pub fn new(hash: Box<dyn DigestHash>) -> Self {
        Self {
            hash,
            last_nonce: String::new(),
            nonce_count: 0,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        self.hash.algorithm()
    }

    pub fn compute_response(
        &mut self,
        challenge: &DigestChallenge,
        creds: &DigestCredentials<'_>,
        method: &str,
        uri: &str,
        qop: &str,
    ) -> Result<DigestResponse> {
        let cnonce = generate_cnonce();
        self.compute_response_with_cnonce(challenge, creds, method, uri, qop, &cnonce)
    }

    pub fn compute_response_with_cnonce(
        &mut self,
        challenge: &DigestChallenge,
        creds: &DigestCredentials<'_>,
        method: &str,
        uri: &str,
        qop: &str,
        cnonce: &str,
    ) -> Result<DigestResponse> {
        let ha1 = self.hash_of(&format!(
            "{}:{}:{}",
            creds.username, challenge.realm, creds.password
        ))?;
        let ha2 = self.hash_of(&format!("{}:{}", method, uri))?;

        if self.last_nonce != challenge.nonce {
            self.last_nonce.clear();
            self.last_nonce.push_str(&challenge.nonce);
            self.nonce_count = 0;
        }
        self.nonce_count = self.nonce_count.wrapping_add(1);

        let mut nc: HString<8> = HString::new();
        write!(nc, "{:08x}", self.nonce_count).map_err(|_| SipError::Capacity)?;
        let mut cnonce_buf: HString<64> = HString::new();
        cnonce_buf.push_str(cnonce).map_err(|_| SipError::Capacity)?;

        let combo = if qop.is_empty() {
            format!("{}:{}:{}", ha1, challenge.nonce, ha2)
        } else {
            format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, challenge.nonce, nc, cnonce, qop, ha2
            )
        };
        let response = self.hash_of(&combo)?;

        Ok(DigestResponse {
            response,
            nc,
            cnonce: cnonce_buf,
        })
    }

    /// Compute a response and package it with the fields of the
    /// Authorization header.
    pub fn authorize(
        &mut self,
        challenge: &DigestChallenge,
        creds: &DigestCredentials<'_>,
        method: &str,
        uri: &str,
        qop: &str,
    ) -> Result<DigestAuthorization> {
        let computed = self.compute_response(challenge, creds, method, uri, qop)?;
        Ok(DigestAuthorization::new(
            challenge,
            creds.username,
            uri,
            self.algorithm(),
            qop,
            computed,
        ))
    }

    fn hash_of(&self, input: &str) -> Result<String> {
        match self.hash.hex_digest(input.as_bytes()) {
            Some(hex) if !hex.is_empty() => Ok(hex),
            _ => Err(SipError::HashUnavailable(self.hash.algorithm())),
        }
    }
}

/// Everything that goes into an `Authorization: Digest ...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestAuthorization {
    pub username: String,
    pub realm: String,
    pub uri: String,
    pub nonce: String,
    pub response: String,
    pub algorithm: &'static str,
    pub qop: String,
    pub nc: HString<8>,
    pub cnonce: HString<64>,
    pub opaque: Option<String>,
    pub for_proxy: bool,
}

impl DigestAuthorization {
    pub fn new(
        challenge: &DigestChallenge,
        username: &str,
        uri: &str,
        algorithm: &'static str,
        qop: &str,
        computed: DigestResponse,
    ) -> Self {
        Self {
            username: username.to_string(),
            realm: challenge.realm.clone(),
            uri: uri.to_string(),
            nonce: challenge.nonce.clone(),
            response: computed.response,
            algorithm,
            qop: qop.to_string(),
            nc: computed.nc,
            cnonce: computed.cnonce,
            opaque: challenge.opaque.clone(),
            for_proxy: challenge.from_proxy,
        }
    }

    pub fn header_value(&self) -> String {
        let mut value = String::new();
        let _ = write!(
            value,
            "Digest username=\"{}\", realm=\"{}\", uri=\"{}\", nonce=\"{}\", response=\"{}\", algorithm={}",
            self.username, self.realm, self.uri, self.nonce, self.response, self.algorithm
        );
        if !self.qop.is_empty() {
            let _ = write!(
                value,
                ", qop={}, nc={}, cnonce=\"{}\"",
                self.qop, self.nc, self.cnonce
            );
        }
        if let Some(opaque) = &self.opaque {
            let _ = write!(value, ", opaque=\"{}\"", opaque);
        }
        value
    }

    /// `Authorization`, or `Proxy-Authorization` when answering a 407.
    pub fn to_header(&self) -> Header {
        let name = if self.for_proxy {
            "Proxy-Authorization"
        } else {
            "Authorization"
        };
        Header::new(name, &self.header_value())
    }
}

/// 16 random bytes, hex encoded. Only needs to be unique, not secret.
pub fn generate_cnonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    to_hex(&bytes)
}

pub(crate) fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
