use crate::{Result, SipError};

pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Host and port of a `sip:host[:port]` URI as used for the registrar and
/// the optional outbound proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrarUri {
    pub host: String,
    pub port: u16,
}

impl RegistrarUri {
    /// Accepts `sip:host`, `sip:host:port`, `sip:user@host:port` and
    /// bracketed IPv6 hosts. URI parameters and headers are ignored.
    pub fn parse(input: &str) -> Result<Self> {
        let malformed = || SipError::MalformedRegistrar(input.to_string());

        let trimmed = input.trim();
        let rest = strip_scheme(trimmed).ok_or_else(malformed)?;

        let rest = rest
            .split(|c: char| c == ';' || c == '?')
            .next()
            .unwrap_or_default();
        let hostport = match rest.rsplit_once('@') {
            Some((_user, hostport)) => hostport,
            None => rest,
        };

        let (host, port) = if let Some(v6) = hostport.strip_prefix('[') {
            let (host, after) = v6.split_once(']').ok_or_else(malformed)?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p),
                None if after.is_empty() => None,
                None => return Err(malformed()),
            };
            (host, port)
        } else {
            match hostport.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (hostport, None),
            }
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(malformed());
        }

        let port = match port {
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(malformed()),
                Ok(p) => p,
            },
            None => DEFAULT_SIP_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Request-URI for REGISTER: `sip:<host>`.
    pub fn request_uri(&self) -> String {
        if self.host.contains(':') {
            format!("sip:[{}]", self.host)
        } else {
            format!("sip:{}", self.host)
        }
    }
}

fn strip_scheme(uri: &str) -> Option<&str> {
    let (scheme, rest) = uri.split_once(':')?;
    scheme.eq_ignore_ascii_case("sip").then_some(rest)
}
