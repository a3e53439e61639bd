use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use sip_core::{
    generate_cnonce, parse_message, ChallengeStatus, DigestChallenge, DigestCredentials,
    Message, RegisterTarget, RegistrarUri, RegistrationResult, RegistrationSession, Request,
    Response, SipError,
};

use crate::messages::{AgentEvent, AgentEventReceiver, AgentEventSender};
use crate::settings::Settings;
use crate::transport::{TransportConfig, TransportError, UdpTransport};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("SIP stack not initialized")]
    NotInitialized,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("sip error: {0}")]
    Sip(#[from] SipError),
    #[error("registration of {aor} rejected with status {status}")]
    Rejected { aor: String, status: u16 },
    #[error("no account registered for {0}")]
    UnknownAccount(String),
    #[error("register thread panicked")]
    WorkerPanicked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub transport: TransportConfig,
    /// Bounded wait for each reply from the registrar.
    pub receive_timeout: Duration,
    pub expires: u32,
    /// Nonce answered when the registrar sends no challenge and none is
    /// cached. Empty means a random one per attempt.
    pub fallback_nonce: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            receive_timeout: Duration::from_millis(500),
            expires: 3600,
            fallback_nonce: String::new(),
        }
    }
}

impl From<&Settings> for AgentConfig {
    fn from(settings: &Settings) -> Self {
        let ports = candidate_ports(settings.first_port, settings.last_port);
        Self {
            transport: TransportConfig {
                candidate_ports: ports,
                ..TransportConfig::default()
            },
            receive_timeout: Duration::from_millis(settings.receive_timeout_ms),
            expires: settings.expires,
            fallback_nonce: settings.fallback_nonce.to_string(),
        }
    }
}

/// Inclusive port range from settings. An inverted range is swapped.
fn candidate_ports(first: u16, last: u16) -> Vec<u16> {
    if first > last {
        warn!("first_port {first} is above last_port {last}; using {last}..={first}");
        return (last..=first).collect();
    }
    (first..=last).collect()
}

/// Who to register and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub aor: String,
    pub registrar: String,
    pub username: String,
    pub password: String,
    pub proxy: Option<String>,
}

impl From<&Settings> for Identity {
    fn from(settings: &Settings) -> Self {
        Self {
            aor: settings.sip_aor.to_string(),
            registrar: settings.sip_registrar.to_string(),
            username: settings.sip_username.to_string(),
            password: settings.sip_password.to_string(),
            proxy: Some(settings.sip_proxy)
                .filter(|p| !p.is_empty())
                .map(str::to_string),
        }
    }
}

/// Snapshot of the most recent registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub uri: String,
    pub registered: bool,
    /// False until a final 2xx has been seen.
    pub confirmed: bool,
    pub expires_secs: u32,
    pub last_error: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutcome {
    pub status: String,
    pub result: RegistrationResult,
    pub challenge: ChallengeStatus,
    pub confirmed: bool,
}

#[derive(Debug)]
struct Account {
    identity: Identity,
    session: RegistrationSession,
}

/// User-agent facade: one UDP endpoint, one registration session per AOR.
///
/// Attempts run synchronously on the calling thread and block for at most
/// two receive timeouts. Methods take `&mut self`, so attempts on a shared
/// agent are serialised by whatever lock wraps it.
#[derive(Debug, Default)]
pub struct UserAgent {
    config: AgentConfig,
    transport: Option<UdpTransport>,
    accounts: HashMap<String, Account>,
    last_info: Option<AccountInfo>,
    events: Option<AgentEventSender>,
}

impl UserAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn initialize(&mut self) -> Result<String, AgentError> {
        if let Some(transport) = &self.transport {
            debug!("SIP stack already initialized on port {}", transport.bound_port());
            return Ok("SIP stack already initialized".to_string());
        }

        let transport = UdpTransport::open(&self.config.transport)?;
        let status = format!(
            "SIP stack initialized with UDP on port {}",
            transport.bound_port()
        );
        info!("{status}");
        self.transport = Some(transport);
        Ok(status)
    }

    pub fn register_account(
        &mut self,
        identity: &Identity,
    ) -> Result<RegistrationOutcome, AgentError> {
        let expires = self.config.expires;
        self.run_attempt(identity.clone(), expires)
    }

    /// Remove the binding created by `register_account` (`Expires: 0`),
    /// reusing the account's dialog identifiers and credentials.
    pub fn unregister_account(&mut self, aor: &str) -> Result<RegistrationOutcome, AgentError> {
        let identity = self
            .accounts
            .get(aor)
            .map(|account| account.identity.clone())
            .ok_or_else(|| AgentError::UnknownAccount(aor.to_string()))?;
        self.run_attempt(identity, 0)
    }

    pub fn account_info(&self) -> Option<&AccountInfo> {
        self.last_info.as_ref()
    }

    pub fn shutdown(&mut self) -> String {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            self.accounts.clear();
            if let Some(info) = self.last_info.as_mut() {
                info.registered = false;
                info.status = "SIP stack shutdown".to_string();
            }
        }
        "SIP stack shutdown".to_string()
    }

    /// Receive registration events from now on. A new subscription
    /// replaces the previous one.
    pub fn subscribe(&mut self) -> AgentEventReceiver {
        let (tx, rx) = channel();
        self.events = Some(tx);
        rx
    }

    pub fn is_initialized(&self) -> bool {
        self.transport.is_some()
    }

    pub fn version(&self) -> String {
        format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.transport.as_ref().map(UdpTransport::local_ip)
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.transport.as_ref().map(UdpTransport::bound_port)
    }

    fn run_attempt(
        &mut self,
        identity: Identity,
        expires: u32,
    ) -> Result<RegistrationOutcome, AgentError> {
        if self.transport.is_none() {
            return Err(AgentError::NotInitialized);
        }

        // Caller input is validated before anything touches the network.
        let resolved = parse_targets(&identity).map_err(AgentError::from).and_then(|(registrar, hop)| {
            let transport = self.transport.as_ref().ok_or(AgentError::NotInitialized)?;
            let destination = transport.resolve(&hop.host, hop.port)?;
            Ok((registrar, destination))
        });
        let (registrar, destination) = match resolved {
            Ok(v) => v,
            Err(err) => {
                self.record_failure(&identity.aor, &err);
                return Err(err);
            }
        };

        let transport = self.transport.as_mut().ok_or(AgentError::NotInitialized)?;
        let local_ip = transport.local_ip().to_string();

        let account = self
            .accounts
            .entry(identity.aor.clone())
            .or_insert_with(|| Account {
                identity: identity.clone(),
                session: RegistrationSession::with_random_ids(&local_ip),
            });
        account.identity = identity.clone();

        let request_uri = registrar.request_uri();
        let contact = build_contact_uri(&identity, &local_ip, transport.bound_port());
        let target = RegisterTarget {
            request_uri: &request_uri,
            aor: &identity.aor,
            via_host: &local_ip,
            via_port: transport.bound_port(),
            contact: &contact,
            expires,
        };
        let creds = DigestCredentials {
            username: &identity.username,
            password: &identity.password,
        };
        let fallback = DigestChallenge::new(
            &registrar.host,
            &if self.config.fallback_nonce.is_empty() {
                generate_cnonce()
            } else {
                self.config.fallback_nonce.clone()
            },
        );

        info!(
            "registering {} with {} via {} (expires {})",
            identity.aor, request_uri, destination, expires
        );
        let attempt = perform_register(
            transport,
            &mut account.session,
            &target,
            &creds,
            &fallback,
            destination,
            self.config.receive_timeout,
        );

        match attempt {
            Ok((result, challenge)) => self.finish(&identity.aor, result, challenge, expires),
            Err(err) => {
                self.record_failure(&identity.aor, &err);
                Err(err)
            }
        }
    }

    fn finish(
        &mut self,
        aor: &str,
        result: RegistrationResult,
        challenge: ChallengeStatus,
        requested: u32,
    ) -> Result<RegistrationOutcome, AgentError> {
        // Only a final 2xx confirms; a fallback challenge is reported
        // through `RegistrationOutcome::challenge`.
        let confirmed = matches!(
            result,
            RegistrationResult::Registered(_) | RegistrationResult::Unregistered
        );

        let (registered, expires, status, event) = match result {
            RegistrationResult::Registered(exp) | RegistrationResult::Unconfirmed(exp)
                if requested > 0 =>
            {
                let status = if confirmed {
                    "Account registered successfully".to_string()
                } else {
                    "Account registration sent (unconfirmed)".to_string()
                };
                let event = AgentEvent::Registered {
                    aor: aor.to_string(),
                    expires: exp,
                    confirmed,
                };
                (true, exp, status, event)
            }
            RegistrationResult::Registered(_)
            | RegistrationResult::Unconfirmed(_)
            | RegistrationResult::Unregistered => (
                false,
                0,
                "Account unregistered".to_string(),
                AgentEvent::Unregistered {
                    aor: aor.to_string(),
                },
            ),
            RegistrationResult::Failed(status) => {
                let err = AgentError::Rejected {
                    aor: aor.to_string(),
                    status,
                };
                self.record_failure(aor, &err);
                return Err(err);
            }
        };

        info!("{aor}: {status}");
        self.last_info = Some(AccountInfo {
            uri: aor.to_string(),
            registered,
            confirmed,
            expires_secs: expires,
            last_error: None,
            status: status.clone(),
        });
        self.emit(event);

        Ok(RegistrationOutcome {
            status,
            result,
            challenge,
            confirmed,
        })
    }

    fn record_failure(&mut self, aor: &str, err: &AgentError) {
        warn!("registration of {aor} failed: {err}");
        self.last_info = Some(AccountInfo {
            uri: aor.to_string(),
            registered: false,
            confirmed: false,
            expires_secs: 0,
            last_error: Some(err.to_string()),
            status: "Account registration failed".to_string(),
        });
        self.emit(AgentEvent::RegisterFailed {
            aor: aor.to_string(),
            reason: err.to_string(),
        });
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                debug!("event receiver dropped");
            }
        }
    }
}

/// The two-round exchange: REGISTER, wait for the challenge, answer it,
/// wait for the final response.
fn perform_register(
    transport: &mut UdpTransport,
    session: &mut RegistrationSession,
    target: &RegisterTarget<'_>,
    creds: &DigestCredentials<'_>,
    fallback: &DigestChallenge,
    destination: SocketAddr,
    timeout: Duration,
) -> Result<(RegistrationResult, ChallengeStatus), AgentError> {
    let first = session.start(target)?;
    send_request(transport, session, &first, destination)?;

    let reply = wait_for_response(transport, session, timeout);
    let challenge = session.on_challenge(reply.as_ref(), fallback)?;
    if challenge == ChallengeStatus::NotRequired {
        let result = session
            .last_result()
            .unwrap_or(RegistrationResult::Registered(target.expires));
        return Ok((result, challenge));
    }

    let second = session.authenticate(target, creds)?;
    send_request(transport, session, &second, destination)?;

    let final_response = wait_for_response(transport, session, timeout);
    Ok((session.on_final_response(final_response.as_ref()), challenge))
}

fn send_request(
    transport: &UdpTransport,
    session: &mut RegistrationSession,
    req: &Request,
    destination: SocketAddr,
) -> Result<(), AgentError> {
    let sent = req.render().map_err(AgentError::from).and_then(|rendered| {
        debug!("sending REGISTER to {destination}:\n{rendered}");
        transport
            .send_to(rendered.as_bytes(), destination)
            .map_err(AgentError::from)
    });
    if let Err(e) = sent {
        session.fail(0);
        return Err(e);
    }
    Ok(())
}

/// Wait for the final response to the session's latest request. Datagrams
/// that are not responses to it (provisionals, stray retransmissions,
/// requests from the registrar) are skipped until the deadline.
fn wait_for_response(
    transport: &mut UdpTransport,
    session: &RegistrationSession,
    timeout: Duration,
) -> Option<Response> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }

        let (bytes, from) = match transport.receive(remaining) {
            Ok(Some(datagram)) => datagram,
            Ok(None) => return None,
            Err(e) => {
                warn!("receive failed: {e}");
                return None;
            }
        };

        let text = String::from_utf8_lossy(&bytes);
        debug!("received {} bytes from {from}:\n{text}", bytes.len());
        match parse_message(&text) {
            Ok(Message::Response(resp)) if session.matches(&resp) => {
                if resp.is_final() {
                    return Some(resp);
                }
                debug!("provisional {} {}", resp.status_code, resp.reason);
            }
            Ok(Message::Response(resp)) => {
                debug!("ignoring unrelated response {}", resp.status_code);
            }
            Ok(Message::Request(req)) => debug!("ignoring {} request from {from}", req.method),
            Err(e) => warn!("unparseable datagram from {from}: {e}"),
        }
    }
}

/// Registrar URI and the next hop datagrams go to (outbound proxy if set).
fn parse_targets(identity: &Identity) -> Result<(RegistrarUri, RegistrarUri), SipError> {
    let registrar = RegistrarUri::parse(&identity.registrar)?;
    let next_hop = match identity.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(proxy) => RegistrarUri::parse(proxy)?,
        None => registrar.clone(),
    };
    Ok((registrar, next_hop))
}

/// `<sip:user@ip:port>`, user taken from the AOR, else the auth username.
fn build_contact_uri(identity: &Identity, ip: &str, port: u16) -> String {
    let without_scheme = identity.aor.trim().trim_start_matches("sip:");
    let user_part = match without_scheme.split_once('@') {
        Some((user, _)) if !user.is_empty() => user,
        _ => identity.username.as_str(),
    };
    if ip.contains(':') {
        format!("<sip:{}@[{}]:{}>", user_part, ip, port)
    } else {
        format!("<sip:{}@{}:{}>", user_part, ip, port)
    }
}
