use core::fmt::Write;

use log::{debug, info, warn};
use rand::Rng;

use crate::{
    auth::{to_hex, DigestAuthorization, DigestChallenge, DigestCredentials, DigestEngine},
    message::{Header, Method, Request, Response},
    parse_challenge_header, Result, SipError,
};

const BRANCH_COOKIE: &str = "z9hG4bK";
const QOP_AUTH: &str = "auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Idle,
    AwaitingChallenge,
    Authenticating,
    Registered,
    Failed,
}

/// Where the credentials for the authenticated round came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    /// Realm and nonce were taken from the registrar's reply.
    Confirmed,
    /// No usable challenge arrived; a cached or configured one was used.
    Fallback,
    /// The registrar accepted the unauthenticated REGISTER.
    NotRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationResult {
    /// Final 2xx seen; carries the granted expiry in seconds.
    Registered(u32),
    /// Authenticated REGISTER went out but no final response arrived.
    Unconfirmed(u32),
    /// 2xx to a REGISTER with `Expires: 0`.
    Unregistered,
    Failed(u16),
}

/// Call-ID and From-tag shared by every request of one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogIds {
    pub call_id: String,
    pub from_tag: String,
}

impl DialogIds {
    pub fn new(call_id: &str, from_tag: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            from_tag: from_tag.to_string(),
        }
    }

    pub fn generate(local_ip: &str) -> Self {
        let mut call_id = random_token(8);
        let _ = write!(call_id, "@{}", local_ip);
        Self {
            call_id,
            from_tag: random_token(4),
        }
    }
}

/// The parts of a REGISTER that stay the same across both rounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterTarget<'a> {
    /// Request-URI, also the digest `uri`.
    pub request_uri: &'a str,
    pub aor: &'a str,
    pub via_host: &'a str,
    pub via_port: u16,
    pub contact: &'a str,
    pub expires: u32,
}

#[derive(Debug, Clone)]
pub struct RegisterParams<'a> {
    pub target: &'a RegisterTarget<'a>,
    pub dialog: &'a DialogIds,
    pub cseq: u32,
    pub branch: &'a str,
    pub authorization: Option<&'a DigestAuthorization>,
}

/// Build a REGISTER request. Pure: every identifier comes from `params`.
pub fn build_register(params: &RegisterParams<'_>) -> Result<Request> {
    let target = params.target;
    let mut req = Request::new(Method::Register, target.request_uri);

    req.add_header(build_via(target.via_host, target.via_port, params.branch)?);
    req.add_header(Header::new("Max-Forwards", "70"));
    req.add_header(build_from(target.aor, &params.dialog.from_tag)?);
    req.add_header(Header::new("To", target.aor));
    req.add_header(Header::new("Call-ID", &params.dialog.call_id));
    req.add_header(Header::new("CSeq", &format_cseq(params.cseq, Method::Register)?));
    req.add_header(Header::new("Contact", target.contact));
    if let Some(auth) = params.authorization {
        req.add_header(auth.to_header());
    }
    req.add_header(Header::new("Expires", &target.expires.to_string()));
    req.add_header(Header::new("Content-Length", "0"));

    Ok(req)
}

/// One identity's registration: dialog identifiers, CSeq, digest state and
/// the last challenge seen. Performs no I/O; the caller sends the requests
/// it builds and feeds back whatever comes in.
#[derive(Debug)]
pub struct RegistrationSession {
    state: RegistrationState,
    dialog: DialogIds,
    cseq: u32,
    digest: DigestEngine,
    challenge: Option<DigestChallenge>,
    challenge_status: Option<ChallengeStatus>,
    requested_expires: u32,
    last_result: Option<RegistrationResult>,
}

impl RegistrationSession {
    pub fn new(dialog: DialogIds, digest: DigestEngine) -> Self {
        Self {
            state: RegistrationState::Idle,
            dialog,
            cseq: 0,
            digest,
            challenge: None,
            challenge_status: None,
            requested_expires: 0,
            last_result: None,
        }
    }

    pub fn with_random_ids(local_ip: &str) -> Self {
        Self::new(DialogIds::generate(local_ip), DigestEngine::default())
    }

    /// Unauthenticated REGISTER that opens a new attempt.
    pub fn start(&mut self, target: &RegisterTarget<'_>) -> Result<Request> {
        if matches!(
            self.state,
            RegistrationState::AwaitingChallenge | RegistrationState::Authenticating
        ) {
            return Err(SipError::InvalidState("registration already in progress"));
        }

        let req = self.next_request(target, None)?;
        self.requested_expires = target.expires;
        self.challenge_status = None;
        self.set_state(RegistrationState::AwaitingChallenge);
        Ok(req)
    }

    /// Handle the reply to the unauthenticated REGISTER, or its absence.
    ///
    /// A usable challenge in the reply wins; otherwise the last challenge
    /// this session answered is reused, and failing that `fallback`. A
    /// reply without a nonce fills an empty realm from `fallback` too.
    pub fn on_challenge(
        &mut self,
        reply: Option<&Response>,
        fallback: &DigestChallenge,
    ) -> Result<ChallengeStatus> {
        if self.state != RegistrationState::AwaitingChallenge {
            return Err(SipError::InvalidState("not awaiting a challenge"));
        }

        if let Some(resp) = reply {
            if (200..300).contains(&resp.status_code) {
                info!("registrar accepted REGISTER without authentication");
                let result = self.accept(resp);
                self.last_result = Some(result);
                return Ok(self.record_status(ChallengeStatus::NotRequired));
            }
        }

        let parsed = reply
            .and_then(|resp| {
                let www = resp.header("WWW-Authenticate").map(|v| (v, false));
                www.or_else(|| resp.header("Proxy-Authenticate").map(|v| (v, true)))
            })
            .map(|(value, from_proxy)| DigestChallenge {
                from_proxy,
                ..parse_challenge_header(value)
            })
            .unwrap_or_default();

        let (mut challenge, status) = if parsed.is_usable() {
            (parsed, ChallengeStatus::Confirmed)
        } else {
            let cached = self.challenge.clone().filter(DigestChallenge::is_usable);
            let reason = if reply.is_some() {
                "reply carried no usable challenge"
            } else {
                "no reply to REGISTER"
            };
            match cached {
                Some(cached) => {
                    warn!("{reason}; reusing previous nonce");
                    (cached, ChallengeStatus::Fallback)
                }
                None => {
                    warn!("{reason}; using fallback realm {}", fallback.realm);
                    (fallback.clone(), ChallengeStatus::Fallback)
                }
            }
        };
        if challenge.realm.is_empty() {
            challenge.realm.clone_from(&fallback.realm);
        }

        debug!(
            "challenge realm={} nonce={} qop={}",
            challenge.realm, challenge.nonce, challenge.qop
        );
        self.challenge = Some(challenge);
        self.set_state(RegistrationState::Authenticating);
        Ok(self.record_status(status))
    }

    /// Authenticated REGISTER for the current challenge. Same Call-ID and
    /// From-tag, next CSeq, fresh branch. Always answers with `qop=auth`.
    pub fn authenticate(
        &mut self,
        target: &RegisterTarget<'_>,
        creds: &DigestCredentials<'_>,
    ) -> Result<Request> {
        if self.state != RegistrationState::Authenticating {
            return Err(SipError::InvalidState("no challenge to answer"));
        }
        let challenge = self
            .challenge
            .clone()
            .ok_or(SipError::InvalidState("no challenge to answer"))?;

        let auth = match self.digest.authorize(
            &challenge,
            creds,
            "REGISTER",
            target.request_uri,
            QOP_AUTH,
        ) {
            Ok(auth) => auth,
            Err(e) => {
                self.fail(0);
                return Err(e);
            }
        };

        self.next_request(target, Some(&auth))
    }

    /// Handle the final response to the authenticated REGISTER. `None`
    /// means the wait ran out: the registration is kept but reported as
    /// unconfirmed.
    pub fn on_final_response(&mut self, resp: Option<&Response>) -> RegistrationResult {
        let result = match resp {
            None => {
                warn!("no final response to authenticated REGISTER; registration unconfirmed");
                self.set_state(if self.requested_expires == 0 {
                    RegistrationState::Idle
                } else {
                    RegistrationState::Registered
                });
                RegistrationResult::Unconfirmed(self.requested_expires)
            }
            Some(resp) if (200..300).contains(&resp.status_code) => self.accept(resp),
            Some(resp) => {
                warn!(
                    "registration rejected: {} {}",
                    resp.status_code, resp.reason
                );
                self.fail(resp.status_code)
            }
        };
        self.last_result = Some(result);
        result
    }

    /// Mark the attempt as failed, e.g. after a transport error.
    pub fn fail(&mut self, status: u16) -> RegistrationResult {
        self.set_state(RegistrationState::Failed);
        let result = RegistrationResult::Failed(status);
        self.last_result = Some(result);
        result
    }

    /// True when `resp` answers the request this session sent last.
    pub fn matches(&self, resp: &Response) -> bool {
        let call_id = resp.header("Call-ID").or_else(|| resp.header("i"));
        let cseq = resp.header("CSeq").and_then(parse_cseq_number);
        call_id == Some(self.dialog.call_id.as_str()) && cseq == Some(self.cseq)
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn dialog(&self) -> &DialogIds {
        &self.dialog
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    pub fn last_challenge(&self) -> Option<&DigestChallenge> {
        self.challenge.as_ref()
    }

    pub fn challenge_status(&self) -> Option<ChallengeStatus> {
        self.challenge_status
    }

    pub fn last_result(&self) -> Option<RegistrationResult> {
        self.last_result
    }

    fn next_request(
        &mut self,
        target: &RegisterTarget<'_>,
        authorization: Option<&DigestAuthorization>,
    ) -> Result<Request> {
        self.cseq = self.cseq.wrapping_add(1);
        let branch = new_branch();
        build_register(&RegisterParams {
            target,
            dialog: &self.dialog,
            cseq: self.cseq,
            branch: &branch,
            authorization,
        })
    }

    fn accept(&mut self, resp: &Response) -> RegistrationResult {
        if self.requested_expires == 0 {
            self.set_state(RegistrationState::Idle);
            return RegistrationResult::Unregistered;
        }
        let expires = granted_expires(resp).unwrap_or(self.requested_expires);
        self.set_state(RegistrationState::Registered);
        RegistrationResult::Registered(expires)
    }

    fn record_status(&mut self, status: ChallengeStatus) -> ChallengeStatus {
        self.challenge_status = Some(status);
        status
    }

    fn set_state(&mut self, state: RegistrationState) {
        if state != self.state {
            debug!("registration state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

/// `z9hG4bK` magic cookie followed by a random token.
pub fn new_branch() -> String {
    let mut branch = String::from(BRANCH_COOKIE);
    branch.push_str(&random_token(8));
    branch
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(bytes.as_mut_slice());
    to_hex(&bytes)
}

/// Expiry granted by a 2xx: Contact `expires` parameter, then the
/// `Expires` header.
fn granted_expires(resp: &Response) -> Option<u32> {
    let from_contact = resp.header("Contact").and_then(|contact| {
        contact.split(';').find_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("expires")
                .then(|| value.trim().trim_end_matches(|c: char| !c.is_ascii_digit()))
                .and_then(|v| v.parse::<u32>().ok())
        })
    });
    from_contact.or_else(|| resp.header("Expires").and_then(|v| v.trim().parse().ok()))
}

fn parse_cseq_number(cseq: &str) -> Option<u32> {
    cseq.split_whitespace().next()?.parse().ok()
}

fn build_via(host: &str, port: u16, branch: &str) -> Result<Header> {
    let mut value = String::new();
    write!(value, "SIP/2.0/UDP {}:{};rport;branch={}", host, port, branch)
        .map_err(|_| SipError::Capacity)?;
    Ok(Header::new("Via", &value))
}

fn build_from(uri: &str, tag: &str) -> Result<Header> {
    let mut value = String::new();
    write!(value, "{};tag={}", uri, tag).map_err(|_| SipError::Capacity)?;
    Ok(Header::new("From", &value))
}

fn format_cseq(seq: u32, method: Method) -> Result<String> {
    let mut buf = String::new();
    write!(buf, "{} {}", seq, method).map_err(|_| SipError::Capacity)?;
    Ok(buf)
}
