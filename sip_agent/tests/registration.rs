use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sip_agent::{
    spawn_register, AgentConfig, AgentError, AgentEvent, Identity, TransportConfig,
    TransportError, UserAgent,
};
use sip_core::{
    parse_message, ChallengeStatus, DigestChallenge, DigestCredentials, DigestEngine, Header,
    Message, RegistrationResult, Request, Response, SipError,
};

const PASSWORD: &str = "secret";

/// What the fake registrar does with each REGISTER it receives, in order.
#[derive(Debug, Clone)]
enum Reply {
    Challenge(&'static str),
    FoldedChallenge(&'static str),
    ProxyChallenge(&'static str),
    Status(u16, &'static str),
    Silent,
}

struct FakeRegistrar {
    port: u16,
    handle: JoinHandle<Vec<Request>>,
}

impl FakeRegistrar {
    fn spawn(script: Vec<Reply>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut buf = [0u8; 4096];
            for reply in script {
                let Ok((len, from)) = socket.recv_from(&mut buf) else {
                    break;
                };
                let text = String::from_utf8_lossy(&buf[..len]).to_string();
                let Ok(Message::Request(req)) = parse_message(&text) else {
                    panic!("registrar got a non-request:\n{text}");
                };
                if let Some(resp) = respond(&req, &reply) {
                    let rendered = resp.render().unwrap();
                    socket.send_to(rendered.as_bytes(), from).unwrap();
                }
                seen.push(req);
            }
            seen
        });

        Self { port, handle }
    }

    fn uri(&self) -> String {
        format!("sip:127.0.0.1:{}", self.port)
    }

    fn requests(self) -> Vec<Request> {
        self.handle.join().unwrap()
    }
}

fn respond(req: &Request, reply: &Reply) -> Option<Response> {
    let (code, reason) = match reply {
        Reply::Silent => return None,
        Reply::Challenge(_) | Reply::FoldedChallenge(_) => (401, "Unauthorized"),
        Reply::ProxyChallenge(_) => (407, "Proxy Authentication Required"),
        Reply::Status(code, reason) => (*code, *reason),
    };

    let mut resp = Response::new(code, reason);
    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
        if let Some(value) = req.header(name) {
            resp.add_header(Header::new(name, value));
        }
    }
    match reply {
        Reply::Challenge(nonce) => resp.add_header(Header::new(
            "WWW-Authenticate",
            &format!("Digest realm=\"test.local\", nonce=\"{nonce}\", qop=\"auth\", algorithm=MD5"),
        )),
        // Rendered as a folded header line on the wire.
        Reply::FoldedChallenge(nonce) => resp.add_header(Header::new(
            "WWW-Authenticate",
            &format!("Digest realm=\"test.local\",\r\n  nonce=\"{nonce}\",\r\n  qop=\"auth\""),
        )),
        Reply::ProxyChallenge(nonce) => resp.add_header(Header::new(
            "Proxy-Authenticate",
            &format!("Digest realm=\"test.local\", nonce=\"{nonce}\", qop=\"auth\""),
        )),
        _ => {}
    }
    if (200..300).contains(&code) {
        if let Some(expires) = req.header("Expires") {
            resp.add_header(Header::new("Expires", expires));
        }
    }
    resp.add_header(Header::new("Content-Length", "0"));
    Some(resp)
}

fn auth_param<'a>(value: &'a str, key: &str) -> Option<&'a str> {
    value
        .trim_start_matches("Digest ")
        .split(", ")
        .find_map(|part| part.strip_prefix(key)?.strip_prefix('='))
        .map(|v| v.trim_matches('"'))
}

fn agent(timeout: Duration) -> UserAgent {
    let mut agent = UserAgent::new(AgentConfig {
        transport: TransportConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            candidate_ports: vec![0],
            ..TransportConfig::default()
        },
        receive_timeout: timeout,
        expires: 3600,
        fallback_nonce: "fixture-nonce".to_string(),
    });
    agent.initialize().unwrap();
    agent
}

fn identity(registrar: &str) -> Identity {
    Identity {
        aor: "sip:1314@test.local".to_string(),
        registrar: registrar.to_string(),
        username: "1314".to_string(),
        password: PASSWORD.to_string(),
        proxy: None,
    }
}

fn expected_response(authorization: &str) -> String {
    let challenge = DigestChallenge {
        qop: "auth".to_string(),
        ..DigestChallenge::new(
            auth_param(authorization, "realm").unwrap(),
            auth_param(authorization, "nonce").unwrap(),
        )
    };
    let creds = DigestCredentials {
        username: "1314",
        password: PASSWORD,
    };
    DigestEngine::default()
        .compute_response_with_cnonce(
            &challenge,
            &creds,
            "REGISTER",
            auth_param(authorization, "uri").unwrap(),
            "auth",
            auth_param(authorization, "cnonce").unwrap(),
        )
        .unwrap()
        .response
}

#[test]
fn challenge_then_ok_registers() {
    let registrar = FakeRegistrar::spawn(vec![
        Reply::Challenge("abc123"),
        Reply::Status(200, "OK"),
    ]);
    let mut agent = agent(Duration::from_secs(2));

    let outcome = agent.register_account(&identity(&registrar.uri())).unwrap();
    assert_eq!(outcome.result, RegistrationResult::Registered(3600));
    assert_eq!(outcome.challenge, ChallengeStatus::Confirmed);
    assert!(outcome.confirmed);

    let info = agent.account_info().unwrap();
    assert!(info.registered);
    assert!(info.confirmed);
    assert_eq!(info.expires_secs, 3600);
    assert_eq!(info.uri, "sip:1314@test.local");

    let requests = registrar.requests();
    assert_eq!(requests.len(), 2);
    let (first, second) = (&requests[0], &requests[1]);

    assert!(first.header("Authorization").is_none());
    assert_eq!(first.uri, "sip:127.0.0.1");
    assert_eq!(first.header("CSeq"), Some("1 REGISTER"));
    assert_eq!(second.header("CSeq"), Some("2 REGISTER"));
    assert_eq!(first.header("Call-ID"), second.header("Call-ID"));
    assert_eq!(first.header("From"), second.header("From"));
    assert_ne!(first.header("Via"), second.header("Via"));
    assert!(first.header("Via").unwrap().contains(";branch=z9hG4bK"));

    let authorization = second.header("Authorization").unwrap();
    assert_eq!(auth_param(authorization, "nonce"), Some("abc123"));
    assert_eq!(auth_param(authorization, "realm"), Some("test.local"));
    assert_eq!(auth_param(authorization, "nc"), Some("00000001"));
    assert_eq!(auth_param(authorization, "qop"), Some("auth"));
    assert_eq!(
        auth_param(authorization, "response"),
        Some(expected_response(authorization).as_str())
    );
}

#[test]
fn repeated_registration_keeps_dialog() {
    let registrar = FakeRegistrar::spawn(vec![
        Reply::Challenge("n1"),
        Reply::Status(200, "OK"),
        Reply::Challenge("n2"),
        Reply::Status(200, "OK"),
        Reply::Challenge("n2"),
        Reply::Status(200, "OK"),
    ]);
    let mut agent = agent(Duration::from_secs(2));
    let id = identity(&registrar.uri());

    for _ in 0..3 {
        agent.register_account(&id).unwrap();
    }

    let requests = registrar.requests();
    assert_eq!(requests.len(), 6);
    let call_id = requests[0].header("Call-ID");
    assert!(requests.iter().all(|r| r.header("Call-ID") == call_id));
    assert_eq!(requests[5].header("CSeq"), Some("6 REGISTER"));

    let nc = |i: usize| {
        auth_param(requests[i].header("Authorization").unwrap(), "nc").map(str::to_string)
    };
    assert_eq!(nc(1).as_deref(), Some("00000001"));
    // New nonce restarts the count, same nonce continues it.
    assert_eq!(nc(3).as_deref(), Some("00000001"));
    assert_eq!(nc(5).as_deref(), Some("00000002"));
}

#[test]
fn silent_registrar_leaves_registration_unconfirmed() {
    let registrar = FakeRegistrar::spawn(vec![Reply::Silent, Reply::Silent]);
    let mut agent = agent(Duration::from_millis(300));
    let events = agent.subscribe();

    let outcome = agent.register_account(&identity(&registrar.uri())).unwrap();
    assert_eq!(outcome.result, RegistrationResult::Unconfirmed(3600));
    assert_eq!(outcome.challenge, ChallengeStatus::Fallback);
    assert!(!outcome.confirmed);

    let info = agent.account_info().unwrap();
    assert!(info.registered);
    assert!(!info.confirmed);

    let requests = registrar.requests();
    assert_eq!(requests.len(), 2);
    let authorization = requests[1].header("Authorization").unwrap();
    assert_eq!(auth_param(authorization, "nonce"), Some("fixture-nonce"));
    assert_eq!(auth_param(authorization, "realm"), Some("127.0.0.1"));

    assert_eq!(
        events.try_recv().unwrap(),
        AgentEvent::Registered {
            aor: "sip:1314@test.local".to_string(),
            expires: 3600,
            confirmed: false,
        }
    );
}

#[test]
fn rejection_after_auth_is_reported() {
    let registrar = FakeRegistrar::spawn(vec![
        Reply::Challenge("abc123"),
        Reply::Status(403, "Forbidden"),
    ]);
    let mut agent = agent(Duration::from_secs(2));
    let events = agent.subscribe();

    let err = agent
        .register_account(&identity(&registrar.uri()))
        .unwrap_err();
    assert!(matches!(err, AgentError::Rejected { status: 403, .. }));

    let info = agent.account_info().unwrap();
    assert!(!info.registered);
    assert!(info.last_error.as_deref().unwrap().contains("403"));
    assert!(matches!(
        events.try_recv().unwrap(),
        AgentEvent::RegisterFailed { .. }
    ));
    assert_eq!(registrar.requests().len(), 2);
}

#[test]
fn malformed_registrar_fails_before_sending() {
    let mut agent = agent(Duration::from_millis(100));

    let err = agent.register_account(&identity("http://pbx")).unwrap_err();
    assert!(matches!(
        err,
        AgentError::Sip(SipError::MalformedRegistrar(_))
    ));
    let info = agent.account_info().unwrap();
    assert!(!info.registered);
    assert!(info.last_error.is_some());
}

#[test]
fn unregister_sends_zero_expires() {
    let registrar = FakeRegistrar::spawn(vec![
        Reply::Challenge("abc123"),
        Reply::Status(200, "OK"),
        Reply::Challenge("abc123"),
        Reply::Status(200, "OK"),
    ]);
    let mut agent = agent(Duration::from_secs(2));
    let events = agent.subscribe();
    let id = identity(&registrar.uri());

    agent.register_account(&id).unwrap();
    let outcome = agent.unregister_account(&id.aor).unwrap();
    assert_eq!(outcome.result, RegistrationResult::Unregistered);
    assert!(!agent.account_info().unwrap().registered);

    let requests = registrar.requests();
    assert_eq!(requests[2].header("Expires"), Some("0"));
    assert_eq!(requests[3].header("Expires"), Some("0"));
    assert_eq!(requests[0].header("Call-ID"), requests[3].header("Call-ID"));

    let seen: Vec<AgentEvent> = events.try_iter().collect();
    assert!(matches!(seen[0], AgentEvent::Registered { confirmed: true, .. }));
    assert!(matches!(seen[1], AgentEvent::Unregistered { .. }));
}

#[test]
fn open_registrar_needs_one_request() {
    let registrar = FakeRegistrar::spawn(vec![Reply::Status(200, "OK")]);
    let mut agent = agent(Duration::from_secs(2));

    let outcome = agent.register_account(&identity(&registrar.uri())).unwrap();
    assert_eq!(outcome.challenge, ChallengeStatus::NotRequired);
    assert_eq!(outcome.result, RegistrationResult::Registered(3600));

    let requests = registrar.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].header("Authorization").is_none());
}

#[test]
fn outbound_proxy_receives_requests() {
    let proxy = FakeRegistrar::spawn(vec![
        Reply::Challenge("abc123"),
        Reply::Status(200, "OK"),
    ]);
    let mut agent = agent(Duration::from_secs(2));
    let id = Identity {
        proxy: Some(proxy.uri()),
        ..identity("sip:registrar.test.local")
    };

    agent.register_account(&id).unwrap();

    let requests = proxy.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].uri, "sip:registrar.test.local");
}

#[test]
fn register_from_background_thread() {
    let registrar = FakeRegistrar::spawn(vec![
        Reply::Challenge("abc123"),
        Reply::Status(200, "OK"),
    ]);
    let agent = Arc::new(Mutex::new(agent(Duration::from_secs(2))));

    let handle = spawn_register(agent.clone(), identity(&registrar.uri())).unwrap();
    assert_eq!(handle.thread().name(), Some("sip-register"));
    let outcome = handle.join().unwrap().unwrap();
    assert!(outcome.confirmed);
    assert!(agent.lock().unwrap().account_info().unwrap().registered);
    assert_eq!(registrar.requests().len(), 2);
}

#[test]
fn initialize_and_shutdown_are_idempotent() {
    let mut agent = agent(Duration::from_millis(100));
    assert!(agent.is_initialized());
    assert_eq!(agent.initialize().unwrap(), "SIP stack already initialized");
    assert!(agent.bound_port().unwrap() > 0);
    assert_eq!(agent.local_ip(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

    assert_eq!(agent.shutdown(), "SIP stack shutdown");
    assert_eq!(agent.shutdown(), "SIP stack shutdown");
    assert!(!agent.is_initialized());
    assert!(matches!(
        agent.register_account(&identity("sip:127.0.0.1")),
        Err(AgentError::NotInitialized)
    ));
    assert!(agent.version().starts_with("sip_agent "));
}

#[test]
fn folded_challenge_is_answered() {
    let registrar = FakeRegistrar::spawn(vec![
        Reply::FoldedChallenge("folded-nonce"),
        Reply::Status(200, "OK"),
    ]);
    let mut agent = agent(Duration::from_secs(2));

    let outcome = agent.register_account(&identity(&registrar.uri())).unwrap();
    assert_eq!(outcome.challenge, ChallengeStatus::Confirmed);
    assert!(outcome.confirmed);

    let requests = registrar.requests();
    let authorization = requests[1].header("Authorization").unwrap();
    assert_eq!(auth_param(authorization, "nonce"), Some("folded-nonce"));
    assert_eq!(auth_param(authorization, "realm"), Some("test.local"));
}

#[test]
fn proxy_challenge_is_answered_with_proxy_authorization() {
    let registrar = FakeRegistrar::spawn(vec![
        Reply::ProxyChallenge("pn"),
        Reply::Status(200, "OK"),
    ]);
    let mut agent = agent(Duration::from_secs(2));

    let outcome = agent.register_account(&identity(&registrar.uri())).unwrap();
    assert!(outcome.confirmed);

    let requests = registrar.requests();
    assert!(requests[1].header("Authorization").is_none());
    let authorization = requests[1].header("Proxy-Authorization").unwrap();
    assert_eq!(auth_param(authorization, "nonce"), Some("pn"));
    assert_eq!(
        auth_param(authorization, "response"),
        Some(expected_response(authorization).as_str())
    );
}

#[test]
fn send_failure_aborts_then_recovers() {
    // An IPv4 socket cannot send to an IPv6 destination.
    let mut agent = agent(Duration::from_millis(300));
    let events = agent.subscribe();
    let unreachable = identity("sip:[::1]:5060");

    let err = agent.register_account(&unreachable).unwrap_err();
    assert!(matches!(err, AgentError::Transport(TransportError::Io(_))));
    let info = agent.account_info().unwrap();
    assert!(!info.registered);
    assert!(info.last_error.is_some());
    assert!(matches!(
        events.try_recv().unwrap(),
        AgentEvent::RegisterFailed { .. }
    ));

    let registrar = FakeRegistrar::spawn(vec![
        Reply::Challenge("abc123"),
        Reply::Status(200, "OK"),
    ]);
    let outcome = agent.register_account(&identity(&registrar.uri())).unwrap();
    assert!(outcome.confirmed);

    let requests = registrar.requests();
    assert_eq!(requests[0].header("CSeq"), Some("2 REGISTER"));
    assert_eq!(requests[1].header("CSeq"), Some("3 REGISTER"));
}
