use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use log::info;

mod agent;
mod messages;
pub mod settings;
pub mod transport;

pub use agent::{
    AccountInfo, AgentConfig, AgentError, Identity, RegistrationOutcome, UserAgent,
};
pub use messages::{AgentEvent, AgentEventReceiver, AgentEventSender};
pub use transport::{TransportConfig, TransportError, UdpTransport, DEFAULT_CANDIDATE_PORTS};

pub type RegisterHandle = thread::JoinHandle<Result<RegistrationOutcome, AgentError>>;

/// Run `register_account` on a named background thread. The agent stays
/// locked for the length of the attempt, so attempts on one agent never
/// overlap.
pub fn spawn_register(agent: Arc<Mutex<UserAgent>>, identity: Identity) -> io::Result<RegisterHandle> {
    thread::Builder::new()
        .name("sip-register".into())
        .spawn(move || {
            let mut agent = agent.lock().unwrap_or_else(PoisonError::into_inner);
            agent.register_account(&identity)
        })
}

pub fn run() -> Result<(), AgentError> {
    let cfg = &settings::SETTINGS;
    let mut agent = UserAgent::new(AgentConfig::from(cfg));
    info!("starting {}", agent.version());

    agent.initialize()?;
    let events = agent.subscribe();

    let agent = Arc::new(Mutex::new(agent));
    let handle = spawn_register(agent.clone(), Identity::from(cfg)).map_err(TransportError::from)?;
    let outcome = handle.join().unwrap_or(Err(AgentError::WorkerPanicked));

    for event in events.try_iter() {
        info!("event: {event:?}");
    }

    let mut agent = agent.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(info) = agent.account_info() {
        info!(
            "{}: {} (registered={}, confirmed={}, expires={}s)",
            info.uri, info.status, info.registered, info.confirmed, info.expires_secs
        );
    }
    info!("{}", agent.shutdown());

    outcome.map(|_| ())
}
