use std::sync::mpsc::{Receiver, Sender};

/// Notifications about account registrations, delivered to whoever called
/// `UserAgent::subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Registered { aor: String, expires: u32, confirmed: bool },
    RegisterFailed { aor: String, reason: String },
    Unregistered { aor: String },
}

pub type AgentEventSender = Sender<AgentEvent>;
pub type AgentEventReceiver = Receiver<AgentEvent>;
