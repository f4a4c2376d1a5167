use std::time::Instant;

use thiserror::Error;

/// Session lifecycle (spec §3): `Handshaking -> Ready -> (Active | Flashing)
/// -> Disconnected`. `Disconnected` is terminal; a returning device gets a
/// fresh session rather than resurrecting this one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionState {
    Handshaking,
    Ready { since: Instant },
    Active { since: Instant },
    Flashing { since: Instant },
    Disconnected,
}

#[derive(Debug, Error)]
#[error("invalid session transition: {from} -> {to}")]
pub struct SessionStateError {
    from: &'static str,
    to: &'static str,
}

impl SessionState {
    fn label(&self) -> &'static str {
        match self {
            SessionState::Handshaking => "Handshaking",
            SessionState::Ready { .. } => "Ready",
            SessionState::Active { .. } => "Active",
            SessionState::Flashing { .. } => "Flashing",
            SessionState::Disconnected => "Disconnected",
        }
    }

    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let allowed = matches!(
            (self, &next),
            (Handshaking, Ready { .. })
                | (Ready { .. }, Active { .. })
                | (Ready { .. }, Flashing { .. })
                | (Active { .. }, Flashing { .. })
                | (Active { .. }, Ready { .. })
                | (Flashing { .. }, Ready { .. })
                | (Flashing { .. }, Active { .. })
                | (_, Disconnected)
        );
        if allowed {
            Ok(next)
        } else {
            Err(SessionStateError {
                from: self.label(),
                to: next.label(),
            })
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, SessionState::Disconnected)
    }
}
