//! Decision Surface
//!
//! Single-threaded state machine fed by the broker's prompt channel.
//! `Idle → Prompting(ticket) → Idle`, with further prompts queued in arrival
//! order so a second concurrent prompt is never dropped.

use std::collections::VecDeque;

use chrono::Utc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::debug;

use crate::ssh::{Decision, HostKeyPromptEvent, PendingAuthentication, PromptEvent, PromptReceiver, TicketId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceState {
    Idle,
    Prompting(TicketId),
}

#[derive(Default)]
pub struct DecisionSurface {
    current: Option<PendingAuthentication>,
    queue: VecDeque<PendingAuthentication>,
}

impl DecisionSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SurfaceState {
        match &self.current {
            Some(p) => SurfaceState::Prompting(p.ticket_id.clone()),
            None => SurfaceState::Idle,
        }
    }

    /// Prompts waiting behind the current one
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn current(&self) -> Option<&PendingAuthentication> {
        self.current.as_ref()
    }

    fn knows(&self, ticket_id: &TicketId) -> bool {
        self.current.iter().chain(self.queue.iter()).any(|p| &p.ticket_id == ticket_id)
    }

    /// Apply one broker event
    pub fn apply(&mut self, event: PromptEvent) {
        match event {
            PromptEvent::Prompt(pending) => {
                if self.knows(&pending.ticket_id) {
                    debug!("Prompt for ticket {} already shown, ignoring", pending.ticket_id);
                    return;
                }
                if self.current.is_none() {
                    self.current = Some(pending);
                } else {
                    self.queue.push_back(pending);
                }
            }
            PromptEvent::Withdrawn(ticket_id) => {
                if self.current.as_ref().is_some_and(|p| p.ticket_id == ticket_id) {
                    debug!("Current prompt {} withdrawn", ticket_id);
                    self.advance();
                } else {
                    self.queue.retain(|p| p.ticket_id != ticket_id);
                }
            }
        }
    }

    /// Drain every event that is ready without waiting
    ///
    /// Returns the number of events applied.
    pub fn pump(&mut self, rx: &mut PromptReceiver) -> usize {
        let mut applied = 0;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    self.apply(event);
                    applied += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return applied,
            }
        }
    }

    /// Render data for the current prompt
    pub fn view(&self) -> Option<HostKeyPromptEvent> {
        self.current
            .as_ref()
            .map(|p| HostKeyPromptEvent::from_pending(p, Utc::now()))
    }

    /// Map a keypress to a decision: `y` accepts, `n` rejects
    pub fn handle_key(&mut self, key: char) -> Option<Decision> {
        match key {
            'y' | 'Y' => self.decide(true),
            'n' | 'N' => self.decide(false),
            _ => None,
        }
    }

    /// Answer the current prompt and move on
    pub fn decide(&mut self, accepted: bool) -> Option<Decision> {
        let pending = self.current.take()?;
        self.advance();
        Some(Decision {
            ticket_id: pending.ticket_id,
            accepted,
        })
    }

    fn advance(&mut self) {
        self.current = self.queue.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::DecisionBroker;

    fn pending(host: &str) -> PendingAuthentication {
        PendingAuthentication {
            ticket_id: TicketId::new(),
            host: host.to_string(),
            remote_address: format!("{}:22", host),
            key_type: "ssh-ed25519".to_string(),
            fingerprint: "SHA256:abc".to_string(),
            key_material: vec![7; 32],
            issued_at: Utc::now(),
        }
    }

    #[test]
    fn test_idle_to_prompting_and_back() {
        let mut surface = DecisionSurface::new();
        assert_eq!(surface.state(), SurfaceState::Idle);
        assert!(surface.view().is_none());

        let p = pending("db1");
        let id = p.ticket_id.clone();
        surface.apply(PromptEvent::Prompt(p));
        assert_eq!(surface.state(), SurfaceState::Prompting(id.clone()));

        let view = surface.view().unwrap();
        assert_eq!(view.host, "db1");
        assert_eq!(view.fingerprint, "SHA256:abc");
        assert!(view.warning.contains("never been seen before"));

        // Unrelated keys do nothing
        assert!(surface.handle_key('x').is_none());
        let decision = surface.handle_key('y').unwrap();
        assert_eq!(decision, Decision { ticket_id: id, accepted: true });
        assert_eq!(surface.state(), SurfaceState::Idle);
        assert!(surface.handle_key('n').is_none());
    }

    #[test]
    fn test_concurrent_prompts_are_queued() {
        let mut surface = DecisionSurface::new();
        let a = pending("db1");
        let b = pending("db2");
        let (a_id, b_id) = (a.ticket_id.clone(), b.ticket_id.clone());

        surface.apply(PromptEvent::Prompt(a));
        surface.apply(PromptEvent::Prompt(b));
        assert_eq!(surface.state(), SurfaceState::Prompting(a_id.clone()));
        assert_eq!(surface.queued(), 1);

        let first = surface.handle_key('n').unwrap();
        assert_eq!(first.ticket_id, a_id);
        assert!(!first.accepted);
        assert_eq!(surface.state(), SurfaceState::Prompting(b_id.clone()));

        let second = surface.handle_key('Y').unwrap();
        assert_eq!(second.ticket_id, b_id);
        assert_eq!(surface.state(), SurfaceState::Idle);
    }

    #[test]
    fn test_duplicate_prompt_shown_once() {
        let mut surface = DecisionSurface::new();
        let p = pending("db1");
        surface.apply(PromptEvent::Prompt(p.clone()));
        surface.apply(PromptEvent::Prompt(p));
        assert_eq!(surface.queued(), 0);
        surface.decide(true).unwrap();
        assert_eq!(surface.state(), SurfaceState::Idle);
    }

    #[test]
    fn test_withdrawn_prompts_removed() {
        let mut surface = DecisionSurface::new();
        let a = pending("db1");
        let b = pending("db2");
        let c = pending("db3");
        let (a_id, b_id, c_id) = (a.ticket_id.clone(), b.ticket_id.clone(), c.ticket_id.clone());
        surface.apply(PromptEvent::Prompt(a));
        surface.apply(PromptEvent::Prompt(b));
        surface.apply(PromptEvent::Prompt(c));

        // Queued one disappears
        surface.apply(PromptEvent::Withdrawn(b_id));
        assert_eq!(surface.queued(), 1);

        // Current one disappears, next takes its place
        surface.apply(PromptEvent::Withdrawn(a_id));
        assert_eq!(surface.state(), SurfaceState::Prompting(c_id));

        // Unknown withdrawals are ignored
        surface.apply(PromptEvent::Withdrawn(TicketId::new()));
        assert_eq!(surface.queued(), 0);
        assert!(surface.current().is_some());
    }

    #[test]
    fn test_pump_with_broker() {
        let (broker, mut rx) = DecisionBroker::new();
        let mut surface = DecisionSurface::new();

        let ticket = broker.issue(pending("db1")).unwrap();
        assert_eq!(surface.pump(&mut rx), 1);

        let decision = surface.handle_key('y').unwrap();
        assert_eq!(&decision.ticket_id, ticket.id());
        assert!(broker.resolve(&decision));
        // A repeated keypress after resolution produces nothing to send
        assert!(surface.handle_key('y').is_none());

        // The withdrawal for the answered ticket is harmless
        assert_eq!(surface.pump(&mut rx), 1);
        assert_eq!(surface.state(), SurfaceState::Idle);
        assert_eq!(
            ticket.wait(),
            crate::ssh::Verdict::Decided { accepted: true }
        );
    }
}
