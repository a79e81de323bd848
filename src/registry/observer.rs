use std::sync::mpsc;

use tracing::trace;

use crate::layer::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The reconnect handshake finished and the unacknowledged backlog was resent.
    Reconnected { sid: SessionId },
    /// The session was dropped to make room for another id sharing its slot.
    Evicted { sid: SessionId },
}

pub trait Observer {
    fn on_event(&mut self, event: Event);
}

impl Observer for mpsc::Sender<Event> {
    fn on_event(&mut self, event: Event) {
        if self.send(event).is_err() {
            trace!(?event, "event receiver gone");
        }
    }
}
