//! Sessions addressed by id.
//!
//! A session lives in slot `sid % capacity`, so lookups never search. Two ids sharing a slot
//! cannot be live at the same time; [`CollisionPolicy`] decides what `create` does about it.

mod observer;

use tracing::{debug, warn};

use crate::layer::{InputError, InputReport, SendError, Session, SessionBuilder, SessionId, Stat};

pub use observer::*;

pub struct RegistryBuilder {
    pub capacity: usize,
    /// Settings for every session the registry creates.
    pub session: SessionBuilder,
    pub collision: CollisionPolicy,
    pub observer: Option<Box<dyn Observer>>,
}

impl RegistryBuilder {
    pub fn build(self) -> Result<Registry, BuildError> {
        if self.capacity == 0 {
            return Err(BuildError::ZeroCapacity);
        }
        let this = Registry {
            slots: (0..self.capacity).map(|_| None).collect(),
            len: 0,
            session: self.session,
            collision: self.collision,
            observer: self.observer,
        };
        this.check_rep();
        Ok(this)
    }

    pub fn default() -> Self {
        RegistryBuilder {
            capacity: 16384,
            session: SessionBuilder::default(),
            collision: CollisionPolicy::Reject,
            observer: None,
        }
    }
}

#[derive(Debug)]
pub enum BuildError {
    ZeroCapacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// `create` fails while another id holds the slot.
    Reject,
    /// `create` drops the other id's session and reports it to the observer.
    Evict,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    InvalidId { sid: SessionId },
    NotFound { sid: SessionId },
    Disabled { sid: SessionId },
    AlreadyExists { sid: SessionId },
    SlotOccupied { sid: SessionId, occupant: SessionId },
    Send(SendError),
    Input(InputError),
}

/// One unit of pending work of a session.
#[derive(Debug, PartialEq, Eq)]
pub enum Poll {
    Empty,
    /// Wire bytes for the transport.
    Outbound(Vec<u8>),
    /// Bytes delivered to the application.
    Inbound(SessionId, Vec<u8>),
}

pub struct Registry {
    slots: Vec<Option<Session>>,
    len: usize,
    session: SessionBuilder,
    collision: CollisionPolicy,
    observer: Option<Box<dyn Observer>>,
}

impl Registry {
    #[inline]
    fn check_rep(&self) {
        assert!(self.len <= self.slots.len());
    }

    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ids of the sessions held, in slot order.
    pub fn sids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.slots.iter().flatten().map(|session| session.sid())
    }

    fn slot(&self, sid: SessionId) -> Result<usize, Error> {
        if sid <= 0 {
            return Err(Error::InvalidId { sid });
        }
        Ok(sid as usize % self.slots.len())
    }

    pub fn create(&mut self, sid: SessionId) -> Result<&mut Session, Error> {
        let slot = self.slot(sid)?;
        if let Some(occupant) = &self.slots[slot] {
            if occupant.sid() == sid {
                if occupant.is_enabled() {
                    return Err(Error::AlreadyExists { sid });
                }
                debug!(sid, "release stale session");
            } else {
                let occupant = occupant.sid();
                match self.collision {
                    CollisionPolicy::Reject => {
                        return Err(Error::SlotOccupied { sid, occupant });
                    }
                    CollisionPolicy::Evict => {
                        warn!(sid, occupant, slot, "evict session on slot collision");
                        self.emit(Event::Evicted { sid: occupant });
                    }
                }
            }
            self.slots[slot] = None;
            self.len -= 1;
        }

        self.len += 1;
        self.check_rep();
        Ok(self.slots[slot].insert(self.session.build(sid)))
    }

    /// Releases the session and returns its final counters.
    pub fn delete(&mut self, sid: SessionId) -> Result<Stat, Error> {
        let slot = self.slot(sid)?;
        let session = match self.slots[slot].take() {
            Some(session) if session.sid() == sid => session,
            other => {
                self.slots[slot] = other;
                return Err(Error::NotFound { sid });
            }
        };
        let stat = session.stat();
        self.len -= 1;
        debug!(sid, ?stat, "delete session");
        self.check_rep();
        Ok(stat)
    }

    /// Looks `sid` up; with `enabled_only` a disabled session counts as absent.
    #[must_use]
    pub fn find(&self, sid: SessionId, enabled_only: bool) -> Option<&Session> {
        let slot = self.slot(sid).ok()?;
        self.slots[slot]
            .as_ref()
            .filter(|session| session.sid() == sid)
            .filter(|session| !enabled_only || session.is_enabled())
    }

    #[must_use]
    pub fn find_mut(&mut self, sid: SessionId, enabled_only: bool) -> Option<&mut Session> {
        let slot = self.slot(sid).ok()?;
        self.slots[slot]
            .as_mut()
            .filter(|session| session.sid() == sid)
            .filter(|session| !enabled_only || session.is_enabled())
    }

    fn get(&mut self, sid: SessionId) -> Result<&mut Session, Error> {
        let slot = self.slot(sid)?;
        match &mut self.slots[slot] {
            Some(session) if session.sid() == sid => Ok(session),
            _ => Err(Error::NotFound { sid }),
        }
    }

    fn get_enabled(&mut self, sid: SessionId) -> Result<&mut Session, Error> {
        let session = self.get(sid)?;
        if !session.is_enabled() {
            return Err(Error::Disabled { sid });
        }
        Ok(session)
    }

    pub fn disable(&mut self, sid: SessionId) -> Result<(), Error> {
        self.get_enabled(sid)?.set_enabled(false);
        Ok(())
    }

    pub fn send_ack(&mut self, sid: SessionId) -> Result<(), Error> {
        self.get_enabled(sid)?.send_ack();
        Ok(())
    }

    /// Re-enables the session, disabled or not, and starts the reconnect handshake.
    pub fn reconnect(&mut self, sid: SessionId) -> Result<(), Error> {
        self.get(sid)?.reconnect();
        Ok(())
    }

    pub fn send(&mut self, sid: SessionId, data: &[u8]) -> Result<(), Error> {
        self.get_enabled(sid)?.send(data).map_err(Error::Send)
    }

    pub fn send_message(&mut self, sid: SessionId, msg: &[u8]) -> Result<(), Error> {
        self.get_enabled(sid)?.send_message(msg).map_err(Error::Send)
    }

    /// Feeds transport bytes into the session and reports a completed reconnect to the observer.
    ///
    /// The event is emitted even when a malformed header later fails the call.
    pub fn input(&mut self, sid: SessionId, data: &[u8]) -> Result<InputReport, Error> {
        let res = self.get_enabled(sid)?.input(data);
        let reconnected = match &res {
            Ok(report) => report.reconnected,
            Err(e) => e.report().reconnected,
        };
        if reconnected {
            self.emit(Event::Reconnected { sid });
        }
        res.map_err(Error::Input)
    }

    /// Takes all pending output, or else all delivered bytes.
    pub fn poll(&mut self, sid: SessionId) -> Result<Poll, Error> {
        let session = self.get_enabled(sid)?;
        if let Some(wire) = take_framed(session) {
            return Ok(Poll::Outbound(wire));
        }
        let len = session.delivered_len();
        if len == 0 {
            return Ok(Poll::Empty);
        }
        let data = session.pullup_delivered().to_vec();
        session.drain_delivered(len);
        Ok(Poll::Inbound(sid, data))
    }

    /// Like [`Registry::poll`], but inbound work is one whole length-prefixed message.
    pub fn poll_message(&mut self, sid: SessionId) -> Result<Poll, Error> {
        let session = self.get_enabled(sid)?;
        if let Some(wire) = take_framed(session) {
            return Ok(Poll::Outbound(wire));
        }
        Ok(match session.recv_message() {
            Some(msg) => Poll::Inbound(sid, msg),
            None => Poll::Empty,
        })
    }

    fn emit(&mut self, event: Event) {
        if let Some(observer) = &mut self.observer {
            observer.on_event(event);
        }
    }
}

fn take_framed(session: &mut Session) -> Option<Vec<u8>> {
    let len = session.framed_len();
    if len == 0 {
        return None;
    }
    let wire = session.pullup_framed().to_vec();
    session.drain_framed(len);
    Some(wire)
}
