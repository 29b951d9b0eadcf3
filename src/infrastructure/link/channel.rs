//! Flow-controlled command channel.
//!
//! The transport accepts at most one in-flight characteristic write. This
//! channel owns that token: a submission is either sent, refused while a
//! write is pending, or failed outright by the transport. Callers decide
//! what a refusal means - the control stream drops the frame, the
//! bind/unbind handshake defers instead.

use tracing::warn;

use crate::infrastructure::link::protocol::Command;
use crate::infrastructure::link::transport::GattTransport;

/// Outcome of a submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// The frame went out; a write-completed event will follow.
    Sent,
    /// A write is already in flight. Nothing was changed.
    Busy,
    /// The transport refused to start the write. Fatal for the session.
    Failed,
}

/// Outcome of a write completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Idle,
    /// The queued unbind went out on the back of the completed write.
    UnbindChained,
    UnbindFailed,
}

pub struct CommandChannel {
    write_char_uuid: u128,
    write_pending: bool,
    unbind_queued: bool,
}

impl CommandChannel {
    pub fn new(write_char_uuid: u128) -> Self {
        Self {
            write_char_uuid,
            write_pending: false,
            unbind_queued: false,
        }
    }

    pub fn is_write_pending(&self) -> bool {
        self.write_pending
    }

    /// Try to put a command on the wire.
    pub fn submit(&mut self, command: &Command, transport: &mut dyn GattTransport) -> Submit {
        if self.write_pending {
            return Submit::Busy;
        }

        // The transport may keep only a reference to the buffer it is given,
        // so the frame is encoded fresh here; nothing the caller does later
        // can reach a write already on the wire.
        let frame = command.encode();
        match transport.write_command(self.write_char_uuid, frame.as_bytes()) {
            Ok(()) => {
                self.write_pending = true;
                Submit::Sent
            }
            Err(e) => {
                warn!("characteristic write failed to start: {e:#}");
                Submit::Failed
            }
        }
    }

    /// Arm the unbind chain: the next completion sends exactly one Unbind.
    pub fn queue_unbind(&mut self) {
        self.unbind_queued = true;
    }

    /// The in-flight write was acknowledged by the transport.
    pub fn complete_write(&mut self, transport: &mut dyn GattTransport) -> Completion {
        self.write_pending = false;

        if !self.unbind_queued {
            return Completion::Idle;
        }

        // Consumed before the submission: one follow-up, never two.
        self.unbind_queued = false;
        match self.submit(&Command::Unbind, transport) {
            Submit::Sent => Completion::UnbindChained,
            Submit::Busy | Submit::Failed => Completion::UnbindFailed,
        }
    }

    /// Drop all flow-control state (teardown, or a fresh discovery pass).
    pub fn reset(&mut self) {
        self.write_pending = false;
        self.unbind_queued = false;
    }
}
