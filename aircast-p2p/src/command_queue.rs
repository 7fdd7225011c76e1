//! Request/reply serialization for the control socket
//!
//! The supplicant control socket does not multiplex: replies carry no
//! correlation id and always answer the single request currently on the
//! wire. The queue keeps outgoing requests FIFO, allows at most one of them
//! in flight, and binds the N-th reply to the N-th completion.
//!
//! The queue performs no I/O itself. `enqueue` and `begin_next` hand back
//! the message that should be written now, and the owner pushes it to the
//! socket. Completions receive a mutable borrow of the owning context, so a
//! completion may enqueue follow-up requests; those land behind the entry
//! being completed.

use std::collections::VecDeque;

use crate::message::Message;

/// Callback invoked with the reply to a queued request
pub type Completion<Ctx> = Box<dyn FnOnce(&mut Ctx, &Message) + Send>;

/// An outgoing request awaiting its reply
pub struct CommandEntry<Ctx> {
    pub message: Message,
    pub completion: Option<Completion<Ctx>>,
}

/// FIFO of outgoing requests with single-in-flight dispatch
pub struct CommandQueue<Ctx> {
    pending: VecDeque<CommandEntry<Ctx>>,
    in_flight: bool,
}

impl<Ctx> CommandQueue<Ctx> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: false,
        }
    }

    /// Append a request. When nothing is in flight the request becomes the
    /// in-flight head immediately and is returned for writing.
    pub fn enqueue(
        &mut self,
        message: Message,
        completion: Option<Completion<Ctx>>,
    ) -> Option<Message> {
        self.pending.push_back(CommandEntry {
            message,
            completion,
        });

        if self.in_flight {
            return None;
        }

        self.in_flight = true;
        self.pending.front().map(|entry| entry.message.clone())
    }

    /// Take the in-flight head to complete it with a reply. Returns `None`
    /// when no request is in flight.
    pub fn complete_head(&mut self) -> Option<CommandEntry<Ctx>> {
        if !self.in_flight {
            return None;
        }

        self.in_flight = false;
        self.pending.pop_front()
    }

    /// Promote the next pending request to in-flight, returning it for
    /// writing. Called after the previous head's completion has run.
    pub fn begin_next(&mut self) -> Option<Message> {
        if self.in_flight {
            return None;
        }

        let next = self.pending.front().map(|entry| entry.message.clone())?;
        self.in_flight = true;
        Some(next)
    }

    /// Drop all pending entries, completions included. Used when the link
    /// goes down and replies can no longer arrive.
    pub fn clear(&mut self) -> usize {
        self.in_flight = false;
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn is_idle(&self) -> bool {
        !self.in_flight && self.pending.is_empty()
    }
}

impl<Ctx> Default for CommandQueue<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}
