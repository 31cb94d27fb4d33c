//! The shared text buffer: a chunk plus typed mutation events.
use crate::{Result, TextChunk, TextOperation, UserId};

/// Handle returned by [`TextBuffer::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(u64);

/// A buffer mutation, reported after it took effect. `remote` is false for
/// edits made through the local editor and true for edits replayed from
/// other participants, so editor hooks can tell the two apart.
#[derive(Clone, Debug)]
pub enum BufferEvent {
    /// Text was inserted.
    Inserted {
        /// Character offset of the insertion.
        pos: usize,
        /// The inserted, authored text.
        chunk: TextChunk,
        /// The acting user.
        user: UserId,
        /// Whether the edit originated on another replica.
        remote: bool,
    },
    /// Text was erased.
    Erased {
        /// Character offset of the erasure.
        pos: usize,
        /// The erased, authored text.
        chunk: TextChunk,
        /// The acting user.
        user: UserId,
        /// Whether the edit originated on another replica.
        remote: bool,
    },
}

type Subscriber = Box<dyn FnMut(&BufferEvent) + Send>;

/// Wraps a [`TextChunk`] and notifies subscribers of every mutation.
#[derive(Default)]
pub struct TextBuffer {
    chunk: TextChunk,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: u64,
}

impl TextBuffer {
    /// Returns an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a buffer initialised with `chunk`.
    pub fn from_chunk(chunk: TextChunk) -> Self {
        Self {
            chunk,
            ..Self::default()
        }
    }

    /// The current content.
    pub fn chunk(&self) -> &TextChunk {
        &self.chunk
    }

    /// Character length of the content.
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    /// Replaces the content wholesale without emitting events, used when
    /// loading synchronised state.
    pub fn restore(&mut self, chunk: TextChunk) {
        self.chunk = chunk;
    }

    /// Registers `subscriber` for mutation events. Subscribers run in
    /// registration order.
    pub fn subscribe(&mut self, subscriber: impl FnMut(&BufferEvent) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(subscriber)));
        id
    }

    /// Removes a subscriber. Unknown handles are ignored.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.retain(|(sid, _)| *sid != id);
    }

    /// Applies `operation` on behalf of `user`, returning the reversible
    /// form as executed. Emits one event per atomic edit.
    pub fn apply(
        &mut self,
        operation: &TextOperation,
        user: UserId,
        remote: bool,
    ) -> Result<TextOperation> {
        let applied = operation.apply(&mut self.chunk)?;
        self.emit_applied(&applied, user, remote);
        Ok(applied)
    }

    fn emit_applied(&mut self, applied: &TextOperation, user: UserId, remote: bool) {
        match applied {
            TextOperation::Insert { pos, chunk } => {
                self.emit(BufferEvent::Inserted {
                    pos: *pos,
                    chunk: chunk.clone(),
                    user,
                    remote,
                });
            }
            TextOperation::ReversibleDelete { pos, chunk } => {
                self.emit(BufferEvent::Erased {
                    pos: *pos,
                    chunk: chunk.clone(),
                    user,
                    remote,
                });
            }
            TextOperation::Split(a, b) => {
                self.emit_applied(a, user, remote);
                self.emit_applied(b, user, remote);
            }
            // Plain deletes are upgraded by apply; nothing to report for a
            // noop.
            TextOperation::Delete { .. } | TextOperation::Noop => {}
        }
    }

    fn emit(&mut self, event: BufferEvent) {
        for (_, subscriber) in &mut self.subscribers {
            subscriber(&event);
        }
    }
}

impl std::fmt::Debug for TextBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TextBuffer")
            .field("chunk", &self.chunk)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn events_carry_author_and_provenance() {
        let events: Arc<Mutex<Vec<(String, bool)>>> = Default::default();
        let sink = events.clone();
        let mut buffer = TextBuffer::new();
        buffer.subscribe(move |event| {
            let entry = match event {
                BufferEvent::Inserted { chunk, remote, .. } => {
                    (format!("+{}", chunk), *remote)
                }
                BufferEvent::Erased { chunk, remote, .. } => {
                    (format!("-{}", chunk), *remote)
                }
            };
            sink.lock().unwrap().push(entry);
        });
        let insert = TextOperation::Insert {
            pos: 0,
            chunk: TextChunk::from_text("hello", UserId(1)),
        };
        buffer.apply(&insert, UserId(1), false).unwrap();
        let delete = TextOperation::Delete { pos: 0, len: 2 };
        buffer.apply(&delete, UserId(2), true).unwrap();
        assert_eq!(
            events.lock().unwrap().clone(),
            vec![("+hello".into(), false), ("-he".into(), true)]
        );
        assert_eq!(buffer.chunk().to_string(), "llo");
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let count: Arc<Mutex<usize>> = Default::default();
        let sink = count.clone();
        let mut buffer = TextBuffer::new();
        let id = buffer.subscribe(move |_| *sink.lock().unwrap() += 1);
        let insert = TextOperation::Insert {
            pos: 0,
            chunk: TextChunk::from_text("x", UserId(1)),
        };
        buffer.apply(&insert, UserId(1), false).unwrap();
        buffer.unsubscribe(id);
        buffer.apply(&insert, UserId(1), false).unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
