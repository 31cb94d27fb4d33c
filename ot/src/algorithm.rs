//! The adopted algorithm: translating concurrent requests onto the buffer.
use crate::request::RequestKind;
use crate::{
    Error, Request, RequestLog, Result, StateVector, TextBuffer, TextOperation, UserId,
};
use fnv::FnvHashMap;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// The transformation engine of one session replica.
///
/// Owns the buffer, one [`RequestLog`] per participant, and the current
/// state vector. Local edits enter through [`Algorithm::execute_request`],
/// remote requests through [`Algorithm::receive_request`]; both leave the
/// replica in a state where the buffer reflects every applied request.
///
/// Translation works on the original operations stored in the logs: to
/// carry a historic request to a later state, the concurrent requests on
/// the causal path are folded in one at a time, recursively translating
/// each of them first. Results are memoised in the per-log caches keyed by
/// the state they were translated to.
pub struct Algorithm {
    buffer: TextBuffer,
    logs: BTreeMap<UserId, RequestLog>,
    current: StateVector,
    /// Last state each participant is known to have seen.
    acks: FnvHashMap<UserId, StateVector>,
}

impl Algorithm {
    /// Returns an engine over an empty buffer.
    pub fn new() -> Self {
        Self::with_buffer(TextBuffer::new())
    }

    /// Returns an engine over `buffer`.
    pub fn with_buffer(buffer: TextBuffer) -> Self {
        Self {
            buffer,
            logs: BTreeMap::new(),
            current: StateVector::new(),
            acks: FnvHashMap::default(),
        }
    }

    /// The buffer as of the current state.
    pub fn buffer(&self) -> &TextBuffer {
        &self.buffer
    }

    /// Mutable buffer access, for subscribing to mutation events.
    pub fn buffer_mut(&mut self) -> &mut TextBuffer {
        &mut self.buffer
    }

    /// The current state vector.
    pub fn current(&self) -> &StateVector {
        &self.current
    }

    /// The request log of `user`.
    pub fn log(&self, user: UserId) -> Option<&RequestLog> {
        self.logs.get(&user)
    }

    /// Participants with a log.
    pub fn users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.logs.keys().copied()
    }

    /// Registers a participant. Idempotent.
    pub fn add_user(&mut self, user: UserId) {
        self.logs.entry(user).or_insert_with(|| RequestLog::new(user));
    }

    /// Books a synchronised request into the logs without touching the
    /// buffer: the buffer content arrives separately during the same
    /// synchronisation. Per user, requests must arrive in log order.
    /// [`Algorithm::finish_restore`] completes the procedure.
    pub fn restore_request(&mut self, request: Request) -> Result<()> {
        let user = request.user();
        self.add_user(user);
        let log = self
            .logs
            .get_mut(&user)
            .ok_or(Error::UnknownUser(user))?;
        // The sending replica may have vacuumed a prefix of this log.
        let own = request.vector().get(user);
        if log.is_empty() && own > log.end() {
            log.advance_begin(own)?;
        }
        log.add_request(request)?;
        Ok(())
    }

    /// Recomputes the current state vector after a sequence of
    /// [`Algorithm::restore_request`] calls.
    pub fn finish_restore(&mut self) {
        let mut current = StateVector::new();
        for (user, log) in &self.logs {
            current.set(*user, log.end());
        }
        self.current = current;
    }

    fn log_end(&self, user: UserId) -> u32 {
        self.logs.get(&user).map(|l| l.end()).unwrap_or(0)
    }

    /// Wraps a local `operation` by `user` into a `Do` request, applies it
    /// and returns the request for broadcast. Plain deletes are upgraded
    /// to their reversible form first, so the log keeps what it needs to
    /// undo them.
    pub fn execute_request(&mut self, user: UserId, operation: TextOperation) -> Result<Request> {
        if !self.logs.contains_key(&user) {
            return Err(Error::UnknownUser(user));
        }
        let operation = match operation {
            TextOperation::Delete { pos, len } => TextOperation::ReversibleDelete {
                pos,
                chunk: self.buffer.chunk().substring(pos, len)?,
            },
            other => other,
        };
        self.buffer.apply(&operation, user, false)?;
        let request = Request::new_do(user, self.current.clone(), operation);
        self.commit(request.clone())?;
        Ok(request)
    }

    /// Applies a remote request, translating it to the current state.
    ///
    /// Fails with [`Error::DuplicateRequest`] if the request was already
    /// applied and [`Error::CausalityViolated`] if a causal prerequisite is
    /// missing; the caller is expected to retry the latter once newer
    /// requests have arrived.
    pub fn receive_request(&mut self, request: &Request) -> Result<()> {
        let user = request.user();
        self.add_user(user);
        let end = self.log_end(user);
        let own = request.vector().get(user);
        if own < end {
            return Err(Error::DuplicateRequest { user });
        }
        if own > end {
            return Err(Error::CausalityViolated { user });
        }
        for (component, count) in request.vector().iter() {
            if component != user && count > self.log_end(component) {
                return Err(Error::CausalityViolated { user });
            }
        }
        // The target state: everything applied here, the issuer's own
        // component still at the request's index.
        let target = self.current.clone();
        let operation = match request.kind() {
            RequestKind::Do(operation) => {
                self.translate(operation.clone(), user, request.vector(), &target)?
            }
            RequestKind::Undo => {
                let index = self
                    .logs
                    .get(&user)
                    .and_then(|l| l.next_undo_index())
                    .ok_or(Error::NothingToUndo(user))?;
                self.inverse_of(user, index, &target)?
            }
            RequestKind::Redo => {
                let index = self
                    .logs
                    .get(&user)
                    .and_then(|l| l.next_redo_index())
                    .ok_or(Error::NothingToRedo(user))?;
                self.inverse_of(user, index, &target)?
            }
        };
        trace!(%user, at = %request.vector(), "applying remote request");
        self.buffer.apply(&operation, user, true)?;
        self.commit(request.clone())?;
        let ack = self.acks.entry(user).or_default();
        *ack = ack.join(request.vector());
        Ok(())
    }

    /// Whether `user` has a request left to undo.
    pub fn can_undo(&self, user: UserId) -> bool {
        self.logs
            .get(&user)
            .and_then(|l| l.next_undo_index())
            .is_some()
    }

    /// Whether `user` has an undo left to redo.
    pub fn can_redo(&self, user: UserId) -> bool {
        self.logs
            .get(&user)
            .and_then(|l| l.next_redo_index())
            .is_some()
    }

    /// Reverts `user`'s most recent not-yet-undone request and returns the
    /// `Undo` request to broadcast.
    pub fn undo(&mut self, user: UserId) -> Result<Request> {
        let target = self
            .logs
            .get(&user)
            .ok_or(Error::UnknownUser(user))?
            .next_undo_index()
            .ok_or(Error::NothingToUndo(user))?;
        let state = self.current.clone();
        let operation = self.inverse_of(user, target, &state)?;
        self.buffer.apply(&operation, user, false)?;
        let request = Request::new_undo(user, self.current.clone());
        self.commit(request.clone())?;
        Ok(request)
    }

    /// Reapplies `user`'s most recent undo and returns the `Redo` request
    /// to broadcast.
    pub fn redo(&mut self, user: UserId) -> Result<Request> {
        let target = self
            .logs
            .get(&user)
            .ok_or(Error::UnknownUser(user))?
            .next_redo_index()
            .ok_or(Error::NothingToRedo(user))?;
        let state = self.current.clone();
        let operation = self.inverse_of(user, target, &state)?;
        self.buffer.apply(&operation, user, false)?;
        let request = Request::new_redo(user, self.current.clone());
        self.commit(request.clone())?;
        Ok(request)
    }

    /// Books an applied request into its log and advances the state.
    fn commit(&mut self, request: Request) -> Result<()> {
        let user = request.user();
        let log = self
            .logs
            .get_mut(&user)
            .ok_or(Error::UnknownUser(user))?;
        log.add_request(request)?;
        self.current.add(user, 1);
        let ack = self.acks.entry(user).or_default();
        *ack = ack.join(&self.current);
        Ok(())
    }

    /// The inverse that undoes the request at `index` of `user`, expressed
    /// at `state`: the request it is associated with is translated to the
    /// matching state and inverted.
    fn inverse_of(&mut self, user: UserId, index: u32, state: &StateVector) -> Result<TextOperation> {
        let mut target = state.clone();
        target.set(user, index);
        self.operation_at(user, index, &target)?.invert()
    }

    /// The effective operation of log entry `(user, index)` translated to
    /// `target`, whose component for `user` equals `index`.
    fn operation_at(&mut self, user: UserId, index: u32, target: &StateVector) -> Result<TextOperation> {
        debug_assert_eq!(target.get(user), index);
        let (kind, vector) = {
            let entry = self
                .logs
                .get(&user)
                .and_then(|l| l.entry(index))
                .ok_or_else(|| {
                    Error::InvalidRequest(format!(
                        "request {} of user {} was vacuumed",
                        index, user
                    ))
                })?;
            (entry.request.kind().clone(), entry.request.vector().clone())
        };
        match kind {
            RequestKind::Do(operation) => self.translate(operation, user, &vector, target),
            // An undo (or redo) is the inverse of its associated request,
            // carried to the same state.
            RequestKind::Undo | RequestKind::Redo => {
                let previous = self
                    .logs
                    .get(&user)
                    .and_then(|l| l.entry(index))
                    .and_then(|e| e.prev_associated)
                    .ok_or_else(|| {
                        Error::InvalidRequest("undo chain reaches a vacuumed request".into())
                    })?;
                self.inverse_of(user, previous, target)
            }
        }
    }

    /// Translates `operation`, issued by `user` at `from`, to `target` by
    /// folding in the concurrent requests on the causal path, most recent
    /// last. Folded requests are themselves translated recursively, with
    /// memoisation through the per-log caches.
    fn translate(
        &mut self,
        operation: TextOperation,
        user: UserId,
        from: &StateVector,
        target: &StateVector,
    ) -> Result<TextOperation> {
        if from == target {
            return Ok(operation);
        }
        if let Some(cached) = self.logs.get(&user).and_then(|l| l.lookup_cached(target)) {
            trace!(%user, "translation cache hit");
            return Ok(cached.clone());
        }
        // Pick a concurrent request to fold: the newest request of some
        // other participant inside the gap, provided everything it builds
        // on is itself inside the reduced target. One such request always
        // exists for a reachable target; ascending user order keeps the
        // choice deterministic.
        for (other, count) in target.iter() {
            if other == user || count <= from.get(other) {
                continue;
            }
            let index = count - 1;
            let mut reduced = target.clone();
            reduced.set(other, index);
            let fits = {
                let Some(entry) = self.logs.get(&other).and_then(|l| l.entry(index)) else {
                    return Err(Error::InvalidRequest(format!(
                        "request {} of user {} needed for translation was vacuumed",
                        index, other
                    )));
                };
                entry
                    .request
                    .vector()
                    .iter()
                    .all(|(component, value)| value <= reduced.get(component))
            };
            if !fits {
                continue;
            }
            let folded = self.operation_at(other, index, &reduced)?;
            let carried = self.translate(operation, user, from, &reduced)?;
            let result = carried.transform(&folded, user, other);
            if let Some(log) = self.logs.get_mut(&user) {
                log.add_cached(target.clone(), result.clone());
            }
            return Ok(result);
        }
        Err(Error::InvalidRequest(format!(
            "no translation path from {} to {}",
            from, target
        )))
    }

    /// Iterates every retained request, per user in log order. This is a
    /// valid transfer order for synchronisation.
    pub fn request_history(&self) -> impl Iterator<Item = &Request> + '_ {
        self.logs.values().flat_map(|log| {
            (log.begin()..log.end()).filter_map(move |index| log.request(index))
        })
    }

    /// Records that `user` has seen the state `vector`.
    pub fn ack(&mut self, user: UserId, vector: &StateVector) {
        let ack = self.acks.entry(user).or_default();
        *ack = ack.join(vector);
    }

    /// Truncates every log up to the state all participants are known to
    /// have seen, keeping undo chains intact. A bound that was already
    /// achieved is a no-op.
    pub fn vacuum(&mut self) -> Result<()> {
        if self.logs.is_empty() {
            return Ok(());
        }
        let mut bound: Option<StateVector> = None;
        for user in self.logs.keys() {
            let ack = self.acks.get(user).cloned().unwrap_or_default();
            bound = Some(match bound {
                Some(b) => b.meet(&ack),
                None => ack,
            });
        }
        let bound = bound.unwrap_or_default();
        for (user, log) in &mut self.logs {
            let mut limit = bound.get(*user).min(log.end());
            // A fresh undo or redo still reaches into its target's chain;
            // keep those chains even when everyone has seen them.
            for target in [log.next_undo_index(), log.next_redo_index()]
                .into_iter()
                .flatten()
            {
                if let Some(lower) = log.entry(target).map(|e| e.lower_related) {
                    limit = limit.min(lower);
                }
            }
            let mut cut = log.begin();
            for index in log.begin()..limit {
                if log.upper_related(index) == Some(index) {
                    cut = index + 1;
                }
            }
            if cut > log.begin() {
                debug!(user = %user, up_to = cut, "vacuuming request log");
                log.remove_requests(cut)?;
            }
        }
        Ok(())
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Algorithm")
            .field("current", &self.current)
            .field("users", &self.logs.len())
            .finish()
    }
}
