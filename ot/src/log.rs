//! Per-user append-only request logs with undo/redo association chains.
use crate::request::RequestKind;
use crate::{Error, Request, Result, StateVector, TextOperation, UserId};
use std::collections::{BTreeMap, VecDeque};

/// One logged request with its undo/redo association links.
#[derive(Clone, Debug)]
pub(crate) struct Entry {
    pub(crate) request: Request,
    /// Absolute index of the chain's original `Do`.
    pub(crate) original: u32,
    /// For an undo: the request it undoes. For a redo: the undo it redoes.
    pub(crate) prev_associated: Option<u32>,
    /// Inverse direction of `prev_associated`.
    pub(crate) next_associated: Option<u32>,
    /// Lowest absolute index of the contiguous do/undo/redo chain.
    pub(crate) lower_related: u32,
    /// Highest absolute index of the chain.
    pub(crate) upper_related: u32,
}

/// The append-only log of one user's requests, addressed by absolute
/// request index. The log tracks which request a fresh undo or redo by
/// this user would target, and caches translated operations keyed by the
/// state vector they were translated to.
#[derive(Clone, Debug, Default)]
pub struct RequestLog {
    user: UserId,
    begin: u32,
    entries: VecDeque<Entry>,
    next_undo: Option<u32>,
    next_redo: Option<u32>,
    cache: BTreeMap<StateVector, TextOperation>,
}

impl RequestLog {
    /// Returns an empty log for `user`.
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            ..Self::default()
        }
    }

    /// The owning user.
    pub fn user(&self) -> UserId {
        self.user
    }

    /// Absolute index of the oldest retained request.
    pub fn begin(&self) -> u32 {
        self.begin
    }

    /// Absolute index one past the newest request.
    pub fn end(&self) -> u32 {
        self.begin + self.entries.len() as u32
    }

    /// Whether no requests are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entry(&self, index: u32) -> Option<&Entry> {
        index
            .checked_sub(self.begin)
            .and_then(|i| self.entries.get(i as usize))
    }

    fn entry_mut(&mut self, index: u32) -> Option<&mut Entry> {
        index
            .checked_sub(self.begin)
            .and_then(|i| self.entries.get_mut(i as usize))
    }

    /// The request at absolute `index`, if retained.
    pub fn request(&self, index: u32) -> Option<&Request> {
        self.entry(index).map(|e| &e.request)
    }

    /// Absolute index of the request a fresh undo would target.
    pub fn next_undo_index(&self) -> Option<u32> {
        self.next_undo
    }

    /// Absolute index of the undo a fresh redo would target.
    pub fn next_redo_index(&self) -> Option<u32> {
        self.next_redo
    }

    /// The request a fresh undo by this user would revert.
    pub fn next_undo(&self) -> Option<&Request> {
        self.next_undo.and_then(|i| self.request(i))
    }

    /// The undo a fresh redo by this user would reapply.
    pub fn next_redo(&self) -> Option<&Request> {
        self.next_redo.and_then(|i| self.request(i))
    }

    /// The upper bound of the association chain containing `index`.
    pub fn upper_related(&self, index: u32) -> Option<u32> {
        self.entry(index).map(|e| e.upper_related)
    }

    /// Appends `request`. The request vector's component for this user
    /// must equal [`RequestLog::end`].
    pub(crate) fn add_request(&mut self, request: Request) -> Result<()> {
        if request.user() != self.user {
            return Err(Error::InvalidRequest(format!(
                "request by user {} added to log of user {}",
                request.user(),
                self.user
            )));
        }
        let index = self.end();
        if request.vector().get(self.user) != index {
            return Err(Error::InvalidRequest(format!(
                "request self-component {} does not match log end {}",
                request.vector().get(self.user),
                index
            )));
        }
        let kind = request.kind().clone();
        let mut entry = Entry {
            request,
            original: index,
            prev_associated: None,
            next_associated: None,
            lower_related: index,
            upper_related: index,
        };
        match kind {
            RequestKind::Do(_) => {
                self.entries.push_back(entry);
                self.next_undo = Some(index);
                self.next_redo = None;
            }
            RequestKind::Undo => {
                let assoc = self.next_undo.ok_or(Error::NothingToUndo(self.user))?;
                entry.prev_associated = Some(assoc);
                entry.original = self
                    .entry(assoc)
                    .map(|e| e.original)
                    .ok_or_else(|| Error::InvalidRequest("undo target vacuumed".into()))?;
                let lower = self
                    .entry(entry.original)
                    .map(|e| e.lower_related)
                    .ok_or_else(|| Error::InvalidRequest("chain origin vacuumed".into()))?;
                entry.lower_related = lower;
                entry.upper_related = index;
                self.entries.push_back(entry);
                if let Some(target) = self.entry_mut(assoc) {
                    target.next_associated = Some(index);
                }
                self.close_chain(lower, index);
                self.next_undo = self.find_associated(AssocKind::Undo);
                self.next_redo = Some(index);
            }
            RequestKind::Redo => {
                let assoc = self.next_redo.ok_or(Error::NothingToRedo(self.user))?;
                entry.prev_associated = Some(assoc);
                entry.original = self
                    .entry(assoc)
                    .map(|e| e.original)
                    .ok_or_else(|| Error::InvalidRequest("redo target vacuumed".into()))?;
                let lower = self
                    .entry(entry.original)
                    .map(|e| e.lower_related)
                    .ok_or_else(|| Error::InvalidRequest("chain origin vacuumed".into()))?;
                entry.lower_related = lower;
                entry.upper_related = index;
                self.entries.push_back(entry);
                if let Some(target) = self.entry_mut(assoc) {
                    target.next_associated = Some(index);
                }
                self.close_chain(lower, index);
                self.next_undo = Some(index);
                self.next_redo = self.find_associated(AssocKind::Redo);
            }
        }
        Ok(())
    }

    /// Widens the related bounds of every chain member to `[lower, upper]`.
    fn close_chain(&mut self, lower: u32, upper: u32) {
        for index in lower..upper {
            if let Some(entry) = self.entry_mut(index) {
                entry.lower_related = lower;
                entry.upper_related = upper;
            }
        }
    }

    /// Finds the request a fresh undo (or redo) would target by walking
    /// backwards, skipping over already-closed chains.
    fn find_associated(&self, kind: AssocKind) -> Option<u32> {
        let mut index = self.end().checked_sub(1)?;
        loop {
            if index < self.begin {
                return None;
            }
            let entry = self.entry(index)?;
            match entry.request.kind() {
                RequestKind::Do(_) => {
                    return match kind {
                        AssocKind::Undo => Some(index),
                        AssocKind::Redo => None,
                    };
                }
                RequestKind::Undo => match kind {
                    AssocKind::Redo => return Some(index),
                    AssocKind::Undo => {
                        index = entry.prev_associated?.checked_sub(1)?;
                    }
                },
                RequestKind::Redo => match kind {
                    AssocKind::Undo => return Some(index),
                    AssocKind::Redo => {
                        index = entry.prev_associated?.checked_sub(1)?;
                    }
                },
            }
        }
    }

    /// Drops all requests below `up_to`. The caller must ensure no retained
    /// request's associations reach into the removed range: the entry at
    /// `up_to - 1` has to close its own chain. Cached translations that
    /// refer to removed requests are pruned.
    pub fn remove_requests(&mut self, up_to: u32) -> Result<()> {
        if up_to < self.begin || up_to > self.end() {
            return Err(Error::InvalidRequest(format!(
                "removal bound {} outside retained range {}..{}",
                up_to,
                self.begin,
                self.end()
            )));
        }
        if up_to == self.begin {
            return Ok(());
        }
        match self.entry(up_to - 1) {
            Some(entry) if entry.upper_related == up_to - 1 => {}
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "removal bound {} splits an open undo chain",
                    up_to
                )));
            }
        }
        self.entries.drain(..(up_to - self.begin) as usize);
        self.begin = up_to;
        if self.next_undo.is_some_and(|i| i < up_to) {
            self.next_undo = None;
        }
        if self.next_redo.is_some_and(|i| i < up_to) {
            self.next_redo = None;
        }
        let user = self.user;
        self.cache.retain(|vector, _| vector.get(user) >= up_to);
        Ok(())
    }

    /// Fast-forwards the base offset of a still-empty log, used when the
    /// replica this log is synchronised from had vacuumed a prefix.
    pub fn advance_begin(&mut self, begin: u32) -> Result<()> {
        if !self.entries.is_empty() || begin < self.begin {
            return Err(Error::InvalidRequest(format!(
                "cannot rebase populated log to offset {}",
                begin
            )));
        }
        self.begin = begin;
        Ok(())
    }

    /// Looks up a previously cached translation of one of this user's
    /// requests to exactly the state `vector`.
    pub fn lookup_cached(&self, vector: &StateVector) -> Option<&TextOperation> {
        self.cache.get(vector)
    }

    /// Caches `operation` as the translation of one of this user's
    /// requests to the state `vector`.
    pub fn add_cached(&mut self, vector: StateVector, operation: TextOperation) {
        self.cache.insert(vector, operation);
    }

    #[cfg(test)]
    pub(crate) fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AssocKind {
    Undo,
    Redo,
}
