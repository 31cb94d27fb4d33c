//! Buffer operations and the transformation rules between them.
use crate::{Error, Result, TextChunk, UserId};

/// A single edit against a text buffer, addressed in character offsets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TextOperation {
    /// Insert `chunk` before character `pos`.
    Insert {
        /// Insertion offset.
        pos: usize,
        /// The inserted, authored text.
        chunk: TextChunk,
    },
    /// Remove `len` characters starting at `pos`.
    Delete {
        /// First removed offset.
        pos: usize,
        /// Number of removed characters.
        len: usize,
    },
    /// A delete that retains the removed text so it can be inverted.
    ReversibleDelete {
        /// First removed offset.
        pos: usize,
        /// The removed, authored text.
        chunk: TextChunk,
    },
    /// An ordered pair applied left to right, produced when a delete is
    /// transformed across a concurrent insert into its interior.
    Split(Box<TextOperation>, Box<TextOperation>),
    /// Does nothing. Produced when an operation is transformed away
    /// entirely, e.g. two concurrent undos of the same request.
    Noop,
}

impl TextOperation {
    /// Net character-count change caused by applying the operation.
    pub fn length_change(&self) -> isize {
        match self {
            TextOperation::Insert { chunk, .. } => chunk.len() as isize,
            TextOperation::Delete { len, .. } => -(*len as isize),
            TextOperation::ReversibleDelete { chunk, .. } => -(chunk.len() as isize),
            TextOperation::Split(a, b) => a.length_change() + b.length_change(),
            TextOperation::Noop => 0,
        }
    }

    /// Whether the operation modifies the buffer at all.
    pub fn is_noop(&self) -> bool {
        match self {
            TextOperation::Noop => true,
            TextOperation::Insert { chunk, .. } => chunk.is_empty(),
            TextOperation::Delete { len, .. } => *len == 0,
            TextOperation::ReversibleDelete { chunk, .. } => chunk.is_empty(),
            TextOperation::Split(a, b) => a.is_noop() && b.is_noop(),
        }
    }

    /// Applies the operation to `chunk`, returning the reversible form as
    /// executed: plain deletes capture the erased text, inserts and
    /// reversible deletes pass through.
    pub fn apply(&self, target: &mut TextChunk) -> Result<TextOperation> {
        match self {
            TextOperation::Insert { pos, chunk } => {
                target.insert_chunk(*pos, chunk.clone())?;
                Ok(self.clone())
            }
            TextOperation::Delete { pos, len } => {
                let erased = target.erase(*pos, *len)?;
                Ok(TextOperation::ReversibleDelete {
                    pos: *pos,
                    chunk: erased,
                })
            }
            TextOperation::ReversibleDelete { pos, chunk } => {
                let erased = target.erase(*pos, chunk.len())?;
                Ok(TextOperation::ReversibleDelete {
                    pos: *pos,
                    chunk: erased,
                })
            }
            TextOperation::Split(a, b) => {
                let first = a.apply(target)?;
                let second = b.apply(target)?;
                Ok(TextOperation::Split(Box::new(first), Box::new(second)))
            }
            TextOperation::Noop => Ok(TextOperation::Noop),
        }
    }

    /// Returns the operation that undoes this one. Only reversible forms
    /// can be inverted; a plain [`TextOperation::Delete`] fails because the
    /// removed text is unknown.
    pub fn invert(&self) -> Result<TextOperation> {
        match self {
            TextOperation::Insert { pos, chunk } => Ok(TextOperation::ReversibleDelete {
                pos: *pos,
                chunk: chunk.clone(),
            }),
            TextOperation::ReversibleDelete { pos, chunk } => Ok(TextOperation::Insert {
                pos: *pos,
                chunk: chunk.clone(),
            }),
            TextOperation::Delete { .. } => Err(Error::InvalidOperation(
                "a plain delete cannot be inverted".into(),
            )),
            // The pair applies left to right, so the inverse applies the
            // inverted right half first.
            TextOperation::Split(a, b) => Ok(TextOperation::Split(
                Box::new(b.invert()?),
                Box::new(a.invert()?),
            )),
            TextOperation::Noop => Ok(TextOperation::Noop),
        }
    }

    /// Transforms `self` (issued by `user`) against the concurrent
    /// `against` (issued by `other`), so that the result can be applied
    /// after it. Insert-position ties are broken by user id: the lower id
    /// is shifted behind the other's text, which keeps both replicas'
    /// decisions consistent.
    pub fn transform(&self, against: &TextOperation, user: UserId, other: UserId) -> TextOperation {
        match (self, against) {
            (_, TextOperation::Noop) => self.clone(),
            // Folding a pair in means folding its halves in order.
            (_, TextOperation::Split(x, y)) => {
                self.transform(x, user, other).transform(y, user, other)
            }
            // The right half of a pair lives in the context after the left
            // half; shift `against` into that context before recursing.
            (TextOperation::Split(a1, a2), b) => {
                let shifted = b.transform(a1, other, user);
                TextOperation::Split(
                    Box::new(a1.transform(b, user, other)),
                    Box::new(a2.transform(&shifted, user, other)),
                )
            }
            (
                _,
                TextOperation::Insert {
                    pos: b_pos,
                    chunk: b_chunk,
                },
            ) => self.transform_against_insert(*b_pos, b_chunk.len(), user, other),
            (_, TextOperation::Delete { pos: b_pos, len }) => {
                self.transform_against_delete(*b_pos, *len)
            }
            (
                _,
                TextOperation::ReversibleDelete {
                    pos: b_pos,
                    chunk: b_chunk,
                },
            ) => self.transform_against_delete(*b_pos, b_chunk.len()),
        }
    }

    fn transform_against_insert(
        &self,
        b_pos: usize,
        b_len: usize,
        user: UserId,
        other: UserId,
    ) -> TextOperation {
        if b_len == 0 {
            return self.clone();
        }
        match self {
            TextOperation::Noop => TextOperation::Noop,
            // Pairs are decomposed by `transform` before reaching here.
            TextOperation::Split(..) => unreachable!("split handled by transform"),
            TextOperation::Insert { pos, chunk } => {
                let shifted = *pos > b_pos || (*pos == b_pos && user < other);
                TextOperation::Insert {
                    pos: if shifted { pos + b_len } else { *pos },
                    chunk: chunk.clone(),
                }
            }
            TextOperation::Delete { pos, len } => {
                if b_pos >= pos + len {
                    self.clone()
                } else if b_pos <= *pos {
                    TextOperation::Delete {
                        pos: pos + b_len,
                        len: *len,
                    }
                } else {
                    // The insert landed inside the deleted range: delete
                    // around it in two steps.
                    let left = b_pos - pos;
                    TextOperation::Split(
                        Box::new(TextOperation::Delete {
                            pos: *pos,
                            len: left,
                        }),
                        Box::new(TextOperation::Delete {
                            pos: pos + b_len,
                            len: len - left,
                        }),
                    )
                }
            }
            TextOperation::ReversibleDelete { pos, chunk } => {
                let len = chunk.len();
                if b_pos >= pos + len {
                    self.clone()
                } else if b_pos <= *pos {
                    TextOperation::ReversibleDelete {
                        pos: pos + b_len,
                        chunk: chunk.clone(),
                    }
                } else {
                    let left = b_pos - pos;
                    // The retained text splits exactly like the range.
                    let left_chunk = chunk.substring(0, left).expect("split within range");
                    let right_chunk =
                        chunk.substring(left, len - left).expect("split within range");
                    TextOperation::Split(
                        Box::new(TextOperation::ReversibleDelete {
                            pos: *pos,
                            chunk: left_chunk,
                        }),
                        Box::new(TextOperation::ReversibleDelete {
                            pos: pos + b_len,
                            chunk: right_chunk,
                        }),
                    )
                }
            }
        }
    }

    fn transform_against_delete(&self, b_pos: usize, b_len: usize) -> TextOperation {
        if b_len == 0 {
            return self.clone();
        }
        let b_end = b_pos + b_len;
        match self {
            TextOperation::Noop => TextOperation::Noop,
            // Pairs are decomposed by `transform` before reaching here.
            TextOperation::Split(..) => unreachable!("split handled by transform"),
            TextOperation::Insert { pos, chunk } => {
                let pos = if *pos <= b_pos {
                    *pos
                } else if *pos >= b_end {
                    pos - b_len
                } else {
                    // Insert into the erased interior collapses to the
                    // deletion boundary.
                    b_pos
                };
                TextOperation::Insert {
                    pos,
                    chunk: chunk.clone(),
                }
            }
            TextOperation::Delete { pos, len } => {
                let (new_pos, new_len) = overlap_delete(*pos, *len, b_pos, b_len);
                if new_len == 0 {
                    TextOperation::Noop
                } else {
                    TextOperation::Delete {
                        pos: new_pos,
                        len: new_len,
                    }
                }
            }
            TextOperation::ReversibleDelete { pos, chunk } => {
                let len = chunk.len();
                let (new_pos, new_len) = overlap_delete(*pos, len, b_pos, b_len);
                if new_len == 0 {
                    return TextOperation::Noop;
                }
                // Keep only the parts of the retained text that survive the
                // concurrent delete; they become adjacent once it applied.
                let a_end = pos + len;
                let left_keep = b_pos.saturating_sub(*pos).min(len);
                let right_keep = a_end.saturating_sub(b_end).min(len);
                let mut kept = chunk.substring(0, left_keep).expect("prefix within range");
                if right_keep > 0 {
                    kept.append(
                        chunk
                            .substring(len - right_keep, right_keep)
                            .expect("suffix within range"),
                    );
                }
                debug_assert_eq!(kept.len(), new_len);
                TextOperation::ReversibleDelete {
                    pos: new_pos,
                    chunk: kept,
                }
            }
        }
    }
}

/// Range arithmetic for delete-vs-delete: position and length of `a` after
/// the concurrent removal of `[b_pos, b_pos + b_len)`.
fn overlap_delete(a_pos: usize, a_len: usize, b_pos: usize, b_len: usize) -> (usize, usize) {
    let a_end = a_pos + a_len;
    let b_end = b_pos + b_len;
    if a_end <= b_pos {
        (a_pos, a_len)
    } else if a_pos >= b_end {
        (a_pos - b_len, a_len)
    } else {
        let overlap = a_end.min(b_end) - a_pos.max(b_pos);
        (a_pos.min(b_pos), a_len - overlap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(pos: usize, text: &str, author: u32) -> TextOperation {
        TextOperation::Insert {
            pos,
            chunk: TextChunk::from_text(text, UserId(author)),
        }
    }

    fn delete(pos: usize, len: usize) -> TextOperation {
        TextOperation::Delete { pos, len }
    }

    fn buffer(text: &str) -> TextChunk {
        TextChunk::from_text(text, UserId(99))
    }

    /// Convergence helper: applies `a` then `transform(b, a)` and `b` then
    /// `transform(a, b)` and checks both orders agree.
    fn converges(text: &str, a: &TextOperation, b: &TextOperation) -> String {
        let (ua, ub) = (UserId(1), UserId(2));
        let mut left = buffer(text);
        a.apply(&mut left).unwrap();
        b.transform(a, ub, ua).apply(&mut left).unwrap();

        let mut right = buffer(text);
        b.apply(&mut right).unwrap();
        a.transform(b, ua, ub).apply(&mut right).unwrap();

        assert_eq!(left.to_string(), right.to_string());
        left.to_string()
    }

    #[test]
    fn concurrent_inserts_converge() {
        let result = converges("ABCDE", &insert(2, "X", 1), &insert(4, "Y", 2));
        assert_eq!(result, "ABXCDYE");
    }

    #[test]
    fn insert_into_deleted_range_collapses_to_boundary() {
        let result = converges("HELLO", &delete(1, 3), &insert(3, "P", 2));
        assert_eq!(result, "HPO");
    }

    #[test]
    fn equal_position_inserts_tie_break_on_user() {
        let result = converges("", &insert(0, "FOO", 1), &insert(0, "BAR", 2));
        assert_eq!(result, "BARFOO");
    }

    #[test]
    fn overlapping_deletes_converge() {
        assert_eq!(converges("ABCDEF", &delete(1, 3), &delete(2, 3)), "AF");
        assert_eq!(converges("ABCDEF", &delete(0, 2), &delete(4, 2)), "CD");
        assert_eq!(converges("ABCDEF", &delete(1, 2), &delete(1, 2)), "ADEF");
    }

    #[test]
    fn identical_deletes_cancel_to_noop() {
        let a = delete(1, 2);
        let b = delete(1, 2);
        assert_eq!(a.transform(&b, UserId(1), UserId(2)), TextOperation::Noop);
    }

    #[test]
    fn delete_spanning_insert_splits() {
        let a = delete(1, 3);
        let b = insert(3, "P", 2);
        match a.transform(&b, UserId(1), UserId(2)) {
            TextOperation::Split(first, second) => {
                assert_eq!(*first, delete(1, 2));
                assert_eq!(*second, delete(2, 1));
            }
            other => panic!("expected split, got {:?}", other),
        }
    }

    #[test]
    fn reversible_delete_split_keeps_authored_text() {
        let mut chunk = TextChunk::from_text("EL", UserId(1));
        chunk.append(TextChunk::from_text("L", UserId(2)));
        let a = TextOperation::ReversibleDelete { pos: 1, chunk };
        let b = insert(3, "P", 3);
        match a.transform(&b, UserId(1), UserId(3)) {
            TextOperation::Split(first, second) => {
                match (&*first, &*second) {
                    (
                        TextOperation::ReversibleDelete { pos: 1, chunk: c1 },
                        TextOperation::ReversibleDelete { pos: 2, chunk: c2 },
                    ) => {
                        assert_eq!(c1.to_string(), "EL");
                        assert_eq!(c2.to_string(), "L");
                    }
                    other => panic!("unexpected halves {:?}", other),
                }
            }
            other => panic!("expected split, got {:?}", other),
        }
    }

    #[test]
    fn plain_delete_apply_captures_erased_text() {
        let mut target = buffer("HELLO");
        let applied = delete(1, 3).apply(&mut target).unwrap();
        match applied {
            TextOperation::ReversibleDelete { pos: 1, chunk } => {
                assert_eq!(chunk.to_string(), "ELL")
            }
            other => panic!("expected reversible delete, got {:?}", other),
        }
        assert_eq!(target.to_string(), "HO");
    }

    #[test]
    fn invert_roundtrips_through_apply() {
        let mut target = buffer("HELLO");
        let applied = delete(1, 3).apply(&mut target).unwrap();
        applied.invert().unwrap().apply(&mut target).unwrap();
        assert_eq!(target.to_string(), "HELLO");

        let applied = insert(2, "XY", 1).apply(&mut target).unwrap();
        applied.invert().unwrap().apply(&mut target).unwrap();
        assert_eq!(target.to_string(), "HELLO");
    }

    #[test]
    fn split_inverts_right_half_first() {
        let mut target = buffer("ABCDEF");
        let split = TextOperation::Split(
            Box::new(delete(1, 2)),
            Box::new(delete(2, 2)),
        );
        let applied = split.apply(&mut target).unwrap();
        assert_eq!(target.to_string(), "AD");
        applied.invert().unwrap().apply(&mut target).unwrap();
        assert_eq!(target.to_string(), "ABCDEF");
    }
}
