//! Authored text: a run of segments, each tagged with the user that wrote it.
use crate::{Error, Result, UserId};
use smallvec::SmallVec;

/// A maximal run of consecutive characters written by one user.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Segment {
    /// The writing user.
    pub author: UserId,
    /// UTF-8 text of the run.
    pub text: String,
    /// Cached character count of `text`.
    pub chars: usize,
}

impl Segment {
    fn new(author: UserId, text: impl Into<String>) -> Self {
        let text = text.into();
        let chars = text.chars().count();
        Self {
            author,
            text,
            chars,
        }
    }

    /// Splits off the tail beginning at character `at`.
    fn split_off(&mut self, at: usize) -> Segment {
        let byte = byte_of_char(&self.text, at);
        let tail = self.text.split_off(byte);
        let tail_chars = self.chars - at;
        self.chars = at;
        Segment {
            author: self.author,
            text: tail,
            chars: tail_chars,
        }
    }
}

fn byte_of_char(text: &str, at: usize) -> usize {
    text.char_indices()
        .nth(at)
        .map(|(byte, _)| byte)
        .unwrap_or(text.len())
}

/// A sequence of authored segments addressed by character offset.
///
/// Invariants: segments are non-empty, adjacent segments never share an
/// author, and the total length equals the sum of segment lengths.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct TextChunk {
    segments: SmallVec<[Segment; 2]>,
    chars: usize,
}

impl TextChunk {
    /// Returns an empty chunk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a chunk holding `text` written by `author`.
    pub fn from_text(text: impl Into<String>, author: UserId) -> Self {
        let text = text.into();
        if text.is_empty() {
            return Self::new();
        }
        let segment = Segment::new(author, text);
        let chars = segment.chars;
        Self {
            segments: std::iter::once(segment).collect(),
            chars,
        }
    }

    /// Character length of the chunk.
    pub fn len(&self) -> usize {
        self.chars
    }

    /// Whether the chunk holds no text.
    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    /// Iterates segments front to back.
    pub fn segments(&self) -> impl DoubleEndedIterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Locates the segment containing character `offset`, returning the
    /// segment index and the character offset within it. An offset equal to
    /// the length addresses the end of the final segment.
    fn find(&self, offset: usize) -> (usize, usize) {
        let mut remaining = offset;
        for (index, segment) in self.segments.iter().enumerate() {
            if remaining <= segment.chars {
                // Prefer the end of a segment over the start of its
                // neighbour so same-author appends concatenate.
                if remaining == segment.chars
                    && index + 1 < self.segments.len()
                {
                    return (index + 1, 0);
                }
                return (index, remaining);
            }
            remaining -= segment.chars;
        }
        (self.segments.len(), 0)
    }

    fn check_offset(&self, offset: usize, what: &str) -> Result<()> {
        if offset > self.chars {
            return Err(Error::InvalidOperation(format!(
                "{} offset {} exceeds length {}",
                what, offset, self.chars
            )));
        }
        Ok(())
    }

    /// Inserts `text` written by `author` at character `offset`. The
    /// enclosing segment is split if the author differs and merged with an
    /// adjacent same-author segment otherwise.
    pub fn insert_text(
        &mut self,
        offset: usize,
        text: impl Into<String>,
        author: UserId,
    ) -> Result<()> {
        self.insert_chunk(offset, Self::from_text(text, author))
    }

    /// Splices `other` into the chunk at character `offset`. The first and
    /// last segments of `other` merge with their new neighbours when the
    /// authors match.
    pub fn insert_chunk(&mut self, offset: usize, other: TextChunk) -> Result<()> {
        self.check_offset(offset, "insert")?;
        if other.is_empty() {
            return Ok(());
        }
        let (index, within) = self.find(offset);
        let mut tail: SmallVec<[Segment; 2]> = if index < self.segments.len() {
            let rest = if within > 0 && within < self.segments[index].chars {
                let split = self.segments[index].split_off(within);
                let mut rest: SmallVec<[Segment; 2]> =
                    self.segments.drain(index + 1..).collect();
                rest.insert(0, split);
                rest
            } else if within == 0 {
                self.segments.drain(index..).collect()
            } else {
                self.segments.drain(index + 1..).collect()
            };
            rest
        } else {
            SmallVec::new()
        };
        self.chars += other.chars;
        for segment in other.segments {
            self.push_segment(segment);
        }
        for segment in tail.drain(..) {
            self.push_segment(segment);
        }
        Ok(())
    }

    /// Appends a segment, merging with the last one on author match. Does
    /// not touch the cached length.
    fn push_segment(&mut self, segment: Segment) {
        if segment.chars == 0 {
            return;
        }
        if let Some(last) = self.segments.last_mut() {
            if last.author == segment.author {
                last.text.push_str(&segment.text);
                last.chars += segment.chars;
                return;
            }
        }
        self.segments.push(segment);
    }

    /// Removes `length` characters starting at `offset` and returns them as
    /// an independent chunk, preserving authorship.
    pub fn erase(&mut self, offset: usize, length: usize) -> Result<TextChunk> {
        self.check_offset(offset.saturating_add(length), "erase")?;
        if length == 0 {
            return Ok(TextChunk::new());
        }
        let erased = self.substring(offset, length)?;
        let (index, within) = self.find(offset);
        let mut tail: SmallVec<[Segment; 2]> = {
            let rest = if within > 0 {
                let split = self.segments[index].split_off(within);
                let mut rest: SmallVec<[Segment; 2]> =
                    self.segments.drain(index + 1..).collect();
                rest.insert(0, split);
                rest
            } else {
                self.segments.drain(index..).collect()
            };
            rest
        };
        // Drop `length` characters from the front of the tail, then splice
        // the rest back, merging across the cut.
        let mut remaining = length;
        let mut iter = tail.drain(..);
        for mut segment in iter.by_ref() {
            if remaining >= segment.chars {
                remaining -= segment.chars;
                if remaining == 0 {
                    break;
                }
            } else {
                let keep = segment.split_off(remaining);
                self.push_segment(keep);
                break;
            }
        }
        for segment in iter {
            self.push_segment(segment);
        }
        self.chars -= length;
        Ok(erased)
    }

    /// Copies `length` characters starting at `begin` into a new chunk.
    pub fn substring(&self, begin: usize, length: usize) -> Result<TextChunk> {
        self.check_offset(begin.saturating_add(length), "substring")?;
        let mut result = TextChunk::new();
        if length == 0 {
            return Ok(result);
        }
        let mut skip = begin;
        let mut take = length;
        for segment in &self.segments {
            if skip >= segment.chars {
                skip -= segment.chars;
                continue;
            }
            let available = segment.chars - skip;
            let count = available.min(take);
            let from = byte_of_char(&segment.text, skip);
            let to = byte_of_char(&segment.text, skip + count);
            result.chars += count;
            result.push_segment(Segment {
                author: segment.author,
                text: segment.text[from..to].to_owned(),
                chars: count,
            });
            take -= count;
            skip = 0;
            if take == 0 {
                break;
            }
        }
        Ok(result)
    }

    /// Concatenates `other` onto the end.
    pub fn append(&mut self, other: TextChunk) {
        self.chars += other.chars;
        for segment in other.segments {
            self.push_segment(segment);
        }
    }
}

impl std::fmt::Display for TextChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for segment in &self.segments {
            f.write_str(&segment.text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunk(parts: &[(u32, &str)]) -> TextChunk {
        let mut result = TextChunk::new();
        for (author, text) in parts {
            result.append(TextChunk::from_text(*text, UserId(*author)));
        }
        result
    }

    fn segment_lengths(chunk: &TextChunk) -> Vec<usize> {
        chunk.segments().map(|s| s.chars).collect()
    }

    #[test]
    fn adjacent_same_author_segments_merge() {
        let c = chunk(&[(1, "foo"), (1, "bar"), (2, "baz")]);
        assert_eq!(c.segments().count(), 2);
        assert_eq!(c.to_string(), "foobarbaz");
        assert_eq!(c.len(), 9);
    }

    #[test]
    fn insert_splits_on_author_change() {
        let mut c = chunk(&[(1, "hello")]);
        c.insert_text(2, "XY", UserId(2)).unwrap();
        assert_eq!(c.to_string(), "heXYllo");
        assert_eq!(segment_lengths(&c), vec![2, 2, 3]);
    }

    #[test]
    fn insert_concatenates_on_same_author() {
        let mut c = chunk(&[(1, "hello")]);
        c.insert_text(5, " world", UserId(1)).unwrap();
        assert_eq!(c.segments().count(), 1);
        assert_eq!(c.to_string(), "hello world");
    }

    #[test]
    fn erase_merges_same_author_neighbours() {
        let mut c = chunk(&[(1, "abc"), (2, "XY"), (1, "def")]);
        let erased = c.erase(3, 2).unwrap();
        assert_eq!(erased.to_string(), "XY");
        assert_eq!(c.to_string(), "abcdef");
        assert_eq!(c.segments().count(), 1);
    }

    #[test]
    fn erase_across_segments_keeps_authorship() {
        let mut c = chunk(&[(1, "abc"), (2, "def")]);
        let erased = c.erase(2, 2).unwrap();
        assert_eq!(erased.to_string(), "cd");
        let authors: Vec<u32> = erased.segments().map(|s| s.author.0).collect();
        assert_eq!(authors, vec![1, 2]);
        assert_eq!(c.to_string(), "abef");
    }

    #[test]
    fn multibyte_offsets_are_character_offsets() {
        let mut c = chunk(&[(1, "aüb")]);
        c.insert_text(2, "ö", UserId(2)).unwrap();
        assert_eq!(c.to_string(), "aüöb");
        let erased = c.erase(1, 2).unwrap();
        assert_eq!(erased.to_string(), "üö");
        assert_eq!(c.to_string(), "ab");
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let mut c = chunk(&[(1, "abc")]);
        assert!(c.insert_text(4, "x", UserId(1)).is_err());
        assert!(c.erase(1, 3).is_err());
        assert!(c.substring(2, 2).is_err());
    }

    proptest! {
        #[test]
        fn substring_of_full_range_is_identity(
            parts in prop::collection::vec((0u32..3, "[a-z]{1,4}"), 0..5)
        ) {
            let parts: Vec<(u32, &str)> =
                parts.iter().map(|(a, t)| (*a, t.as_str())).collect();
            let c = chunk(&parts);
            prop_assert_eq!(c.substring(0, c.len()).unwrap(), c);
        }

        #[test]
        fn insert_into_empty_is_identity(
            parts in prop::collection::vec((0u32..3, "[a-z]{1,4}"), 0..5)
        ) {
            let parts: Vec<(u32, &str)> =
                parts.iter().map(|(a, t)| (*a, t.as_str())).collect();
            let c = chunk(&parts);
            let mut empty = TextChunk::new();
            empty.insert_chunk(0, c.clone()).unwrap();
            prop_assert_eq!(empty, c);
        }

        #[test]
        fn invariants_hold_after_random_edits(
            ops in prop::collection::vec(
                (0u32..3, 0usize..12, "[a-z]{0,4}", prop::bool::ANY), 0..12
            )
        ) {
            let mut c = TextChunk::new();
            for (author, offset, text, insert) in ops {
                if insert {
                    let offset = offset.min(c.len());
                    c.insert_text(offset, text, UserId(author)).unwrap();
                } else if !c.is_empty() {
                    let offset = offset.min(c.len() - 1);
                    let len = (c.len() - offset).min(text.len());
                    c.erase(offset, len).unwrap();
                }
                // Segments non-empty, no same-author neighbours, length
                // bookkeeping exact.
                let mut total = 0;
                let mut prev: Option<UserId> = None;
                for segment in c.segments() {
                    prop_assert!(segment.chars > 0);
                    prop_assert_eq!(segment.chars, segment.text.chars().count());
                    prop_assert_ne!(Some(segment.author), prev);
                    prev = Some(segment.author);
                    total += segment.chars;
                }
                prop_assert_eq!(total, c.len());
                prop_assert_eq!(c.to_string().chars().count(), c.len());
            }
        }
    }
}
