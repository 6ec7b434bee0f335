//! Two-way merge with fixed precedence.

use std::iter::Peekable;

use super::{Entry, EntryStream};
use crate::error::Result;

/// Merges two sorted streams; on equal keys the first stream wins and the
/// second stream's version of that key is discarded. Used to layer a newer
/// tier over an older one (memtable over SSTs, level L over level L+1).
enum Choice {
    A,
    B,
    Both,
}

pub struct TwoMergeIterator {
    a: Peekable<EntryStream>,
    b: Peekable<EntryStream>,
    skip_tombstones: bool,
}

impl TwoMergeIterator {
    pub fn new(a: EntryStream, b: EntryStream, skip_tombstones: bool) -> Self {
        Self {
            a: a.peekable(),
            b: b.peekable(),
            skip_tombstones,
        }
    }

    fn next_merged(&mut self) -> Option<Result<Entry>> {
        // Surface source errors as soon as they reach the head.
        if matches!(self.a.peek(), Some(Err(_))) {
            return self.a.next();
        }
        if matches!(self.b.peek(), Some(Err(_))) {
            return self.b.next();
        }

        let choice = match (self.a.peek(), self.b.peek()) {
            (None, None) => return None,
            (Some(_), None) => Choice::A,
            (None, Some(_)) => Choice::B,
            (Some(Ok(ea)), Some(Ok(eb))) => match ea.key.cmp(&eb.key) {
                std::cmp::Ordering::Less => Choice::A,
                std::cmp::Ordering::Greater => Choice::B,
                std::cmp::Ordering::Equal => Choice::Both,
            },
            // Errors were handled above.
            _ => return None,
        };

        match choice {
            Choice::A => self.a.next(),
            Choice::B => self.b.next(),
            Choice::Both => {
                // A wins; drop B's version of this key.
                self.b.next();
                self.a.next()
            }
        }
    }
}

impl Iterator for TwoMergeIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_merged()? {
                Ok(entry) if self.skip_tombstones && entry.is_tombstone() => continue,
                item => return Some(item),
            }
        }
    }
}
