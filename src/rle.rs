//! Run-length encoded log of stack pointers.
//!
//! Each entry is a 32-bit word. A word with [`COUNTER_FLAG`] clear is a
//! literal stack index; a word with the flag set holds, in its low 31 bits,
//! how many extra times the literal right before it was recorded.

use crate::error::EncodeError;

pub const COUNTER_FLAG: u32 = 0x8000_0000;
pub const PAYLOAD_MASK: u32 = 0x7FFF_FFFF;

// A counter never grows past this; the next repeat starts a fresh literal.
const MAX_COUNTER: u32 = i32::MAX as u32 - 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackPointerLog {
    words: Vec<u32>,
}

impl StackPointerLog {
    pub fn new() -> Self {
        StackPointerLog { words: Vec::new() }
    }

    pub fn from_words(words: Vec<u32>) -> Self {
        StackPointerLog { words }
    }

    /// Appends one stack pointer. `pointer` must fit in 31 bits.
    pub fn append(&mut self, pointer: u32) {
        debug_assert_eq!(pointer & COUNTER_FLAG, 0);
        let pointer = pointer & PAYLOAD_MASK;
        let Some(&top) = self.words.last() else {
            self.words.push(pointer);
            return;
        };
        if top & COUNTER_FLAG != 0 {
            let counter = top & PAYLOAD_MASK;
            let len = self.words.len();
            if len >= 2 && self.words[len - 2] == pointer && counter < MAX_COUNTER {
                self.words[len - 1] = (counter + 1) | COUNTER_FLAG;
            } else {
                self.words.push(pointer);
            }
        } else if top == pointer {
            self.words.push(1 | COUNTER_FLAG);
        } else {
            self.words.push(pointer);
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Encoded entries, not logical samples.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn runs(&self) -> Runs<'_> {
        Runs {
            words: &self.words,
            pos: 0,
        }
    }

    pub fn decompress(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (pointer, count) in self.runs() {
            out.extend(std::iter::repeat(pointer).take(count as usize));
        }
        out
    }

    /// Number of logical samples in the log.
    pub fn sample_count(&self) -> u64 {
        self.runs().map(|(_, count)| count).sum()
    }

    /// Checks that no counter appears without a literal before it.
    pub fn validate(&self) -> Result<(), EncodeError> {
        let mut prev_literal = false;
        for (offset, word) in self.words.iter().enumerate() {
            let is_counter = word & COUNTER_FLAG != 0;
            if is_counter && !prev_literal {
                return Err(EncodeError::MalformedLog(offset));
            }
            prev_literal = !is_counter;
        }
        Ok(())
    }
}

/// Iterator of `(pointer, total_count)` runs over a log.
///
/// A stray counter with no literal before it is skipped; [`StackPointerLog::validate`]
/// reports it.
pub struct Runs<'a> {
    words: &'a [u32],
    pos: usize,
}

impl Iterator for Runs<'_> {
    type Item = (u32, u64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let word = *self.words.get(self.pos)?;
            self.pos += 1;
            if word & COUNTER_FLAG != 0 {
                continue;
            }
            let mut count = 1u64;
            if let Some(&next) = self.words.get(self.pos) {
                if next & COUNTER_FLAG != 0 {
                    count += (next & PAYLOAD_MASK) as u64;
                    self.pos += 1;
                }
            }
            return Some((word, count));
        }
    }
}
