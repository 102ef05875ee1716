// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

const BITS_PER_WORD: u64 = u64::BITS as u64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitmapError {
    #[error("Unable to allocate memory for a bitmap of {0} bits")]
    Alloc(u64),
}

/// A growable bit vector indexed by pfn.
///
/// Reads past the end see clear bits. Writes past the end grow the
/// bitmap through [`Bitmap::ensure`], so they fail the same way it does.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
}

fn word_index(bit: u64) -> usize {
    (bit / BITS_PER_WORD) as usize
}

fn bit_mask(bit: u64) -> u64 {
    1 << (bit % BITS_PER_WORD)
}

impl Bitmap {
    pub fn new() -> Self {
        Bitmap::default()
    }

    /// Wrap raw words, as returned by a dirty log query.
    pub fn from_words(words: Vec<u64>) -> Self {
        Bitmap { words }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Number of addressable bits.
    pub fn len(&self) -> u64 {
        self.words.len() as u64 * BITS_PER_WORD
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Make `bit` addressable. Capacity at least doubles when it has to
    /// grow, so a slowly increasing index costs amortized constant time.
    pub fn ensure(&mut self, bit: u64) -> Result<(), BitmapError> {
        if bit < self.len() {
            return Ok(());
        }

        let needed = word_index(bit) + 1;
        let target = needed.max(self.words.len() * 2);
        let additional = target - self.words.len();
        self.words
            .try_reserve_exact(additional)
            .map_err(|_| BitmapError::Alloc(target as u64 * BITS_PER_WORD))?;
        self.words.resize(target, 0);
        Ok(())
    }

    pub fn test(&self, bit: u64) -> bool {
        self.words
            .get(word_index(bit))
            .is_some_and(|w| w & bit_mask(bit) != 0)
    }

    pub fn set(&mut self, bit: u64) -> Result<(), BitmapError> {
        self.ensure(bit)?;
        self.words[word_index(bit)] |= bit_mask(bit);
        Ok(())
    }

    pub fn clear(&mut self, bit: u64) {
        if let Some(w) = self.words.get_mut(word_index(bit)) {
            *w &= !bit_mask(bit);
        }
    }

    /// Set `bit`, returning whether it was already set.
    pub fn test_and_set(&mut self, bit: u64) -> Result<bool, BitmapError> {
        let old = self.test(bit);
        self.set(bit)?;
        Ok(old)
    }

    /// Clear `bit`, returning whether it was set.
    pub fn test_and_clear(&mut self, bit: u64) -> bool {
        let old = self.test(bit);
        self.clear(bit);
        old
    }

    /// Set `count` bits starting at `start`.
    pub fn set_range(&mut self, start: u64, count: u64) -> Result<(), BitmapError> {
        if count == 0 {
            return Ok(());
        }
        self.ensure(start + count - 1)?;

        let mut bit = start;
        let end = start + count;
        while bit < end {
            if bit % BITS_PER_WORD == 0 && end - bit >= BITS_PER_WORD {
                self.words[word_index(bit)] = u64::MAX;
                bit += BITS_PER_WORD;
            } else {
                self.words[word_index(bit)] |= bit_mask(bit);
                bit += 1;
            }
        }
        Ok(())
    }

    /// Bitwise OR of `other` into `self`.
    pub fn or(&mut self, other: &Bitmap) -> Result<(), BitmapError> {
        if other.len() > self.len() {
            self.ensure(other.len() - 1)?;
        }
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= o;
        }
        Ok(())
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Positions of all set bits, in increasing order.
    pub fn iter_ones(&self) -> SetBits<'_> {
        SetBits::new(&self.words, 0)
    }

    /// Positions of the set bits within `first..=last`, in increasing order.
    pub fn ones_in_range(&self, first: u64, last: u64) -> impl Iterator<Item = u64> + '_ {
        let start_word = word_index(first).min(self.words.len());
        let end_word = if last >= self.len() {
            self.words.len()
        } else {
            word_index(last) + 1
        };
        let words = self.words.get(start_word..end_word).unwrap_or(&[]);

        SetBits::new(words, start_word as u64 * BITS_PER_WORD)
            .skip_while(move |&bit| bit < first)
            .take_while(move |&bit| bit <= last)
    }
}

/// Iterator over the positions of the set bits of a word slice, treating
/// the slice as one large little-endian integer.
pub struct SetBits<'a> {
    words: std::slice::Iter<'a, u64>,
    /// Bit position of the lowest bit of `current`.
    base: u64,
    /// Bits of the current word not reported yet.
    current: u64,
}

impl<'a> SetBits<'a> {
    fn new(words: &'a [u64], base: u64) -> Self {
        let mut words = words.iter();
        let current = words.next().copied().unwrap_or(0);
        SetBits {
            words,
            base,
            current,
        }
    }
}

impl Iterator for SetBits<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.current == 0 {
            self.current = *self.words.next()?;
            self.base += BITS_PER_WORD;
        }

        let bit = self.current.trailing_zeros() as u64;
        // Drop the lowest set bit.
        self.current &= self.current - 1;
        Some(self.base + bit)
    }
}
