use crate::error::CrackError;
use smallvec::SmallVec;

/// Candidate symbols in digit order: digit 0 is `a`, digit 35 is `9`.
pub const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";
pub const RADIX: u8 = 36;
/// Largest word length whose cumulative candidate count still fits in a `u128`.
pub const MAX_WORD_LENGTH: u32 = 24;

/// Little-endian base-36 digits of a candidate (index 0 is the last rendered symbol).
pub type Digits = SmallVec<[u8; 16]>;

pub fn validate_max_length(max_length: u32) -> Result<(), CrackError> {
    if max_length == 0 || max_length > MAX_WORD_LENGTH {
        return Err(CrackError::Validation(format!(
            "max length must be between 1 and {}, got {}",
            MAX_WORD_LENGTH, max_length
        )));
    }
    Ok(())
}

/// `counts[l]` is the number of candidates of length `1..=l`; `counts[0] == 0`.
pub fn cumulative_counts(max_length: u32) -> Vec<u128> {
    let mut counts = Vec::with_capacity(max_length as usize + 1);
    counts.push(0u128);
    let mut per_length = 1u128;
    for length in 1..=max_length as usize {
        per_length = per_length.saturating_mul(RADIX as u128);
        counts.push(counts[length - 1].saturating_add(per_length));
    }
    counts
}

pub fn total_words(max_length: u32) -> Result<u128, CrackError> {
    validate_max_length(max_length)?;
    Ok(cumulative_counts(max_length)[max_length as usize])
}

/// One partition's contiguous slice of the ordered candidate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    pub max_length: u32,
    pub start_length: u32,
    pub local_offset: u128,
    pub global_offset: u128,
    pub word_count: u128,
}

impl PartitionRange {
    /// Computes the slice owned by `part_number` (1-indexed) out of `part_count`.
    /// Every partition gets `floor(T / P)` candidates and the last one also takes
    /// the remainder.
    pub fn compute(max_length: u32, part_count: u32, part_number: u32) -> Result<Self, CrackError> {
        validate_max_length(max_length)?;
        if part_count == 0 {
            return Err(CrackError::Validation("partition count must be at least 1".to_string()));
        }
        if part_number == 0 || part_number > part_count {
            return Err(CrackError::Validation(format!(
                "partition number {} outside 1..={}",
                part_number, part_count
            )));
        }

        let counts = cumulative_counts(max_length);
        let total = counts[max_length as usize];
        let parts = part_count as u128;
        let base = total / parts;

        let mut word_count = base;
        if part_number == part_count {
            word_count += total % parts;
        }

        let global_offset = base * (part_number as u128 - 1);
        let start_length = (1..=max_length)
            .find(|&length| global_offset < counts[length as usize])
            .unwrap_or(max_length);
        let local_offset = global_offset - counts[start_length as usize - 1];

        Ok(Self {
            max_length,
            start_length,
            local_offset,
            global_offset,
            word_count,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.word_count == 0
    }

    pub fn start_digits(&self) -> Digits {
        offset_digits(self.local_offset, self.start_length)
    }

    pub fn words(&self) -> Words {
        Words::new(self)
    }

    /// Candidate at `index` within this partition, computed without stepping.
    pub fn nth_word(&self, index: u128) -> Option<String> {
        if index >= self.word_count {
            return None;
        }
        word_at(self.max_length, self.global_offset + index)
    }
}

/// Candidate at `global_index` in the full ordering of words of length `1..=max_length`.
pub fn word_at(max_length: u32, global_index: u128) -> Option<String> {
    if validate_max_length(max_length).is_err() {
        return None;
    }
    let counts = cumulative_counts(max_length);
    let length = (1..=max_length).find(|&length| global_index < counts[length as usize])?;
    let digits = offset_digits(global_index - counts[length as usize - 1], length);
    let mut out = Vec::with_capacity(digits.len());
    render(&digits, &mut out);
    String::from_utf8(out).ok()
}

pub fn offset_digits(offset: u128, length: u32) -> Digits {
    let mut digits = Digits::with_capacity(length as usize);
    let mut rest = offset;
    for _ in 0..length {
        digits.push((rest % RADIX as u128) as u8);
        rest /= RADIX as u128;
    }
    digits
}

/// Steps to the next candidate. Returns true when the word grew by one symbol.
pub fn advance(digits: &mut Digits) -> bool {
    match digits.iter().position(|&digit| digit + 1 < RADIX) {
        Some(index) => {
            digits[index] += 1;
            for digit in &mut digits[..index] {
                *digit = 0;
            }
            false
        }
        None => {
            for digit in digits.iter_mut() {
                *digit = 0;
            }
            digits.push(0);
            true
        }
    }
}

pub fn render(digits: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.extend(digits.iter().rev().map(|&digit| ALPHABET[digit as usize]));
}

/// Lazy, finite sequence of a partition's candidates.
///
/// `next_word` lends the rendered bytes without allocating; the `Iterator`
/// impl hands out owned strings.
pub struct Words {
    digits: Digits,
    remaining: u128,
    buffer: Vec<u8>,
    started: bool,
}

impl Words {
    pub fn new(range: &PartitionRange) -> Self {
        Self {
            digits: range.start_digits(),
            remaining: range.word_count,
            buffer: Vec::with_capacity(range.max_length as usize),
            started: false,
        }
    }

    pub fn remaining(&self) -> u128 {
        self.remaining
    }

    pub fn next_word(&mut self) -> Option<&[u8]> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            advance(&mut self.digits);
        } else {
            self.started = true;
        }
        self.remaining -= 1;
        render(&self.digits, &mut self.buffer);
        Some(&self.buffer)
    }
}

impl Iterator for Words {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.next_word()
            .map(|word| String::from_utf8_lossy(word).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cumulative_counts() {
        let counts = cumulative_counts(3);
        assert_eq!(counts, vec![0, 36, 36 + 1296, 36 + 1296 + 46656]);
    }

    #[test]
    fn test_max_length_bounds() {
        assert!(validate_max_length(0).is_err());
        assert!(validate_max_length(1).is_ok());
        assert!(validate_max_length(MAX_WORD_LENGTH).is_ok());
        assert!(validate_max_length(MAX_WORD_LENGTH + 1).is_err());
        let total = total_words(MAX_WORD_LENGTH).unwrap();
        assert!(total > 36u128.pow(MAX_WORD_LENGTH));
    }

    #[test]
    fn test_two_partitions_of_length_two() {
        let first = PartitionRange::compute(2, 2, 1).unwrap();
        assert_eq!(first.start_length, 1);
        assert_eq!(first.local_offset, 0);
        assert_eq!(first.word_count, 666);
        assert_eq!(first.words().next().as_deref(), Some("a"));

        let second = PartitionRange::compute(2, 2, 2).unwrap();
        assert_eq!(second.global_offset, 666);
        assert_eq!(second.start_length, 2);
        assert_eq!(second.local_offset, 630);
        assert_eq!(second.start_digits().as_slice(), &[18, 17]);
        assert_eq!(second.words().next().as_deref(), Some("rs"));
        assert_eq!(second.word_count, 666);
    }

    #[test]
    fn test_last_partition_takes_remainder() {
        let total = total_words(2).unwrap();
        let ranges: Vec<_> = (1..=5).map(|n| PartitionRange::compute(2, 5, n).unwrap()).collect();
        for range in &ranges[..4] {
            assert_eq!(range.word_count, total / 5);
        }
        assert_eq!(ranges[4].word_count, total / 5 + total % 5);
        assert_eq!(ranges.iter().map(|r| r.word_count).sum::<u128>(), total);
    }

    #[test]
    fn test_more_partitions_than_words() {
        let range = PartitionRange::compute(1, 40, 3).unwrap();
        assert!(range.is_empty());
        assert_eq!(range.words().count(), 0);
        let last = PartitionRange::compute(1, 40, 40).unwrap();
        assert_eq!(last.word_count, 36);
    }

    #[test]
    fn test_invalid_partition_numbers() {
        assert!(PartitionRange::compute(3, 0, 1).is_err());
        assert!(PartitionRange::compute(3, 2, 0).is_err());
        assert!(PartitionRange::compute(3, 2, 3).is_err());
        assert!(PartitionRange::compute(0, 1, 1).is_err());
    }

    #[test]
    fn test_advance_within_and_across_lengths() {
        let mut digits = offset_digits(25, 1);
        assert!(!advance(&mut digits));
        assert_eq!(digits.as_slice(), &[26]);

        let mut digits: Digits = SmallVec::from_slice(&[35]);
        assert!(advance(&mut digits));
        assert_eq!(digits.as_slice(), &[0, 0]);

        let mut digits: Digits = SmallVec::from_slice(&[35, 0]);
        assert!(!advance(&mut digits));
        let mut out = Vec::new();
        render(&digits, &mut out);
        assert_eq!(out, b"ba");
    }

    #[test]
    fn test_single_partition_walks_lengths_in_order() {
        let range = PartitionRange::compute(2, 1, 1).unwrap();
        let words: Vec<String> = range.words().collect();
        assert_eq!(words.len(), 1332);
        assert_eq!(words[0], "a");
        assert_eq!(words[25], "z");
        assert_eq!(words[26], "0");
        assert_eq!(words[35], "9");
        assert_eq!(words[36], "aa");
        assert_eq!(words[37], "ab");
        assert_eq!(words[1331], "99");
    }

    #[test]
    fn test_nth_word_matches_stepping() {
        let range = PartitionRange::compute(3, 7, 4).unwrap();
        for (index, word) in range.words().enumerate().step_by(997) {
            assert_eq!(range.nth_word(index as u128), Some(word));
        }
        assert_eq!(range.nth_word(range.word_count), None);
    }

    #[test]
    fn test_next_word_lends_without_allocating_strings() {
        let range = PartitionRange::compute(2, 3, 2).unwrap();
        let mut words = range.words();
        let first = words.next_word().map(|w| w.to_vec());
        assert_eq!(first, range.nth_word(0).map(String::into_bytes));
        assert_eq!(words.remaining(), range.word_count - 1);
    }
}
