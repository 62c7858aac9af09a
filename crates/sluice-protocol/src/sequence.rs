//! Wraparound arithmetic over the 1024-entry sequence space.

use sluice_core::constants::{HALF_SEQUENCE_SPACE, NUM_SEQUENCE_NUMBERS};

/// Sequence number carried in the message header, always below `NUM_SEQUENCE_NUMBERS`.
pub type SequenceNumber = u16;

/// Signed distance from `expected` to `nr`, in `-512..=511`.
///
/// Positive means `nr` is ahead of `expected`. Two numbers exactly half the space
/// apart compare as behind each other.
pub fn relative_sequence_number(nr: SequenceNumber, expected: SequenceNumber) -> i32 {
    let space = NUM_SEQUENCE_NUMBERS as i32;
    (nr as i32 - expected as i32 + space + HALF_SEQUENCE_SPACE) % space - HALF_SEQUENCE_SPACE
}

/// Returns true if `s1` was issued after `s2`.
pub fn sequence_greater_than(s1: SequenceNumber, s2: SequenceNumber) -> bool {
    relative_sequence_number(s1, s2) > 0
}

/// Returns true if `s1` was issued before `s2`.
pub fn sequence_less_than(s1: SequenceNumber, s2: SequenceNumber) -> bool {
    relative_sequence_number(s1, s2) < 0
}

/// The sequence number following `nr`.
pub fn next_sequence(nr: SequenceNumber) -> SequenceNumber {
    (nr + 1) % NUM_SEQUENCE_NUMBERS
}

/// `nr` moved forward by `distance`.
pub fn advance_sequence(nr: SequenceNumber, distance: usize) -> SequenceNumber {
    ((nr as usize + distance) % NUM_SEQUENCE_NUMBERS as usize) as SequenceNumber
}
