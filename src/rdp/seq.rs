// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{cmp, fmt, ops};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A 16-bit transport sequence number.
///
/// Sequence numbers advance modulo 2<sup>16</sup>. Comparisons are computed
/// on the signed difference, so ordering stays correct across the unsigned
/// wrap as long as the two numbers are within half the space of each other,
/// far beyond the few-packet windows this transport negotiates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SeqNumber(u16);

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u16> for SeqNumber {
    fn from(value: u16) -> Self {
        SeqNumber(value)
    }
}

impl From<SeqNumber> for u16 {
    fn from(value: SeqNumber) -> Self {
        value.0
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ops::Add<u16> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u16) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl ops::AddAssign<u16> for SeqNumber {
    fn add_assign(&mut self, rhs: u16) {
        *self = *self + rhs;
    }
}

impl ops::Sub<u16> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u16) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs))
    }
}

/// Distance from `rhs` to `self`, modulo the sequence space.
impl ops::Sub for SeqNumber {
    type Output = u16;

    fn sub(self, rhs: SeqNumber) -> u16 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        (self.0.wrapping_sub(other.0) as i16).partial_cmp(&0)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
