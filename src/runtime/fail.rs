// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Structures
//======================================================================================================================

/// Error type used across the stack. Carries a POSIX error code so callers
/// can branch on the condition without string matching, plus a cause for the
/// log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fail {
    pub errno: i32,
    pub cause: String,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Fail {
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl std::fmt::Display for Fail {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "error {}: {}", self.errno, self.cause)
    }
}

impl std::error::Error for Fail {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
