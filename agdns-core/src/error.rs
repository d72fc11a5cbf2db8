// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! This module provides the universal error type used in the core library.
//! Each sub-module keeps its own `thiserror`-derived error enum; this type
//! composes them at the crate boundary via `#[from]`.

pub use crate::{forward::error::ForwardError, ratelimit::RateLimitError};
use thiserror::Error;

/// Shorthand for the crate-wide result type.
pub type Result<T> = std::result::Result<T, CoreError>;

/// `CoreError` enumerates all possible errors surfaced by the core engine.
///
/// Per the error taxonomy: *protocol* errors are handled inline (FORMERR,
/// never surfaced as `CoreError`); *policy* drops never produce a response
/// and are represented as `Ok(None)` at the pipeline boundary, not as an
/// error; what remains here is what §7 calls upstream-network-after-fallback,
/// upstream-mismatch and collaborator-hard failures, which the outermost
/// listener turns into a `SERVFAIL`.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Error surfaced by the forward resolver (§4.1).
    #[error(transparent)]
    Forward(#[from] ForwardError),

    /// Error surfaced by the rate-limit engine (§4.2).
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// A collaborator (profile DB, filter storage, ...) failed in a way
    /// that cannot be treated as "not found" and must surface as SERVFAIL.
    #[error("collaborator '{0}' failed: {1}")]
    Collaborator(&'static str, String),

    /// The inbound message did not have exactly one question, or failed to
    /// parse; caller should respond FORMERR without disconnecting.
    #[error("malformed DNS message: {0}")]
    Protocol(String),

    /// Programmer error: an invariant the rest of the engine relies on was
    /// violated (e.g. an "impossible" enum variant reached). Per §9 this is
    /// the deliberate choice to fail fast rather than limp along.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Wraps `domain`'s wire (de)serialization errors.
    #[error(transparent)]
    Wire(#[from] domain::base::ShortBuf),
}

impl CoreError {
    /// True if this error should be reported to the client as a wire
    /// `SERVFAIL` as opposed to silently dropped or answered `FORMERR`.
    pub fn is_servfail(&self) -> bool {
        matches!(
            self,
            CoreError::Forward(_) | CoreError::Collaborator(..) | CoreError::Invariant(_)
        )
    }
}
