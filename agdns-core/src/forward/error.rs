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

//! Error type for the forward resolver.

use thiserror::Error;

/// Shorthand for the forward resolver's result type.
pub type Result<T> = std::result::Result<T, ForwardError>;

/// Errors the forward resolver can surface.
#[derive(Error, Debug)]
pub enum ForwardError {
    /// IO error talking to an upstream (dial, send, recv).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The exchange did not complete before its deadline.
    #[error(transparent)]
    Timeout(#[from] tokio::time::error::Elapsed),

    /// Response ID did not match the request ID (§4.1 "Response validation").
    #[error("response id {got} does not match request id {want}")]
    Id {
        /// ID carried by the response.
        got: u16,
        /// ID carried by the request.
        want: u16,
    },

    /// Response did not carry exactly one question.
    #[error("response carried {0} questions, expected exactly one")]
    QuestionCount(usize),

    /// Response question's qtype/qname/qclass did not match the request.
    #[error("response question does not match request question")]
    QuestionMismatch,

    /// `Exchange` returned `(nil, nil)` in the original terms: no error and
    /// no response.
    #[error("upstream returned no response and no error")]
    NoResponse,

    /// The active list was empty and no fallback upstream was configured.
    #[error("no active or fallback upstream available")]
    NoUpstream,

    /// Wire (de)serialization error.
    #[error(transparent)]
    Wire(#[from] domain::base::ShortBuf),

    /// Wraps `domain`'s message-parse error.
    #[error("failed to parse DNS message: {0}")]
    Parse(String),

    /// The connection pool has been closed.
    #[error("connection pool closed")]
    PoolClosed,
}

impl ForwardError {
    /// Whether this is a *network*-class error per §4.1/§7: something that
    /// justifies falling back to a secondary upstream rather than
    /// surfacing immediately. ID/question mismatches are deliberately
    /// excluded — retrying on the same socket after a mismatch risks
    /// picking up a second stale reply (§7 "Upstream mismatch").
    pub fn is_network_error(&self) -> bool {
        match self {
            ForwardError::Io(e) => is_network_io_error(e),
            ForwardError::Timeout(_) => true,
            ForwardError::NoResponse => true,
            ForwardError::PoolClosed => true,
            ForwardError::Id { .. }
            | ForwardError::QuestionCount(_)
            | ForwardError::QuestionMismatch
            | ForwardError::NoUpstream
            | ForwardError::Wire(_)
            | ForwardError::Parse(_) => false,
        }
    }
}

/// Network-error predicate over a raw `io::Error` (timeout, EOF, refused,
/// reset, ...), as referenced by §4.1 "an error satisfying the
/// network-error predicate".
pub fn is_network_io_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        TimedOut
            | ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | UnexpectedEof
            | WouldBlock
            | Interrupted
    )
}
