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

//! Error type for the rate-limit engine (§4.2 step 1 "Validate `ip`").

use thiserror::Error;

/// Shorthand for the rate-limit engine's result type.
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors the rate-limit engine can surface.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// The peer address carried a zero remote port, treated as spoofing
    /// (§4.2 "Middleware wrapping").
    #[error("zero source port from {0}, treated as spoofed")]
    ZeroPort(std::net::IpAddr),
}
