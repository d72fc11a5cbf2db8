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

//! Error type for the cache layer.

use thiserror::Error;

/// Shorthand for the cache layer's result type.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors the cache layer can surface.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The message had no question, so no cache key could be derived.
    #[error("cannot derive a cache key: message has no question")]
    NoQuestion,

    /// Wraps `domain`'s wire (de)serialization errors encountered while
    /// rewriting TTLs on serve.
    #[error(transparent)]
    Wire(#[from] domain::base::ShortBuf),
}
