//! Error types for resource accounting.

use thiserror::Error;

use crate::counter::Dimension;
use crate::types::ScopeName;

/// Errors surfaced by scopes and the resource manager.
///
/// Every error is returned directly to the calling operation; nothing is
/// retried internally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResourceError {
    /// A reservation would drive a dimension of some scope above its cap.
    #[error(
        "{scope}: cannot reserve {dimension}: requested {requested}, in use {current}, limit {limit}"
    )]
    LimitExceeded {
        /// The scope whose limit did not admit the reservation.
        scope: ScopeName,
        /// The dimension that did not fit.
        dimension: Dimension,
        /// Usage at the time of the request.
        current: u64,
        /// The requested delta.
        requested: u64,
        /// The scope's cap for the dimension.
        limit: u64,
    },

    /// An operation was attempted on a scope after `done()`.
    #[error("{scope}: resource scope closed")]
    ScopeClosed {
        /// The closed scope.
        scope: ScopeName,
    },

    /// `set_peer`, `set_protocol`, or `set_service` was called twice.
    #[error("{scope}: already attached to a {target}")]
    AlreadyAttached {
        /// The connection or stream scope.
        scope: ScopeName,
        /// What the scope is already attached to: `"peer"`, `"protocol"`,
        /// or `"service"`.
        target: &'static str,
    },

    /// `set_service` was called before `set_protocol`.
    #[error("{scope}: not attached to a protocol")]
    NotAttachedToProtocol {
        /// The stream scope.
        scope: ScopeName,
    },

    /// More was released than had been reserved. This is a bug in the
    /// caller; usage is clamped at zero and the violation reported.
    #[error("{scope}: released more {dimension} than was reserved")]
    AccountingUnderflow {
        /// The scope whose counter underflowed.
        scope: ScopeName,
        /// The dimension that underflowed.
        dimension: Dimension,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;

    #[test]
    fn limit_exceeded_names_the_scope_and_dimension() {
        let err = ResourceError::LimitExceeded {
            scope: ScopeName::Peer(PeerId::from("p1")),
            dimension: Dimension::StreamsInbound,
            current: 16,
            requested: 1,
            limit: 16,
        };
        assert_eq!(
            err.to_string(),
            "peer:p1: cannot reserve inbound streams: requested 1, in use 16, limit 16"
        );
    }

    #[test]
    fn scope_closed_message() {
        let err = ResourceError::ScopeClosed {
            scope: ScopeName::Connection(4),
        };
        assert_eq!(err.to_string(), "conn-4: resource scope closed");
    }
}
