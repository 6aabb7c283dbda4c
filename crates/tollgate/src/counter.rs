//! Scalar accounting over the fixed resource dimensions.
//!
//! `ResourceCounter` pairs a mutable [`ResourceStat`] with an immutable
//! [`Limit`] and offers the two primitives everything else is built from:
//! an all-or-nothing `reserve` and a clamping `release`. The counter holds
//! no lock of its own; the owning scope serializes access.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;
use crate::limit::Limit;
use crate::types::{Direction, ScopeName};

/// One accounting dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Reserved memory, in bytes.
    Memory,
    /// Inbound connections.
    ConnsInbound,
    /// Outbound connections.
    ConnsOutbound,
    /// Inbound streams.
    StreamsInbound,
    /// Outbound streams.
    StreamsOutbound,
    /// File descriptors.
    Fd,
}

impl Dimension {
    /// Every dimension, in checking order.
    pub const ALL: [Self; 6] = [
        Self::Memory,
        Self::ConnsInbound,
        Self::ConnsOutbound,
        Self::StreamsInbound,
        Self::StreamsOutbound,
        Self::Fd,
    ];
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::ConnsInbound => f.write_str("inbound connections"),
            Self::ConnsOutbound => f.write_str("outbound connections"),
            Self::StreamsInbound => f.write_str("inbound streams"),
            Self::StreamsOutbound => f.write_str("outbound streams"),
            Self::Fd => f.write_str("file descriptors"),
        }
    }
}

/// A snapshot of per-dimension usage; also the delta type for reservations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStat {
    /// Memory in use, in bytes.
    pub memory: u64,
    /// Inbound connections in use.
    pub conns_inbound: u64,
    /// Outbound connections in use.
    pub conns_outbound: u64,
    /// Inbound streams in use.
    pub streams_inbound: u64,
    /// Outbound streams in use.
    pub streams_outbound: u64,
    /// File descriptors in use.
    pub fd: u64,
}

impl ResourceStat {
    /// A delta of `n` bytes of memory and nothing else.
    #[must_use]
    pub const fn memory(n: u64) -> Self {
        Self {
            memory: n,
            conns_inbound: 0,
            conns_outbound: 0,
            streams_inbound: 0,
            streams_outbound: 0,
            fd: 0,
        }
    }

    /// The delta charged for one connection.
    #[must_use]
    pub const fn conn(dir: Direction, use_fd: bool) -> Self {
        let mut stat = Self::memory(0);
        match dir {
            Direction::Inbound => stat.conns_inbound = 1,
            Direction::Outbound => stat.conns_outbound = 1,
        }
        if use_fd {
            stat.fd = 1;
        }
        stat
    }

    /// The delta charged for one stream.
    #[must_use]
    pub const fn stream(dir: Direction) -> Self {
        let mut stat = Self::memory(0);
        match dir {
            Direction::Inbound => stat.streams_inbound = 1,
            Direction::Outbound => stat.streams_outbound = 1,
        }
        stat
    }

    /// True when every dimension is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.memory == 0
            && self.conns_inbound == 0
            && self.conns_outbound == 0
            && self.streams_inbound == 0
            && self.streams_outbound == 0
            && self.fd == 0
    }

    /// Reads one dimension.
    #[must_use]
    pub const fn get(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Memory => self.memory,
            Dimension::ConnsInbound => self.conns_inbound,
            Dimension::ConnsOutbound => self.conns_outbound,
            Dimension::StreamsInbound => self.streams_inbound,
            Dimension::StreamsOutbound => self.streams_outbound,
            Dimension::Fd => self.fd,
        }
    }

    fn set(&mut self, dimension: Dimension, value: u64) {
        match dimension {
            Dimension::Memory => self.memory = value,
            Dimension::ConnsInbound => self.conns_inbound = value,
            Dimension::ConnsOutbound => self.conns_outbound = value,
            Dimension::StreamsInbound => self.streams_inbound = value,
            Dimension::StreamsOutbound => self.streams_outbound = value,
            Dimension::Fd => self.fd = value,
        }
    }
}

impl Limit {
    /// Reads the cap for one dimension.
    #[must_use]
    pub const fn get(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Memory => self.memory,
            Dimension::ConnsInbound => self.conns_inbound,
            Dimension::ConnsOutbound => self.conns_outbound,
            Dimension::StreamsInbound => self.streams_inbound,
            Dimension::StreamsOutbound => self.streams_outbound,
            Dimension::Fd => self.fd,
        }
    }
}

/// A reservation rejected by one dimension of a counter.
///
/// The owning scope attaches its identity via [`Exceeded::into_error`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Exceeded {
    pub dimension: Dimension,
    pub current: u64,
    pub requested: u64,
    pub limit: u64,
}

impl Exceeded {
    pub(crate) fn into_error(self, scope: ScopeName) -> ResourceError {
        ResourceError::LimitExceeded {
            scope,
            dimension: self.dimension,
            current: self.current,
            requested: self.requested,
            limit: self.limit,
        }
    }
}

/// A release that would have driven a dimension below zero.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Underflow {
    pub dimension: Dimension,
}

impl Underflow {
    pub(crate) fn into_error(self, scope: ScopeName) -> ResourceError {
        ResourceError::AccountingUnderflow {
            scope,
            dimension: self.dimension,
        }
    }
}

/// Mutable usage against an immutable limit.
#[derive(Debug, Clone)]
pub(crate) struct ResourceCounter {
    used: ResourceStat,
    limit: Limit,
}

impl ResourceCounter {
    pub(crate) fn new(limit: Limit) -> Self {
        Self {
            used: ResourceStat::default(),
            limit,
        }
    }

    /// Admits `delta` if it fits within the limit on every dimension, or
    /// leaves the counter untouched and reports the first dimension that
    /// does not fit.
    pub(crate) fn reserve(&mut self, delta: &ResourceStat) -> Result<(), Exceeded> {
        for dimension in Dimension::ALL {
            let requested = delta.get(dimension);
            if requested == 0 {
                continue;
            }
            let current = self.used.get(dimension);
            let limit = self.limit.get(dimension);
            match current.checked_add(requested) {
                Some(next) if next <= limit => {}
                _ => {
                    return Err(Exceeded {
                        dimension,
                        current,
                        requested,
                        limit,
                    });
                }
            }
        }
        for dimension in Dimension::ALL {
            let next = self.used.get(dimension) + delta.get(dimension);
            self.used.set(dimension, next);
        }
        Ok(())
    }

    /// Subtracts `delta`, clamping each dimension at zero. Going below zero
    /// is a caller bug; the first offending dimension is reported so the
    /// scope can surface it.
    pub(crate) fn release(&mut self, delta: &ResourceStat) -> Result<(), Underflow> {
        let mut underflow = None;
        for dimension in Dimension::ALL {
            let current = self.used.get(dimension);
            match current.checked_sub(delta.get(dimension)) {
                Some(next) => self.used.set(dimension, next),
                None => {
                    self.used.set(dimension, 0);
                    underflow.get_or_insert(Underflow { dimension });
                }
            }
        }
        match underflow {
            None => Ok(()),
            Some(u) => Err(u),
        }
    }

    pub(crate) fn stat(&self) -> ResourceStat {
        self.used
    }

    pub(crate) fn limit(&self) -> Limit {
        self.limit
    }

    /// Zeroes the usage vector. Only `done()` calls this, after the parents
    /// have been credited.
    pub(crate) fn clear(&mut self) {
        self.used = ResourceStat::default();
    }
}
