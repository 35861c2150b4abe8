//! Identifier newtypes shared across the meshdb crates.
//!
//! Transaction ids, partition ids and host-site ids are all small integers
//! that are already unique, so maps keyed by them use identity hashing
//! ([`nohash_hasher`]).

use std::fmt;

/// Number of low bits of a [`TxnId`] that carry the assigning partition.
const PARTITION_BITS: u32 = 14;
const PARTITION_MASK: u64 = (1 << PARTITION_BITS) - 1;

/// The sentinel partition id of the multi-partition initiator. Transaction
/// ids minted for multi-partition work carry this in their partition bits.
pub const MP_INIT_PID: PartitionId = PartitionId((1 << PARTITION_BITS) - 1);

/// A globally unique, monotonically assigned transaction id.
///
/// The id packs an ever-increasing sequence number above the id of the
/// partition that assigned it, so ids order transactions by age and still
/// identify their initiator. The canonical rendering is the "TxnEgo" form
/// `sequence:partition`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl TxnId {
    pub const fn new(sequence: u64, partition: PartitionId) -> Self {
        Self(sequence << PARTITION_BITS | partition.0 as u64 & PARTITION_MASK)
    }

    pub const fn sequence(self) -> u64 {
        self.0 >> PARTITION_BITS
    }

    pub const fn partition_id(self) -> PartitionId {
        PartitionId((self.0 & PARTITION_MASK) as u32)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sequence(), self.partition_id())
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnId({self})")
    }
}

impl nohash_hasher::IsEnabled for TxnId {}

/// Id of a data partition.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl nohash_hasher::IsEnabled for PartitionId {}

/// A host-site id: the address of one execution site on one host, and in
/// particular how partition masters are addressed. Host id in the high half,
/// site id in the low half, rendered `host:site`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HSId(pub u64);

impl HSId {
    pub const fn new(host: u32, site: u32) -> Self {
        Self((host as u64) << 32 | site as u64)
    }

    pub const fn host(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn site(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for HSId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.site())
    }
}

impl fmt::Debug for HSId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HSId({self})")
    }
}

impl nohash_hasher::IsEnabled for HSId {}
