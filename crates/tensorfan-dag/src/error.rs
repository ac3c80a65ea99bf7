use tensorfan_core::IOName;

/// Failures surfaced by the scheduling core.
///
/// Everything here travels up to the driving executor as an explicit value
/// and fails the enclosing request; nothing is retried at this layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    /// A fan-out was requested with an empty subsession name.
    #[error("cannot generate subsessions with an empty name")]
    EmptyName,

    /// The subsession name was already used by an outer fan-out level.
    #[error("subsession '{0}' already spawned a fan-out")]
    DuplicateSubsessionName(String),

    /// A referenced subsession does not exist on this branch.
    #[error("unknown subsession '{0}'")]
    UnknownSubsession(String),

    /// A fan-in was requested with no subsession names.
    #[error("cannot collapse an empty set of subsessions")]
    EmptyCollapseSet,

    /// Fan-in attempted on levels that are not the most recently pushed
    /// contiguous suffix.
    #[error("cannot collapse out of LIFO order, '{innermost}' must collapse first")]
    CollapseOrderViolation { innermost: String },

    /// The input was already delivered to this node.
    #[error("input '{0}' already set")]
    DuplicateInput(IOName),

    /// The same `(input, shard_id)` fragment arrived twice.
    #[error("shard {shard_id} of input '{input}' already stored")]
    DuplicateShard { input: IOName, shard_id: u32 },

    /// A shard id outside `[0, total_shards)`; the executor mislabeled a
    /// branch.
    #[error("shard id {shard_id} out of range for {total_shards} shards")]
    ShardIdOutOfRange { shard_id: u32, total_shards: u32 },

    /// A fragment disagrees with the first-seen fragment for its input in
    /// element type, shape, or byte length.
    #[error("shard {shard_id} of input '{input}' does not match earlier fragments")]
    InconsistentShardDimensions { input: IOName, shard_id: u32 },

    /// Consolidation is a host memcpy; device-memory fragments cannot be
    /// gathered.
    #[error("cannot gather device-memory shard for input '{0}'")]
    DeviceShardNotSupported(IOName),

    /// Demultiplexing removes dim 0 and must leave a batch dim plus payload.
    #[error("tensor rank {rank} too small to demultiplex, need at least 3")]
    WrongRankToDemultiplex { rank: usize },

    /// dim\[0\] disagrees with the statically declared shard count.
    #[error("dim[0] is {actual} but the node declared {declared} shards")]
    WrongShardCountToDemultiplex { declared: u32, actual: usize },

    #[error("dim[0] size {0} exceeds the demultiplex limit")]
    TooManyShards(usize),

    /// Dynamic demultiplexing of an empty result is unsupported.
    #[error("cannot demultiplex a tensor with zero shards")]
    NoShardsToDemultiplex,

    #[error("cannot demultiplex a device-memory tensor")]
    DeviceDemultiplexNotSupported,
}
