use std::{error::Error, fmt};

/// The collective module's result type.
pub type Result<T> = std::result::Result<T, CollectiveErr>;

/// Failures of the group-wide sum-combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveErr {
    /// This worker's buffer length disagrees with the rest of the group.
    LengthMismatch {
        rank: usize,
        got: usize,
        expected: usize,
    },
    /// A worker left the group while others still depended on it.
    PeerLost { alive: usize, world_size: usize },
    /// A previous failure left the group unusable.
    Poisoned,
}

impl fmt::Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveErr::LengthMismatch {
                rank,
                got,
                expected,
            } => write!(
                f,
                "buffer length mismatch at rank {rank}: got {got}, the group expects {expected}"
            ),
            CollectiveErr::PeerLost { alive, world_size } => {
                write!(f, "peer lost: {alive} of {world_size} workers remain")
            }
            CollectiveErr::Poisoned => {
                write!(f, "the group was poisoned by an earlier failure")
            }
        }
    }
}

impl Error for CollectiveErr {}
