use std::fmt;

/// Integer identity of a process within the fixed topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rank(pub u32);

impl fmt::Display for Rank {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "rank{}", self.0)
    }
}

/// Rank that assembles frames. Every other rank is a worker.
pub const COORDINATOR_RANK: Rank = Rank(0);

/// Position of a worker among the workers only, `rank - 1`.
///
/// The coordinator never renders in a distributed frame, so it takes no
/// slot in the round-robin modulo space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerIndex(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
    Empty,
    RankOutOfRange { rank: Rank, size: u32 },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::Empty => write!(formatter, "topology must contain at least one process"),
            TopologyError::RankOutOfRange { rank, size } => {
                write!(formatter, "{rank} is outside a topology of {size} processes")
            }
        }
    }
}

impl std::error::Error for TopologyError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessTopology {
    rank: Rank,
    size: u32,
}

impl ProcessTopology {
    pub fn new(rank: Rank, size: u32) -> Result<Self, TopologyError> {
        if size == 0 {
            return Err(TopologyError::Empty);
        }
        if rank.0 >= size {
            return Err(TopologyError::RankOutOfRange { rank, size });
        }
        Ok(Self { rank, size })
    }

    pub fn self_rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == COORDINATOR_RANK
    }

    pub fn coordinator(&self) -> Rank {
        COORDINATOR_RANK
    }

    pub fn worker_count(&self) -> u32 {
        self.size - 1
    }

    pub fn worker_index(&self) -> Option<WorkerIndex> {
        if self.is_coordinator() {
            None
        } else {
            Some(WorkerIndex(self.rank.0 - 1))
        }
    }

    /// Panics if `worker` is not below `worker_count()`.
    pub fn worker_rank(&self, worker: WorkerIndex) -> Rank {
        assert!(
            worker.0 < self.worker_count(),
            "worker index {} outside {} workers",
            worker.0,
            self.worker_count()
        );
        Rank(worker.0 + 1)
    }

    pub fn worker_ranks(&self) -> impl Iterator<Item = Rank> {
        (1..self.size).map(Rank)
    }
}
