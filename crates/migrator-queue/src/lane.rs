use migrator_core::JobType;

/// The two worker lanes. Full migrations are long and few; syncs are short
/// and frequent. Separate lanes keep a burst of either from starving the
/// other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobLane {
    Migration,
    Sync,
}

impl JobLane {
    pub fn for_job_type(job_type: JobType) -> Self {
        match job_type {
            JobType::Full | JobType::Resume => Self::Migration,
            JobType::Sync => Self::Sync,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::Sync => "sync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "migration" => Some(Self::Migration),
            "sync" => Some(Self::Sync),
            _ => None,
        }
    }
}

/// Per-lane job counts reported by `status`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LaneCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}
