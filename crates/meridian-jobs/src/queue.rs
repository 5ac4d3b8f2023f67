//! Priority tiers and the static queue registry.

use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Built-in priority tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Time-critical work with its own pool.
    RealTime,
    /// Important work sharing the real-time pool.
    High,
    /// Above the default tier.
    AboveNormal,
    /// Default tier.
    Normal,
    /// Background work; may starve under load.
    BelowNormal,
}

impl Priority {
    /// All tiers, highest first.
    pub const ALL: [Priority; 5] = [
        Priority::RealTime,
        Priority::High,
        Priority::AboveNormal,
        Priority::Normal,
        Priority::BelowNormal,
    ];

    /// Tier label used in configuration.
    pub fn label(&self) -> &'static str {
        match self {
            Priority::RealTime => "realtime",
            Priority::High => "high",
            Priority::AboveNormal => "above_normal",
            Priority::Normal => "normal",
            Priority::BelowNormal => "below_normal",
        }
    }

    /// Queue name used by the standard registry.
    pub fn default_queue(&self) -> &'static str {
        match self {
            Priority::RealTime => "a_realtime",
            Priority::High => "b_high",
            Priority::AboveNormal => "c_above_normal",
            Priority::Normal => "default",
            Priority::BelowNormal => "e-below_normal",
        }
    }

    /// Rank used by the standard registry (lower runs first).
    pub fn default_rank(&self) -> u32 {
        *self as u32
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One registered queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    /// Tier label routed to this queue.
    pub tier: String,

    /// Queue name.
    pub name: String,

    /// Ordering rank; lower value = higher priority.
    pub rank: u32,
}

impl QueueDefinition {
    /// Creates a queue definition.
    pub fn new(tier: impl Into<String>, name: impl Into<String>, rank: u32) -> Self {
        Self {
            tier: tier.into(),
            name: name.into(),
            rank,
        }
    }
}

impl From<Priority> for QueueDefinition {
    fn from(priority: Priority) -> Self {
        Self::new(priority.label(), priority.default_queue(), priority.default_rank())
    }
}

/// A tier resolved against the registry at startup.
///
/// Holding a `Tier` means routing cannot fail at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tier {
    label: String,
    queue: String,
}

impl Tier {
    /// Tier label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue the tier routes to.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

/// Static mapping from tier label to queue name and rank.
///
/// Read-only after construction; changing ranks requires a restart.
#[derive(Debug, Clone)]
pub struct QueueRegistry {
    /// Definitions sorted by rank.
    queues: Vec<QueueDefinition>,
    by_tier: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl QueueRegistry {
    /// Builds a registry, rejecting empty, duplicate or blank entries.
    pub fn new(definitions: impl IntoIterator<Item = QueueDefinition>) -> JobResult<Self> {
        let queues: Vec<QueueDefinition> = definitions.into_iter().collect();
        if queues.is_empty() {
            return Err(JobError::Configuration("at least one queue must be registered".to_string()));
        }

        {
            let mut ranks = HashSet::new();
            let mut names = HashSet::new();
            let mut tiers = HashSet::new();
            for def in &queues {
                if def.name.trim().is_empty() || def.tier.trim().is_empty() {
                    return Err(JobError::Configuration(format!(
                        "queue and tier names must not be blank (tier '{}', queue '{}')",
                        def.tier, def.name
                    )));
                }
                if !names.insert(def.name.as_str()) {
                    return Err(JobError::Configuration(format!("duplicate queue name: {}", def.name)));
                }
                if !ranks.insert(def.rank) {
                    return Err(JobError::Configuration(format!(
                        "duplicate queue rank {} (queue {})",
                        def.rank, def.name
                    )));
                }
                if !tiers.insert(def.tier.as_str()) {
                    return Err(JobError::Configuration(format!("duplicate tier label: {}", def.tier)));
                }
            }
        }

        Ok(Self::indexed(queues))
    }

    /// The five built-in tiers with their default queue names.
    pub fn standard() -> Self {
        Self::indexed(Priority::ALL.into_iter().map(QueueDefinition::from).collect())
    }

    fn indexed(mut queues: Vec<QueueDefinition>) -> Self {
        queues.sort_by_key(|def| def.rank);
        let by_tier = queues.iter().enumerate().map(|(i, d)| (d.tier.clone(), i)).collect();
        let by_name = queues.iter().enumerate().map(|(i, d)| (d.name.clone(), i)).collect();

        Self {
            queues,
            by_tier,
            by_name,
        }
    }

    /// Queue name for a tier label.
    pub fn queue_for(&self, tier: &str) -> JobResult<&str> {
        self.by_tier
            .get(tier)
            .map(|&i| self.queues[i].name.as_str())
            .ok_or_else(|| JobError::Configuration(format!("unknown tier: {}", tier)))
    }

    /// Resolves a tier label into a routing handle. Call at startup.
    pub fn tier(&self, label: &str) -> JobResult<Tier> {
        let queue = self.queue_for(label)?.to_string();
        Ok(Tier {
            label: label.to_string(),
            queue,
        })
    }

    /// Resolves one of the built-in tiers.
    pub fn priority(&self, priority: Priority) -> JobResult<Tier> {
        self.tier(priority.label())
    }

    /// Rank of a queue; lower value = higher priority.
    pub fn rank_of(&self, queue: &str) -> Option<u32> {
        self.by_name.get(queue).map(|&i| self.queues[i].rank)
    }

    /// Returns true if the queue is registered.
    pub fn contains(&self, queue: &str) -> bool {
        self.by_name.contains_key(queue)
    }

    /// Sorts queue names highest priority first, rejecting unknown or
    /// repeated names.
    pub fn order_by_rank(&self, queues: &[String]) -> JobResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut ranked = Vec::with_capacity(queues.len());
        for queue in queues {
            let rank = self
                .rank_of(queue)
                .ok_or_else(|| JobError::Configuration(format!("unknown queue: {}", queue)))?;
            if !seen.insert(queue.as_str()) {
                return Err(JobError::Configuration(format!("queue listed twice: {}", queue)));
            }
            ranked.push((rank, queue.clone()));
        }
        ranked.sort_by_key(|(rank, _)| *rank);
        Ok(ranked.into_iter().map(|(_, queue)| queue).collect())
    }

    /// Registered queue names, highest priority first.
    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(|def| def.name.as_str())
    }

    /// Registered definitions, highest priority first.
    pub fn definitions(&self) -> &[QueueDefinition] {
        &self.queues
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Queue name.
    pub queue: String,

    /// Enqueued jobs, eligible now or later.
    pub enqueued: u64,

    /// Jobs currently leased.
    pub leased: u64,

    /// Continuations waiting on their parent.
    pub awaiting_parent: u64,

    /// Completed jobs still retained.
    pub succeeded: u64,

    /// Terminally failed jobs still retained.
    pub failed: u64,
}
