//! Memory layer: assemble the request-scoped context snapshot.
//!
//! `load` fans out concurrently to the stores, each sub-fetch bounded by
//! its own deadline. A timed-out or failed sub-fetch is non-fatal: the
//! Brain proceeds with a partial context and the decision log carries a
//! `partial_memory` warning.

use std::fmt::Write as _;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tracing::warn;

use crate::knowledge::KnowledgeChunk;
use crate::store::conversation::Turn;
use crate::store::people::Person;
use crate::store::teachings::Teaching;
use crate::store::workitems::{Goal, Insight, TaskItem};
use crate::store::{StoreError, TenantDb};
use crate::types::SenderIdentity;

/// Bound on recent turns included in context.
const TURNS_LIMIT: u32 = 10;
/// Bound on name-matched persons.
const PERSONS_LIMIT: u32 = 5;
/// Bound on open tasks.
const TASKS_LIMIT: u32 = 20;
/// Bound on active goals.
const GOALS_LIMIT: u32 = 10;
/// Bound on teachings.
const TEACHINGS_LIMIT: u32 = 5;
/// Bound on insights, and their minimum priority.
const INSIGHTS_LIMIT: u32 = 5;
const INSIGHTS_MIN_PRIORITY: i64 = 7;

/// Warning label recorded when any sub-fetch fails or times out.
pub const WARN_PARTIAL_MEMORY: &str = "partial_memory";

/// Read-only context snapshot for one request.
///
/// Owned by the request task; lives only for that request. Knowledge
/// chunks start empty and are filled lazily by Decision or a handler.
#[derive(Debug, Clone)]
pub struct MemoryContext {
    pub sender: SenderIdentity,
    pub recent_turns: Vec<Turn>,
    pub summary: Option<String>,
    pub preferences: Option<Value>,
    pub persons: Vec<Person>,
    pub tasks: Vec<TaskItem>,
    pub goals: Vec<Goal>,
    pub teachings: Vec<Teaching>,
    pub insights: Vec<Insight>,
    pub knowledge: Vec<KnowledgeChunk>,
    pub warnings: Vec<&'static str>,
}

impl MemoryContext {
    /// An empty context for a sender (tests, degraded paths).
    pub fn empty(sender: SenderIdentity) -> Self {
        Self {
            sender,
            recent_turns: Vec::new(),
            summary: None,
            preferences: None,
            persons: Vec::new(),
            tasks: Vec::new(),
            goals: Vec::new(),
            teachings: Vec::new(),
            insights: Vec::new(),
            knowledge: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Compact textual rendering for LLM prompts. Bounded: only the last
    /// few turns and the leading items of each list are included.
    pub fn render_compact(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "sender: {} (role level {})",
            self.sender.display_name, self.sender.role_level
        );
        if let Some(summary) = &self.summary {
            let _ = writeln!(out, "summary: {summary}");
        }
        for turn in self.recent_turns.iter().rev().take(5).rev() {
            let excerpt: String = turn.content.chars().take(120).collect();
            let _ = writeln!(out, "{}: {excerpt}", turn.role);
        }
        if !self.tasks.is_empty() {
            let _ = writeln!(out, "open tasks:");
            for task in self.tasks.iter().take(5) {
                let excerpt: String = task.body.chars().take(60).collect();
                let _ = writeln!(out, "- {excerpt}");
            }
        }
        if !self.goals.is_empty() {
            let _ = writeln!(out, "active goals:");
            for goal in self.goals.iter().take(3) {
                let _ = writeln!(out, "- {}", goal.title);
            }
        }
        if !self.persons.is_empty() {
            let names: Vec<&str> = self.persons.iter().map(|p| p.name.as_str()).collect();
            let _ = writeln!(out, "mentioned persons: {}", names.join(", "));
        }
        for teaching in &self.teachings {
            let _ = writeln!(out, "principle[{}]: {}", teaching.category, teaching.statement);
        }
        out
    }

    /// The last task mentioned in recent context, if any (ellipsis
    /// resolution support).
    pub fn most_recent_task(&self) -> Option<&TaskItem> {
        self.tasks.first()
    }
}

/// Deadlines governing the fan-out.
#[derive(Debug, Clone, Copy)]
pub struct MemoryDeadlines {
    pub per_fetch: Duration,
    pub aggregate: Duration,
}

impl Default for MemoryDeadlines {
    fn default() -> Self {
        Self {
            per_fetch: Duration::from_secs(2),
            aggregate: Duration::from_secs(3),
        }
    }
}

/// Collapse a bounded sub-fetch into its value or a default-plus-warning.
fn settle<T>(
    source: &'static str,
    outcome: Result<Result<T, StoreError>, tokio::time::error::Elapsed>,
    default: T,
    degraded: &mut bool,
) -> T {
    match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            warn!(source, error = %err, "memory sub-fetch failed");
            *degraded = true;
            default
        }
        Err(_) => {
            warn!(source, "memory sub-fetch timed out");
            *degraded = true;
            default
        }
    }
}

/// Load the unified context for a request.
///
/// Every sub-fetch is tenant-scoped through `db` and individually
/// cancellable; the per-fetch deadline keeps the whole fan-out inside the
/// aggregate budget.
pub async fn load(
    db: &TenantDb,
    sender: &SenderIdentity,
    room_id: &str,
    message: &str,
    deadlines: MemoryDeadlines,
) -> MemoryContext {
    let d = deadlines.per_fetch.min(deadlines.aggregate);
    let user_id = sender.user_id;

    let (turns, summary, preferences, persons, tasks, goals, teachings, insights) = tokio::join!(
        timeout(d, db.recent_turns(room_id, user_id, TURNS_LIMIT)),
        timeout(d, db.rolling_summary(room_id, user_id)),
        timeout(d, db.preferences_for(user_id)),
        timeout(d, db.persons_mentioned_in(message, PERSONS_LIMIT)),
        timeout(d, db.open_tasks_for(user_id, TASKS_LIMIT)),
        timeout(d, db.active_goals_for(user_id, GOALS_LIMIT)),
        timeout(d, db.relevant_teachings(message, TEACHINGS_LIMIT)),
        timeout(d, db.recent_insights(INSIGHTS_MIN_PRIORITY, INSIGHTS_LIMIT)),
    );

    let mut degraded = false;
    let context = MemoryContext {
        sender: sender.clone(),
        recent_turns: settle("turns", turns, Vec::new(), &mut degraded),
        summary: settle("summary", summary, None, &mut degraded),
        preferences: settle("preferences", preferences, None, &mut degraded),
        persons: settle("persons", persons, Vec::new(), &mut degraded),
        tasks: settle("tasks", tasks, Vec::new(), &mut degraded),
        goals: settle("goals", goals, Vec::new(), &mut degraded),
        teachings: settle("teachings", teachings, Vec::new(), &mut degraded),
        insights: settle("insights", insights, Vec::new(), &mut degraded),
        knowledge: Vec::new(),
        warnings: Vec::new(),
    };

    if degraded {
        let mut context = context;
        context.warnings.push(WARN_PARTIAL_MEMORY);
        return context;
    }
    context
}
