//! Capability handlers and their registry wiring.
//!
//! Each handler holds exactly the collaborators it needs; none can send a
//! chat message (the messaging trait is not available here), write
//! conversation state, or make policy decisions.

pub mod announcements;
pub mod chat;
pub mod goals;
pub mod knowledge;
pub mod tasks;
pub mod teachings;

use std::sync::Arc;

use crate::announce::flow::AnnouncementFlow;
use crate::chat::ChatTaskOps;
use crate::knowledge::KnowledgePort;
use crate::llm::LlmPort;
use crate::store::Db;

use super::HandlerRegistry;

/// Collaborators shared by the default handler set.
#[derive(Clone)]
pub struct HandlerDeps {
    pub db: Arc<Db>,
    pub chat_tasks: Arc<dyn ChatTaskOps>,
    pub knowledge: Arc<dyn KnowledgePort>,
    pub llm: Arc<dyn LlmPort>,
    pub announce: Arc<AnnouncementFlow>,
}

/// Build the default handler registry matching [`super::catalog`].
pub fn build_registry(deps: &HandlerDeps) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(
        "task_search",
        Arc::new(tasks::TaskSearchHandler::new(deps.db.clone())),
    );
    registry.register(
        "task_create",
        Arc::new(tasks::TaskCreateHandler::new(
            deps.db.clone(),
            deps.chat_tasks.clone(),
        )),
    );
    registry.register(
        "task_complete",
        Arc::new(tasks::TaskCompleteHandler::new(deps.db.clone())),
    );
    registry.register(
        "announcement_create",
        Arc::new(announcements::AnnouncementCreateHandler::new(
            deps.db.clone(),
            deps.announce.clone(),
        )),
    );
    registry.register(
        "announcement_cancel",
        Arc::new(announcements::AnnouncementCancelHandler::new(
            deps.db.clone(),
            deps.announce.clone(),
        )),
    );
    registry.register(
        "knowledge_query",
        Arc::new(knowledge::KnowledgeQueryHandler::new(
            deps.knowledge.clone(),
            deps.llm.clone(),
        )),
    );
    registry.register("goal_set", Arc::new(goals::GoalSetHandler::new()));
    registry.register(
        "teaching_record",
        Arc::new(teachings::TeachingRecordHandler::new(deps.db.clone())),
    );
    registry.register(
        "general_chat",
        Arc::new(chat::GeneralChatHandler::new(deps.llm.clone())),
    );
    registry
}
