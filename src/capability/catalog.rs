//! The default capability catalog.
//!
//! Keyword sets are bilingual: the deployment locale is Japanese corporate
//! chat, with English fallbacks for mixed-language rooms.

use super::{CapabilityDescriptor, KeywordSet, ParamKind, ParameterSpec};
use crate::types::{RiskLevel, RoleLevel};

/// Build the default descriptors.
pub fn default_catalog() -> Vec<CapabilityDescriptor> {
    vec![
        CapabilityDescriptor {
            key: "task_search",
            display_name: "タスク検索",
            description: "List the sender's open tasks across rooms",
            category: "tasks",
            enabled: true,
            required_role_level: RoleLevel::GUEST,
            risk_level: RiskLevel::Low,
            requires_confirmation: false,
            manages_own_confirmation: false,
            priority: 6,
            intent_keywords: KeywordSet::of(
                &[
                    "タスクを教えて",
                    "タスク一覧",
                    "タスク確認",
                    "my tasks",
                    "list tasks",
                ],
                &["タスク", "一覧", "確認", "tasks", "todo"],
                &["作成", "作って", "追加", "create", "add"],
            ),
            decision_keywords: KeywordSet::of(
                &["タスク", "tasks"],
                &["教えて", "一覧", "確認", "list", "show"],
                &["作成", "作って", "create"],
            ),
            parameters: vec![ParameterSpec {
                name: "scope",
                kind: ParamKind::Text,
                required: false,
            }],
            handler_key: "task_search",
            chain_hints: vec!["期限が近いタスクにリマインダーを設定しますか？"],
        },
        CapabilityDescriptor {
            key: "task_create",
            display_name: "タスク作成",
            description: "Create a task for a person with an optional deadline",
            category: "tasks",
            enabled: true,
            required_role_level: RoleLevel::MEMBER,
            risk_level: RiskLevel::Medium,
            requires_confirmation: false,
            manages_own_confirmation: false,
            priority: 6,
            intent_keywords: KeywordSet::of(
                &[
                    "タスクを作成",
                    "タスクを作って",
                    "タスクをお願い",
                    "create a task",
                    "assign a task",
                ],
                &["タスク", "お願い", "依頼", "までに", "task", "deadline"],
                &["一覧", "教えて", "list", "show"],
            ),
            decision_keywords: KeywordSet::of(
                &["作成", "作って", "お願い", "create", "assign"],
                &["タスク", "期限", "までに", "task", "by"],
                &["一覧", "list"],
            ),
            parameters: vec![
                ParameterSpec {
                    name: "assignee",
                    kind: ParamKind::Text,
                    required: true,
                },
                ParameterSpec {
                    name: "body",
                    kind: ParamKind::Text,
                    required: true,
                },
                ParameterSpec {
                    name: "deadline",
                    kind: ParamKind::Date,
                    required: false,
                },
            ],
            handler_key: "task_create",
            chain_hints: vec!["リマインダーも設定しますか？", "他の方にも同じタスクを作成しますか？"],
        },
        CapabilityDescriptor {
            key: "task_complete",
            display_name: "タスク完了",
            description: "Mark one of the sender's tasks as done",
            category: "tasks",
            enabled: true,
            required_role_level: RoleLevel::MEMBER,
            risk_level: RiskLevel::Medium,
            requires_confirmation: false,
            manages_own_confirmation: false,
            priority: 5,
            intent_keywords: KeywordSet::of(
                &["完了にして", "終わった", "完了した", "mark done", "finished"],
                &["完了", "done", "済み"],
                &["作成", "一覧", "create", "list"],
            ),
            decision_keywords: KeywordSet::of(
                &["完了", "done", "終わった"],
                &["タスク", "task"],
                &[],
            ),
            // Optional: "mark done" with no object falls back to the most
            // recently discussed task inside the handler.
            parameters: vec![ParameterSpec {
                name: "task",
                kind: ParamKind::Text,
                required: false,
            }],
            handler_key: "task_complete",
            chain_hints: vec!["残りのタスクを確認しますか？"],
        },
        CapabilityDescriptor {
            key: "announcement_create",
            display_name: "アナウンス配信",
            description: "Schedule an announcement to a room, optionally with tasks",
            category: "announcements",
            enabled: true,
            required_role_level: RoleLevel::LEAD,
            risk_level: RiskLevel::High,
            requires_confirmation: true,
            manages_own_confirmation: true,
            priority: 7,
            intent_keywords: KeywordSet::of(
                &[
                    "アナウンスして",
                    "告知して",
                    "周知して",
                    "連絡して",
                    "announce",
                    "broadcast",
                ],
                &["アナウンス", "告知", "周知", "全員に", "みんなに", "everyone"],
                &["キャンセル", "中止", "cancel"],
            ),
            decision_keywords: KeywordSet::of(
                &["アナウンス", "告知", "周知", "announce"],
                &["全員", "配信", "連絡", "room", "everyone"],
                &["キャンセル", "cancel"],
            ),
            parameters: vec![
                ParameterSpec {
                    name: "message",
                    kind: ParamKind::Text,
                    required: true,
                },
                ParameterSpec {
                    name: "room",
                    kind: ParamKind::Text,
                    required: false,
                },
                ParameterSpec {
                    name: "create_tasks",
                    kind: ParamKind::Boolean,
                    required: false,
                },
                ParameterSpec {
                    name: "task_deadline",
                    kind: ParamKind::Date,
                    required: false,
                },
                ParameterSpec {
                    name: "schedule_at",
                    kind: ParamKind::Date,
                    required: false,
                },
                ParameterSpec {
                    name: "cron",
                    kind: ParamKind::Text,
                    required: false,
                },
            ],
            handler_key: "announcement_create",
            chain_hints: vec!["毎週の定期配信にしますか？"],
        },
        CapabilityDescriptor {
            key: "announcement_cancel",
            display_name: "アナウンス取消",
            description: "Cancel a pending or scheduled announcement",
            category: "announcements",
            enabled: true,
            required_role_level: RoleLevel::LEAD,
            risk_level: RiskLevel::High,
            requires_confirmation: true,
            manages_own_confirmation: false,
            priority: 6,
            intent_keywords: KeywordSet::of(
                &["アナウンスをキャンセル", "配信を中止", "cancel the announcement"],
                &["キャンセル", "中止", "取消", "cancel"],
                &["作成", "して", "announce"],
            ),
            decision_keywords: KeywordSet::of(
                &["キャンセル", "中止", "cancel"],
                &["アナウンス", "配信", "announcement"],
                &[],
            ),
            parameters: vec![ParameterSpec {
                name: "announcement",
                kind: ParamKind::Text,
                required: false,
            }],
            handler_key: "announcement_cancel",
            chain_hints: vec![],
        },
        CapabilityDescriptor {
            key: "knowledge_query",
            display_name: "ナレッジ検索",
            description: "Answer from the tenant's knowledge base",
            category: "knowledge",
            enabled: true,
            required_role_level: RoleLevel::GUEST,
            risk_level: RiskLevel::Low,
            requires_confirmation: false,
            manages_own_confirmation: false,
            priority: 5,
            intent_keywords: KeywordSet::of(
                &["教えてください", "どうすれば", "やり方", "手順", "how do i", "what is"],
                &["教えて", "方法", "ルール", "規定", "how", "policy"],
                &["タスク", "アナウンス", "task", "announce"],
            ),
            decision_keywords: KeywordSet::of(
                &["教えて", "方法", "手順", "how", "what"],
                &["ルール", "規定", "policy"],
                &[],
            ),
            parameters: vec![ParameterSpec {
                name: "query",
                kind: ParamKind::Text,
                required: true,
            }],
            handler_key: "knowledge_query",
            chain_hints: vec!["関連する資料も探しますか？"],
        },
        CapabilityDescriptor {
            key: "goal_set",
            display_name: "目標設定",
            description: "Guide the sender through capturing a goal",
            category: "goals",
            enabled: true,
            required_role_level: RoleLevel::MEMBER,
            risk_level: RiskLevel::Low,
            requires_confirmation: false,
            manages_own_confirmation: false,
            priority: 5,
            intent_keywords: KeywordSet::of(
                &["目標を設定", "目標を立てたい", "set a goal", "new goal"],
                &["目標", "ゴール", "goal"],
                &["一覧", "確認", "list"],
            ),
            decision_keywords: KeywordSet::of(
                &["目標", "goal"],
                &["設定", "立てたい", "set"],
                &[],
            ),
            parameters: vec![ParameterSpec {
                name: "title",
                kind: ParamKind::Text,
                required: false,
            }],
            handler_key: "goal_set",
            chain_hints: vec!["週次で進捗を確認しましょうか？"],
        },
        CapabilityDescriptor {
            key: "teaching_record",
            display_name: "ティーチング記録",
            description: "Record a leadership value statement",
            category: "teachings",
            enabled: true,
            required_role_level: RoleLevel::PRINCIPAL,
            risk_level: RiskLevel::Medium,
            requires_confirmation: true,
            manages_own_confirmation: false,
            priority: 8,
            intent_keywords: KeywordSet::of(
                &["方針として覚えて", "価値観として記録", "remember this as policy"],
                &["方針", "価値観", "覚えて", "記録", "policy"],
                &[],
            ),
            decision_keywords: KeywordSet::of(
                &["方針", "価値観", "policy"],
                &["覚えて", "記録", "remember"],
                &[],
            ),
            parameters: vec![ParameterSpec {
                name: "statement",
                kind: ParamKind::Text,
                required: true,
            }],
            handler_key: "teaching_record",
            chain_hints: vec![],
        },
        CapabilityDescriptor {
            key: "general_chat",
            display_name: "応答",
            description: "Conversational reply when no operation applies",
            category: "chat",
            enabled: true,
            required_role_level: RoleLevel::GUEST,
            risk_level: RiskLevel::Low,
            requires_confirmation: false,
            manages_own_confirmation: false,
            priority: 1,
            intent_keywords: KeywordSet::of(
                &["こんにちは", "ありがとう", "hello", "thanks"],
                &["おはよう", "お疲れ", "hi"],
                &[],
            ),
            decision_keywords: KeywordSet::of(&["こんにちは", "hello"], &["ありがとう", "thanks"], &[]),
            parameters: vec![ParameterSpec {
                name: "text",
                kind: ParamKind::Text,
                required: false,
            }],
            handler_key: "general_chat",
            chain_hints: vec![],
        },
    ]
}
