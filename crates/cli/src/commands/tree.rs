use clap::Subcommand;
use loomweave_config::AppConfig;
use loomweave_core::{Direction, Role};
use loomweave_storage::{
    Conversation, ConversationService, FileConversationStore, FileVariableStore, NewConversation,
};
use std::fmt::Write as _;
use std::sync::Arc;

use super::{CmdResult, load_config, parse_name};

#[derive(Debug, Subcommand)]
pub enum TreeCommand {
    /// List conversations, most recently updated first
    List,

    /// Print the active path with branch positions
    Show { id: String },

    /// Create a conversation
    New {
        /// Generated when omitted
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value = "")]
        title: String,
        /// Root system prompt
        #[arg(long, default_value = "")]
        system: String,
        /// Opening assistant message
        #[arg(long)]
        greeting: Option<String>,
        #[arg(long)]
        character: Option<String>,
    },

    /// Append a message under the active tail (or --parent)
    Append {
        id: String,
        /// system | user | assistant | thinking
        #[arg(value_parser = parse_name::<Role>)]
        role: Role,
        content: String,
        #[arg(long)]
        parent: Option<String>,
    },

    /// Move to the previous or next sibling at a depth (root = 1)
    Switch {
        id: String,
        depth: usize,
        /// left | right
        #[arg(value_parser = parse_name::<Direction>)]
        direction: Direction,
    },

    /// Start a fresh assistant branch for a user message
    Retry { id: String, node_id: String },

    /// Delete a node and its descendants
    DeleteBranch { id: String, node_id: String },

    /// Keep only the first `depth` nodes of the active path
    Truncate { id: String, depth: usize },

    /// Delete a whole conversation
    Delete { id: String },
}

pub async fn run(command: TreeCommand) -> CmdResult {
    let config = load_config()?;
    let service = file_service(&config);
    let output = execute(&service, command).await?;
    print!("{output}");
    Ok(())
}

fn file_service(config: &AppConfig) -> ConversationService {
    ConversationService::new(
        Arc::new(FileConversationStore::new(config.storage.conversations_dir())),
        Arc::new(FileVariableStore::new(config.storage.variables_dir())),
    )
}

/// Run one tree command and render what it did.
pub async fn execute(service: &ConversationService, command: TreeCommand) -> CmdResult<String> {
    let mut out = String::new();
    match command {
        TreeCommand::List => {
            let mut summaries = service.list().await?;
            summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            if summaries.is_empty() {
                writeln!(out, "No conversations yet.")?;
            }
            for s in summaries {
                let updated = s.updated_at.with_timezone(&chrono::Local);
                writeln!(
                    out,
                    "{:<24} {:<24} {:>4} nodes  depth {:<3} {}",
                    s.id,
                    s.title,
                    s.node_count,
                    s.depth,
                    updated.format("%Y-%m-%d %H:%M")
                )?;
            }
        }
        TreeCommand::Show { id } => {
            let conversation = service.get(&id).await?;
            render_path(&mut out, &conversation)?;
        }
        TreeCommand::New {
            id,
            title,
            system,
            greeting,
            character,
        } => {
            let conversation = service
                .create(NewConversation {
                    id,
                    title,
                    system_prompt: system,
                    greeting,
                    character,
                })
                .await?;
            writeln!(out, "✅ Created {}", conversation.id)?;
        }
        TreeCommand::Append {
            id,
            role,
            content,
            parent,
        } => {
            let (_, node_id) = service
                .append(&id, parent.as_deref(), role, &content)
                .await?;
            writeln!(out, "{node_id}")?;
        }
        TreeCommand::Switch {
            id,
            depth,
            direction,
        } => match service.switch_branch(&id, depth, direction).await? {
            (conversation, Some(_)) => render_path(&mut out, &conversation)?,
            (_, None) => writeln!(out, "No sibling in that direction at depth {depth}.")?,
        },
        TreeCommand::Retry { id, node_id } => match service.retry(&id, &node_id).await? {
            (_, Some(outcome)) => writeln!(out, "{}", outcome.node_id())?,
            (_, None) => return Err(format!("{node_id} is not a user message in {id}").into()),
        },
        TreeCommand::DeleteBranch { id, node_id } => {
            let (_, outcome) = service.delete_branch(&id, &node_id).await?;
            if !outcome.deleted {
                return Err(format!("Cannot delete {node_id}").into());
            }
            writeln!(out, "🗑️  Deleted {node_id}")?;
            if let Some(selected) = outcome.selected {
                writeln!(out, "   Selected {selected}")?;
            }
            if let Some(placeholder) = outcome.placeholder {
                writeln!(out, "   Empty reply slot {placeholder}")?;
            }
        }
        TreeCommand::Truncate { id, depth } => {
            let (conversation, changed) = service.truncate_after(&id, depth).await?;
            if !changed {
                writeln!(out, "Nothing after depth {depth}.")?;
            }
            render_path(&mut out, &conversation)?;
        }
        TreeCommand::Delete { id } => {
            if !service.delete(&id).await? {
                return Err(format!("No conversation named {id}").into());
            }
            writeln!(out, "🗑️  Deleted {id}")?;
        }
    }
    Ok(out)
}

fn render_path(out: &mut String, conversation: &Conversation) -> std::fmt::Result {
    writeln!(out, "{} {}", conversation.id, conversation.title)?;
    for indicator in conversation.tree.branch_table() {
        let content = conversation
            .tree
            .node(&indicator.node_id)
            .map(|n| n.content.as_str())
            .unwrap_or_default();
        let position = if indicator.count > 1 {
            format!("‹{}/{}›", indicator.index, indicator.count)
        } else {
            String::new()
        };
        writeln!(
            out,
            "{:>3}. {:<10} {:<7} {}  {}",
            indicator.depth,
            indicator.role.as_str(),
            position,
            indicator.node_id,
            preview(content)
        )?;
    }
    Ok(())
}

fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default();
    if line.chars().count() > 60 || content.contains('\n') {
        let short: String = line.chars().take(60).collect();
        format!("{short}…")
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomweave_storage::{InMemoryConversationStore, InMemoryVariableStore};

    fn service() -> ConversationService {
        ConversationService::new(
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(InMemoryVariableStore::new()),
        )
    }

    async fn new_conversation(service: &ConversationService) {
        execute(
            service,
            TreeCommand::New {
                id: Some("c1".into()),
                title: "Tavern".into(),
                system: "Be terse.".into(),
                greeting: Some("Hello.".into()),
                character: None,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn new_append_show() {
        let svc = service();
        new_conversation(&svc).await;
        let node = execute(
            &svc,
            TreeCommand::Append {
                id: "c1".into(),
                role: Role::User,
                content: "Any rooms?".into(),
                parent: None,
            },
        )
        .await
        .unwrap();
        let node = node.trim();

        let shown = execute(&svc, TreeCommand::Show { id: "c1".into() })
            .await
            .unwrap();
        let lines: Vec<_> = shown.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains("system"));
        assert!(lines[3].contains(node));
        assert!(lines[3].contains("Any rooms?"));
    }

    #[tokio::test]
    async fn retry_then_switch_back() {
        let svc = service();
        new_conversation(&svc).await;
        let conv = svc.get("c1").await.unwrap();
        let greeting = conv.tree.active_tail().to_string();
        let (_, user) = svc.append("c1", None, Role::User, "Hi").await.unwrap();
        svc.append("c1", None, Role::Assistant, "First reply").await.unwrap();

        let retried = execute(
            &svc,
            TreeCommand::Retry {
                id: "c1".into(),
                node_id: user.clone(),
            },
        )
        .await
        .unwrap();
        let shown = execute(&svc, TreeCommand::Show { id: "c1".into() })
            .await
            .unwrap();
        assert!(shown.contains("‹2/2›"));
        assert!(shown.contains(retried.trim()));

        let switched = execute(
            &svc,
            TreeCommand::Switch {
                id: "c1".into(),
                depth: 4,
                direction: Direction::Left,
            },
        )
        .await
        .unwrap();
        assert!(switched.contains("‹1/2›"));
        assert!(switched.contains("First reply"));

        let nowhere = execute(
            &svc,
            TreeCommand::Switch {
                id: "c1".into(),
                depth: 2,
                direction: Direction::Left,
            },
        )
        .await
        .unwrap();
        assert!(nowhere.starts_with("No sibling"));

        let err = execute(
            &svc,
            TreeCommand::Retry {
                id: "c1".into(),
                node_id: greeting,
            },
        )
        .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn truncate_and_delete() {
        let svc = service();
        new_conversation(&svc).await;
        svc.append("c1", None, Role::User, "Hi").await.unwrap();

        let truncated = execute(
            &svc,
            TreeCommand::Truncate {
                id: "c1".into(),
                depth: 2,
            },
        )
        .await
        .unwrap();
        assert!(!truncated.contains("Hi"));
        assert!(truncated.contains("Hello."));

        let listed = execute(&svc, TreeCommand::List).await.unwrap();
        assert!(listed.starts_with("c1"));

        execute(&svc, TreeCommand::Delete { id: "c1".into() })
            .await
            .unwrap();
        assert!(execute(&svc, TreeCommand::Delete { id: "c1".into() }).await.is_err());
        let listed = execute(&svc, TreeCommand::List).await.unwrap();
        assert_eq!(listed.trim(), "No conversations yet.");
    }

    #[test]
    fn preview_shortens_long_content() {
        assert_eq!(preview("short"), "short");
        assert_eq!(preview("two\nlines"), "two…");
        assert_eq!(preview(&"x".repeat(80)).chars().count(), 61);
    }
}
