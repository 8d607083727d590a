//! `devassist history`: list, print or clear stored conversations.

use devassist_core::history::{HistoryStore, rebuild_chat};
use devassist_core::message::{ChatMessage, ConversationId};

pub async fn run(conversation: Option<String>, clear: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    let store = super::history_store(&config);

    match conversation {
        Some(id) if clear => {
            let removed = store.clear(&ConversationId::from(&id)).await?;
            if removed {
                println!("  Deleted conversation {id}");
            } else {
                println!("  No conversation {id}");
            }
        }
        Some(id) => print_conversation(store.as_ref(), &ConversationId::from(&id)).await?,
        None => list(store.as_ref()).await?,
    }
    Ok(())
}

async fn list(store: &dyn HistoryStore) -> Result<(), Box<dyn std::error::Error>> {
    let ids = store.conversations().await?;
    if ids.is_empty() {
        println!("  No stored conversations.");
        return Ok(());
    }
    for id in ids {
        let items = store.read_all(&id).await?;
        let first = rebuild_chat(&items)
            .into_iter()
            .find_map(|message| match message {
                ChatMessage::User { text, .. } => Some(text),
                ChatMessage::Model { .. } => None,
            })
            .unwrap_or_default();
        let started = items
            .first()
            .map(|item| item.timestamp.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("  {id}  {started}  {} messages  {}", items.len(), preview(&first, 50));
    }
    Ok(())
}

async fn print_conversation(
    store: &dyn HistoryStore,
    id: &ConversationId,
) -> Result<(), Box<dyn std::error::Error>> {
    let chat = rebuild_chat(&store.read_all(id).await?);
    if chat.is_empty() {
        println!("  No conversation {id}");
        return Ok(());
    }
    for message in chat {
        for line in render(&message) {
            println!("  {line}");
        }
        println!();
    }
    Ok(())
}

/// Terminal lines for one chat message.
fn render(message: &ChatMessage) -> Vec<String> {
    match message {
        ChatMessage::User { text, .. } => text.lines().map(|l| format!("You > {l}")).collect(),
        ChatMessage::Model {
            answer,
            steps,
            error,
            ..
        } => {
            let mut lines: Vec<String> = steps
                .iter()
                .map(|step| format!("· {} {}", step.title, step.action))
                .collect();
            if let Some(answer) = answer {
                lines.extend(answer.lines().map(|l| format!("Assistant > {l}")));
            }
            if let Some(kind) = error {
                lines.push(format!("[Error] {kind}"));
            }
            lines
        }
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let cut: String = line.chars().take(max_chars).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use devassist_core::message::{ErrorKind, Step};

    #[test]
    fn renders_steps_before_answer() {
        let step = Step {
            title: "Investigating network request".into(),
            action: r#"getEventByKey({"eventKey":"r-2"})"#.into(),
            output: None,
            canceled: false,
        };
        let lines = render(&ChatMessage::answer("It blocks rendering.", vec![step], vec![]));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("· Investigating network request"));
        assert_eq!(lines[1], "Assistant > It blocks rendering.");
    }

    #[test]
    fn renders_failures() {
        let lines = render(&ChatMessage::failure(ErrorKind::Block, vec![]));
        assert_eq!(lines, vec!["[Error] BLOCK"]);
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("ééééé", 3), "ééé...");
        assert_eq!(preview("first\nsecond", 10), "first");
    }
}
