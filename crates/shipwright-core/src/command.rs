//! Turning inbound chat text and push payloads into [`Task`]s.

use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    config::Config,
    types::{Action, Task},
};

/// Result of reading a chat message addressed to the bot.
#[derive(Debug)]
pub enum ChatCommand {
    /// A well-formed command to enqueue.
    Task(Task),
    /// Prefix matched but the action is missing or unknown. Answered with usage, never enqueued.
    Usage,
}

/// Parse `<prefix> <action> [args...]`. Returns `None` when the text is not addressed to us.
pub fn parse_chat_command(
    text: &str,
    prefix: &str,
    requester: &str,
    channel: &str,
) -> Option<ChatCommand> {
    let rest = text.trim().strip_prefix(prefix)?;
    // `!dockerfile` is not a command.
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let mut words = rest.split_whitespace();
    let Some(action) = words.next().and_then(Action::parse) else {
        debug!(requester, "unrecognized command: {}", text.trim());
        return Some(ChatCommand::Usage);
    };
    let arguments = words.map(str::to_string).collect();
    Some(ChatCommand::Task(Task::new(
        requester, channel, action, arguments,
    )))
}

#[derive(Debug, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    pub pusher: Pusher,
    pub repository: PushRepository,
    /// Null when the push deleted a branch.
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Deserialize)]
pub struct Pusher {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct PushRepository {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct HeadCommit {
    pub id: String,
}

impl PushEvent {
    /// The build task for this push, or `None` when it should be ignored.
    pub fn into_task(self, config: &Config) -> Option<Task> {
        let repo = self.repository.full_name;
        if !config.is_watched(&repo) {
            info!(repo = %repo, "push for unwatched repository ignored");
            return None;
        }
        let Some(head) = self.head_commit else {
            info!(repo = %repo, git_ref = %self.git_ref, "push without head commit ignored");
            return None;
        };

        let channel = config.channel_for(&repo).to_string();
        Some(
            Task::new(self.pusher.name, channel, Action::Build, vec![repo, head.id])
                .with_run_after_build(config.run_after_push),
        )
    }
}
