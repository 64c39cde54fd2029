//! Slash command surface exposed by front ends.
//!
//! The parser is a pure function so the control plane, the MCP front end,
//! and tests all resolve commands identically. A leading `/<repo-name>`
//! segment targets an explicit repo; without it, commands resolve against
//! the workspace's active repo pointer.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum SlashCommand {
    NewSession { title: Option<String> },
    FollowUp { message: String },
    Summary,
    Run { script: String },
    Commit { message: String },
    Pr { title: Option<String> },
    Attach { pr_number: u64 },
    Diff,
    GitStatus,
    SetActiveRepo { repo_name: String },
}

/// A parsed command plus its repo targeting.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedCommand {
    /// Explicit `/<repo-name>` prefix, if any. `None` means the caller
    /// should resolve against `active_workspace_repo_id`.
    pub repo: Option<String>,
    pub command: SlashCommand,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CommandParseError {
    #[error("input is not a slash command")]
    NotACommand,
    #[error("unknown command '/{0}'")]
    Unknown(String),
    #[error("'/{0}' requires an argument")]
    MissingArgument(&'static str),
}

/// Parse a raw input line. `repo_names` is the set of repos attached to the
/// workspace, used to recognize a `/<repo-name>` targeting prefix.
pub fn parse(input: &str, repo_names: &[&str]) -> Result<ParsedCommand, CommandParseError> {
    let input = input.trim();
    let stripped = input.strip_prefix('/').ok_or(CommandParseError::NotACommand)?;
    let (head, rest) = split_word(stripped);

    // `/<repo-name> /commit msg` and `/<repo-name> commit msg` both target
    // the named repo explicitly.
    if repo_names.contains(&head) {
        let rest = rest.trim().trim_start_matches('/');
        let (sub, args) = split_word(rest);
        return Ok(ParsedCommand {
            repo: Some(head.to_string()),
            command: parse_verb(sub, args)?,
        });
    }

    Ok(ParsedCommand {
        repo: None,
        command: parse_verb(head, rest)?,
    })
}

fn parse_verb(verb: &str, args: &str) -> Result<SlashCommand, CommandParseError> {
    let args = args.trim();
    let opt = |s: &str| {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    };
    match verb {
        "new-session" => Ok(SlashCommand::NewSession { title: opt(args) }),
        "follow-up" => {
            if args.is_empty() {
                Err(CommandParseError::MissingArgument("follow-up"))
            } else {
                Ok(SlashCommand::FollowUp {
                    message: args.to_string(),
                })
            }
        }
        "summary" => Ok(SlashCommand::Summary),
        "run" => {
            if args.is_empty() {
                Err(CommandParseError::MissingArgument("run"))
            } else {
                Ok(SlashCommand::Run {
                    script: args.to_string(),
                })
            }
        }
        "commit" => {
            if args.is_empty() {
                Err(CommandParseError::MissingArgument("commit"))
            } else {
                Ok(SlashCommand::Commit {
                    message: args.to_string(),
                })
            }
        }
        "pr" => Ok(SlashCommand::Pr { title: opt(args) }),
        "attach" => args
            .parse::<u64>()
            .map(|pr_number| SlashCommand::Attach { pr_number })
            .map_err(|_| CommandParseError::MissingArgument("attach")),
        "diff" => Ok(SlashCommand::Diff),
        "git-status" => Ok(SlashCommand::GitStatus),
        "set-active-repo" => {
            if args.is_empty() {
                Err(CommandParseError::MissingArgument("set-active-repo"))
            } else {
                Ok(SlashCommand::SetActiveRepo {
                    repo_name: args.to_string(),
                })
            }
        }
        other => Err(CommandParseError::Unknown(other.to_string())),
    }
}

fn split_word(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    }
}
