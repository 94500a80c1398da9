//! Line commands typed into the terminal client.

use shared::domain::UserId;

/// A conversation named by its position in `/list` (1-based) or by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationRef {
    Index(usize),
    Id(String),
}

impl ConversationRef {
    fn parse(raw: &str) -> Self {
        match raw.parse::<usize>() {
            Ok(index) if index > 0 => Self::Index(index),
            _ => Self::Id(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Profile {
        name: String,
        avatar: Option<String>,
    },
    Create {
        member_ids: Vec<UserId>,
        name: String,
    },
    Edit {
        conversation: ConversationRef,
        member_ids: Vec<UserId>,
        name: String,
    },
    Delete(ConversationRef),
    Open(ConversationRef),
    Close,
    List,
    Show,
    Whoami,
    Say(String),
    System(String),
    Help,
    Quit,
}

pub const HELP: &str = "\
/profile <name> [avatar-url]       set display name and avatar
/create <id,id,...> [name]         create a conversation
/edit <conv> <id,id,...> [name]    rename / change members
/delete <conv>                     delete a conversation
/open <conv>                       make a conversation active
/close                             clear the active conversation
/list                              list conversations
/show                              print the active conversation
/system <text>                     send a system message
/whoami                            print your id
/quit                              exit
<text>                             send to the active conversation";

fn member_list(raw: &str) -> Vec<UserId> {
    raw.split(',').map(UserId::from).collect()
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Say(line.to_string()));
    };

    let (verb, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    match verb {
        "profile" => {
            let (name, avatar) = match args.rsplit_once(' ') {
                Some((name, avatar)) if avatar.contains("://") => {
                    (name.to_string(), Some(avatar.to_string()))
                }
                _ => (args.to_string(), None),
            };
            Ok(Command::Profile { name, avatar })
        }
        "create" => {
            if args.is_empty() {
                return Err("usage: /create <id,id,...> [name]".to_string());
            }
            let (members, name) = args.split_once(' ').unwrap_or((args, ""));
            Ok(Command::Create {
                member_ids: member_list(members),
                name: name.to_string(),
            })
        }
        "edit" => {
            let mut parts = args.splitn(3, ' ');
            let (Some(conversation), Some(members)) = (parts.next(), parts.next()) else {
                return Err("usage: /edit <conv> <id,id,...> [name]".to_string());
            };
            Ok(Command::Edit {
                conversation: ConversationRef::parse(conversation),
                member_ids: member_list(members),
                name: parts.next().unwrap_or_default().to_string(),
            })
        }
        "delete" | "open" if args.is_empty() => Err(format!("usage: /{verb} <conv>")),
        "delete" => Ok(Command::Delete(ConversationRef::parse(args))),
        "open" => Ok(Command::Open(ConversationRef::parse(args))),
        "close" => Ok(Command::Close),
        "list" => Ok(Command::List),
        "show" => Ok(Command::Show),
        "whoami" => Ok(Command::Whoami),
        "system" => Ok(Command::System(args.to_string())),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command /{other}; try /help")),
    }
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
