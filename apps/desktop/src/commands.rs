use std::path::PathBuf;

use client_core::{MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Login { username: String, password: String },
    To { peer: UserId, text: String },
    /// `None` selects the broadcast thread.
    Select(Option<UserId>),
    Delete(MessageId),
    Attach { path: PathBuf, caption: String },
    Avatar(PathBuf),
    Password { old: String, new: String },
    Read,
    Who,
    Users,
    Peers,
    History,
    Logout,
    Quit,
    Help,
}

pub const HELP: &str = "\
/login <user> <password>   sign in
/to <user> <text>          private message
/select <user>|all         switch thread
/history                   show the current thread
/delete <message-id>       delete a message
/attach <path> [caption]   send a file to the current thread
/avatar <path>             change profile picture
/password <old> <new>      change password
/read                      mark the current thread read
/who                       online users
/users                     all registered users
/peers                     private-chat partners
/logout                    forget credentials and disconnect
/quit                      exit
anything else              message the current thread";

pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Say(line.to_string()));
    };
    let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let args = args.trim();

    match name {
        "login" => {
            let (username, password) = two_args(args, "/login <user> <password>")?;
            Ok(Command::Login { username, password })
        }
        "to" => {
            let (peer, text) = args
                .split_once(char::is_whitespace)
                .ok_or("usage: /to <user> <text>")?;
            Ok(Command::To {
                peer: UserId::from(peer),
                text: text.trim().to_string(),
            })
        }
        "select" => match args {
            "" => Err("usage: /select <user>|all".into()),
            "all" | "broadcast" => Ok(Command::Select(None)),
            peer => Ok(Command::Select(Some(UserId::from(peer)))),
        },
        "delete" if !args.is_empty() => Ok(Command::Delete(MessageId::from(args))),
        "attach" if !args.is_empty() => {
            let (path, caption) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
            Ok(Command::Attach {
                path: PathBuf::from(path),
                caption: caption.trim().to_string(),
            })
        }
        "avatar" if !args.is_empty() => Ok(Command::Avatar(PathBuf::from(args))),
        "password" => {
            let (old, new) = two_args(args, "/password <old> <new>")?;
            Ok(Command::Password { old, new })
        }
        "read" => Ok(Command::Read),
        "who" => Ok(Command::Who),
        "users" => Ok(Command::Users),
        "peers" => Ok(Command::Peers),
        "history" => Ok(Command::History),
        "logout" => Ok(Command::Logout),
        "quit" | "exit" => Ok(Command::Quit),
        "help" => Ok(Command::Help),
        "delete" | "attach" | "avatar" => Err(format!("/{name} needs an argument")),
        other => Err(format!("unknown command /{other}; try /help")),
    }
}

fn two_args(args: &str, usage: &str) -> Result<(String, String), String> {
    let mut parts = args.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(first), Some(second), None) => Ok((first.to_string(), second.to_string())),
        _ => Err(format!("usage: {usage}")),
    }
}

/// MIME type for the attachment kinds the client accepts.
pub fn mime_for(path: &std::path::Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(parse_command("  hello there "), Ok(Command::Say("hello there".into())));
    }

    #[test]
    fn parses_private_message_and_thread_selection() {
        assert_eq!(
            parse_command("/to bob see you at 5"),
            Ok(Command::To {
                peer: UserId::from("bob"),
                text: "see you at 5".into()
            })
        );
        assert_eq!(parse_command("/select all"), Ok(Command::Select(None)));
        assert_eq!(
            parse_command("/select bob"),
            Ok(Command::Select(Some(UserId::from("bob"))))
        );
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(parse_command("/login alice").is_err());
        assert!(parse_command("/delete").is_err());
        assert!(parse_command("/to bob").is_err());
        assert!(parse_command("/dance").is_err());
    }

    #[test]
    fn attachment_caption_is_optional() {
        assert_eq!(
            parse_command("/attach ./cat.png"),
            Ok(Command::Attach {
                path: PathBuf::from("./cat.png"),
                caption: String::new()
            })
        );
        assert_eq!(mime_for(std::path::Path::new("cat.PNG")), Some("image/png"));
        assert_eq!(mime_for(std::path::Path::new("setup.exe")), None);
    }
}
