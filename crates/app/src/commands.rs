use snafu::{Snafu, ensure};

/// One line of user input, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List { filter: String },
    Open(ConversationRef),
    Back,
    Clear,
    Delete,
    Mute,
    Stop,
    Group { name: String },
    Rename { name: String },
    Photo { source: String, caption: String },
    Send(String),
    Help,
    Quit,
}

/// A conversation picked either by its position in the last listing or by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationRef {
    Position(usize),
    Id(String),
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    UnknownCommand { stage: &'static str, name: String },
    #[snafu(display("`/{command}` needs {argument}"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
        argument: &'static str,
    },
}

pub const HELP: &str = "\
/list [filter]        show conversations, optionally filtered by name or username
/open <n|id>          open a conversation by list position or id
/back                 return to the conversation list
/clear                clear the open conversation's history
/delete               delete the open conversation
/mute                 toggle mute on the open conversation
/stop                 stop the reply that is streaming
/group <name>         create a group and open it
/name <name>          change your display name
/photo <data-uri> [caption]  send a photo
/quit                 exit
anything else         send it as a message";

/// Returns `Ok(None)` for blank input.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "list" | "ls" => Command::List {
            filter: argument.to_string(),
        },
        "open" => {
            ensure!(
                !argument.is_empty(),
                MissingArgumentSnafu {
                    stage: "parse-open",
                    command: "open",
                    argument: "a list position or conversation id",
                }
            );
            let target = match argument.parse::<usize>() {
                Ok(position) => ConversationRef::Position(position),
                Err(_) => ConversationRef::Id(argument.to_string()),
            };
            Command::Open(target)
        }
        "back" => Command::Back,
        "clear" => Command::Clear,
        "delete" => Command::Delete,
        "mute" => Command::Mute,
        "stop" => Command::Stop,
        "group" => {
            ensure!(
                !argument.is_empty(),
                MissingArgumentSnafu {
                    stage: "parse-group",
                    command: "group",
                    argument: "a group name",
                }
            );
            Command::Group {
                name: argument.to_string(),
            }
        }
        "name" => {
            ensure!(
                !argument.is_empty(),
                MissingArgumentSnafu {
                    stage: "parse-name",
                    command: "name",
                    argument: "a display name",
                }
            );
            Command::Rename {
                name: argument.to_string(),
            }
        }
        "photo" => {
            let (source, caption) = argument
                .split_once(char::is_whitespace)
                .map(|(source, caption)| (source, caption.trim()))
                .unwrap_or((argument, ""));
            ensure!(
                !source.is_empty(),
                MissingArgumentSnafu {
                    stage: "parse-photo",
                    command: "photo",
                    argument: "a data URI",
                }
            );
            Command::Photo {
                source: source.to_string(),
                caption: caption.to_string(),
            }
        }
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => {
            return UnknownCommandSnafu {
                stage: "parse-command",
                name: name.to_string(),
            }
            .fail();
        }
    };
    Ok(Some(command))
}

/// MIME type declared in a `data:` URI header, if any.
pub fn data_uri_mime(source: &str) -> Option<&str> {
    let header = source.strip_prefix("data:")?.split_once(',')?.0;
    header
        .split(';')
        .next()
        .map(str::trim)
        .filter(|mime| !mime.is_empty())
}
