#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Init,
    /// `/summarize`, also reachable as `/compact`.
    Summarize,
    Share,
    Unshare,
    /// Any other named command, run on the backend with its raw arguments.
    Custom { name: String, arguments: String },
}

impl SlashCommand {
    pub fn name(&self) -> &str {
        match self {
            Self::Init => "init",
            Self::Summarize => "summarize",
            Self::Share => "share",
            Self::Unshare => "unshare",
            Self::Custom { name, .. } => name,
        }
    }
}

pub fn parse_slash_command(input: &str) -> Option<SlashCommand> {
    let trimmed = input.trim();
    let rest = trimmed.strip_prefix('/')?;

    let (name, arguments) = match rest.split_once(char::is_whitespace) {
        Some((name, arguments)) => (name, arguments.trim()),
        None => (rest, ""),
    };
    if name.is_empty() {
        return None;
    }

    let parsed = match name {
        "init" => SlashCommand::Init,
        "summarize" | "compact" => SlashCommand::Summarize,
        "share" => SlashCommand::Share,
        "unshare" => SlashCommand::Unshare,
        _ => SlashCommand::Custom {
            name: name.to_string(),
            arguments: arguments.to_string(),
        },
    };

    Some(parsed)
}
