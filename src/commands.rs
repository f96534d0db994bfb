use std::str::FromStr;

use strum::{AsRefStr, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// Commands that can be invoked by starting a line with a leading slash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, AsRefStr, IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum SlashCommand {
    /// Forget this conversation and start over
    New,
    /// Show only messages containing a phrase
    Search,
    /// Generate an image from a prompt
    Image,
    /// Print the whole conversation
    History,
    /// Show help
    Help,
    /// Exit the application
    Bye,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: SlashCommand,
    pub argument: Option<String>,
}

impl ParsedCommand {
    pub fn argument(&self) -> Option<&str> {
        self.argument.as_deref()
    }
}

impl SlashCommand {
    /// User-visible description shown in help.
    pub fn description(self) -> &'static str {
        match self {
            SlashCommand::New => "forget this conversation and start a new one",
            SlashCommand::Search => "show messages containing a phrase (case-insensitive)",
            SlashCommand::Image => "generate an image from a prompt",
            SlashCommand::History => "print the whole conversation",
            SlashCommand::Help => "show available commands",
            SlashCommand::Bye => "exit the application",
        }
    }

    /// Command string without the leading '/'.
    pub fn command(self) -> &'static str {
        self.into()
    }

    /// Whether the command is useless without an argument
    pub fn needs_argument(self) -> bool {
        matches!(self, SlashCommand::Search | SlashCommand::Image)
    }
}

/// Parse a slash command from user input
pub fn parse_slash_command(input: &str) -> Option<ParsedCommand> {
    let body = input.trim_start().strip_prefix('/')?;

    let mut parts = body.splitn(2, char::is_whitespace);
    let head = parts.next()?.to_lowercase();
    let argument = parts
        .next()
        .map(str::trim)
        .filter(|rest| !rest.is_empty())
        .map(str::to_string);

    let command = SlashCommand::from_str(&head).ok().or_else(|| match head.as_str() {
        "q" | "quit" | "exit" => Some(SlashCommand::Bye),
        "s" | "find" => Some(SlashCommand::Search),
        "img" => Some(SlashCommand::Image),
        "clear" | "reset" => Some(SlashCommand::New),
        "h" | "?" => Some(SlashCommand::Help),
        _ => None,
    })?;

    Some(ParsedCommand { command, argument })
}

/// Get help text for all available commands
pub fn get_help_text() -> String {
    let mut help = String::from("Available commands:\n\n");
    for command in SlashCommand::iter() {
        let usage = if command.needs_argument() {
            format!("/{} <text>", command.command())
        } else {
            format!("/{}", command.command())
        };
        help.push_str(&format!("  {:<16} {}\n", usage, command.description()));
    }

    help.push_str("\nAliases: /q for /bye, /s for /search, /img for /image, /clear for /new");
    help.push_str("\nAnything else is sent to the model.");

    help
}
