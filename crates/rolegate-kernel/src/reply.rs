use rolegate_contracts::ReplyCommand;

pub const APPROVE_MARKER: &str = "##APPROVE";
pub const DENY_MARKER: &str = "##DENY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Line,
    Prefix,
}

impl MatchMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "line" => Some(MatchMode::Line),
            "prefix" => Some(MatchMode::Prefix),
            _ => None,
        }
    }
}

pub fn classify_reply(body: &str, mode: MatchMode) -> ReplyCommand {
    match mode {
        MatchMode::Line => body
            .lines()
            .find_map(|line| marker_command(line.trim()))
            .unwrap_or(ReplyCommand::Unrecognized),
        MatchMode::Prefix => {
            if body.starts_with(APPROVE_MARKER) {
                ReplyCommand::Approve
            } else if body.starts_with(DENY_MARKER) {
                ReplyCommand::Deny
            } else {
                ReplyCommand::Unrecognized
            }
        }
    }
}

pub fn confirmation_text(command: ReplyCommand, from_address: &str) -> Option<String> {
    match command {
        ReplyCommand::Approve => Some(format!(
            "Approving a request based on e-mail from {from_address}"
        )),
        ReplyCommand::Deny => Some(format!(
            "Denying a request based on e-mail from {from_address}"
        )),
        ReplyCommand::Unrecognized => None,
    }
}

fn marker_command(line: &str) -> Option<ReplyCommand> {
    match line {
        APPROVE_MARKER => Some(ReplyCommand::Approve),
        DENY_MARKER => Some(ReplyCommand::Deny),
        _ => None,
    }
}
