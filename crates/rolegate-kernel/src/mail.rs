use rolegate_contracts::{OutboundMessage, RoleRequest};

use crate::KernelError;

pub fn parse_role_request(message_id: &str, body: &str) -> Result<RoleRequest, KernelError> {
    if message_id.trim().is_empty() {
        return Err(KernelError::Parse(
            "role request mail has no message id".to_string(),
        ));
    }

    let mut project = None;
    let mut role = None;
    let mut user = None;
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let slot = match key.trim().to_ascii_lowercase().as_str() {
            "project" => &mut project,
            "role" => &mut role,
            "user" => &mut user,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }

    let missing = |field: &str| KernelError::Parse(format!("role request mail has no {field} line"));
    Ok(RoleRequest {
        project_name: project.ok_or_else(|| missing("project"))?,
        role_name: role.ok_or_else(|| missing("role"))?,
        user_name: user.ok_or_else(|| missing("user"))?,
        source_message_id: message_id.trim().to_string(),
    })
}

pub fn compose_clarification(
    rendered: &str,
    default_to: &str,
    default_subject: &str,
) -> OutboundMessage {
    let mut message = OutboundMessage {
        to: default_to.to_string(),
        subject: default_subject.to_string(),
        body: rendered.to_string(),
        in_reply_to: None,
    };

    let lines: Vec<&str> = rendered.lines().collect();
    let header_count = lines.iter().take_while(|line| header(line).is_some()).count();
    let closed = lines
        .get(header_count)
        .is_some_and(|line| line.trim().is_empty());
    if header_count == 0 || !closed {
        return message;
    }

    for line in &lines[..header_count] {
        if let Some((name, value)) = header(line) {
            match name.to_ascii_lowercase().as_str() {
                "to" => message.to = value.to_string(),
                "subject" => message.subject = value.to_string(),
                _ => {}
            }
        }
    }
    let body_start = (header_count + 1).min(lines.len());
    message.body = lines[body_start..].join("\n");
    message
}

fn header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let valid_name = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    valid_name.then(|| (name, value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_lines_in_any_order() {
        let body = "A new role was requested.\n\nUser: alice\nProject: glassfish\nrole:  Observer \n";
        let request = parse_role_request("<m1@dev.java.net>", body).unwrap();
        assert_eq!(request.project_name, "glassfish");
        assert_eq!(request.role_name, "Observer");
        assert_eq!(request.user_name, "alice");
        assert_eq!(request.source_message_id, "<m1@dev.java.net>");
    }

    #[test]
    fn first_occurrence_wins() {
        let body = "project: a\nproject: b\nrole: r\nuser: u";
        assert_eq!(parse_role_request("m", body).unwrap().project_name, "a");
    }

    #[test]
    fn missing_field_is_rejected() {
        let err = parse_role_request("m", "project: a\nrole: r").unwrap_err();
        assert_eq!(
            err,
            KernelError::Parse("role request mail has no user line".to_string())
        );
        assert!(parse_role_request(" ", "project: a\nrole: r\nuser: u").is_err());
    }

    #[test]
    fn plain_body_uses_defaults() {
        let msg = compose_clarification("Hello alice", "owner@x", "subject");
        assert_eq!(msg.to, "owner@x");
        assert_eq!(msg.subject, "subject");
        assert_eq!(msg.body, "Hello alice");
    }

    #[test]
    fn header_block_overrides_recipient_and_subject() {
        let rendered = "To: alice@dev.java.net\nSubject: About your request\nX-Extra: 1\n\nHi alice,\nwhy?";
        let msg = compose_clarification(rendered, "owner@x", "subject");
        assert_eq!(msg.to, "alice@dev.java.net");
        assert_eq!(msg.subject, "About your request");
        assert_eq!(msg.body, "Hi alice,\nwhy?");
    }

    #[test]
    fn header_like_first_line_without_blank_separator_is_body() {
        let rendered = "Note: please answer\nwith ##APPROVE or ##DENY";
        let msg = compose_clarification(rendered, "owner@x", "subject");
        assert_eq!(msg.to, "owner@x");
        assert_eq!(msg.body, rendered);
    }
}
