use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use rolegate_contracts::{PolicyDocument, Rule, RuleAction};
use url::Url;

use crate::template::{render, TemplateVars};
use crate::KernelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyRoot {
    Redirect(String),
    Document(PolicyDocument),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Deny { reason: String },
    Talk { body: String },
}

pub fn policy_url(template: &str, project: &str) -> Result<Url, KernelError> {
    let raw = template.replace("${project}", project);
    Url::parse(&raw).map_err(|err| KernelError::Location(format!("{raw}: {err}")))
}

pub fn resolve_location(base: &Url, location: &str) -> Result<Url, KernelError> {
    base.join(location.trim())
        .map_err(|err| KernelError::Location(format!("{location} relative to {base}: {err}")))
}

pub fn split_roles(attribute: &str) -> Vec<String> {
    attribute
        .split(',')
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_policy_xml(text: &str) -> Result<PolicyRoot, KernelError> {
    let mut reader = Reader::from_str(text);
    let mut depth = 0usize;
    let mut root: Option<String> = None;
    let mut redirect_text = String::new();
    let mut rules = Vec::new();
    let mut current: Option<PendingRule> = None;

    loop {
        let event = reader.read_event().map_err(|err| {
            KernelError::Parse(format!(
                "malformed policy document at byte {}: {err}",
                reader.buffer_position()
            ))
        })?;
        match event {
            Event::Start(e) => {
                let name = element_name(&e)?;
                if depth == 0 {
                    root = Some(name);
                } else if depth == 1 && name == "rule" && !is_redirect(&root) {
                    current = Some(PendingRule::from_element(&e)?);
                }
                depth += 1;
            }
            Event::Empty(e) => {
                let name = element_name(&e)?;
                if depth == 0 {
                    root = Some(name);
                } else if depth == 1 && name == "rule" && !is_redirect(&root) {
                    rules.push(PendingRule::from_element(&e)?.finish());
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 1 {
                    if let Some(rule) = current.take() {
                        rules.push(rule.finish());
                    }
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|err| KernelError::Parse(format!("invalid text content: {err}")))?;
                push_text(depth, &root, &mut redirect_text, current.as_mut(), &text);
            }
            Event::CData(c) => {
                let bytes = c.into_inner();
                let text = String::from_utf8_lossy(&bytes);
                push_text(depth, &root, &mut redirect_text, current.as_mut(), &text);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(KernelError::Parse(
            "policy document ended before its root element was closed".to_string(),
        ));
    }
    match root {
        None => Err(KernelError::Parse(
            "policy document has no root element".to_string(),
        )),
        Some(name) if name == "redirect" => {
            let location = redirect_text.trim();
            if location.is_empty() {
                return Err(KernelError::Parse(
                    "redirect element carries no location".to_string(),
                ));
            }
            Ok(PolicyRoot::Redirect(location.to_string()))
        }
        Some(_) => Ok(PolicyRoot::Document(PolicyDocument { rules })),
    }
}

pub fn evaluate(
    policy: &PolicyDocument,
    role: &str,
    vars: &TemplateVars<'_>,
) -> Result<Verdict, KernelError> {
    let rule = policy
        .rules
        .iter()
        .find(|rule| rule.roles.iter().any(|r| r.trim() == role))
        .ok_or_else(|| KernelError::Policy(format!("no rule matches role {role}")))?;

    match RuleAction::from_name(&rule.action) {
        Some(RuleAction::Approve) => Ok(Verdict::Approve),
        Some(RuleAction::Deny) => Ok(Verdict::Deny {
            reason: render(&rule.body, vars),
        }),
        Some(RuleAction::Talk) => Ok(Verdict::Talk {
            body: render(&rule.body, vars).trim().to_string(),
        }),
        None => Err(KernelError::Parse(format!(
            "unknown action {:?} in rule for role {role}",
            rule.action
        ))),
    }
}

struct PendingRule {
    roles: Vec<String>,
    action: String,
    body_attr: Option<String>,
    text: String,
}

impl PendingRule {
    fn from_element(e: &BytesStart<'_>) -> Result<Self, KernelError> {
        let mut rule = PendingRule {
            roles: Vec::new(),
            action: String::new(),
            body_attr: None,
            text: String::new(),
        };
        for attr in e.attributes() {
            let attr =
                attr.map_err(|err| KernelError::Parse(format!("invalid rule attribute: {err}")))?;
            let value = attr
                .unescape_value()
                .map_err(|err| KernelError::Parse(format!("invalid rule attribute: {err}")))?
                .into_owned();
            match attr.key.local_name().as_ref() {
                b"role" => rule.roles = split_roles(&value),
                b"action" => rule.action = value,
                b"body" => rule.body_attr = Some(value),
                _ => {}
            }
        }
        Ok(rule)
    }

    fn finish(self) -> Rule {
        Rule {
            roles: self.roles,
            action: self.action,
            body: self.body_attr.unwrap_or(self.text),
        }
    }
}

fn element_name(e: &BytesStart<'_>) -> Result<String, KernelError> {
    std::str::from_utf8(e.local_name().as_ref())
        .map(str::to_string)
        .map_err(|err| KernelError::Parse(format!("element name is not UTF-8: {err}")))
}

fn is_redirect(root: &Option<String>) -> bool {
    root.as_deref() == Some("redirect")
}

fn push_text(
    depth: usize,
    root: &Option<String>,
    redirect_text: &mut String,
    current: Option<&mut PendingRule>,
    text: &str,
) {
    if depth == 1 && is_redirect(root) {
        redirect_text.push_str(text);
    } else if depth == 2 {
        if let Some(rule) = current {
            rule.text.push_str(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars<'static> {
        TemplateVars {
            project: "glassfish",
            role: "observer",
            user: "alice",
        }
    }

    fn rule(roles: &str, action: &str, body: &str) -> Rule {
        Rule {
            roles: split_roles(roles),
            action: action.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn talk_rule_renders_trimmed_body() {
        let doc = match parse_policy_xml(
            r#"<policy><rule role="committer,observer" action="talk" body="Hello ${user}"/></policy>"#,
        )
        .unwrap()
        {
            PolicyRoot::Document(doc) => doc,
            other => panic!("unexpected root: {other:?}"),
        };
        let verdict = evaluate(&doc, "observer", &vars()).unwrap();
        assert_eq!(
            verdict,
            Verdict::Talk {
                body: "Hello alice".to_string()
            }
        );
    }

    #[test]
    fn body_falls_back_to_element_text() {
        let xml = "<policy>\n  <rule role=\"developer\" action=\"deny\">Sorry ${user},\nno ${role} in ${project}.</rule>\n</policy>";
        let PolicyRoot::Document(doc) = parse_policy_xml(xml).unwrap() else {
            panic!("expected a policy document");
        };
        assert_eq!(doc.rules.len(), 1);
        let verdict = evaluate(&doc, "developer", &vars()).unwrap();
        assert_eq!(
            verdict,
            Verdict::Deny {
                reason: "Sorry alice,\nno observer in glassfish.\n".to_string()
            }
        );
    }

    #[test]
    fn cdata_and_entities_are_kept_in_body() {
        let xml = r#"<policy><rule role="a" action="talk"><![CDATA[Hi <${user}>]]> &amp; bye</rule></policy>"#;
        let PolicyRoot::Document(doc) = parse_policy_xml(xml).unwrap() else {
            panic!("expected a policy document");
        };
        assert_eq!(doc.rules[0].body, "Hi <${user}> & bye");
    }

    #[test]
    fn first_matching_rule_wins() {
        let doc = PolicyDocument {
            rules: vec![
                rule("developer", "approve", ""),
                rule(" observer , committer", "deny", "no"),
                rule("observer", "approve", ""),
            ],
        };
        assert_eq!(
            evaluate(&doc, "observer", &vars()).unwrap(),
            Verdict::Deny {
                reason: "no\n".to_string()
            }
        );
    }

    #[test]
    fn role_match_is_case_sensitive_and_exact() {
        let doc = PolicyDocument {
            rules: vec![rule("Observer,observers", "approve", "")],
        };
        let err = evaluate(&doc, "observer", &vars()).unwrap_err();
        assert!(matches!(err, KernelError::Policy(_)));
    }

    #[test]
    fn action_names_ignore_case() {
        let doc = PolicyDocument {
            rules: vec![rule("observer", "APPROVE", "")],
        };
        assert_eq!(evaluate(&doc, "observer", &vars()).unwrap(), Verdict::Approve);
    }

    #[test]
    fn unknown_action_on_selected_rule_is_a_parse_error() {
        let doc = PolicyDocument {
            rules: vec![
                rule("observer", "escalate", ""),
                rule("observer", "approve", ""),
            ],
        };
        let err = evaluate(&doc, "observer", &vars()).unwrap_err();
        assert!(matches!(err, KernelError::Parse(_)));
    }

    #[test]
    fn unknown_action_on_other_rule_is_ignored() {
        let doc = PolicyDocument {
            rules: vec![
                rule("developer", "escalate", ""),
                rule("observer", "approve", ""),
            ],
        };
        assert_eq!(evaluate(&doc, "observer", &vars()).unwrap(), Verdict::Approve);
    }

    #[test]
    fn redirect_root_yields_trimmed_location() {
        let root = parse_policy_xml("<redirect>\n  ../other/role-approval.policy \n</redirect>")
            .unwrap();
        assert_eq!(
            root,
            PolicyRoot::Redirect("../other/role-approval.policy".to_string())
        );
    }

    #[test]
    fn empty_redirect_is_rejected() {
        let err = parse_policy_xml("<redirect/>").unwrap_err();
        assert!(matches!(err, KernelError::Parse(_)));
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(parse_policy_xml("").is_err());
        assert!(parse_policy_xml("<policy><rule role=\"a\"></policy>").is_err());
        assert!(parse_policy_xml("<policy>").is_err());
    }

    #[test]
    fn relative_locations_resolve_against_previous_url() {
        let base = policy_url(
            "https://${project}.dev.java.net/role-approval.policy",
            "glassfish",
        )
        .unwrap();
        assert_eq!(
            base.as_str(),
            "https://glassfish.dev.java.net/role-approval.policy"
        );
        let next = resolve_location(&base, "policies/main.policy").unwrap();
        assert_eq!(
            next.as_str(),
            "https://glassfish.dev.java.net/policies/main.policy"
        );
        let absolute = resolve_location(&next, "https://example.org/p.xml").unwrap();
        assert_eq!(absolute.as_str(), "https://example.org/p.xml");
    }

    #[test]
    fn malformed_template_url_is_a_location_error() {
        let err = policy_url("not a url ${project}", "x").unwrap_err();
        assert!(matches!(err, KernelError::Location(_)));
    }
}
