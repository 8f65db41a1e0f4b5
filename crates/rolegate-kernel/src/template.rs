use rolegate_contracts::RoleRequest;

#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub project: &'a str,
    pub role: &'a str,
    pub user: &'a str,
}

impl<'a> TemplateVars<'a> {
    pub fn from_request(request: &'a RoleRequest) -> Self {
        Self {
            project: &request.project_name,
            role: &request.role_name,
            user: &request.user_name,
        }
    }
}

pub fn render(template: &str, vars: &TemplateVars<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    for line in template.lines() {
        let line = line
            .replace("${project}", vars.project)
            .replace("${role}", vars.role)
            .replace("${user}", vars.user);
        out.push_str(&line);
        out.push('\n');
    }
    out
}
