use std::collections::HashMap;
use std::path::Path;

use crate::MailError;

const VERIFICATION: &str = include_str!("../templates/verification.eml");
const INVITE: &str = include_str!("../templates/invite.eml");
const VERIFY_RESPONSE: &str = include_str!("../templates/verify_response.html");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    /// Email carrying the validation link and token.
    Verification,
    /// Email telling an invitee about a pending room invite.
    Invite,
    /// HTML page shown after following the validation link.
    VerifyResponse,
}

impl TemplateKind {
    fn file_name(self) -> &'static str {
        match self {
            Self::Verification => "verification.eml",
            Self::Invite => "invite.eml",
            Self::VerifyResponse => "verify_response.html",
        }
    }
}

/// The template set, embedded defaults optionally overridden from disk.
#[derive(Debug, Clone)]
pub struct Templates {
    verification: String,
    invite: String,
    verify_response: String,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            verification: VERIFICATION.to_string(),
            invite: INVITE.to_string(),
            verify_response: VERIFY_RESPONSE.to_string(),
        }
    }
}

impl Templates {
    /// Loads the defaults, replacing any that exist as files in `dir`.
    pub fn load(dir: Option<&Path>) -> Result<Self, MailError> {
        let mut templates = Self::default();
        let Some(dir) = dir else {
            return Ok(templates);
        };
        for kind in [
            TemplateKind::Verification,
            TemplateKind::Invite,
            TemplateKind::VerifyResponse,
        ] {
            let path = dir.join(kind.file_name());
            if !path.is_file() {
                continue;
            }
            let body = std::fs::read_to_string(&path).map_err(|source| MailError::Template {
                path: path.display().to_string(),
                source,
            })?;
            tracing::info!(path = %path.display(), "loaded template override");
            *templates.slot(kind) = body;
        }
        Ok(templates)
    }

    fn slot(&mut self, kind: TemplateKind) -> &mut String {
        match kind {
            TemplateKind::Verification => &mut self.verification,
            TemplateKind::Invite => &mut self.invite,
            TemplateKind::VerifyResponse => &mut self.verify_response,
        }
    }

    pub fn get(&self, kind: TemplateKind) -> &str {
        match kind {
            TemplateKind::Verification => &self.verification,
            TemplateKind::Invite => &self.invite,
            TemplateKind::VerifyResponse => &self.verify_response,
        }
    }
}

/// Expands `%(name)s` placeholders from `vars`. `%%` is a literal `%`.
/// Unknown names expand to nothing.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("%%") {
            out.push('%');
            rest = after;
            continue;
        }
        let placeholder = tail
            .strip_prefix("%(")
            .and_then(|inner| inner.split_once(")s"));
        match placeholder {
            Some((name, after)) if !name.contains(')') => {
                if let Some(value) = vars.get(name) {
                    out.push_str(value);
                }
                rest = after;
            }
            _ => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
