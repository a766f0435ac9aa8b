use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tessera_types::random_alphanumeric;
use url::form_urlencoded::byte_serialize;
use url::Url;

use crate::templates::render;

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Adds `<name>_forhtml` and `<name>_forurl` for every variable.
pub fn with_variants(mut vars: HashMap<String, String>) -> HashMap<String, String> {
    let derived: Vec<(String, String)> = vars
        .iter()
        .flat_map(|(name, value)| {
            [
                (format!("{name}_forhtml"), escape_html(value)),
                (
                    format!("{name}_forurl"),
                    byte_serialize(value.as_bytes()).collect(),
                ),
            ]
        })
        .collect();
    vars.extend(derived);
    vars
}

/// Renders a full message from `template`.
///
/// Fills in `messageid`, `date`, `from`, and `to` (the first recipient)
/// before expanding.
pub fn compose(
    template: &str,
    from: &str,
    to: &[String],
    hostname: &str,
    now: DateTime<Utc>,
    mut vars: HashMap<String, String>,
) -> Vec<u8> {
    vars.insert(
        "messageid".into(),
        format!(
            "<{}{}@{}>",
            now.timestamp_millis(),
            random_alphanumeric(16),
            hostname
        ),
    );
    vars.insert("date".into(), now.to_rfc2822());
    vars.insert("from".into(), from.to_string());
    vars.insert(
        "to".into(),
        to.first().cloned().unwrap_or_default(),
    );
    render(template, &with_variants(vars)).into_bytes()
}

/// Link the user follows to validate an email session.
///
/// A `next_link` gets the session id appended to its own query before it
/// is embedded.
pub fn validation_link(
    client_http_base: &str,
    sid: i64,
    token: &str,
    client_secret: &str,
    next_link: Option<&str>,
) -> Result<String, url::ParseError> {
    let base = client_http_base.trim_end_matches('/');
    let mut link = Url::parse(&format!(
        "{base}/_matrix/identity/api/v1/validate/email/submitToken"
    ))?;
    let sid = sid.to_string();
    {
        let mut query = link.query_pairs_mut();
        query
            .append_pair("token", token)
            .append_pair("client_secret", client_secret)
            .append_pair("sid", &sid);
        if let Some(next) = next_link {
            let mut next = Url::parse(next)?;
            next.query_pairs_mut().append_pair("sid", &sid);
            query.append_pair("nextLink", next.as_str());
        }
    }
    Ok(link.into())
}
