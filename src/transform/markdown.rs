use mailparse::{MailHeaderMap, ParsedMail};
use regex::Regex;

use crate::transform::html::find_part;

/// Plain structured form: a metadata block followed by the text body. When
/// the message only carries HTML, tags are stripped to approximate it.
pub fn render_markdown(mail: &ParsedMail<'_>) -> String {
    let subject = mail
        .headers
        .get_first_value("Subject")
        .unwrap_or_else(|| "(no subject)".to_string());

    let mut out = String::new();
    out.push_str(&format!("# {subject}\n\n"));
    for name in ["From", "To", "Cc", "Date"] {
        if let Some(value) = mail.headers.get_first_value(name) {
            out.push_str(&format!("- **{name}:** {value}\n"));
        }
    }
    out.push_str("\n---\n\n");

    let body = match find_part(mail, "text/plain") {
        Some(text) => text,
        None => find_part(mail, "text/html")
            .map(|html| strip_tags(&html))
            .unwrap_or_default(),
    };
    out.push_str(body.trim_end());
    out.push('\n');
    out
}

fn strip_tags(html: &str) -> String {
    let without_blocks = match Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>") {
        Ok(re) => re.replace_all(html, "").into_owned(),
        Err(_) => html.to_string(),
    };
    let stripped = match Regex::new(r"(?s)<[^>]*>") {
        Ok(re) => re.replace_all(&without_blocks, "").into_owned(),
        Err(_) => without_blocks,
    };
    stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
