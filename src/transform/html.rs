use std::collections::HashMap;

use mailparse::{MailHeaderMap, ParsedMail};
use regex::Regex;
use serde::Deserialize;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HtmlOptions {
    #[serde(default = "default_true")]
    pub inline_styles: bool,
    #[serde(default = "default_true")]
    pub strip_external_images: bool,
    #[serde(default)]
    pub hide_cc: bool,
    #[serde(default = "default_true")]
    pub hide_bcc: bool,
}

impl Default for HtmlOptions {
    fn default() -> Self {
        Self {
            inline_styles: true,
            strip_external_images: true,
            hide_cc: false,
            hide_bcc: true,
        }
    }
}

const STYLES: &str = "body{font-family:sans-serif;margin:2em auto;max-width:60em}\
table.headers{border-collapse:collapse;margin-bottom:1.5em}\
table.headers td{padding:0.15em 0.75em 0.15em 0;vertical-align:top}\
table.headers td.label{color:#555;font-weight:bold}\
pre{white-space:pre-wrap}";

/// Standalone HTML document for one canonical message. `cid_map` rewrites
/// `cid:` image references to extracted attachment files.
pub fn render_html(
    mail: &ParsedMail<'_>,
    options: &HtmlOptions,
    cid_map: &HashMap<String, String>,
) -> String {
    let subject = mail
        .headers
        .get_first_value("Subject")
        .unwrap_or_else(|| "(no subject)".to_string());

    let mut out = String::new();
    out.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    out.push_str(&format!("<title>{}</title>\n", escape(&subject)));
    if options.inline_styles {
        out.push_str(&format!("<style>{STYLES}</style>\n"));
    }
    out.push_str("</head>\n<body>\n<table class=\"headers\">\n");
    push_header_row(&mut out, mail, "Subject");
    push_header_row(&mut out, mail, "From");
    push_header_row(&mut out, mail, "To");
    if !options.hide_cc {
        push_header_row(&mut out, mail, "Cc");
    }
    if !options.hide_bcc {
        push_header_row(&mut out, mail, "Bcc");
    }
    push_header_row(&mut out, mail, "Date");
    out.push_str("</table>\n");

    match find_part(mail, "text/html") {
        Some(body) => {
            let mut body = body;
            if options.strip_external_images {
                body = strip_external_images(&body);
            }
            body = rewrite_cid_references(&body, cid_map);
            out.push_str(&body);
        }
        None => {
            let text = find_part(mail, "text/plain").unwrap_or_default();
            out.push_str(&format!("<pre>{}</pre>", escape(&text)));
        }
    }
    out.push_str("\n</body>\n</html>\n");
    out
}

fn push_header_row(out: &mut String, mail: &ParsedMail<'_>, name: &str) {
    if let Some(value) = mail.headers.get_first_value(name) {
        out.push_str(&format!(
            "<tr><td class=\"label\">{name}</td><td>{}</td></tr>\n",
            escape(&value)
        ));
    }
}

/// First body part of the given mime type, depth-first.
pub fn find_part(mail: &ParsedMail<'_>, mimetype: &str) -> Option<String> {
    if mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
        return mail.get_body().ok();
    }
    for part in &mail.subparts {
        if let Some(body) = find_part(part, mimetype) {
            return Some(body);
        }
    }
    None
}

fn strip_external_images(html: &str) -> String {
    match Regex::new(r#"(?i)src\s*=\s*["'](?:https?:)?//[^"']*["']"#) {
        Ok(re) => re.replace_all(html, "src=\"\"").into_owned(),
        Err(_) => html.to_string(),
    }
}

fn rewrite_cid_references(html: &str, cid_map: &HashMap<String, String>) -> String {
    if cid_map.is_empty() {
        return html.to_string();
    }
    let mut out = html.to_string();
    for (cid, path) in cid_map {
        out = out.replace(&format!("cid:{cid}"), path);
    }
    out
}

pub fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &[u8] = b"Subject: Hello <World>\r\nFrom: Alice <alice@example.org>\r\nTo: bob@example.org\r\nCc: carol@example.org\r\nBcc: dave@example.org\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nplain body";

    const HTML: &[u8] = b"Subject: Rich\r\nContent-Type: text/html; charset=utf-8\r\n\r\n<p>hi <img src=\"https://tracker.example/x.png\"> <img src=\"cid:logo1\"></p>";

    #[test]
    fn plain_text_renders_in_pre() {
        let mail = mailparse::parse_mail(PLAIN).unwrap();
        let html = render_html(&mail, &HtmlOptions::default(), &HashMap::new());
        assert!(html.contains("<pre>plain body</pre>"));
        assert!(html.contains("Hello &lt;World&gt;"));
        assert!(html.contains("alice@example.org"));
    }

    #[test]
    fn cc_and_bcc_visibility_follow_options() {
        let mail = mailparse::parse_mail(PLAIN).unwrap();
        let default = render_html(&mail, &HtmlOptions::default(), &HashMap::new());
        assert!(default.contains("carol@example.org"));
        assert!(!default.contains("dave@example.org"));

        let hidden = render_html(
            &mail,
            &HtmlOptions {
                hide_cc: true,
                hide_bcc: false,
                ..HtmlOptions::default()
            },
            &HashMap::new(),
        );
        assert!(!hidden.contains("carol@example.org"));
        assert!(hidden.contains("dave@example.org"));
    }

    #[test]
    fn external_images_are_blanked() {
        let mail = mailparse::parse_mail(HTML).unwrap();
        let html = render_html(&mail, &HtmlOptions::default(), &HashMap::new());
        assert!(!html.contains("tracker.example"));
        assert!(html.contains("src=\"\""));
    }

    #[test]
    fn external_images_kept_when_disabled() {
        let mail = mailparse::parse_mail(HTML).unwrap();
        let html = render_html(
            &mail,
            &HtmlOptions {
                strip_external_images: false,
                ..HtmlOptions::default()
            },
            &HashMap::new(),
        );
        assert!(html.contains("tracker.example"));
    }

    #[test]
    fn cid_references_are_rewritten() {
        let mail = mailparse::parse_mail(HTML).unwrap();
        let mut cid_map = HashMap::new();
        cid_map.insert(
            "logo1".to_string(),
            "../../../attachments/2024/01/x/logo.png".to_string(),
        );
        let html = render_html(&mail, &HtmlOptions::default(), &cid_map);
        assert!(html.contains("../../../attachments/2024/01/x/logo.png"));
        assert!(!html.contains("cid:logo1"));
    }

    #[test]
    fn inline_styles_follow_option() {
        let mail = mailparse::parse_mail(PLAIN).unwrap();
        let styled = render_html(&mail, &HtmlOptions::default(), &HashMap::new());
        assert!(styled.contains("<style>"));
        let bare = render_html(
            &mail,
            &HtmlOptions {
                inline_styles: false,
                ..HtmlOptions::default()
            },
            &HashMap::new(),
        );
        assert!(!bare.contains("<style>"));
    }
}
