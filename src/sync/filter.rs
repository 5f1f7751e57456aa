use regex::Regex;

/// Exclusion patterns over `/`-separated folder paths.
///
/// `*` matches within one segment, `**` spans segments, a leading `**/`
/// anchors at any depth, and a bare literal matches itself plus all of its
/// descendants. Matching is case-insensitive; literal portions are
/// regex-escaped so `Q4 (final)` is just a folder name.
#[derive(Debug, Clone, Default)]
pub struct FolderMatcher {
    patterns: Vec<Regex>,
}

impl FolderMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let compiled = patterns
            .iter()
            .map(|p| p.as_ref().trim())
            .filter(|p| !p.is_empty())
            .filter_map(|p| Regex::new(&translate(p)).ok())
            .collect();
        Self { patterns: compiled }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        self.patterns.iter().any(|re| re.is_match(path))
    }
}

fn translate(pattern: &str) -> String {
    let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();

    if !pattern.contains('*') {
        let escaped: Vec<String> = segments.iter().map(|s| regex::escape(s)).collect();
        return format!("(?i)^{}(?:/.*)?$", escaped.join("/"));
    }

    let mut regex = String::from("(?i)^");
    let mut needs_sep = false;
    let count = segments.len();
    for (index, segment) in segments.iter().enumerate() {
        let last = index + 1 == count;
        if *segment == "**" {
            if last {
                if needs_sep {
                    // trailing /** : all descendants
                    regex.push_str("/.+");
                } else {
                    regex.push_str(".*");
                }
                needs_sep = false;
            } else {
                if needs_sep {
                    regex.push('/');
                }
                // zero or more whole segments
                regex.push_str("(?:[^/]+/)*");
                needs_sep = false;
            }
            continue;
        }
        if needs_sep {
            regex.push('/');
        }
        regex.push_str(&translate_segment(segment));
        needs_sep = true;
    }
    regex.push('$');
    regex
}

fn translate_segment(segment: &str) -> String {
    regex::escape(segment).replace("\\*", "[^/]*")
}
