use std::path::Path;

use time::OffsetDateTime;
use unicode_normalization::UnicodeNormalization;

use crate::util::time::filename_timestamp;

/// Characters that are unsafe in a filename on at least one supported platform.
const ILLEGAL: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

const SUBJECT_FLOOR: usize = 10;
const SUBJECT_CEILING: usize = 50;
const FOLDER_PREFIX_MAX: usize = 30;

/// Conservative total-path budget; the lowest common denominator across
/// Windows MAX_PATH and typical filesystem limits, with headroom for
/// collision suffixes.
const PATH_BUDGET: usize = 240;

const FALLBACK_SLUG: &str = "no-subject";

/// Lowercase, collapse illegal characters / controls / whitespace runs into
/// single `-`, trim `-` and `.` from both ends. Empty survivors fall back to
/// the given default.
fn clean_component(input: &str, lowercase: bool, fallback: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.nfc() {
        let ch = if lowercase {
            // to_lowercase may expand to multiple chars
            let mut lowered = ch.to_lowercase();
            match (lowered.next(), lowered.next()) {
                (Some(first), None) => first,
                _ => ch,
            }
        } else {
            ch
        };
        if ch.is_control() || ch.is_whitespace() || ILLEGAL.contains(&ch) {
            pending_dash = !out.is_empty();
            continue;
        }
        if pending_dash {
            out.push('-');
            pending_dash = false;
        }
        out.push(ch);
    }
    let trimmed = out.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn subject_slug(subject: &str, max_len: usize) -> String {
    let slug = clean_component(subject, true, FALLBACK_SLUG);
    let truncated: String = slug.chars().take(max_len).collect();
    let trimmed = truncated.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Lowercased folder segments joined by `-`. Over-budget prefixes keep the
/// root and deepest segments and elide everything between.
pub fn folder_prefix(folder_path: &str) -> String {
    let segments: Vec<String> = folder_path
        .split('/')
        .filter(|s| !s.trim().is_empty())
        .map(|s| clean_component(s, true, "folder"))
        .collect();
    if segments.is_empty() {
        return "folder".to_string();
    }
    let joined = segments.join("-");
    if joined.chars().count() <= FOLDER_PREFIX_MAX || segments.len() == 1 {
        return truncate_chars(&joined, FOLDER_PREFIX_MAX);
    }
    let elided = format!(
        "{}-{}",
        segments[0],
        segments[segments.len() - 1]
    );
    truncate_chars(&elided, FOLDER_PREFIX_MAX)
}

fn truncate_chars(input: &str, max: usize) -> String {
    let out: String = input.chars().take(max).collect();
    out.trim_matches('-').to_string()
}

/// How many characters the subject slug may occupy, given where the archive
/// lives. Clamped to a floor of 10 and a ceiling of 50.
pub fn subject_budget(archive_root: &Path, folder_prefix: &str) -> usize {
    // eml/YYYY/MM/ + timestamp + two separators + extension + collision room
    let fixed = "eml/0000/00/".len() + 19 + 2 + ".eml".len() + 4;
    let used = archive_root.as_os_str().len() + 1 + folder_prefix.len() + fixed;
    PATH_BUDGET
        .saturating_sub(used)
        .clamp(SUBJECT_FLOOR, SUBJECT_CEILING)
}

/// `{folder-prefix}_{YYYY-MM-DD-HH-MM-SS}_{subject-slug}[_{n}].eml`
///
/// Pure: identical inputs always produce identical output. Collision handling
/// is the caller's job via `counter`.
pub fn message_filename(
    folder_path: &str,
    subject: &str,
    received: OffsetDateTime,
    subject_max: usize,
    counter: Option<u32>,
) -> String {
    let prefix = folder_prefix(folder_path);
    let slug = subject_slug(subject, subject_max);
    let stamp = filename_timestamp(received);
    let name = match counter {
        None => format!("{prefix}_{stamp}_{slug}.eml"),
        Some(n) => format!("{prefix}_{stamp}_{slug}_{n}.eml"),
    };
    name.nfc().collect()
}

/// Display path → cross-platform safe relative path. Case is preserved; each
/// segment gets the same character policy as subject slugs.
pub fn sanitize_folder_path(display: &str) -> String {
    let segments: Vec<String> = display
        .split('/')
        .filter(|s| !s.trim().is_empty())
        .map(|s| clean_component(s, false, "Unknown"))
        .collect();
    if segments.is_empty() {
        "Unknown".to_string()
    } else {
        segments.join("/").nfc().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::datetime;

    const T: OffsetDateTime = datetime!(2024-01-15 10:30:00 UTC);

    #[test]
    fn slug_basic() {
        assert_eq!(subject_slug("Hello World", 50), "hello-world");
        assert_eq!(subject_slug("Re: Invoice #42?", 50), "re-invoice-#42");
    }

    #[test]
    fn slug_collapses_runs() {
        assert_eq!(subject_slug("a   b\t\tc", 50), "a-b-c");
        assert_eq!(subject_slug("x //\\ y", 50), "x-y");
    }

    #[test]
    fn slug_trims_dashes_and_dots() {
        assert_eq!(subject_slug("...hello...", 50), "hello");
        assert_eq!(subject_slug("--hi--", 50), "hi");
    }

    #[test]
    fn slug_fallback() {
        assert_eq!(subject_slug("", 50), "no-subject");
        assert_eq!(subject_slug("////", 50), "no-subject");
        assert_eq!(subject_slug("   ", 50), "no-subject");
    }

    #[test]
    fn slug_respects_max() {
        let long = "word ".repeat(40);
        let slug = subject_slug(&long, 20);
        assert!(slug.chars().count() <= 20);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn prefix_joins_and_lowercases() {
        assert_eq!(folder_prefix("Inbox"), "inbox");
        assert_eq!(folder_prefix("Inbox/Project X"), "inbox-project-x");
    }

    #[test]
    fn prefix_elides_middle_segments() {
        let prefix = folder_prefix("Archive/Year 2023/Quarter Four/Invoices Received");
        assert!(prefix.starts_with("archive"));
        assert!(prefix.contains("invoices"));
        assert!(!prefix.contains("quarter"));
        assert!(prefix.chars().count() <= 30);
    }

    #[test]
    fn prefix_empty_input() {
        assert_eq!(folder_prefix(""), "folder");
        assert_eq!(folder_prefix("///"), "folder");
    }

    #[test]
    fn filename_shape() {
        let name = message_filename("Inbox", "Hello", T, 50, None);
        assert_eq!(name, "inbox_2024-01-15-10-30-00_hello.eml");
    }

    #[test]
    fn filename_counter_suffixes() {
        let first = message_filename("Inbox", "Hello", T, 50, None);
        let second = message_filename("Inbox", "Hello", T, 50, Some(1));
        let large = message_filename("Inbox", "Hello", T, 50, Some(5280));
        assert_eq!(first, "inbox_2024-01-15-10-30-00_hello.eml");
        assert_eq!(second, "inbox_2024-01-15-10-30-00_hello_1.eml");
        assert_eq!(large, "inbox_2024-01-15-10-30-00_hello_5280.eml");
    }

    #[test]
    fn filename_is_deterministic() {
        let a = message_filename("Inbox/Sub", "Status update", T, 40, None);
        let b = message_filename("Inbox/Sub", "Status update", T, 40, None);
        assert_eq!(a, b);
    }

    #[test]
    fn filenames_sort_by_prefix_then_timestamp() {
        let earlier = message_filename("Inbox", "zzz", datetime!(2024-01-01 00:00:00 UTC), 50, None);
        let later = message_filename("Inbox", "aaa", datetime!(2024-02-01 00:00:00 UTC), 50, None);
        assert!(earlier < later);
        let other_folder = message_filename("Sent", "aaa", datetime!(2023-01-01 00:00:00 UTC), 50, None);
        assert!(earlier < other_folder);
    }

    #[test]
    fn budget_clamps_to_floor_and_ceiling() {
        let deep = Path::new("/").join("x".repeat(300));
        assert_eq!(subject_budget(&deep, "inbox"), 10);
        assert_eq!(subject_budget(Path::new("/a"), "inbox"), 50);
    }

    #[test]
    fn sanitize_folder_path_segments() {
        assert_eq!(sanitize_folder_path("Inbox/Project: X"), "Inbox/Project-X");
        assert_eq!(sanitize_folder_path(""), "Unknown");
        assert_eq!(sanitize_folder_path("///"), "Unknown");
    }

    #[test]
    fn output_is_nfc_composed() {
        // U+0065 U+0301 (decomposed) and U+00E9 (composed) must collide
        let decomposed = message_filename("Inbox", "Caf\u{0065}\u{0301}", T, 50, None);
        let composed = message_filename("Inbox", "Caf\u{00e9}", T, 50, None);
        assert_eq!(decomposed, composed);
    }

    proptest! {
        #[test]
        fn slug_is_always_safe(input in ".{0,256}") {
            let slug = subject_slug(&input, 50);
            prop_assert!(!slug.is_empty());
            prop_assert!(slug.chars().count() <= 50);
            for ch in ['\0', '/', '\\', ':', '*', '?', '"', '<', '>', '|', '\r', '\n', ' '] {
                prop_assert!(!slug.contains(ch));
            }
            prop_assert!(!slug.starts_with('-') && !slug.ends_with('-'));
            prop_assert!(!slug.starts_with('.') && !slug.ends_with('.'));
        }

        #[test]
        fn generator_is_pure(subject in ".{0,100}", folder in "[A-Za-z/ ]{0,40}") {
            let a = message_filename(&folder, &subject, T, 50, None);
            let b = message_filename(&folder, &subject, T, 50, None);
            prop_assert_eq!(a, b);
        }
    }
}
