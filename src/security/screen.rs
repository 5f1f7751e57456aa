/// Extensions that are never extracted to disk: native executables, script
/// runtimes, JVM artifacts, installable packages, mobile packages.
const BLOCKED_EXTENSIONS: &[&str] = &[
    // native / Windows
    "exe", "dll", "bat", "cmd", "msi", "scr", "com", "pif", "ps1", "vbs", "js", "wsf", "hta",
    // script runtimes
    "sh", "bash", "zsh", "fish", "csh", "py", "rb", "pl", "php",
    // JVM
    "jar", "class", "war", "ear",
    // platform packages
    "app", "dmg", "pkg", "deb", "rpm", "run", "bin", "appimage",
    // mobile
    "apk", "ipa",
];

pub fn is_blocked_extension(filename: &str) -> bool {
    let Some((_, ext)) = filename.rsplit_once('.') else {
        return false;
    };
    if ext.is_empty() {
        return false;
    }
    let lowered = ext.to_ascii_lowercase();
    BLOCKED_EXTENSIONS.contains(&lowered.as_str())
}

/// True only for a non-empty relative path with no parent-directory segments
/// under either separator convention. Absolute forms (leading `/`, drive
/// letter, UNC) are rejected.
pub fn is_safe_relative_entry(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return false;
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return false;
    }
    path.split(['/', '\\']).all(|segment| segment != "..")
}
