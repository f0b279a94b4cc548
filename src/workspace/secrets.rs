//! Detection of committed credentials in a workspace.
//!
//! Two checks feed the monitor's security signals: tracked dotenv-style
//! files, and credential-shaped strings inside tracked text files.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Files larger than this are not scanned for credentials.
pub const MAX_SCAN_BYTES: u64 = 256 * 1024;

const TEMPLATE_SUFFIXES: &[&str] = &["example", "sample", "template", "dist"];

struct Detector {
    name: &'static str,
    regex: Regex,
}

impl Detector {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).expect("secret detector regex is valid"),
        }
    }
}

static DETECTORS: LazyLock<Vec<Detector>> = LazyLock::new(|| {
    vec![
        Detector::new("aws_access_key_id", r"\b(AKIA|ASIA)[A-Z0-9]{16}\b"),
        Detector::new("github_token", r"\bgh[pousr]_[A-Za-z0-9]{36,}\b"),
        Detector::new("openai_style_key", r"\bsk-[A-Za-z0-9_\-]{20,}"),
        Detector::new("slack_token", r"\bxox[abposr]-[A-Za-z0-9\-]{10,}"),
        Detector::new(
            "private_key",
            r"-----BEGIN (RSA |EC |DSA |OPENSSH |PGP |ENCRYPTED )?PRIVATE KEY( BLOCK)?-----",
        ),
        Detector::new(
            "generic_secret_assignment",
            r#"(?i)\b[a-z0-9_\-]*(secret|token|password|passwd|api[_\-]?key|access[_\-]?key)[a-z0-9_\-]*\s*[:=]\s*['"][^'"\s]{16,}['"]"#,
        ),
    ]
});

/// One credential-shaped match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretFinding {
    pub path: String,
    /// 1-based line number.
    pub line: usize,
    pub detector: &'static str,
}

impl std::fmt::Display for SecretFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.path, self.line, self.detector)
    }
}

/// Whether `path` names a dotenv-style file that should never be tracked.
///
/// `.env` and `.env.<anything>` match, except template variants such as
/// `.env.example`.
pub fn is_dotenv_file(path: &str) -> bool {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);
    if name == ".env" {
        return true;
    }
    match name.strip_prefix(".env.") {
        Some(suffix) => !TEMPLATE_SUFFIXES
            .iter()
            .any(|t| suffix.eq_ignore_ascii_case(t)),
        None => false,
    }
}

/// Run every detector over `content`, reporting at most one finding per
/// line.
pub fn scan_content(path: &str, content: &str) -> Vec<SecretFinding> {
    content
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            DETECTORS
                .iter()
                .find(|d| d.regex.is_match(line))
                .map(|d| SecretFinding {
                    path: path.to_string(),
                    line: idx + 1,
                    detector: d.name,
                })
        })
        .collect()
}

/// Scan the given tracked files under `root`. Unreadable, oversized and
/// non-UTF-8 files are skipped.
pub fn scan_files(root: &Path, files: &[String]) -> Vec<SecretFinding> {
    let mut findings = Vec::new();
    for rel in files {
        let full = root.join(rel);
        let Ok(meta) = std::fs::metadata(&full) else {
            continue;
        };
        if !meta.is_file() || meta.len() > MAX_SCAN_BYTES {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&full) else {
            continue;
        };
        findings.extend(scan_content(rel, &content));
    }
    findings
}
