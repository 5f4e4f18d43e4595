use std::sync::OnceLock;

use regex::Regex;

/// Hard cap on the stored goal text.
const MAX_GOAL_CHARS: usize = 4000;

fn code_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```.*?```").expect("code block regex"))
}

fn credential_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r#"(?i)api[_-]?key\s*[=:]\s*["']?[A-Za-z0-9_\-]{16,}["']?"#,
            r#"(?i)password\s*[=:]\s*["']?[^\s"']+["']?"#,
            r#"(?i)secret\s*[=:]\s*["']?[^\s"']+["']?"#,
            r"(?i)bearer\s+[A-Za-z0-9_\-.]{16,}",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("credential regex"))
        .collect()
    })
}

/// Sanitize a task goal before it is stored and handed to adapters.
///
/// Fenced code blocks are removed wholesale (source must reach agents via
/// the workspace, not the goal text), credential-looking spans are
/// redacted, and the result is capped at a fixed length.
pub fn sanitize_goal(goal: &str) -> String {
    let stripped = code_block_re().replace_all(goal, "[code removed]");
    let mut clean = stripped.into_owned();
    for re in credential_res().iter() {
        clean = re.replace_all(&clean, "[redacted]").into_owned();
    }
    if clean.chars().count() > MAX_GOAL_CHARS {
        clean = clean.chars().take(MAX_GOAL_CHARS).collect();
    }
    clean
}
