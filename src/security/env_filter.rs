use std::ffi::{OsStr, OsString};

/// Variable name prefixes that must never reach a tool process. Matching is done on
/// the upper-cased name.
const SENSITIVE_ENV_PREFIXES: &[&str] = &[
    "AWS_SECRET",
    "AWS_SESSION",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "GCLOUD_",
    "AZURE_",
    "OPENAI_API",
    "OPENROUTER_API",
    "ANTHROPIC_API",
    "GEMINI_API",
    "GROQ_API",
    "MISTRAL_API",
    "TOOL_ORCH_JWT",
    "TOOL_ORCH_ENCRYPTION",
    "TOOL_ORCH_SECRET",
    "SSH_",
    "GPG_",
];

const SENSITIVE_ENV_EXACT: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "DATABASE_URL",
    "DB_PASSWORD",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "GITLAB_TOKEN",
    "NPM_TOKEN",
    "DOCKER_PASSWORD",
];

pub fn is_sensitive_env_name(name: &str) -> bool {
    let upper = name.trim().to_ascii_uppercase();
    SENSITIVE_ENV_PREFIXES
        .iter()
        .any(|prefix| upper.starts_with(prefix))
        || SENSITIVE_ENV_EXACT.iter().any(|exact| upper == *exact)
}

fn is_sensitive_os_name(name: &OsStr) -> bool {
    // Names that are not valid UTF-8 cannot match any entry above.
    name.to_str().is_some_and(is_sensitive_env_name)
}

/// Returns `vars` without secret-bearing entries, preserving order and values.
pub fn filter_env<I>(vars: I) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter(|(name, _)| !is_sensitive_os_name(name))
        .collect()
}

/// Snapshot of the current process environment with secrets removed.
pub fn filtered_process_env() -> Vec<(OsString, OsString)> {
    filter_env(std::env::vars_os())
}
