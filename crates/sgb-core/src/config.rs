use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for the daemon.
///
/// Everything is env-var driven with `.env` support; the three identifying
/// parameters (account, data dir, socket path) are required.
#[derive(Clone, Debug)]
pub struct Config {
    // Identity
    pub account: String,
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,

    // Operators: senders allowed to run admin commands outside any group
    // context (e.g. /status in a DM).
    pub operators: Vec<String>,

    // Transport
    pub call_timeout: Duration,
    pub mutation_timeout: Duration,

    // Membership sync
    pub sync_interval: Duration,

    // Rate limiting (per-class ceilings over a sliding window)
    pub rate_limit_enabled: bool,
    pub rate_limit_window: Duration,
    pub rate_limit_general: u32,
    pub rate_limit_ai: u32,
    pub rate_limit_mutation: u32,
    pub rate_limit_lookup: u32,

    // AI completion collaborator
    pub ai_api_url: Option<String>,
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    pub ai_fallback_reply: String,

    // Domain lookup allowlist
    pub approved_domains: Vec<String>,

    // Persistence
    pub usage_log_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,

    // Runtime files
    pub pid_file: PathBuf,
    pub stop_file: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let account = env_str("SIGNAL_ACCOUNT").unwrap_or_default();
        if account.trim().is_empty() {
            return Err(Error::Config(
                "SIGNAL_ACCOUNT environment variable is required".to_string(),
            ));
        }

        let data_dir = env_path("SIGNAL_DATA_DIR").ok_or_else(|| {
            Error::Config("SIGNAL_DATA_DIR environment variable is required".to_string())
        })?;
        let socket_path = env_path("SIGNAL_SOCKET_PATH").ok_or_else(|| {
            Error::Config("SIGNAL_SOCKET_PATH environment variable is required".to_string())
        })?;

        fs::create_dir_all(&data_dir)?;

        let operators = parse_csv(env_str("BOT_OPERATORS"));

        let call_timeout = Duration::from_millis(env_u64("CALL_TIMEOUT_MS").unwrap_or(15_000));
        let mutation_timeout =
            Duration::from_millis(env_u64("MUTATION_TIMEOUT_MS").unwrap_or(30_000));

        let sync_interval = Duration::from_secs(env_u64("SYNC_INTERVAL_SECS").unwrap_or(300));

        let rate_limit_enabled = env_bool("RATE_LIMIT_ENABLED").unwrap_or(true);
        let rate_limit_window =
            Duration::from_secs(env_u64("RATE_LIMIT_WINDOW_SECS").unwrap_or(60));
        let rate_limit_general = env_u32("RATE_LIMIT_GENERAL").unwrap_or(20);
        let rate_limit_ai = env_u32("RATE_LIMIT_AI").unwrap_or(5);
        let rate_limit_mutation = env_u32("RATE_LIMIT_MUTATION").unwrap_or(4);
        let rate_limit_lookup = env_u32("RATE_LIMIT_LOOKUP").unwrap_or(3);

        let ai_api_url = env_str("AI_API_URL").and_then(non_empty);
        let ai_api_key = env_str("AI_API_KEY").and_then(non_empty);
        let ai_model = env_str("AI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
        let ai_fallback_reply = env_str("AI_FALLBACK_REPLY").and_then(non_empty).unwrap_or_else(
            || "Sorry, I could not come up with an answer right now. Please try again later.".to_string(),
        );

        let approved_domains = parse_csv_lower(env_str("APPROVED_DOMAINS"));

        let usage_log_path =
            env_path("USAGE_LOG_PATH").unwrap_or_else(|| data_dir.join("usage.log"));
        let audit_log_path =
            env_path("AUDIT_LOG_PATH").unwrap_or_else(|| data_dir.join("audit.log"));
        let audit_log_json = env_bool("AUDIT_LOG_JSON").unwrap_or(true);

        let pid_file = data_dir.join("sgb.pid");
        let stop_file = data_dir.join("sgb.stop");

        Ok(Self {
            account,
            data_dir,
            socket_path,
            operators,
            call_timeout,
            mutation_timeout,
            sync_interval,
            rate_limit_enabled,
            rate_limit_window,
            rate_limit_general,
            rate_limit_ai,
            rate_limit_mutation,
            rate_limit_lookup,
            ai_api_url,
            ai_api_key,
            ai_model,
            ai_fallback_reply,
            approved_domains,
            usage_log_path,
            audit_log_path,
            audit_log_json,
            pid_file,
            stop_file,
        })
    }

    pub fn is_operator(&self, sender: &str) -> bool {
        self.operators.iter().any(|o| o == sender)
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from).filter(|p| !p.as_os_str().is_empty())
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_csv_lower(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parsing_trims_and_drops_empties() {
        let v = parse_csv(Some(" +491700000001 , , uuid-abc ".to_string()));
        assert_eq!(v, vec!["+491700000001".to_string(), "uuid-abc".to_string()]);
    }

    #[test]
    fn csv_lower_normalizes_case() {
        let v = parse_csv_lower(Some("Example.ORG,Other.Net".to_string()));
        assert_eq!(v, vec!["example.org".to_string(), "other.net".to_string()]);
    }
}
