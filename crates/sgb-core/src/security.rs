use std::{
    collections::{HashMap, VecDeque},
    sync::OnceLock,
    time::{Duration, Instant},
};

use regex::Regex;

use crate::domain::MemberId;

// ============== Sanitization ==============

/// Placeholder character the network substitutes for a mention inside message
/// text. The real identifier lives in the mention-span list.
pub const MENTION_PLACEHOLDER: char = '\u{FFFC}';

/// Characters with special meaning to a shell or markup context; stripped
/// from all free-text arguments before they reach a handler.
const STRIPPED: &[char] = &[
    '`', '$', ';', '|', '&', '<', '>', '\\', '"', '\'', '{', '}', '(', ')', '*',
];

pub fn sanitize_text(s: &str) -> String {
    s.chars()
        .filter(|c| !STRIPPED.contains(c) && (!c.is_control() || *c == '\n'))
        .collect()
}

// ============== Argument classes ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgClass {
    CommandToken,
    Identifier,
    Url,
    Domain,
    FreeText,
}

impl ArgClass {
    pub fn max_len(self) -> usize {
        match self {
            ArgClass::CommandToken => 32,
            ArgClass::Identifier => 64,
            ArgClass::Url => 256,
            ArgClass::Domain => 253,
            ArgClass::FreeText => 1000,
        }
    }

    fn label(self) -> &'static str {
        match self {
            ArgClass::CommandToken => "command",
            ArgClass::Identifier => "identifier",
            ArgClass::Url => "URL",
            ArgClass::Domain => "domain",
            ArgClass::FreeText => "text",
        }
    }
}

/// Typed validation failure; the reason is safe to echo back to the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationFailure {
    pub reason: String,
}

impl ValidationFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static validation pattern"))
}

pub fn is_phone_number(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^\+[1-9]\d{6,14}$").is_match(s)
}

pub fn is_account_uuid(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
    )
    .is_match(s)
}

pub fn is_member_identifier(s: &str) -> bool {
    is_phone_number(s) || is_account_uuid(s)
}

pub fn is_url(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^https?://[A-Za-z0-9][A-Za-z0-9.\-]*(?::\d{1,5})?(?:/\S*)?$").is_match(s)
}

pub fn is_domain(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"^(?:[A-Za-z0-9](?:[A-Za-z0-9\-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,}$",
    )
    .is_match(s)
}

/// Validate one argument against its class: length cap first, then the
/// format predicate. Free text is sanitized rather than rejected.
pub fn validate_arg(class: ArgClass, raw: &str) -> Result<String, ValidationFailure> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ValidationFailure::new(format!(
            "missing {} argument",
            class.label()
        )));
    }
    if value.chars().count() > class.max_len() {
        return Err(ValidationFailure::new(format!(
            "{} too long (max {} characters)",
            class.label(),
            class.max_len()
        )));
    }

    let ok = match class {
        ArgClass::CommandToken => value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'),
        ArgClass::Identifier => is_member_identifier(value),
        ArgClass::Url => is_url(value),
        ArgClass::Domain => is_domain(value),
        ArgClass::FreeText => return Ok(sanitize_text(value)),
    };

    if !ok {
        return Err(ValidationFailure::new(format!(
            "not a valid {}: {}",
            class.label(),
            sanitize_text(value)
        )));
    }
    Ok(value.to_string())
}

/// Validate a free-text argument that may carry a mention placeholder.
///
/// Everything from the first placeholder on is a substitution artifact: the
/// real identifier comes from the mention-span list, so that tail is exempt
/// from length/pattern checks. Text before the placeholder is validated
/// normally.
pub fn validate_free_text_with_mentions(raw: &str) -> Result<String, ValidationFailure> {
    match raw.find(MENTION_PLACEHOLDER) {
        None => validate_arg(ArgClass::FreeText, raw),
        Some(idx) => {
            let head = &raw[..idx];
            let head = if head.trim().is_empty() {
                String::new()
            } else {
                validate_arg(ArgClass::FreeText, head)?
            };
            Ok(format!("{head}{}", &raw[idx..]))
        }
    }
}

// ============== Command-line parsing ==============

/// A parsed command line. Only the first line is parsed for the command name
/// and arguments; the remaining lines ride along as trailing context and are
/// never re-parsed as commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: String,
    pub trailing: String,
}

pub fn parse_command_line(text: &str) -> Option<ParsedCommand> {
    let mut lines = text.splitn(2, '\n');
    let first = lines.next().unwrap_or("").trim();
    let trailing = lines.next().unwrap_or("").to_string();

    let rest = first.strip_prefix('/')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("").trim().to_lowercase();
    if name.is_empty() {
        return None;
    }
    let args = parts.next().unwrap_or("").trim().to_string();

    Some(ParsedCommand {
        name,
        args,
        trailing,
    })
}

// ============== Rate Limiter (sliding window) ==============

/// Coarse command classes with independent ceilings. Expensive classes get
/// lower ceilings than the default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandClass {
    General,
    Ai,
    GroupMutation,
    DomainLookup,
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimits {
    pub enabled: bool,
    pub window: Duration,
    pub general: u32,
    pub ai: u32,
    pub mutation: u32,
    pub lookup: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            general: 20,
            ai: 5,
            mutation: 4,
            lookup: 3,
        }
    }
}

impl RateLimits {
    fn ceiling(&self, class: CommandClass) -> u32 {
        match class {
            CommandClass::General => self.general,
            CommandClass::Ai => self.ai,
            CommandClass::GroupMutation => self.mutation,
            CommandClass::DomainLookup => self.lookup,
        }
    }
}

/// Sliding-window limiter keyed by (user, command class). Windows are pruned
/// on every check; an exceeded ceiling reports the remaining cooldown.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    windows: HashMap<(MemberId, CommandClass), VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            windows: HashMap::new(),
        }
    }

    pub fn check(&mut self, user: &MemberId, class: CommandClass) -> (bool, Option<Duration>) {
        self.check_at(user, class, Instant::now())
    }

    pub fn check_at(
        &mut self,
        user: &MemberId,
        class: CommandClass,
        now: Instant,
    ) -> (bool, Option<Duration>) {
        if !self.limits.enabled {
            return (true, None);
        }

        let window = self.limits.window;
        let ceiling = self.limits.ceiling(class) as usize;

        let calls = self
            .windows
            .entry((user.clone(), class))
            .or_insert_with(VecDeque::new);

        while let Some(front) = calls.front() {
            if now.duration_since(*front) >= window {
                calls.pop_front();
            } else {
                break;
            }
        }

        if calls.len() < ceiling {
            calls.push_back(now);
            return (true, None);
        }

        // Cooldown: time until the oldest call in the window ages out.
        let retry_after = calls
            .front()
            .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(window);
        (false, Some(retry_after))
    }

    /// Drop windows that have gone fully idle. Runs on its own timer; must
    /// not be called from the transport read loop.
    pub fn prune_idle(&mut self, now: Instant) {
        let window = self.limits.window;
        self.windows.retain(|_, calls| {
            calls
                .back()
                .map(|last| now.duration_since(*last) < window)
                .unwrap_or(false)
        });
    }
}
