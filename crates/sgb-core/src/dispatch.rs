//! Dispatch gates: classification, validation, permissions, rate limiting.
//!
//! Per inbound message the lifecycle is
//! `Received -> Classified -> Validated -> PermissionChecked -> Dispatched ->
//! Completed | Rejected`. This module owns everything up to `Dispatched`; the
//! application layer executes the handler and reports completion.

use std::time::Duration;

use crate::{
    commands::{CommandRegistry, CommandSpec},
    domain::{InboundMessage, MemberId, MentionSpan},
    security::{parse_command_line, CommandClass, ParsedCommand, RateLimiter, ValidationFailure},
};

/// Result of classifying raw message text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classified {
    Command(ParsedCommand),
    NaturalText(String),
}

pub fn classify(text: &str) -> Classified {
    match parse_command_line(text) {
        Some(parsed) => Classified::Command(parsed),
        None => Classified::NaturalText(text.to_string()),
    }
}

/// Why a message was rejected. Every variant has a distinct user-facing
/// message; internal detail stays in the audit log.
#[derive(Clone, Debug)]
pub enum Rejection {
    NotPermitted { command: String },
    UnknownCommand { command: String },
    RateLimited { retry_after: Duration },
    ValidationFailed { reason: String },
}

impl Rejection {
    pub fn user_message(&self) -> String {
        match self {
            Rejection::NotPermitted { command } => {
                format!("You are not permitted to use /{command}.")
            }
            Rejection::UnknownCommand { command } => {
                format!("Unknown command /{command}. Send /help for the list of commands.")
            }
            Rejection::RateLimited { retry_after } => format!(
                "Too many requests. Please wait {}s and try again.",
                retry_after.as_secs().max(1)
            ),
            Rejection::ValidationFailed { reason } => {
                format!("Invalid input: {reason}")
            }
        }
    }

    /// Short classification string for usage records.
    pub fn class(&self) -> &'static str {
        match self {
            Rejection::NotPermitted { .. } => "not_permitted",
            Rejection::UnknownCommand { .. } => "unknown_command",
            Rejection::RateLimited { .. } => "rate_limited",
            Rejection::ValidationFailed { .. } => "validation_failed",
        }
    }
}

impl From<ValidationFailure> for Rejection {
    fn from(v: ValidationFailure) -> Self {
        Rejection::ValidationFailed { reason: v.reason }
    }
}

/// Everything the gates need to know about the message's surroundings.
/// Group context is resolved by the caller (roster + normalizer) before the
/// gates run.
#[derive(Clone, Debug)]
pub struct DispatchContext {
    pub sender: MemberId,
    pub is_direct: bool,
    pub in_known_group: bool,
    pub sender_is_admin: bool,
    pub sender_is_operator: bool,
}

/// A command that passed every gate and is ready to run.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub spec: CommandSpec,
    pub args: String,
    pub trailing: String,
    pub mentions: Vec<MentionSpan>,
}

#[derive(Debug)]
pub enum Decision {
    Run(Invocation),
    Reject(Rejection),
}

/// Run the gate chain for a parsed command.
///
/// Order matters: unknown commands reject before permissions (there is no
/// spec to check), permissions before rate limiting (a denied caller should
/// not consume window slots), rate limiting last.
pub fn evaluate(
    registry: &CommandRegistry,
    rate_limiter: &mut RateLimiter,
    ctx: &DispatchContext,
    parsed: ParsedCommand,
    message: &InboundMessage,
) -> Decision {
    let Some(spec) = registry.find(&parsed.name) else {
        return Decision::Reject(Rejection::UnknownCommand {
            command: parsed.name,
        });
    };

    if let Some(rejection) = check_permissions(spec, ctx) {
        return Decision::Reject(rejection);
    }

    let (allowed, retry_after) = rate_limiter.check(&ctx.sender, spec.class);
    if !allowed {
        return Decision::Reject(Rejection::RateLimited {
            retry_after: retry_after.unwrap_or(Duration::from_secs(60)),
        });
    }

    Decision::Run(Invocation {
        spec: *spec,
        args: parsed.args,
        trailing: parsed.trailing,
        mentions: message.mentions.clone(),
    })
}

fn check_permissions(spec: &CommandSpec, ctx: &DispatchContext) -> Option<Rejection> {
    let rejection = || {
        Some(Rejection::NotPermitted {
            command: spec.name.to_string(),
        })
    };

    if spec.perms.dm_only && !ctx.is_direct {
        return rejection();
    }
    if spec.perms.group_only && (ctx.is_direct || !ctx.in_known_group) {
        return rejection();
    }
    if spec.perms.admin_only && !(ctx.sender_is_admin || ctx.sender_is_operator) {
        return rejection();
    }
    None
}

/// Natural-text rate gate (non-command DM traffic goes to the AI
/// collaborator and shares its ceiling).
pub fn gate_natural_text(
    rate_limiter: &mut RateLimiter,
    ctx: &DispatchContext,
) -> Option<Rejection> {
    let (allowed, retry_after) = rate_limiter.check(&ctx.sender, CommandClass::Ai);
    if allowed {
        return None;
    }
    Some(Rejection::RateLimited {
        retry_after: retry_after.unwrap_or(Duration::from_secs(60)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::RateLimits;

    fn message(text: &str) -> InboundMessage {
        InboundMessage {
            sender: MemberId("+491700000001".to_string()),
            sender_name: None,
            group_id: None,
            text: text.to_string(),
            mentions: vec![],
            timestamp: None,
        }
    }

    fn ctx() -> DispatchContext {
        DispatchContext {
            sender: MemberId("+491700000001".to_string()),
            is_direct: true,
            in_known_group: false,
            sender_is_admin: false,
            sender_is_operator: false,
        }
    }

    fn parts() -> (CommandRegistry, RateLimiter) {
        (
            CommandRegistry::builtin(),
            RateLimiter::new(RateLimits::default()),
        )
    }

    #[test]
    fn classification_splits_commands_from_text() {
        assert!(matches!(classify("/help"), Classified::Command(_)));
        assert!(matches!(classify("what is up"), Classified::NaturalText(_)));
    }

    #[test]
    fn unknown_command_is_rejected_with_help_pointer() {
        let (reg, mut rl) = parts();
        let msg = message("/frobnicate");
        let Classified::Command(parsed) = classify(&msg.text) else {
            panic!("expected command");
        };
        let Decision::Reject(rej) = evaluate(&reg, &mut rl, &ctx(), parsed, &msg) else {
            panic!("expected rejection");
        };
        assert_eq!(rej.class(), "unknown_command");
        assert!(rej.user_message().contains("/help"));
    }

    #[test]
    fn admin_only_command_rejects_plain_member() {
        let (reg, mut rl) = parts();
        let msg = message("/add +491700000002");
        let Classified::Command(parsed) = classify(&msg.text) else {
            panic!("expected command");
        };
        let Decision::Reject(rej) = evaluate(&reg, &mut rl, &ctx(), parsed, &msg) else {
            panic!("expected rejection");
        };
        assert_eq!(rej.class(), "not_permitted");
    }

    #[test]
    fn operator_satisfies_admin_only() {
        let (reg, mut rl) = parts();
        let msg = message("/add +491700000002");
        let Classified::Command(parsed) = classify(&msg.text) else {
            panic!("expected command");
        };
        let mut c = ctx();
        c.sender_is_operator = true;
        assert!(matches!(
            evaluate(&reg, &mut rl, &c, parsed, &msg),
            Decision::Run(_)
        ));
    }

    #[test]
    fn dm_only_command_rejects_group_context() {
        let (reg, mut rl) = parts();
        let msg = message("/groups");
        let Classified::Command(parsed) = classify(&msg.text) else {
            panic!("expected command");
        };
        let mut c = ctx();
        c.is_direct = false;
        c.in_known_group = true;
        let Decision::Reject(rej) = evaluate(&reg, &mut rl, &c, parsed, &msg) else {
            panic!("expected rejection");
        };
        assert_eq!(rej.class(), "not_permitted");
    }

    #[test]
    fn group_only_command_rejects_dm_context() {
        let (reg, mut rl) = parts();
        let msg = message("/promote +491700000002");
        let Classified::Command(parsed) = classify(&msg.text) else {
            panic!("expected command");
        };
        let mut c = ctx();
        c.sender_is_operator = true;
        let Decision::Reject(rej) = evaluate(&reg, &mut rl, &c, parsed, &msg) else {
            panic!("expected rejection");
        };
        assert_eq!(rej.class(), "not_permitted");
    }

    #[test]
    fn rate_limit_rejection_carries_cooldown() {
        let (reg, mut rl) = parts();
        let c = ctx();

        // /help is General class: ceiling 20.
        for _ in 0..20 {
            let Classified::Command(parsed) = classify("/help") else {
                panic!("expected command");
            };
            assert!(matches!(
                evaluate(&reg, &mut rl, &c, parsed, &message("/help")),
                Decision::Run(_)
            ));
        }
        let Classified::Command(parsed) = classify("/help") else {
            panic!("expected command");
        };
        let Decision::Reject(rej) = evaluate(&reg, &mut rl, &c, parsed, &message("/help")) else {
            panic!("expected rejection");
        };
        assert_eq!(rej.class(), "rate_limited");
        assert!(matches!(rej, Rejection::RateLimited { retry_after } if retry_after > Duration::ZERO));
    }

    #[test]
    fn denied_caller_does_not_consume_window_slots() {
        let (reg, mut rl) = parts();
        let c = ctx();

        // Repeatedly denied admin-only calls...
        for _ in 0..50 {
            let Classified::Command(parsed) = classify("/add +491700000002") else {
                panic!("expected command");
            };
            let msg = message("/add +491700000002");
            assert!(matches!(
                evaluate(&reg, &mut rl, &c, parsed, &msg),
                Decision::Reject(Rejection::NotPermitted { .. })
            ));
        }

        // ...leave the mutation window empty for an authorized caller.
        let mut admin = ctx();
        admin.sender_is_admin = true;
        let Classified::Command(parsed) = classify("/add +491700000002") else {
            panic!("expected command");
        };
        let msg = message("/add +491700000002");
        assert!(matches!(
            evaluate(&reg, &mut rl, &admin, parsed, &msg),
            Decision::Run(_)
        ));
    }

    #[test]
    fn rejection_messages_are_distinct() {
        let msgs = [
            Rejection::NotPermitted {
                command: "add".to_string(),
            }
            .user_message(),
            Rejection::UnknownCommand {
                command: "add".to_string(),
            }
            .user_message(),
            Rejection::RateLimited {
                retry_after: Duration::from_secs(30),
            }
            .user_message(),
            Rejection::ValidationFailed {
                reason: "bad".to_string(),
            }
            .user_message(),
        ];
        for (i, a) in msgs.iter().enumerate() {
            for b in msgs.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
