//! Command implementations.
//!
//! Handlers never mutate cached groups directly: mutations go through the
//! transport and the roster catches up on the next sync (kicked off early
//! after a confirmed change).

use std::sync::Arc;

use sgb_core::{
    ai::UserContext,
    audit::AuditEvent,
    dispatch::{Invocation, Rejection},
    domain::{InboundMessage, MemberId},
    roster::{Group, Roster},
    rpc::{GroupUpdate, UpdateOutcome},
    security::{
        sanitize_text, validate_arg, validate_free_text_with_mentions, ArgClass,
        MENTION_PLACEHOLDER,
    },
};

use super::HandlerError;
use crate::router::AppState;

const MAX_LOOKUP_BATCH: usize = 10;

pub async fn run(
    state: &Arc<AppState>,
    msg: &InboundMessage,
    group: Option<&Arc<Group>>,
    inv: &Invocation,
) -> Result<String, HandlerError> {
    use sgb_core::commands::CommandKind::*;

    match inv.spec.kind {
        Help => Ok(state.registry.help_text()),
        Groups => Ok(groups_listing(state)),
        Join => join(state, msg, inv).await,
        AddMember => update_membership(state, group, inv, MembershipAction::Add).await,
        RemoveMember => update_membership(state, group, inv, MembershipAction::Remove).await,
        Promote => promote(state, group, inv).await,
        Ai => ai_command(state, msg, group, inv).await,
        Lookup => lookup(state, inv),
        Status => Ok(status(state).await),
    }
}

// ── listing + index resolution ──────────────────────────────────

fn groups_listing(state: &AppState) -> String {
    let listing = state.roster.ordered_groups();
    if listing.is_empty() {
        return "No groups known yet. Try again after the next sync.".to_string();
    }

    let mut out = String::from("Groups:\n");
    for (i, g) in listing.iter().enumerate() {
        let name = if g.name.is_empty() { "(unnamed)" } else { &g.name };
        out.push_str(&format!("#{} {} - {} members\n", i + 1, name, g.member_count));
    }
    out.push_str("Send /join #<number> to ask to join.");
    out
}

fn parse_group_index(token: &str) -> Option<usize> {
    token.strip_prefix('#')?.parse::<usize>().ok()
}

fn usage_rejection(inv: &Invocation) -> HandlerError {
    HandlerError::Reject(Rejection::ValidationFailed {
        reason: format!("usage: {}", inv.spec.usage),
    })
}

fn group_by_index(state: &AppState, index: usize) -> Result<Arc<Group>, HandlerError> {
    let snapshot = state.roster.snapshot();
    Roster::group_by_index(&snapshot, index).ok_or_else(|| {
        HandlerError::Reject(Rejection::ValidationFailed {
            reason: format!("no group #{index}; send /groups for the current list"),
        })
    })
}

// ── join ────────────────────────────────────────────────────────

async fn join(
    state: &Arc<AppState>,
    msg: &InboundMessage,
    inv: &Invocation,
) -> Result<String, HandlerError> {
    let token = inv
        .args
        .split_whitespace()
        .next()
        .ok_or_else(|| usage_rejection(inv))?;
    let index = parse_group_index(token).ok_or_else(|| usage_rejection(inv))?;
    let group = group_by_index(state, index)?;

    if group.is_member(&msg.sender) {
        return Ok(format!("You are already a member of {}.", group.name));
    }

    let update = GroupUpdate {
        add_members: vec![msg.sender.clone()],
        ..GroupUpdate::default()
    };

    match state.api.update_group(&group.id, &update).await? {
        UpdateOutcome::Confirmed => {
            schedule_roster_refresh(state);
            Ok(format!("Added you to {}.", group.name))
        }
        UpdateOutcome::Unconfirmed => Ok(format!(
            "Your request to join {} went out, but the network did not confirm it in time. \
             It most likely went through; check again in a few minutes.",
            group.name
        )),
    }
}

// ── membership mutations ────────────────────────────────────────

enum MembershipAction {
    Add,
    Remove,
}

/// Target member plus an optional `#n` group index from the argument string.
/// A mention placeholder wins over typed identifiers; the identifier then
/// comes from the mention-span list, not the text.
fn parse_member_args(inv: &Invocation) -> Result<(MemberId, Option<usize>), HandlerError> {
    let index = inv
        .args
        .split_whitespace()
        .find_map(parse_group_index);

    if inv.args.contains(MENTION_PLACEHOLDER) {
        let Some(mention) = inv.mentions.first() else {
            return Err(HandlerError::Reject(Rejection::ValidationFailed {
                reason: "message carries a mention placeholder but no mention data".to_string(),
            }));
        };
        return Ok((mention.id.clone(), index));
    }

    let token = inv
        .args
        .split_whitespace()
        .find(|t| !t.starts_with('#'))
        .ok_or_else(|| usage_rejection(inv))?;
    let identifier = validate_arg(ArgClass::Identifier, token)?;
    Ok((MemberId(identifier), index))
}

fn resolve_target_group(
    state: &AppState,
    group: Option<&Arc<Group>>,
    index: Option<usize>,
    inv: &Invocation,
) -> Result<Arc<Group>, HandlerError> {
    if let Some(index) = index {
        return group_by_index(state, index);
    }
    group.cloned().ok_or_else(|| usage_rejection(inv))
}

async fn update_membership(
    state: &Arc<AppState>,
    group: Option<&Arc<Group>>,
    inv: &Invocation,
    action: MembershipAction,
) -> Result<String, HandlerError> {
    let (target, index) = parse_member_args(inv)?;
    let group = resolve_target_group(state, group, index, inv)?;

    let (update, verb) = match action {
        MembershipAction::Add => (
            GroupUpdate {
                add_members: vec![target.clone()],
                ..GroupUpdate::default()
            },
            "Added",
        ),
        MembershipAction::Remove => (
            GroupUpdate {
                remove_members: vec![target.clone()],
                ..GroupUpdate::default()
            },
            "Removed",
        ),
    };

    match state.api.update_group(&group.id, &update).await? {
        UpdateOutcome::Confirmed => {
            schedule_roster_refresh(state);
            let preposition = match action {
                MembershipAction::Add => "to",
                MembershipAction::Remove => "from",
            };
            Ok(format!("{verb} {target} {preposition} {}.", group.name))
        }
        UpdateOutcome::Unconfirmed => Ok(format!(
            "The change for {target} in {} was sent, but the network did not confirm it in time. \
             It most likely went through; the next sync will show the result. Do not repeat the \
             command blindly.",
            group.name
        )),
    }
}

async fn promote(
    state: &Arc<AppState>,
    group: Option<&Arc<Group>>,
    inv: &Invocation,
) -> Result<String, HandlerError> {
    let (target, _) = parse_member_args(inv)?;
    // group_only is enforced upstream; this is the message's own group.
    let group = group.cloned().ok_or_else(|| usage_rejection(inv))?;

    let update = GroupUpdate {
        add_admins: vec![target.clone()],
        ..GroupUpdate::default()
    };

    match state.api.update_group(&group.id, &update).await? {
        UpdateOutcome::Confirmed => {
            schedule_roster_refresh(state);
            Ok(format!("Promoted {target} to admin in {}.", group.name))
        }
        UpdateOutcome::Unconfirmed => Ok(format!(
            "The promotion of {target} in {} was sent but not confirmed in time; it most likely \
             went through.",
            group.name
        )),
    }
}

/// Mutations change remote state the cache cannot see; pull a fresh listing
/// soon instead of waiting out the full interval.
fn schedule_roster_refresh(state: &Arc<AppState>) {
    let roster = state.roster.clone();
    let api = state.api.clone();
    tokio::spawn(async move {
        if let Err(e) = roster.sync_once(&api).await {
            eprintln!("[SYNC] post-mutation refresh failed: {e}");
        }
    });
}

// ── AI completion ───────────────────────────────────────────────

async fn ai_command(
    state: &Arc<AppState>,
    msg: &InboundMessage,
    group: Option<&Arc<Group>>,
    inv: &Invocation,
) -> Result<String, HandlerError> {
    let head = validate_free_text_with_mentions(&inv.args)?;
    let mut prompt = head;
    if !inv.trailing.trim().is_empty() {
        if !prompt.is_empty() {
            prompt.push('\n');
        }
        prompt.push_str(&sanitize_text(&inv.trailing));
    }
    if prompt.trim().is_empty() {
        return Err(usage_rejection(inv));
    }

    Ok(ai_reply(state, msg, group, &prompt).await)
}

/// Ask the completion collaborator; failures are recoverable and replaced by
/// the configured fallback reply.
pub async fn ai_reply(
    state: &Arc<AppState>,
    msg: &InboundMessage,
    group: Option<&Arc<Group>>,
    prompt: &str,
) -> String {
    let ctx = UserContext {
        actor: msg.sender.0.clone(),
        actor_name: msg.sender_name.clone(),
        group_name: group.map(|g| g.name.clone()),
    };

    match state.ai.complete(prompt, &ctx).await {
        Ok(text) => text,
        Err(e) => {
            eprintln!("[AI] completion failed, using fallback: {e}");
            let _ = state
                .audit
                .write(AuditEvent::error(&msg.sender.0, "ai", &e.to_string()));
            state.cfg.ai_fallback_reply.clone()
        }
    }
}

// ── domain lookup ───────────────────────────────────────────────

fn lookup(state: &AppState, inv: &Invocation) -> Result<String, HandlerError> {
    let tokens: Vec<&str> = inv.args.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(usage_rejection(inv));
    }
    if tokens.len() > MAX_LOOKUP_BATCH {
        return Err(HandlerError::Reject(Rejection::ValidationFailed {
            reason: format!("at most {MAX_LOOKUP_BATCH} domains per lookup"),
        }));
    }

    let mut out = String::new();
    for token in tokens {
        let domain = validate_arg(ArgClass::Domain, token)?.to_lowercase();
        let approved = state.cfg.approved_domains.iter().any(|d| d == &domain);
        out.push_str(&format!(
            "{domain}: {}\n",
            if approved { "approved" } else { "not approved" }
        ));
    }
    Ok(out.trim_end().to_string())
}

// ── status ──────────────────────────────────────────────────────

async fn status(state: &Arc<AppState>) -> String {
    let transport = state.api.transport();

    let daemon_version = if transport.is_connected() {
        match state.api.version().await {
            Ok(v) => v,
            Err(e) => format!("unreachable ({})", e.class()),
        }
    } else {
        "unreachable".to_string()
    };

    let last_sync = state
        .roster
        .last_sync()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());

    format!(
        "Connection: {}\nDaemon version: {}\nPending calls: {}\nGroups cached: {}\nLast sync: {}",
        if transport.is_connected() { "up" } else { "down" },
        daemon_version,
        transport.pending_calls(),
        state.roster.snapshot().len(),
        last_sync
    )
}
