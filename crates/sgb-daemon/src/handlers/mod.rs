//! Inbound message handling.
//!
//! Every message runs the same lifecycle: classify, gate (validation,
//! permissions, rate limit), execute, reply, record usage. Handler failures
//! are converted to user-facing rejections here and never reach the
//! transport read loop.

use std::{sync::Arc, time::Instant};

use sgb_core::{
    audit::AuditEvent,
    dispatch::{classify, evaluate, gate_natural_text, Classified, Decision, DispatchContext, Rejection},
    domain::InboundMessage,
    gateway::UsageRecord,
    roster::Group,
    security::ValidationFailure,
};

use crate::router::AppState;

pub mod commands;

/// Failures inside a command handler: either a typed user-facing rejection
/// or an internal error (audited, generic reply).
#[derive(Debug)]
pub enum HandlerError {
    Reject(Rejection),
    Internal(sgb_core::Error),
}

impl From<ValidationFailure> for HandlerError {
    fn from(v: ValidationFailure) -> Self {
        HandlerError::Reject(Rejection::ValidationFailed { reason: v.reason })
    }
}

impl From<sgb_core::Error> for HandlerError {
    fn from(e: sgb_core::Error) -> Self {
        HandlerError::Internal(e)
    }
}

pub async fn handle_inbound(state: Arc<AppState>, msg: InboundMessage) {
    let group = msg
        .group_id
        .as_deref()
        .and_then(|raw| state.roster.resolve_raw(raw));

    let _ = state
        .audit
        .write(AuditEvent::message(&msg.sender.0, &msg.text));

    match classify(&msg.text) {
        Classified::Command(parsed) => handle_command(state, msg, group, parsed).await,
        Classified::NaturalText(_) => handle_natural_text(state, msg, group).await,
    }
}

fn dispatch_context(state: &AppState, msg: &InboundMessage, group: Option<&Arc<Group>>) -> DispatchContext {
    DispatchContext {
        sender: msg.sender.clone(),
        is_direct: msg.is_direct(),
        in_known_group: group.is_some(),
        sender_is_admin: group.map(|g| g.is_admin(&msg.sender)).unwrap_or(false),
        sender_is_operator: state.cfg.is_operator(&msg.sender.0),
    }
}

async fn handle_command(
    state: Arc<AppState>,
    msg: InboundMessage,
    group: Option<Arc<Group>>,
    parsed: sgb_core::security::ParsedCommand,
) {
    let command_name = parsed.name.clone();
    let ctx = dispatch_context(&state, &msg, group.as_ref());

    let decision = {
        let mut limiter = state.rate_limiter.lock().await;
        evaluate(&state.registry, &mut limiter, &ctx, parsed, &msg)
    };

    match decision {
        Decision::Reject(rejection) => {
            record_rejection(&state, &msg, &command_name, &rejection, 0);
            reply(&state, &msg, group.as_ref(), &rejection.user_message()).await;
        }
        Decision::Run(invocation) => {
            let started = Instant::now();
            let outcome = commands::run(&state, &msg, group.as_ref(), &invocation).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(text) => {
                    let _ = state.gateway.record_usage(UsageRecord::new(
                        invocation.spec.name,
                        &msg.sender.0,
                        true,
                        latency_ms,
                    ));
                    reply(&state, &msg, group.as_ref(), &text).await;
                }
                Err(HandlerError::Reject(rejection)) => {
                    record_rejection(&state, &msg, &command_name, &rejection, latency_ms);
                    reply(&state, &msg, group.as_ref(), &rejection.user_message()).await;
                }
                Err(HandlerError::Internal(e)) => {
                    // Internal detail goes to the audit log only.
                    let _ = state
                        .audit
                        .write(AuditEvent::error(&msg.sender.0, &command_name, &e.to_string()));
                    let _ = state.gateway.record_usage(
                        UsageRecord::new(invocation.spec.name, &msg.sender.0, false, latency_ms)
                            .with_error(e.class()),
                    );
                    reply(
                        &state,
                        &msg,
                        group.as_ref(),
                        "Something went wrong handling that command. The error has been logged.",
                    )
                    .await;
                }
            }
        }
    }
}

async fn handle_natural_text(
    state: Arc<AppState>,
    msg: InboundMessage,
    group: Option<Arc<Group>>,
) {
    // Natural text in groups is other people's conversation, not bot input.
    if !msg.is_direct() {
        return;
    }

    let ctx = dispatch_context(&state, &msg, group.as_ref());
    let gate = {
        let mut limiter = state.rate_limiter.lock().await;
        gate_natural_text(&mut limiter, &ctx)
    };
    if let Some(rejection) = gate {
        record_rejection(&state, &msg, "ai", &rejection, 0);
        reply(&state, &msg, None, &rejection.user_message()).await;
        return;
    }

    let started = Instant::now();
    let text = commands::ai_reply(&state, &msg, None, &msg.text).await;
    let _ = state.gateway.record_usage(UsageRecord::new(
        "ai",
        &msg.sender.0,
        true,
        started.elapsed().as_millis() as u64,
    ));
    reply(&state, &msg, None, &text).await;
}

fn record_rejection(
    state: &AppState,
    msg: &InboundMessage,
    command: &str,
    rejection: &Rejection,
    latency_ms: u64,
) {
    match rejection {
        Rejection::RateLimited { retry_after } => {
            let _ = state.audit.write(AuditEvent::rate_limit(
                &msg.sender.0,
                command,
                retry_after.as_secs_f64(),
            ));
        }
        other => {
            let _ = state.audit.write(AuditEvent::rejection(
                &msg.sender.0,
                command,
                other.class(),
            ));
        }
    }

    // Unknown commands are outside the registry and only audited; everything
    // else also gets a usage record.
    if state.registry.find(command).is_some() {
        let _ = state.gateway.record_usage(
            UsageRecord::new(command, &msg.sender.0, false, latency_ms)
                .with_error(rejection.class()),
        );
    }
}

/// Reply where the message came from: the group, or the sender's DM.
async fn reply(state: &AppState, msg: &InboundMessage, group: Option<&Arc<Group>>, text: &str) {
    let result = match group {
        Some(g) => state.api.send_group(&g.id, text).await,
        None => state.api.send_direct(&msg.sender, text).await,
    };
    if let Err(e) = result {
        eprintln!("[DISPATCH] reply failed: {e}");
        let _ = state
            .audit
            .write(AuditEvent::transport(&format!("reply failed: {e}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{path::PathBuf, sync::Mutex as StdMutex, time::Duration};

    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde_json::json;

    use sgb_core::{
        ai::NoCompletion,
        audit::AuditLogger,
        commands::CommandRegistry,
        config::Config,
        domain::{MemberId, MentionSpan},
        gateway::SecureGateway,
        groups::GroupIdNormalizer,
        roster::Roster,
        rpc::{SignalApi, Transport},
        security::{RateLimiter, RateLimits, MENTION_PLACEHOLDER},
        Error, Result,
    };

    const OPERATOR: &str = "+491700000009";

    struct FakeTransport {
        calls: StdMutex<Vec<(String, serde_json::Value)>>,
        groups_json: serde_json::Value,
        update_times_out: bool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn call(
            &self,
            method: &str,
            params: serde_json::Value,
            _timeout: Duration,
        ) -> Result<serde_json::Value> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params));
            match method {
                "updateGroup" if self.update_times_out => Err(Error::Timeout {
                    method: method.to_string(),
                }),
                "listGroups" => Ok(self.groups_json.clone()),
                "version" => Ok(json!({ "version": "0.13.4" })),
                _ => Ok(json!({})),
            }
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn pending_calls(&self) -> usize {
            0
        }
    }

    impl FakeTransport {
        fn sends(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == "send")
                .filter_map(|(_, p)| p.get("message").and_then(|m| m.as_str()).map(String::from))
                .collect()
        }

        fn updates(&self) -> Vec<serde_json::Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == "updateGroup")
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    fn tmp_base(prefix: &str) -> String {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        format!("/tmp/{prefix}-{}-{ts}", std::process::id())
    }

    fn test_config(base: &str) -> Config {
        Config {
            account: "+491700000001".to_string(),
            data_dir: PathBuf::from("/tmp"),
            socket_path: PathBuf::from(format!("{base}.sock")),
            operators: vec![OPERATOR.to_string()],
            call_timeout: Duration::from_millis(200),
            mutation_timeout: Duration::from_millis(200),
            sync_interval: Duration::from_secs(300),
            rate_limit_enabled: true,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_general: 20,
            rate_limit_ai: 5,
            rate_limit_mutation: 4,
            rate_limit_lookup: 3,
            ai_api_url: None,
            ai_api_key: None,
            ai_model: "test-model".to_string(),
            ai_fallback_reply: "fallback reply".to_string(),
            approved_domains: vec!["example.org".to_string()],
            usage_log_path: PathBuf::from(format!("{base}-usage.log")),
            audit_log_path: PathBuf::from(format!("{base}-audit.log")),
            audit_log_json: true,
            pid_file: PathBuf::from(format!("{base}.pid")),
            stop_file: PathBuf::from(format!("{base}.stop")),
        }
    }

    fn raw_group_id(seed: u8) -> String {
        STANDARD.encode([seed; 32])
    }

    fn member_number(seed: u8, i: usize) -> String {
        format!("+4917000{seed:02}{i:03}")
    }

    fn group_json(seed: u8, name: &str, member_count: usize) -> serde_json::Value {
        let members: Vec<serde_json::Value> = (0..member_count)
            .map(|i| json!({ "number": member_number(seed, i) }))
            .collect();
        json!({
            "id": raw_group_id(seed),
            "name": name,
            "isMember": true,
            "members": members,
            "admins": [{ "number": member_number(seed, 0) }],
        })
    }

    async fn test_state(
        prefix: &str,
        groups: Vec<serde_json::Value>,
        update_times_out: bool,
    ) -> (Arc<AppState>, Arc<FakeTransport>) {
        let base = tmp_base(prefix);
        let cfg = Arc::new(test_config(&base));

        let fake = Arc::new(FakeTransport {
            calls: StdMutex::new(Vec::new()),
            groups_json: serde_json::Value::Array(groups),
            update_times_out,
        });

        let normalizer = Arc::new(GroupIdNormalizer::new());
        let roster = Arc::new(Roster::new(normalizer.clone()));
        let api = SignalApi::new(
            fake.clone(),
            normalizer,
            cfg.account.clone(),
            cfg.call_timeout,
            cfg.mutation_timeout,
        );

        let registry = Arc::new(CommandRegistry::builtin());
        let gateway = Arc::new(SecureGateway::new(
            cfg.usage_log_path.clone(),
            registry.names(),
        ));
        let audit = Arc::new(AuditLogger::new(cfg.audit_log_path.clone(), true));
        let rate_limiter = Arc::new(tokio::sync::Mutex::new(RateLimiter::new(RateLimits {
            enabled: cfg.rate_limit_enabled,
            window: cfg.rate_limit_window,
            general: cfg.rate_limit_general,
            ai: cfg.rate_limit_ai,
            mutation: cfg.rate_limit_mutation,
            lookup: cfg.rate_limit_lookup,
        })));

        let state = Arc::new(AppState {
            cfg,
            api,
            roster,
            registry,
            rate_limiter,
            gateway,
            audit,
            ai: Arc::new(NoCompletion),
        });

        // Prime the roster from the scripted listing.
        state.roster.sync_once(&state.api).await.unwrap();
        fake.calls.lock().unwrap().clear();

        (state, fake)
    }

    fn dm(sender: &str, text: &str) -> InboundMessage {
        InboundMessage {
            sender: MemberId(sender.to_string()),
            sender_name: None,
            group_id: None,
            text: text.to_string(),
            mentions: vec![],
            timestamp: Some(1_700_000_000_000),
        }
    }

    fn group_message(sender: &str, seed: u8, text: &str) -> InboundMessage {
        InboundMessage {
            group_id: Some(raw_group_id(seed)),
            ..dm(sender, text)
        }
    }

    #[tokio::test]
    async fn listing_and_index_commands_share_one_ordering() {
        let (state, fake) = test_state(
            "sgb-h-order",
            vec![
                group_json(1, "gardening", 4),
                group_json(2, "chess", 8),
                group_json(3, "cooking", 6),
            ],
            false,
        )
        .await;

        handle_inbound(state.clone(), dm(OPERATOR, "/groups")).await;
        let listing = fake.sends().pop().unwrap();

        let ordered = state.roster.ordered_groups();
        for (i, g) in ordered.iter().enumerate() {
            assert!(listing.contains(&format!("#{} {}", i + 1, g.name)));
        }
        // Largest group first.
        assert!(listing.contains("#1 chess"));

        // "add to group #3" resolves position 3 of that same ordering.
        handle_inbound(state.clone(), dm(OPERATOR, "/add +491700000055 #3")).await;
        let updates = fake.updates();
        assert_eq!(updates.len(), 1);
        let expected = state.roster.normalizer().prefixed_format(&ordered[2].id);
        assert_eq!(updates[0]["groupId"], json!(expected));
        assert_eq!(updates[0]["addMembers"], json!(["+491700000055"]));
    }

    #[tokio::test]
    async fn unknown_command_points_at_help() {
        let (state, fake) = test_state("sgb-h-unknown", vec![], false).await;
        handle_inbound(state, dm(OPERATOR, "/frobnicate now")).await;
        let replies = fake.sends();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("/help"));
    }

    #[tokio::test]
    async fn plain_member_cannot_mutate_membership() {
        let (state, fake) = test_state("sgb-h-perm", vec![group_json(1, "gardening", 4)], false).await;

        // Member 001 is not the admin (000 is).
        let msg = group_message(&member_number(1, 1), 1, "/remove +491700001002");
        handle_inbound(state, msg).await;

        assert!(fake.updates().is_empty());
        let replies = fake.sends();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("not permitted"));
    }

    #[tokio::test]
    async fn group_admin_can_remove_a_member() {
        let (state, fake) = test_state("sgb-h-admin", vec![group_json(1, "gardening", 4)], false).await;

        let msg = group_message(&member_number(1, 0), 1, "/remove +491700001002");
        handle_inbound(state, msg).await;

        let updates = fake.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["removeMembers"], json!(["+491700001002"]));
        assert!(fake.sends().last().unwrap().contains("Removed"));
    }

    #[tokio::test]
    async fn mutation_timeout_reports_unconfirmed_not_failure() {
        let (state, fake) = test_state("sgb-h-unconf", vec![group_json(1, "gardening", 4)], true).await;

        let msg = group_message(&member_number(1, 0), 1, "/add +491700000055");
        handle_inbound(state, msg).await;

        let replies = fake.sends();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("did not confirm"));
        assert!(!replies[0].contains("went wrong"));
    }

    #[tokio::test]
    async fn mention_span_supplies_the_target_identifier() {
        let (state, fake) = test_state("sgb-h-mention", vec![group_json(1, "gardening", 4)], false).await;

        let mut msg = group_message(&member_number(1, 0), 1, &format!("/add {MENTION_PLACEHOLDER}"));
        msg.mentions = vec![MentionSpan {
            id: MemberId("+491700000077".to_string()),
            start: 5,
            length: 1,
        }];
        handle_inbound(state, msg).await;

        let updates = fake.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["addMembers"], json!(["+491700000077"]));
    }

    #[tokio::test]
    async fn natural_group_text_is_ignored() {
        let (state, fake) = test_state("sgb-h-chatter", vec![group_json(1, "gardening", 4)], false).await;
        handle_inbound(state, group_message(&member_number(1, 1), 1, "lovely weather")).await;
        assert!(fake.sends().is_empty());
    }

    #[tokio::test]
    async fn natural_dm_gets_the_fallback_reply_when_ai_fails() {
        let (state, fake) = test_state("sgb-h-fallback", vec![], false).await;
        handle_inbound(state, dm("+491700000002", "what is the meeting time?")).await;
        let replies = fake.sends();
        assert_eq!(replies, vec!["fallback reply".to_string()]);
    }

    #[tokio::test]
    async fn mutation_ceiling_rejects_the_fifth_call_in_the_window() {
        let (state, fake) = test_state("sgb-h-ratelimit", vec![group_json(1, "gardening", 9)], false).await;

        for i in 0..4 {
            let msg = dm(OPERATOR, &format!("/add +4917000001{i:02} #1"));
            handle_inbound(state.clone(), msg).await;
        }
        assert_eq!(fake.updates().len(), 4);

        handle_inbound(state, dm(OPERATOR, "/add +491700000199 #1")).await;
        assert_eq!(fake.updates().len(), 4);
        assert!(fake.sends().last().unwrap().contains("Too many requests"));
    }

    #[tokio::test]
    async fn lookup_reports_each_domain_distinctly() {
        let (state, fake) = test_state("sgb-h-lookup", vec![], false).await;
        handle_inbound(state, dm(OPERATOR, "/lookup example.org other.net")).await;
        let reply = fake.sends().pop().unwrap();
        assert!(reply.contains("example.org: approved"));
        assert!(reply.contains("other.net: not approved"));
    }

    #[tokio::test]
    async fn invalid_domain_fails_validation_with_a_typed_message() {
        let (state, fake) = test_state("sgb-h-baddomain", vec![], false).await;
        handle_inbound(state, dm(OPERATOR, "/lookup not_a_domain")).await;
        let reply = fake.sends().pop().unwrap();
        assert!(reply.contains("Invalid input"));
    }

    #[tokio::test]
    async fn successful_commands_write_usage_records() {
        let (state, fake) = test_state("sgb-h-usage", vec![group_json(1, "gardening", 4)], false).await;
        let usage_path = state.cfg.usage_log_path.clone();

        handle_inbound(state, dm(OPERATOR, "/groups")).await;
        assert_eq!(fake.sends().len(), 1);

        let written = std::fs::read_to_string(usage_path).unwrap();
        assert!(written.contains("\"command\":\"groups\""));
        assert!(written.contains("\"success\":true"));
    }

    #[tokio::test]
    async fn join_resolves_the_listing_index() {
        let (state, fake) = test_state(
            "sgb-h-join",
            vec![group_json(1, "gardening", 4), group_json(2, "chess", 8)],
            false,
        )
        .await;

        handle_inbound(state.clone(), dm("+491700000002", "/join #2")).await;

        let updates = fake.updates();
        assert_eq!(updates.len(), 1);
        // #2 is the smaller group (gardening, 4 members).
        let ordered = state.roster.ordered_groups();
        let expected = state.roster.normalizer().prefixed_format(&ordered[1].id);
        assert_eq!(updates[0]["groupId"], json!(expected));
        assert_eq!(updates[0]["addMembers"], json!(["+491700000002"]));
    }

    #[tokio::test]
    async fn multi_line_messages_only_run_the_first_line() {
        let (state, fake) = test_state("sgb-h-multiline", vec![group_json(1, "gardening", 9)], false).await;

        let msg = dm(OPERATOR, "/add +491700000055 #1\n/add +491700000056 #1");
        handle_inbound(state, msg).await;

        // One mutation, not two: the second line is trailing context.
        assert_eq!(fake.updates().len(), 1);
    }
}

