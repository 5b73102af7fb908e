//! Remote-call surface to the signal-cli daemon.
//!
//! The transport itself (socket, framing, correlation) lives in the
//! `sgb-signal-cli` adapter crate behind the [`Transport`] port. This module
//! owns the wire schemas and the typed method wrappers, including the
//! mutation-timeout policy.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::{
    domain::{GroupId, InboundMessage, MemberId, MentionSpan},
    errors::Error,
    groups::GroupIdNormalizer,
    Result,
};

/// Port for the correlated request/response connection.
///
/// One implementation: the signal-cli UNIX-socket adapter. `call` resolves
/// with the matched response payload or `Error::Timeout` after `timeout`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value>;

    fn is_connected(&self) -> bool;
    fn pending_calls(&self) -> usize;
}

// ── inbound notification schema ─────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "sourceNumber", default)]
    pub source_number: Option<String>,
    #[serde(rename = "sourceUuid", default)]
    pub source_uuid: Option<String>,
    #[serde(rename = "sourceName", default)]
    pub source_name: Option<String>,
    #[serde(rename = "dataMessage", default)]
    pub data_message: Option<DataMessage>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DataMessage {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "groupInfo", default)]
    pub group_info: Option<GroupInfo>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
}

#[derive(Debug, Deserialize)]
pub struct GroupInfo {
    #[serde(rename = "groupId", default)]
    pub group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Mention {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub length: usize,
}

impl Mention {
    fn identifier(&self) -> Option<String> {
        self.number
            .clone()
            .or_else(|| self.uuid.clone())
            .filter(|s| !s.is_empty())
    }
}

/// Convert a `receive` envelope into the dispatchable message model.
///
/// Returns `None` for envelopes without a text body (receipts, typing
/// indicators, reactions); those are not dispatchable work.
pub fn envelope_to_inbound(env: Envelope) -> Option<InboundMessage> {
    let sender = env
        .source_number
        .or(env.source_uuid)
        .filter(|s| !s.is_empty())?;

    let data = env.data_message?;
    let text = data.message.filter(|m| !m.is_empty())?;

    let mentions = data
        .mentions
        .iter()
        .filter_map(|m| {
            Some(MentionSpan {
                id: MemberId(m.identifier()?),
                start: m.start,
                length: m.length,
            })
        })
        .collect();

    Some(InboundMessage {
        sender: MemberId(sender),
        sender_name: env.source_name,
        group_id: data.group_info.and_then(|g| g.group_id),
        text,
        mentions,
        timestamp: env.timestamp,
    })
}

// ── group listing schema ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GroupEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "isMember", default = "default_true")]
    pub is_member: bool,
    #[serde(default)]
    pub members: Vec<MemberEntry>,
    #[serde(default)]
    pub admins: Vec<MemberEntry>,
}

#[derive(Debug, Deserialize)]
pub struct MemberEntry {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
}

impl MemberEntry {
    pub fn identifier(&self) -> Option<String> {
        self.number
            .clone()
            .or_else(|| self.uuid.clone())
            .filter(|s| !s.is_empty())
    }
}

fn default_true() -> bool {
    true
}

// ── typed method wrappers ───────────────────────────────────────

/// Outcome of a group-membership mutation.
///
/// The external process frequently completes `updateGroup` after the
/// correlation window closes, so a timeout is reported as an explicit
/// unconfirmed status instead of a failure. Callers must not retry blindly;
/// the next membership sync is the source of truth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Confirmed,
    Unconfirmed,
}

/// One combined membership mutation, any subset of the three lists.
#[derive(Clone, Debug, Default)]
pub struct GroupUpdate {
    pub add_members: Vec<MemberId>,
    pub remove_members: Vec<MemberId>,
    pub add_admins: Vec<MemberId>,
}

impl GroupUpdate {
    pub fn is_empty(&self) -> bool {
        self.add_members.is_empty() && self.remove_members.is_empty() && self.add_admins.is_empty()
    }
}

/// Typed wrapper over the raw transport for the methods this daemon consumes.
#[derive(Clone)]
pub struct SignalApi {
    transport: Arc<dyn Transport>,
    normalizer: Arc<GroupIdNormalizer>,
    account: String,
    call_timeout: Duration,
    mutation_timeout: Duration,
}

impl SignalApi {
    pub fn new(
        transport: Arc<dyn Transport>,
        normalizer: Arc<GroupIdNormalizer>,
        account: impl Into<String>,
        call_timeout: Duration,
        mutation_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            normalizer,
            account: account.into(),
            call_timeout,
            mutation_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Read-only health probe. Timeout is a hard failure.
    pub async fn version(&self) -> Result<String> {
        let result = self
            .transport
            .call("version", json!({ "account": &self.account }), self.call_timeout)
            .await?;
        Ok(result
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    pub async fn send_direct(&self, to: &MemberId, text: &str) -> Result<()> {
        let params = json!({
            "account": &self.account,
            "recipient": [to.0],
            "message": text,
        });
        self.transport.call("send", params, self.call_timeout).await?;
        Ok(())
    }

    pub async fn send_group(&self, group: &GroupId, text: &str) -> Result<()> {
        let params = json!({
            "account": &self.account,
            "groupId": self.normalizer.prefixed_format(group),
            "message": text,
        });
        self.transport.call("send", params, self.call_timeout).await?;
        Ok(())
    }

    /// Full group listing. Timeout is a hard failure (the caller keeps its
    /// previous snapshot).
    pub async fn list_groups(&self, detailed: bool) -> Result<Vec<GroupEntry>> {
        let params = json!({ "account": &self.account, "detailed": detailed });
        let result = self
            .transport
            .call("listGroups", params, self.call_timeout)
            .await?;
        serde_json::from_value(result).map_err(Error::Json)
    }

    /// Combined membership mutation. A timeout here is ambiguous success:
    /// reported as `Unconfirmed`, never as a failure and never retried.
    pub async fn update_group(
        &self,
        group: &GroupId,
        update: &GroupUpdate,
    ) -> Result<UpdateOutcome> {
        if update.is_empty() {
            return Ok(UpdateOutcome::Confirmed);
        }

        let mut params = json!({
            "account": &self.account,
            "groupId": self.normalizer.prefixed_format(group),
        });
        if !update.add_members.is_empty() {
            params["addMembers"] = ids_json(&update.add_members);
        }
        if !update.remove_members.is_empty() {
            params["removeMembers"] = ids_json(&update.remove_members);
        }
        if !update.add_admins.is_empty() {
            params["addAdmins"] = ids_json(&update.add_admins);
        }

        match self
            .transport
            .call("updateGroup", params, self.mutation_timeout)
            .await
        {
            Ok(_) => Ok(UpdateOutcome::Confirmed),
            Err(Error::Timeout { method }) => {
                eprintln!("[RPC] {method} timed out; treating as unconfirmed success");
                Ok(UpdateOutcome::Unconfirmed)
            }
            Err(e) => Err(e),
        }
    }
}

fn ids_json(ids: &[MemberId]) -> serde_json::Value {
    serde_json::Value::Array(
        ids.iter()
            .map(|m| serde_json::Value::String(m.0.clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTransport {
        fail_with_timeout: bool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn call(
            &self,
            method: &str,
            _params: serde_json::Value,
            _timeout: Duration,
        ) -> Result<serde_json::Value> {
            if self.fail_with_timeout {
                return Err(Error::Timeout {
                    method: method.to_string(),
                });
            }
            Ok(json!({}))
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn pending_calls(&self) -> usize {
            0
        }
    }

    fn api(fail_with_timeout: bool) -> SignalApi {
        SignalApi::new(
            Arc::new(FakeTransport { fail_with_timeout }),
            Arc::new(GroupIdNormalizer::new()),
            "+491700000001",
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
    }

    fn sample_group() -> GroupId {
        use base64::{engine::general_purpose::STANDARD, Engine};
        GroupId(STANDARD.encode([1u8; 32]))
    }

    #[tokio::test]
    async fn mutation_timeout_is_unconfirmed_success() {
        let api = api(true);
        let update = GroupUpdate {
            add_members: vec![MemberId("+491700000002".to_string())],
            ..GroupUpdate::default()
        };
        let outcome = api.update_group(&sample_group(), &update).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Unconfirmed);
    }

    #[tokio::test]
    async fn read_timeout_is_a_hard_failure() {
        let api = api(true);
        let err = api.list_groups(true).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn empty_update_is_a_no_op() {
        let api = api(true);
        let outcome = api
            .update_group(&sample_group(), &GroupUpdate::default())
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Confirmed);
    }

    #[test]
    fn envelope_with_text_converts() {
        let env: Envelope = serde_json::from_value(json!({
            "sourceNumber": "+491700000002",
            "sourceName": "Ada",
            "dataMessage": {
                "message": "hello",
                "groupInfo": { "groupId": "group.abcd" },
                "mentions": [{ "uuid": "11111111-2222-3333-4444-555555555555", "start": 0, "length": 1 }]
            },
            "timestamp": 1700000000000u64
        }))
        .unwrap();

        let msg = envelope_to_inbound(env).unwrap();
        assert_eq!(msg.sender.0, "+491700000002");
        assert_eq!(msg.group_id.as_deref(), Some("group.abcd"));
        assert_eq!(msg.mentions.len(), 1);
    }

    #[test]
    fn receipt_envelope_is_not_dispatchable() {
        let env: Envelope = serde_json::from_value(json!({
            "sourceNumber": "+491700000002",
            "timestamp": 1700000000000u64
        }))
        .unwrap();
        assert!(envelope_to_inbound(env).is_none());
    }
}
