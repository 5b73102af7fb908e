//! Membership roster: the best-known member/admin snapshot per group.
//!
//! Refreshed by a periodic full listing, never incrementally. A sync replaces
//! each group's sets wholesale; a failed sync keeps the previous snapshot and
//! lets the next tick retry.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};

use crate::{
    domain::{GroupId, MemberId},
    groups::GroupIdNormalizer,
    rpc::{GroupEntry, SignalApi},
    Result,
};

#[derive(Clone, Debug)]
pub struct Member {
    pub id: MemberId,
    pub name: Option<String>,
    pub admin: bool,
}

#[derive(Clone, Debug)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub members: Vec<Member>,
    pub member_count: usize,
    pub last_sync: DateTime<Utc>,
}

impl Group {
    pub fn is_member(&self, id: &MemberId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    pub fn is_admin(&self, id: &MemberId) -> bool {
        self.members.iter().any(|m| &m.id == id && m.admin)
    }
}

type Snapshot = Arc<HashMap<GroupId, Arc<Group>>>;

/// Read-mostly snapshot store. Writers build a complete replacement map and
/// swap it in; readers clone the `Arc` and work on a consistent view.
pub struct Roster {
    normalizer: Arc<GroupIdNormalizer>,
    snapshot: RwLock<Snapshot>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
}

impl Roster {
    pub fn new(normalizer: Arc<GroupIdNormalizer>) -> Self {
        Self {
            normalizer,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            last_sync: RwLock::new(None),
        }
    }

    pub fn normalizer(&self) -> &Arc<GroupIdNormalizer> {
        &self.normalizer
    }

    /// The current consistent view. Cheap; callers that need the listing and
    /// index resolution to agree must take one snapshot and use it for both.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: &GroupId) -> Option<Arc<Group>> {
        self.snapshot().get(id).cloned()
    }

    /// Resolve a raw (unnormalized) group id to its cached group.
    pub fn resolve_raw(&self, raw: &str) -> Option<Arc<Group>> {
        let id = self.normalizer.normalize(raw)?;
        self.get(&id)
    }

    /// The single deterministic ordering shared by the listing command and
    /// every index-accepting command: descending member count, ties broken by
    /// canonical id.
    pub fn ordered_groups(&self) -> Vec<Arc<Group>> {
        ordered(&self.snapshot())
    }

    /// Resolve a one-based listing index against a snapshot.
    pub fn group_by_index(snapshot: &Snapshot, index: usize) -> Option<Arc<Group>> {
        if index == 0 {
            return None;
        }
        ordered(snapshot).into_iter().nth(index - 1)
    }

    /// Replace the whole snapshot from a fresh listing. Entries the listing
    /// no longer contains are dropped; nothing is merged field-by-field.
    pub fn apply_listing(&self, entries: Vec<GroupEntry>) -> usize {
        let now = Utc::now();
        let mut next: HashMap<GroupId, Arc<Group>> = HashMap::new();

        for entry in entries {
            if !entry.is_member {
                continue;
            }
            let Some(raw_id) = entry.id.as_deref() else {
                continue;
            };
            let Some(id) = self.normalizer.normalize(raw_id) else {
                continue;
            };

            let admins: Vec<String> = entry
                .admins
                .iter()
                .filter_map(|a| a.identifier())
                .collect();

            let members: Vec<Member> = entry
                .members
                .iter()
                .filter_map(|m| {
                    let ident = m.identifier()?;
                    Some(Member {
                        admin: admins.iter().any(|a| a == &ident),
                        id: MemberId(ident),
                        name: None,
                    })
                })
                .collect();

            let member_count = members.len();
            next.insert(
                id.clone(),
                Arc::new(Group {
                    id,
                    name: entry.name.unwrap_or_default(),
                    members,
                    member_count,
                    last_sync: now,
                }),
            );
        }

        let count = next.len();
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
        *self.last_sync.write().unwrap_or_else(|e| e.into_inner()) = Some(now);
        count
    }

    /// One full sync against the daemon. On failure the previous snapshot is
    /// left intact; the caller's next tick is the retry.
    pub async fn sync_once(&self, api: &SignalApi) -> Result<usize> {
        let entries = api.list_groups(true).await?;
        Ok(self.apply_listing(entries))
    }
}

fn ordered(snapshot: &Snapshot) -> Vec<Arc<Group>> {
    let mut groups: Vec<Arc<Group>> = snapshot.values().cloned().collect();
    groups.sort_by(|a, b| {
        b.member_count
            .cmp(&a.member_count)
            .then_with(|| a.id.cmp(&b.id))
    });
    groups
}
