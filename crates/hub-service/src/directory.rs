//! Session directory: the hub's authoritative view of rooms.
//!
//! The directory is plain data. It is owned by the `HubActor` and never
//! shared, so every mutation is serialized by the hub mailbox. Each operation
//! returns an outcome describing who must be notified; the actor turns those
//! outcomes into events.
//!
//! Invariants:
//! - A room exists only while it has at least one member.
//! - A room's share owner, if set, is a current member of that room.

use crate::errors::HubError;

use common::protocol::{PeerInfo, ShareState};
use common::types::{display_name_or_default, ParticipantId, RoomId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Registered screen-share owner of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareOwner {
    pub id: ParticipantId,
    pub name: String,
}

#[derive(Debug)]
struct Room {
    /// Members and the display name each joined with.
    members: BTreeMap<ParticipantId, String>,
    share_owner: Option<ShareOwner>,
    created_at: i64,
}

impl Room {
    fn share_state(&self) -> ShareState {
        self.share_owner
            .as_ref()
            .map(|owner| ShareState::owned_by(owner.id, owner.name.clone()))
            .unwrap_or_default()
    }

    fn member_ids(&self) -> Vec<ParticipantId> {
        self.members.keys().copied().collect()
    }
}

/// Result of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room_id: RoomId,
    /// Display name stored for the joiner (blank names become "Guest").
    pub name: String,
    /// Members other than the joiner.
    pub peers: Vec<PeerInfo>,
    pub share: ShareState,
    /// False when the participant was already a member.
    pub newly_joined: bool,
    pub room_created: bool,
}

/// Result of removing a participant from one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    /// Members still in the room, to be told about the departure.
    pub remaining: Vec<ParticipantId>,
    /// The leaver owned the share and it was cleared.
    pub share_cleared: bool,
    pub room_removed: bool,
}

/// Result of a share start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareStartOutcome {
    pub owner: ShareOwner,
    /// Owner that was overwritten, if any.
    pub previous: Option<ShareOwner>,
    /// Every member of the room, including the new owner.
    pub members: Vec<ParticipantId>,
}

/// Point-in-time view of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub members: Vec<PeerInfo>,
    pub share: ShareState,
    pub created_at: i64,
}

/// Rooms, their members and share ownership.
#[derive(Debug, Default)]
pub struct SessionDirectory {
    rooms: BTreeMap<RoomId, Room>,
    memberships: HashMap<ParticipantId, BTreeSet<RoomId>>,
}

impl SessionDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `participant` to `room_id`, creating the room if needed.
    ///
    /// Joining a room the participant is already in updates the stored name
    /// and reports `newly_joined = false`.
    pub fn join(&mut self, participant: ParticipantId, room_id: &RoomId, name: &str) -> JoinOutcome {
        let name = display_name_or_default(name);
        let room_created = !self.rooms.contains_key(room_id);

        let room = self.rooms.entry(room_id.clone()).or_insert_with(|| Room {
            members: BTreeMap::new(),
            share_owner: None,
            created_at: chrono::Utc::now().timestamp(),
        });

        let newly_joined = room.members.insert(participant, name.clone()).is_none();

        let peers = room
            .members
            .iter()
            .filter(|(id, _)| **id != participant)
            .map(|(id, member_name)| PeerInfo {
                id: *id,
                name: member_name.clone(),
            })
            .collect();
        let share = room.share_state();

        self.memberships
            .entry(participant)
            .or_default()
            .insert(room_id.clone());

        JoinOutcome {
            room_id: room_id.clone(),
            name,
            peers,
            share,
            newly_joined,
            room_created,
        }
    }

    /// Remove `participant` from one room.
    ///
    /// Returns `None` if the participant was not a member.
    pub fn leave(&mut self, participant: ParticipantId, room_id: &RoomId) -> Option<LeaveOutcome> {
        let room = self.rooms.get_mut(room_id)?;
        room.members.remove(&participant)?;

        let share_cleared = room
            .share_owner
            .as_ref()
            .is_some_and(|owner| owner.id == participant);
        if share_cleared {
            room.share_owner = None;
        }

        let remaining = room.member_ids();
        let room_removed = remaining.is_empty();
        if room_removed {
            self.rooms.remove(room_id);
        }

        if let Some(rooms) = self.memberships.get_mut(&participant) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                self.memberships.remove(&participant);
            }
        }

        Some(LeaveOutcome {
            room_id: room_id.clone(),
            remaining,
            share_cleared,
            room_removed,
        })
    }

    /// Remove `participant` from every room it belongs to.
    pub fn remove_participant(&mut self, participant: ParticipantId) -> Vec<LeaveOutcome> {
        let rooms = self
            .memberships
            .get(&participant)
            .cloned()
            .unwrap_or_default();

        rooms
            .iter()
            .filter_map(|room_id| self.leave(participant, room_id))
            .collect()
    }

    /// Make `participant` the share owner of `room_id`, overwriting any
    /// current owner.
    ///
    /// # Errors
    ///
    /// - `HubError::RoomNotFound` if the room does not exist
    /// - `HubError::NotMember` if the participant is not in the room
    pub fn start_share(
        &mut self,
        participant: ParticipantId,
        room_id: &RoomId,
        name: &str,
    ) -> Result<ShareStartOutcome, HubError> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| HubError::RoomNotFound(room_id.to_string()))?;

        let member_name = room
            .members
            .get(&participant)
            .ok_or_else(|| HubError::NotMember(room_id.to_string()))?;

        let name = if name.trim().is_empty() {
            member_name.clone()
        } else {
            display_name_or_default(name)
        };

        let owner = ShareOwner {
            id: participant,
            name,
        };
        let previous = room.share_owner.replace(owner.clone());

        Ok(ShareStartOutcome {
            owner,
            previous,
            members: room.member_ids(),
        })
    }

    /// Clear the share owner of `room_id` if `participant` holds it.
    ///
    /// Returns the members to notify, or `None` when nothing changed.
    pub fn stop_share(&mut self, participant: ParticipantId, room_id: &RoomId) -> Option<Vec<ParticipantId>> {
        let room = self.rooms.get_mut(room_id)?;
        let is_owner = room
            .share_owner
            .as_ref()
            .is_some_and(|owner| owner.id == participant);
        if !is_owner {
            return None;
        }

        room.share_owner = None;
        Some(room.member_ids())
    }

    /// Ids of every non-empty room, sorted.
    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }

    /// Members of a room (empty if the room does not exist).
    #[must_use]
    pub fn members(&self, room_id: &RoomId) -> Vec<ParticipantId> {
        self.rooms
            .get(room_id)
            .map(Room::member_ids)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn share_owner(&self, room_id: &RoomId) -> Option<&ShareOwner> {
        self.rooms.get(room_id)?.share_owner.as_ref()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Snapshot every room for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        self.rooms
            .iter()
            .map(|(room_id, room)| RoomSnapshot {
                room_id: room_id.clone(),
                members: room
                    .members
                    .iter()
                    .map(|(id, name)| PeerInfo {
                        id: *id,
                        name: name.clone(),
                    })
                    .collect(),
                share: room.share_state(),
                created_at: room.created_at,
            })
            .collect()
    }
}
