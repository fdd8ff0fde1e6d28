//! Friend requests and friendship records.

use chrono::{DateTime, Utc};
use common::{FriendRequestId, FriendshipId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The status of a friend request.
///
/// Status transitions:
/// ```text
/// Pending ──┬──► Accepted
///           ├──► Rejected
///           └──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FriendRequestStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Cancelled,
}

impl FriendRequestStatus {
    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendRequestStatus::Pending => "Pending",
            FriendRequestStatus::Accepted => "Accepted",
            FriendRequestStatus::Rejected => "Rejected",
            FriendRequestStatus::Cancelled => "Cancelled",
        }
    }

    /// Parses a status name produced by [`FriendRequestStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(FriendRequestStatus::Pending),
            "Accepted" => Some(FriendRequestStatus::Accepted),
            "Rejected" => Some(FriendRequestStatus::Rejected),
            "Cancelled" => Some(FriendRequestStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for FriendRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The part of a friend request that acceptance overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequestSnapshot {
    pub status: FriendRequestStatus,
    pub responded_at: Option<DateTime<Utc>>,
}

/// A friend request, guarded by an optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequest {
    pub id: FriendRequestId,
    pub requester_id: UserId,
    pub receiver_id: UserId,
    pub status: FriendRequestStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    /// Incremented by the store on every successful update.
    pub version: i64,
}

impl FriendRequest {
    /// Creates a pending request from `requester_id` to `receiver_id`.
    pub fn new(requester_id: UserId, receiver_id: UserId) -> Self {
        Self {
            id: FriendRequestId::new(),
            requester_id,
            receiver_id,
            status: FriendRequestStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
            version: 0,
        }
    }

    /// Captures the fields acceptance will overwrite.
    pub fn snapshot(&self) -> FriendRequestSnapshot {
        FriendRequestSnapshot {
            status: self.status,
            responded_at: self.responded_at,
        }
    }

    /// Accepts the request on behalf of `receiver_id`.
    ///
    /// Returns the snapshot taken before the transition.
    pub fn accept(
        &mut self,
        receiver_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<FriendRequestSnapshot, DomainError> {
        if self.receiver_id != receiver_id {
            return Err(DomainError::NotReceiver {
                user_id: receiver_id,
            });
        }
        if self.status != FriendRequestStatus::Pending {
            return Err(DomainError::InvalidStatusTransition {
                current: self.status,
                action: "accept",
            });
        }

        let snapshot = self.snapshot();
        self.status = FriendRequestStatus::Accepted;
        self.responded_at = Some(at);
        Ok(snapshot)
    }

    /// Puts the snapshot fields back.
    pub fn restore(&mut self, snapshot: FriendRequestSnapshot) {
        self.status = snapshot.status;
        self.responded_at = snapshot.responded_at;
    }

    /// Returns true if the request currently matches the snapshot.
    pub fn matches(&self, snapshot: &FriendRequestSnapshot) -> bool {
        self.status == snapshot.status && self.responded_at == snapshot.responded_at
    }
}

/// One direction of a friendship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friendship {
    pub id: FriendshipId,
    pub user_id: UserId,
    pub friend_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl Friendship {
    /// Builds both directions of a friendship between two users.
    pub fn pair(a: UserId, b: UserId, at: DateTime<Utc>) -> [Friendship; 2] {
        [
            Friendship {
                id: FriendshipId::new(),
                user_id: a,
                friend_id: b,
                created_at: at,
            },
            Friendship {
                id: FriendshipId::new(),
                user_id: b,
                friend_id: a,
                created_at: at,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_transitions_and_returns_prior_snapshot() {
        let requester = UserId::new();
        let receiver = UserId::new();
        let mut request = FriendRequest::new(requester, receiver);
        let now = Utc::now();

        let snapshot = request.accept(receiver, now).unwrap();

        assert_eq!(snapshot.status, FriendRequestStatus::Pending);
        assert!(snapshot.responded_at.is_none());
        assert_eq!(request.status, FriendRequestStatus::Accepted);
        assert_eq!(request.responded_at, Some(now));
    }

    #[test]
    fn accept_rejects_wrong_receiver() {
        let mut request = FriendRequest::new(UserId::new(), UserId::new());
        let result = request.accept(UserId::new(), Utc::now());
        assert!(matches!(result, Err(DomainError::NotReceiver { .. })));
        assert_eq!(request.status, FriendRequestStatus::Pending);
    }

    #[test]
    fn accept_rejects_non_pending() {
        let receiver = UserId::new();
        let mut request = FriendRequest::new(UserId::new(), receiver);
        request.accept(receiver, Utc::now()).unwrap();

        let result = request.accept(receiver, Utc::now());
        assert!(matches!(
            result,
            Err(DomainError::InvalidStatusTransition {
                current: FriendRequestStatus::Accepted,
                ..
            })
        ));
    }

    #[test]
    fn restore_reverts_acceptance() {
        let receiver = UserId::new();
        let mut request = FriendRequest::new(UserId::new(), receiver);
        let snapshot = request.accept(receiver, Utc::now()).unwrap();

        assert!(!request.matches(&snapshot));
        request.restore(snapshot);
        assert!(request.matches(&snapshot));
        assert_eq!(request.status, FriendRequestStatus::Pending);
    }

    #[test]
    fn pair_builds_both_directions() {
        let a = UserId::new();
        let b = UserId::new();
        let [ab, ba] = Friendship::pair(a, b, Utc::now());

        assert_eq!((ab.user_id, ab.friend_id), (a, b));
        assert_eq!((ba.user_id, ba.friend_id), (b, a));
        assert_ne!(ab.id, ba.id);
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            FriendRequestStatus::Pending,
            FriendRequestStatus::Accepted,
            FriendRequestStatus::Rejected,
            FriendRequestStatus::Cancelled,
        ] {
            assert_eq!(FriendRequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FriendRequestStatus::parse("Unknown"), None);
    }
}
