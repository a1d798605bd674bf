//! Allocation requests, reviews and the per-cluster awards they carry.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{AllocationId, ClusterId, RequestId, TeamId, UserId};

/// Review state of an allocation request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Pending,
    Approved,
    Declined,
    ChangesRequested,
}

/// A proposal for service units on a team's behalf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub id: RequestId,
    pub team: TeamId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: RequestStatus,
    #[serde(default)]
    pub submitted: Option<NaiveDate>,
    #[serde(default)]
    pub approved: Option<NaiveDate>,
    #[serde(default)]
    pub active: Option<NaiveDate>,
    #[serde(default)]
    pub expire: Option<NaiveDate>,
    #[serde(default)]
    pub reviews: Vec<AllocationReview>,
}

impl AllocationRequest {
    pub fn new(id: impl Into<RequestId>, team: impl Into<TeamId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            team: team.into(),
            title: title.into(),
            description: String::new(),
            status: RequestStatus::Pending,
            submitted: None,
            approved: None,
            active: None,
            expire: None,
            reviews: Vec::new(),
        }
    }

    /// Mark the request approved with the window `[active, expire)`.
    pub fn approve(mut self, on: NaiveDate, active: NaiveDate, expire: NaiveDate) -> Self {
        self.status = RequestStatus::Approved;
        self.approved = Some(on);
        self.active = Some(active);
        self.expire = Some(expire);
        self
    }

    /// The active window, present only once the request is approved and dated.
    pub fn window(&self) -> Option<(NaiveDate, NaiveDate)> {
        match (self.status, self.active, self.expire) {
            (RequestStatus::Approved, Some(active), Some(expire)) => Some((active, expire)),
            _ => None,
        }
    }
}

/// Reviewer verdict on a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReview {
    pub reviewer: UserId,
    pub approve: bool,
    #[serde(default)]
    pub public_comments: Option<String>,
    #[serde(default)]
    pub private_comments: Option<String>,
}

/// One award of service units on one cluster under one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub request: RequestId,
    pub cluster: ClusterId,
    pub requested: u64,
    /// Authoritative grant, set at approval.
    #[serde(default)]
    pub awarded: Option<u64>,
    /// Frozen consumption snapshot, written exactly once at close-out.
    #[serde(default, rename = "final")]
    pub final_usage: Option<u64>,
}

impl Allocation {
    pub fn new(
        id: impl Into<AllocationId>,
        request: impl Into<RequestId>,
        cluster: impl Into<ClusterId>,
        requested: u64,
    ) -> Self {
        Self {
            id: id.into(),
            request: request.into(),
            cluster: cluster.into(),
            requested,
            awarded: None,
            final_usage: None,
        }
    }

    pub fn with_awarded(mut self, awarded: u64) -> Self {
        self.awarded = Some(awarded);
        self
    }

    pub fn awarded_or_zero(&self) -> u64 {
        self.awarded.unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.final_usage.is_some()
    }

    /// Lifecycle phase of this allocation on `today`.
    pub fn phase(&self, request: &AllocationRequest, today: NaiveDate) -> AllocationPhase {
        if self.is_closed() {
            return AllocationPhase::Closed;
        }
        match request.window() {
            Some((_, expire)) if expire <= today => AllocationPhase::Closing,
            Some((active, _)) if active <= today => AllocationPhase::Active,
            _ => AllocationPhase::Pending,
        }
    }
}

/// `Pending -> Active -> Closing -> Closed`; no transition reverses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPhase {
    Pending,
    Active,
    Closing,
    Closed,
}
