//! Ledger data model: clusters, teams, requests and allocations.

mod allocation;
mod cluster;
mod ids;
mod team;

pub use allocation::{
    Allocation, AllocationPhase, AllocationRequest, AllocationReview, RequestStatus,
};
pub use cluster::Cluster;
pub use ids::{AllocationId, ClusterId, RequestId, TeamId, UserId};
pub use team::{Team, TeamMembership, TeamRole};
