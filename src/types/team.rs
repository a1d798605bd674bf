//! Teams and their membership roster.

use serde::{Deserialize, Serialize};

use super::{TeamId, UserId};

/// Role a user holds within a team.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Owner,
    Admin,
    Member,
}

impl TeamRole {
    pub fn is_privileged(self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMembership {
    pub user: UserId,
    pub role: TeamRole,
}

/// A team. Its `name` doubles as the account name in the external
/// accounting system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub members: Vec<TeamMembership>,
}

fn default_active() -> bool {
    true
}

impl Team {
    pub fn new(id: impl Into<TeamId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_active: true,
            members: Vec::new(),
        }
    }

    pub fn with_member(mut self, user: impl Into<UserId>, role: TeamRole) -> Self {
        self.members.push(TeamMembership {
            user: user.into(),
            role,
        });
        self
    }

    pub fn privileged_members(&self) -> impl Iterator<Item = UserId> + '_ {
        self.members
            .iter()
            .filter(|m| m.role.is_privileged())
            .map(|m| m.user)
    }

    pub fn role_of(&self, user: UserId) -> Option<TeamRole> {
        self.members.iter().find(|m| m.user == user).map(|m| m.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privileged_members() {
        let team = Team::new(1, "physics")
            .with_member(10, TeamRole::Owner)
            .with_member(11, TeamRole::Member)
            .with_member(12, TeamRole::Admin);

        let privileged: Vec<_> = team.privileged_members().collect();
        assert_eq!(privileged, vec![UserId(10), UserId(12)]);
        assert_eq!(team.role_of(UserId(11)), Some(TeamRole::Member));
        assert_eq!(team.role_of(UserId(99)), None);
    }
}
