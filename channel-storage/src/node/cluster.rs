use crate::config::endpoint_address;
use crate::error::NodeError;

/// One entry of the membership descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    /// Peer address with the URL scheme stripped.
    pub peer_addr: String,
}

/// Parsed `id=peerURL[,id=peerURL...]` descriptor.
#[derive(Debug, Clone)]
pub struct ClusterMembership {
    descriptor: String,
    members: Vec<Member>,
}

impl ClusterMembership {
    pub fn parse(descriptor: &str) -> Result<Self, NodeError> {
        let invalid = |reason: String| NodeError::InvalidCluster {
            descriptor: descriptor.to_string(),
            reason,
        };

        let mut members: Vec<Member> = Vec::new();
        for part in descriptor.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let (id, url) = part
                .split_once('=')
                .ok_or_else(|| invalid(format!("entry '{part}' is not id=url")))?;
            let id = id.trim();
            if id.is_empty() {
                return Err(invalid(format!("entry '{part}' has an empty member id")));
            }
            if members.iter().any(|member| member.id == id) {
                return Err(invalid(format!("member '{id}' is listed twice")));
            }
            let peer_addr = endpoint_address(url)
                .map_err(|_| invalid(format!("member '{id}' has invalid peer url '{url}'")))?;
            members.push(Member {
                id: id.to_string(),
                peer_addr,
            });
        }

        if members.is_empty() {
            return Err(invalid("cluster requires at least one member".to_string()));
        }

        Ok(Self {
            descriptor: descriptor.to_string(),
            members,
        })
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|member| member.id == id)
    }

    pub fn require_member(&self, id: &str) -> Result<&Member, NodeError> {
        self.member(id).ok_or_else(|| NodeError::NotAMember {
            member: id.to_string(),
            descriptor: self.descriptor.clone(),
        })
    }

    /// Every member except `id`.
    pub fn peers_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Member> + 'a {
        self.members.iter().filter(move |member| member.id != id)
    }
}
