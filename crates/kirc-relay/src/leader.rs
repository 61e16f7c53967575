/// This node's view of a channel's leadership.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LeaderView {
    #[default]
    Unknown,
    /// A claim is in flight
    Claiming,
    LeaderSelf,
    LeaderOther(String),
}

impl LeaderView {
    pub fn from_lookup(me: &str, leader: Option<&str>) -> Self {
        match leader {
            None => Self::Unknown,
            Some(leader) if leader == me => Self::LeaderSelf,
            Some(leader) => Self::LeaderOther(leader.to_string()),
        }
    }

    pub fn leader<'a>(&'a self, me: &'a str) -> Option<&'a str> {
        match self {
            Self::LeaderSelf => Some(me),
            Self::LeaderOther(leader) => Some(leader),
            Self::Unknown | Self::Claiming => None,
        }
    }

    pub fn is_self(&self) -> bool {
        matches!(self, Self::LeaderSelf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_outcomes() {
        assert_eq!(LeaderView::from_lookup("alice", None), LeaderView::Unknown);
        assert_eq!(
            LeaderView::from_lookup("alice", Some("alice")),
            LeaderView::LeaderSelf
        );
        let other = LeaderView::from_lookup("alice", Some("bob"));
        assert_eq!(other.leader("alice"), Some("bob"));
        assert!(!other.is_self());
        assert_eq!(LeaderView::Claiming.leader("alice"), None);
    }
}
