//! Externally supplied membership views.
//!
//! The view engine layered above the mesh periodically delivers an
//! agreed-upon membership snapshot. The mesh only prunes against views of
//! primary (quorate) components; everything else is informational.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::addr::Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// Quorate component; membership in this view is authoritative.
    Primary,
    /// Non-quorate component.
    NonPrimary,
}

/// Per-member metadata carried in a view. The mesh only consumes the key
/// set; the address is advisory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub addr: Option<Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub kind: ViewKind,
    pub members: BTreeMap<Uuid, NodeInfo>,
}

impl View {
    pub fn new(kind: ViewKind) -> Self {
        Self {
            kind,
            members: BTreeMap::new(),
        }
    }

    /// A primary view over the given member set.
    pub fn primary(members: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            kind: ViewKind::Primary,
            members: members
                .into_iter()
                .map(|uuid| (uuid, NodeInfo::default()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_collects_members() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let view = View::primary([a, b]);
        assert_eq!(view.kind, ViewKind::Primary);
        assert_eq!(view.members.len(), 2);
        assert!(view.members.contains_key(&a));
        assert!(view.members.contains_key(&b));
    }
}
