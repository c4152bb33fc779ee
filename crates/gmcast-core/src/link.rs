//! Links — which peers a node believes are alive, and where they listen.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::addr::Addr;

/// The set of live links a node advertises: peer uuid → peer listen address.
///
/// Kept as a `BTreeMap` so topology frames serialize in a stable order and
/// two nodes with the same knowledge produce identical frames.
pub type LinkMap = BTreeMap<Uuid, Addr>;
