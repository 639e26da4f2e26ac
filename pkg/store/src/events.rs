use pkg_types::watch::ResourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    Upsert,
    Delete,
}

/// Change notification sent to the controller. Events are skippable: a
/// pending event for the same key makes a newer one redundant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: ResourceKind,
    /// `<namespace>/<name>` of the changed object.
    pub key: String,
    pub action: StoreAction,
}

impl StoreEvent {
    pub fn upsert(kind: ResourceKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            action: StoreAction::Upsert,
        }
    }

    pub fn delete(kind: ResourceKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            action: StoreAction::Delete,
        }
    }

    /// Coalescing key: `<kind>/<namespace>/<name>`.
    pub fn task_key(&self) -> String {
        format!("{}/{}", self.kind, self.key)
    }
}
