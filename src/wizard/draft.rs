use crate::wizard::state::WizardState;
use rusqlite::Connection;

/// Storage keys for one wizard's draft. Always derived from the wizard's
/// identity so two wizards can never collide on ad hoc key strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftKeys {
    pub state_key: String,
    pub step_key: String,
}

impl DraftKeys {
    pub fn for_wizard(wizard_id: &str) -> Self {
        Self {
            state_key: format!("{wizard_id}.state"),
            step_key: format!("{wizard_id}.step"),
        }
    }
}

/// A durable string-keyed store. Writes are best-effort: a failed save loses
/// at most the latest snapshot, never previously saved data, and must not
/// disturb the wizard itself.
pub trait DraftStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

pub struct SqliteDraftStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteDraftStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl DraftStore for SqliteDraftStore<'_> {
    fn get(&self, key: &str) -> Option<String> {
        crate::db::draft_get(self.conn, key).ok().flatten()
    }

    fn set(&self, key: &str, value: &str) {
        let _ = crate::db::draft_set(self.conn, key, value);
    }

    fn remove(&self, key: &str) {
        let _ = crate::db::draft_remove(self.conn, key);
    }
}

/// Full-replacement snapshot write; called on every wizard mutation.
pub fn save(store: &dyn DraftStore, keys: &DraftKeys, state: &WizardState, step_index: usize) {
    if let Ok(snapshot) = serde_json::to_string(state) {
        store.set(&keys.state_key, &snapshot);
    }
    store.set(&keys.step_key, &step_index.to_string());
}

/// Read once at wizard open. Corrupt or foreign snapshots yield `None` (a
/// fresh wizard) rather than an error; a corrupt step index alone falls back
/// to step 0 of the restored state.
pub fn load(store: &dyn DraftStore, keys: &DraftKeys) -> Option<(WizardState, usize)> {
    let raw = store.get(&keys.state_key)?;
    let state: WizardState = serde_json::from_str(&raw).ok()?;
    let step_index = store
        .get(&keys.step_key)
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(0);
    Some((state, step_index))
}

/// Remove both snapshots; only after a successful submit or explicit cancel.
pub fn clear(store: &dyn DraftStore, keys: &DraftKeys) {
    store.remove(&keys.state_key);
    store.remove(&keys.step_key);
}

#[cfg(test)]
pub struct MemoryDraftStore {
    map: std::cell::RefCell<std::collections::HashMap<String, String>>,
}

#[cfg(test)]
impl MemoryDraftStore {
    pub fn new() -> Self {
        Self {
            map: std::cell::RefCell::new(std::collections::HashMap::new()),
        }
    }

    pub fn poison(&self, key: &str, garbage: &str) {
        self.map
            .borrow_mut()
            .insert(key.to_string(), garbage.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }
}

#[cfg(test)]
impl DraftStore for MemoryDraftStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.map
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.map.borrow_mut().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wizard::state::StepState;
    use serde_json::json;

    #[test]
    fn round_trip_reproduces_state_and_step_index() {
        let store = MemoryDraftStore::new();
        let keys = DraftKeys::for_wizard("assign_class_teacher");

        let mut state = WizardState::empty(4);
        state.steps[0] = StepState::Existing {
            selected: "teacher#7".to_string(),
        };
        state.scalars.insert("assigned_from".into(), json!("2025-01-01"));

        save(&store, &keys, &state, 2);
        let (loaded, step) = load(&store, &keys).expect("snapshot present");
        assert_eq!(loaded, state);
        assert_eq!(step, 2);
    }

    #[test]
    fn load_without_a_prior_save_yields_nothing() {
        let store = MemoryDraftStore::new();
        let keys = DraftKeys::for_wizard("assign_class_teacher");
        assert!(load(&store, &keys).is_none());
    }

    #[test]
    fn corrupt_state_snapshot_is_discarded_silently() {
        let store = MemoryDraftStore::new();
        let keys = DraftKeys::for_wizard("assign_class_teacher");
        store.poison(&keys.state_key, "{not json");
        store.poison(&keys.step_key, "2");
        assert!(load(&store, &keys).is_none());
    }

    #[test]
    fn corrupt_step_index_falls_back_to_zero() {
        let store = MemoryDraftStore::new();
        let keys = DraftKeys::for_wizard("assign_class_teacher");
        save(&store, &keys, &WizardState::empty(4), 3);
        store.poison(&keys.step_key, "three");
        let (_, step) = load(&store, &keys).expect("state still loads");
        assert_eq!(step, 0);
    }

    #[test]
    fn clear_removes_both_keys() {
        let store = MemoryDraftStore::new();
        let keys = DraftKeys::for_wizard("assign_class_teacher");
        save(&store, &keys, &WizardState::empty(4), 1);
        clear(&store, &keys);
        assert!(store.is_empty());
        assert!(load(&store, &keys).is_none());
    }

    #[test]
    fn distinct_wizards_use_distinct_keys() {
        let a = DraftKeys::for_wizard("assign_class_teacher");
        let b = DraftKeys::for_wizard("enroll_student");
        assert_ne!(a.state_key, b.state_key);
        assert_ne!(a.step_key, b.step_key);
    }
}
