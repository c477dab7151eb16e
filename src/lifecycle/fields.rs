use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::sync::lock;

/// A value stored in the field table of a `Lifecycle`.
pub type FieldValue = Arc<dyn Any + Send + Sync>;

/// The string keyed table supervisors use to attach metadata to a child.
#[derive(Default)]
pub(crate) struct Fields(Mutex<HashMap<String, FieldValue>>);

impl Fields {
    pub(crate) fn get(&self, name: &str) -> Option<FieldValue> {
        lock(&self.0).get(name).cloned()
    }

    pub(crate) fn set(&self, name: String, value: FieldValue) {
        lock(&self.0).insert(name, value);
    }

    /// Stores `value` unless the name is taken, returns the stored value and
    /// whether it was already there.
    pub(crate) fn set_default(&self, name: String, value: FieldValue) -> (FieldValue, bool) {
        let mut fields = lock(&self.0);
        match fields.get(&name) {
            Some(existing) => (existing.clone(), true),
            None => {
                fields.insert(name, value.clone());
                (value, false)
            }
        }
    }

    pub(crate) fn remove(&self, name: &str) -> Option<FieldValue> {
        lock(&self.0).remove(name)
    }

    pub(crate) fn snapshot(&self) -> HashMap<String, FieldValue> {
        lock(&self.0).clone()
    }
}
