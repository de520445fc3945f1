use std::any::{Any, TypeId};
use std::collections::HashMap;

/// Typed bag of processed data, filled by processors and read by assemblers.
/// Holds at most one value per type.
#[derive(Default)]
pub struct DataInventory {
    items: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl DataInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the value of the same type it replaced.
    pub fn inject<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.items
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.items
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn take<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.items
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.items.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
