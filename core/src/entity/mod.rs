//! Entity — an identity-less bag of typed components.
//!
//! Entities are shared by `Arc`. Components are added once per type and
//! never removed; components that change over time carry their own locks.
//! A child entity may point back at its parent through a `Weak` reference.

pub mod component;

pub use component::{
    ClientComponent, GroupComponent, MailboxComponent, MuteComponent, SessionComponent,
    ShareComponent, TimerComponent,
};

use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

type ComponentMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

#[derive(Default)]
pub struct Entity {
    components: RwLock<ComponentMap>,
    parent: RwLock<Option<Weak<Entity>>>,
}

impl Entity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Child entity holding a weak back-reference to `parent`.
    pub fn child_of(parent: &Arc<Entity>) -> Arc<Self> {
        let child = Self::new();
        *child.parent.write() = Some(Arc::downgrade(parent));
        child
    }

    pub fn parent(&self) -> Option<Arc<Entity>> {
        self.parent.read().as_ref().and_then(Weak::upgrade)
    }

    /// Add a component. If one of the same type already exists it is kept
    /// and returned instead.
    pub fn add<T: Any + Send + Sync>(&self, component: T) -> Arc<T> {
        let mut components = self.components.write();
        if let Some(existing) = components
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|existing| existing.downcast::<T>().ok())
        {
            return existing;
        }

        let component = Arc::new(component);
        components.insert(TypeId::of::<T>(), component.clone());
        component
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.components
            .read()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|component| component.downcast::<T>().ok())
    }

    pub fn has<T: Any + Send + Sync>(&self) -> bool {
        self.components.read().contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.components.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.read().is_empty()
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("components", &self.len())
            .field("has_parent", &self.parent().is_some())
            .finish()
    }
}
