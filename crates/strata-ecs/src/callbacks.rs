//! Removal callbacks keyed by component type.
//!
//! Callbacks fire when a component is explicitly removed from an entity and,
//! on entity deletion, once for every type the entity held or had staged for
//! addition. They run before the removal is staged, while the entity is still
//! alive.

use std::collections::HashMap;

use crate::component::ComponentTypeId;
use crate::entity::Entity;

type RemovalCallback = Box<dyn FnMut(Entity)>;

#[derive(Default)]
pub struct CallbackRegistry {
    on_removed: HashMap<ComponentTypeId, Vec<RemovalCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to removals of `component`. Subscribers run in
    /// registration order.
    pub fn on_removed(&mut self, component: ComponentTypeId, callback: impl FnMut(Entity) + 'static) {
        self.on_removed
            .entry(component)
            .or_default()
            .push(Box::new(callback));
    }

    /// Invoke every subscriber for `component`. Returns how many ran.
    pub fn fire_removed(&mut self, component: ComponentTypeId, entity: Entity) -> usize {
        match self.on_removed.get_mut(&component) {
            Some(callbacks) => {
                for callback in callbacks.iter_mut() {
                    callback(entity);
                }
                callbacks.len()
            }
            None => 0,
        }
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.on_removed.iter().map(|(ty, cbs)| (ty, cbs.len())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn multiple_subscribers_fire_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut callbacks = CallbackRegistry::new();
        let ty = ComponentTypeId(0);
        for tag in ["first", "second"] {
            let log = Rc::clone(&log);
            callbacks.on_removed(ty, move |e| log.borrow_mut().push((tag, e)));
        }

        let e = Entity::new(3, 1);
        assert_eq!(callbacks.fire_removed(ty, e), 2);
        assert_eq!(*log.borrow(), vec![("first", e), ("second", e)]);
        assert_eq!(callbacks.fire_removed(ComponentTypeId(1), e), 0);
    }
}
