//! Derivations and the read interface shared by every readable handle.

use std::any::Any;

use crate::reactive::engine::NodeGuard;
use crate::reactive::reaction::{Reaction, Reactor};

pub(crate) mod sealed {
    use std::any::Any;

    use crate::reactive::engine::NodeGuard;

    /// Implementation hooks for [`Derivable`](super::Derivable). The trait
    /// set is closed: readable handles are exactly the types this crate
    /// ships.
    pub trait Sealed {
        /// The graph node this handle reads from.
        fn guard(&self) -> &NodeGuard;

        /// A boxed clone of this handle, stored in reaction nodes so the
        /// upstream chain outlives the caller's handle.
        fn keepalive(&self) -> Box<dyn Any>;
    }
}

/// A readable node handle: anything a deriving function or a reaction can
/// observe. Implemented by [`Atom`](crate::Atom), [`Derivation`] and
/// [`Lens`](crate::Lens).
pub trait Derivable<T: Clone + 'static>: sealed::Sealed {
    /// Read the current value. Inside a deriving function this records the
    /// read, making this node a parent of the derivation being evaluated.
    fn get(&self) -> T {
        let value = self.guard().engine().read_value(self.guard().id(), true);
        downcast(&value)
    }

    /// Read the current value without recording a dependency. A derivation
    /// using this sees the value but is not re-run when it changes.
    fn get_untracked(&self) -> T {
        let value = self.guard().engine().read_value(self.guard().id(), false);
        downcast(&value)
    }

    /// Attach a side effect to this node. The reaction is started and run
    /// once immediately with the current value, then re-run whenever a
    /// propagation cycle changes the value.
    fn react<R>(&self, reactor: R) -> Reaction
    where
        R: Reactor<T> + 'static,
        Self: Sized,
    {
        let reaction = Reaction::new(self, reactor);
        reaction.start();
        reaction.force();
        reaction
    }
}

fn downcast<T: Clone + 'static>(value: &std::rc::Rc<dyn Any>) -> T {
    value
        .downcast_ref::<T>()
        .expect("node value has the handle's type")
        .clone()
}

/// A lazy, memoized computation over other nodes.
///
/// The deriving function runs only when the derivation is read and its
/// cached value might be stale; its dependencies are captured automatically
/// from what it reads. Created with [`Engine::derivation`][d].
///
/// [d]: crate::Engine::derivation
pub struct Derivation<T> {
    guard: NodeGuard,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> Derivation<T> {
    pub(crate) fn from_guard(guard: NodeGuard) -> Self {
        Self {
            guard,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Clone + 'static> sealed::Sealed for Derivation<T> {
    fn guard(&self) -> &NodeGuard {
        &self.guard
    }

    fn keepalive(&self) -> Box<dyn Any> {
        Box::new(self.clone())
    }
}

impl<T: Clone + 'static> Derivable<T> for Derivation<T> {}

impl<T> Clone for Derivation<T> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Derivation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derivation")
            .field("node", &self.guard.id().raw())
            .finish()
    }
}
