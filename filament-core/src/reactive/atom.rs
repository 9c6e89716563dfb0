//! Atoms: the mutable roots of the graph.

use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::Error;
use crate::reactive::derivation::{sealed, Derivable};
use crate::reactive::engine::NodeGuard;
use crate::reactive::lens::Writable;

/// A mutable source value.
///
/// Atoms are the only nodes written by application code; every other value
/// in the graph is derived from them. Writing an atom triggers a
/// propagation cycle (or stages into the open transaction or ticker
/// window). Created with [`Engine::atom`][a].
///
/// [a]: crate::Engine::atom
pub struct Atom<T> {
    guard: NodeGuard,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> Atom<T> {
    pub(crate) fn from_guard(guard: NodeGuard) -> Self {
        Self {
            guard,
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + 'static> sealed::Sealed for Atom<T> {
    fn guard(&self) -> &NodeGuard {
        &self.guard
    }

    fn keepalive(&self) -> Box<dyn Any> {
        Box::new(self.clone())
    }
}

impl<T: Clone + 'static> Derivable<T> for Atom<T> {}

impl<T: Clone + 'static> Writable<T> for Atom<T> {
    fn try_set(&self, value: T) -> Result<(), Error> {
        self.guard
            .engine()
            .write_value(self.guard.id(), Rc::new(value))
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atom")
            .field("node", &self.guard.id().raw())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::reactive::{Derivable, Engine, Writable};
    use crate::Error;

    #[test]
    fn get_and_set() {
        let engine = Engine::new();
        let a = engine.atom(1);
        assert_eq!(a.get(), 1);
        a.set(2);
        assert_eq!(a.get(), 2);
    }

    #[test]
    fn clones_alias_the_same_node() {
        let engine = Engine::new();
        let a = engine.atom(String::from("x"));
        let b = a.clone();
        b.set(String::from("y"));
        assert_eq!(a.get(), "y");
        assert_eq!(engine.node_count(), 1);
    }

    #[test]
    fn swap_applies_a_function_to_the_current_value() {
        let engine = Engine::new();
        let a = engine.atom(10);
        a.swap(|v| v + 5);
        assert_eq!(a.get(), 15);
    }

    #[test]
    fn equal_writes_are_no_ops() {
        let engine = Engine::new();
        let a = engine.atom(1);
        let fired = Rc::new(Cell::new(0));
        let _r = {
            let fired = fired.clone();
            a.react(move |_: &i32| fired.set(fired.get() + 1))
        };
        assert_eq!(fired.get(), 1);

        a.set(1);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn per_atom_equality_overrides_the_default() {
        let engine = Engine::new();
        // Compare only the integer part; fractional changes are no-ops.
        let a = engine.atom_with_eq(1.25_f64, |x: &f64, y: &f64| x.trunc() == y.trunc());
        let fired = Rc::new(Cell::new(0));
        let _r = {
            let fired = fired.clone();
            a.react(move |_: &f64| fired.set(fired.get() + 1))
        };
        assert_eq!(fired.get(), 1);

        a.set(1.75);
        assert_eq!(fired.get(), 1);
        a.set(2.5);
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn writes_from_a_reaction_are_rejected() {
        let engine = Engine::new();
        let a = engine.atom(0);
        let b = engine.atom(0);
        let result = Rc::new(Cell::new(None));
        let _r = {
            let b = b.clone();
            let result = result.clone();
            a.react(move |v: &i32| {
                result.set(Some(b.try_set(v + 1)));
            })
        };
        assert_eq!(result.get(), Some(Err(Error::CyclicWrite)));

        // The rejected write left b untouched.
        assert_eq!(b.get(), 0);
    }

    #[test]
    fn writes_from_a_deriving_function_are_rejected() {
        let engine = Engine::new();
        let a = engine.atom(0);
        let b = engine.atom(0);
        let d = engine.derivation({
            let a = a.clone();
            let b = b.clone();
            move || {
                let v = a.get();
                assert_eq!(b.try_set(v), Err(Error::CyclicWrite));
                v
            }
        });
        assert_eq!(d.get(), 0);
        assert_eq!(b.get(), 0);
    }
}
