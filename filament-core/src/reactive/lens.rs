//! Lenses: writable views into parts of other values.
//!
//! The read half of a lens is an ordinary derivation, so lenses participate
//! in propagation like any other node. The write half lives outside the
//! graph: it reads the source, rebuilds it with the focused part replaced,
//! and writes it back through the source's own write path, so transaction
//! and ticker semantics apply unchanged.

use std::any::Any;
use std::rc::Rc;

use crate::error::Error;
use crate::reactive::derivation::{sealed, Derivable, Derivation};
use crate::reactive::engine::NodeGuard;

/// A writable node handle. Implemented by [`Atom`](crate::Atom) and
/// [`Lens`].
pub trait Writable<T: Clone + 'static>: Derivable<T> {
    /// Write a new value. Rejected with [`Error::CyclicWrite`] when a
    /// deriving function or reaction body is executing.
    fn try_set(&self, value: T) -> Result<(), Error>;

    /// Write a new value, panicking on a rejected write. Equal values are
    /// no-ops under the node's equality function.
    fn set(&self, value: T) {
        if let Err(err) = self.try_set(value) {
            panic!("{err}");
        }
    }

    /// Replace the current value with `f` applied to it.
    fn swap<F: FnOnce(T) -> T>(&self, f: F) {
        self.set(f(self.get_untracked()));
    }
}

/// A bidirectional view focusing on part of another writable value.
///
/// Reading a lens reads the focused part; writing one rebuilds the source
/// value around the new part and writes it back. Lenses compose: a lens
/// can focus into another lens.
pub struct Lens<C> {
    view: Derivation<C>,
    write: Rc<dyn Fn(C) -> Result<(), Error>>,
}

impl<C: Clone + PartialEq + 'static> Lens<C> {
    /// Focus `source` down to the part selected by `get`; `set` rebuilds a
    /// whole source value from the old one and a new part.
    pub fn new<P, S>(
        source: &S,
        get: impl Fn(&P) -> C + 'static,
        set: impl Fn(&P, C) -> P + 'static,
    ) -> Self
    where
        P: Clone + 'static,
        S: Derivable<P> + Writable<P> + Clone + 'static,
    {
        let view = source.guard().engine().derivation({
            let source = source.clone();
            move || get(&source.get())
        });
        let write = {
            let source = source.clone();
            Rc::new(move |part: C| {
                let whole = source.get_untracked();
                source.try_set(set(&whole, part))
            }) as Rc<dyn Fn(C) -> Result<(), Error>>
        };
        Self { view, write }
    }
}

impl<C: Clone + PartialEq + 'static> sealed::Sealed for Lens<C> {
    fn guard(&self) -> &NodeGuard {
        self.view.guard()
    }

    fn keepalive(&self) -> Box<dyn Any> {
        Box::new(self.clone())
    }
}

impl<C: Clone + PartialEq + 'static> Derivable<C> for Lens<C> {}

impl<C: Clone + PartialEq + 'static> Writable<C> for Lens<C> {
    fn try_set(&self, value: C) -> Result<(), Error> {
        (self.write)(value)
    }
}

impl<C> Clone for Lens<C> {
    fn clone(&self) -> Self {
        Self {
            view: self.view.clone(),
            write: self.write.clone(),
        }
    }
}

impl<C> std::fmt::Debug for Lens<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lens").finish_non_exhaustive()
    }
}
