//! Single-shot result delivery.
//!
//! Every place the engine owes someone exactly one outcome - a write
//! acknowledgment, a delete response, a readiness signal - goes through one
//! canonical [`Completion`], with two adapters on top: a synchronous
//! callback, or a shared [`CompletionHandle`] the caller polls or takes
//! from. A completion is consumed exactly once.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

type Slot<T> = Rc<RefCell<Option<T>>>;

enum Delivery<T> {
    Callback(Box<dyn FnOnce(T)>),
    Shared(Slot<T>),
}

/// One pending outcome, delivered exactly once via [`Completion::complete`].
pub struct Completion<T> {
    delivery: Delivery<T>,
}

impl<T> Completion<T> {
    /// Deliver through a callback.
    pub fn callback(f: impl FnOnce(T) + 'static) -> Self {
        Self {
            delivery: Delivery::Callback(Box::new(f)),
        }
    }

    /// Deliver into a shared slot, observable through the returned handle.
    pub fn shared() -> (Self, CompletionHandle<T>) {
        let slot: Slot<T> = Rc::new(RefCell::new(None));
        (
            Self {
                delivery: Delivery::Shared(Rc::clone(&slot)),
            },
            CompletionHandle { slot },
        )
    }

    /// Resolve with `value`, consuming the completion.
    pub fn complete(self, value: T) {
        match self.delivery {
            Delivery::Callback(f) => f(value),
            Delivery::Shared(slot) => {
                *slot.borrow_mut() = Some(value);
            }
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.delivery {
            Delivery::Callback(_) => f.write_str("Completion::Callback"),
            Delivery::Shared(_) => f.write_str("Completion::Shared"),
        }
    }
}

/// Observer side of a shared [`Completion`].
#[derive(Debug)]
pub struct CompletionHandle<T> {
    slot: Slot<T>,
}

impl<T> CompletionHandle<T> {
    /// Whether the outcome has been delivered.
    pub fn is_complete(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Take the outcome if it has been delivered.
    pub fn try_take(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }
}

impl<T> Clone for CompletionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Rc::clone(&self.slot),
        }
    }
}
