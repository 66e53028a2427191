//! A small resume-label state machine, for handlers that need to run a
//! sequence of asynchronous steps without re-deriving "where was I" from
//! scratch on every invocation.
//!
//! The idiom this replaces used a `switch`/`goto` pair (labels as values,
//! re-entering a function body at the label left by the previous
//! suspension) to let a single function definition read like straight-
//! line code while actually running as a state machine driven by
//! callbacks. Rust has no `goto`; the equivalent here is an explicit
//! integer label stored alongside the handler's captured state, checked
//! with a `match` at the top of the handler body:
//!
//! ```ignore
//! let coro = CoroState::new();
//! let handler_body = move || {
//!     match coro.step() {
//!         0 => {
//!             // first async step: schedule it, then advance and return
//!             coro.advance();
//!         }
//!         1 => {
//!             // second async step, runs once the first completes
//!             coro.advance();
//!         }
//!         _ => { /* coro_is_done */ }
//!     }
//! };
//! ```
//!
//! Re-entry is always permitted and always resumes from the stored step;
//! the handler closure is re-invoked by the reactor with the same
//! captured context every time, exactly as a plain (non-coroutine)
//! handler would be.

use std::cell::Cell;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resume {
    Continue,
    Done,
}

/// The resume label for one coroutine-style handler. Cheap to share: a
/// single `Cell<usize>` that every step of the handler reads and
/// advances.
#[derive(Debug, Default)]
pub struct CoroState {
    step: Cell<usize>,
}

impl CoroState {
    pub fn new() -> Self {
        CoroState { step: Cell::new(0) }
    }

    pub fn step(&self) -> usize {
        self.step.get()
    }

    pub fn advance(&self) {
        self.step.set(self.step.get() + 1);
    }

    pub fn advance_to(&self, step: usize) {
        self.step.set(step);
    }

    pub fn finish(&self) {
        self.step.set(usize::MAX);
    }
}

pub fn coro_is_done(state: &CoroState) -> Resume {
    if state.step() == usize::MAX {
        Resume::Done
    } else {
        Resume::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn advances_through_steps_and_reports_done() {
        let coro = Rc::new(CoroState::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        let run_step = {
            let coro = coro.clone();
            let log = log.clone();
            move || match coro.step() {
                0 => {
                    log.borrow_mut().push("first");
                    coro.advance();
                }
                1 => {
                    log.borrow_mut().push("second");
                    coro.finish();
                }
                _ => unreachable!("driver must stop calling after finish()"),
            }
        };

        let mut run_step = run_step;
        assert_eq!(coro_is_done(&coro), Resume::Continue);
        run_step();
        assert_eq!(coro_is_done(&coro), Resume::Continue);
        run_step();
        assert_eq!(coro_is_done(&coro), Resume::Done);
        assert_eq!(*log.borrow(), vec!["first", "second"]);
    }
}
