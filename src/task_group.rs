//! A reference-counted completion barrier: hands out `n` handlers, and
//! invokes a final handler exactly once, after all `n` have run.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::node::Handler;

/// Split `handler` across `n` sub-operations: returns `n` handlers, each
/// of which counts down a shared counter. The last one to run invokes
/// `handler`. `n == 0` invokes `handler` immediately and returns no
/// handlers.
pub fn task_group(n: usize, mut handler: Handler) -> Vec<Handler> {
    if n == 0 {
        handler();
        return Vec::new();
    }

    let remaining = Rc::new(Cell::new(n));
    let handler = Rc::new(RefCell::new(Some(handler)));

    (0..n)
        .map(|_| {
            let remaining = remaining.clone();
            let handler = handler.clone();
            Box::new(move || {
                let left = remaining.get() - 1;
                remaining.set(left);
                if left == 0 {
                    if let Some(mut h) = handler.borrow_mut().take() {
                        h();
                    }
                }
            }) as Handler
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn fires_once_after_all_members_complete() {
        let done = Rc::new(StdRefCell::new(0));
        let done2 = done.clone();
        let members = task_group(3, Box::new(move || *done2.borrow_mut() += 1));

        assert_eq!(members.len(), 3);
        let mut members = members.into_iter();
        let mut first = members.next().unwrap();
        first();
        assert_eq!(*done.borrow(), 0);
        let mut second = members.next().unwrap();
        second();
        assert_eq!(*done.borrow(), 0);
        let mut third = members.next().unwrap();
        third();
        assert_eq!(*done.borrow(), 1);
    }

    #[test]
    fn zero_members_fires_immediately() {
        let done = Rc::new(StdRefCell::new(false));
        let done2 = done.clone();
        let members = task_group(0, Box::new(move || *done2.borrow_mut() = true));
        assert!(members.is_empty());
        assert!(*done.borrow());
    }
}
