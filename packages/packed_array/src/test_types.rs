//! Managed types that record their drops, shared by the unit tests of this package.

use std::cell::RefCell;
use std::rc::Rc;

use crate::{PackedIter, PackedLayout};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Event {
    Element(usize),
    Header(u32),
}

pub(crate) type Log = Rc<RefCell<Vec<Event>>>;

pub(crate) fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

#[derive(Debug)]
#[repr(C)]
pub(crate) struct LoggedHeader {
    pub(crate) log: Log,
    pub(crate) id: u32,
    pub(crate) panic_on_drop: bool,
}

impl Drop for LoggedHeader {
    fn drop(&mut self) {
        self.log.borrow_mut().push(Event::Header(self.id));

        assert!(!self.panic_on_drop, "header {} panicked on drop", self.id);
    }
}

#[derive(Debug)]
#[repr(C)]
pub(crate) struct LoggedElement {
    pub(crate) log: Log,
    pub(crate) index: usize,
    pub(crate) panic_on_drop: bool,
}

impl Drop for LoggedElement {
    fn drop(&mut self) {
        self.log.borrow_mut().push(Event::Element(self.index));

        assert!(!self.panic_on_drop, "element {} panicked on drop", self.index);
    }
}

pub(crate) fn element(log: &Log, index: usize) -> LoggedElement {
    LoggedElement {
        log: Rc::clone(log),
        index,
        panic_on_drop: false,
    }
}

#[derive(Debug)]
#[repr(C)]
pub(crate) struct Logged {
    pub(crate) header: LoggedHeader,
    pub(crate) elements: [LoggedElement; 1],
}

impl Logged {
    pub(crate) fn new(log: &Log, id: u32) -> Self {
        Self {
            header: LoggedHeader {
                log: Rc::clone(log),
                id,
                panic_on_drop: false,
            },
            elements: [element(log, 0)],
        }
    }
}

// SAFETY: Logged is repr(C), starts with a LoggedHeader, ends in [LoggedElement; 1] and has no
// Drop implementation of its own.
unsafe impl PackedLayout for Logged {
    type Header = LoggedHeader;
    type Element = LoggedElement;
}

// SAFETY: Items are the elements themselves.
unsafe impl PackedIter for Logged {
    type Item = LoggedElement;
}
