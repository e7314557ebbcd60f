//! Intrusive doubly-linked thread lists.
//!
//! Link cells are embedded in [`ThreadCb`], so list manipulation never
//! allocates and every operation is bounded. A TCB participates in a given
//! list through exactly one link cell; the cell holding `None` means the TCB
//! is not on that list, which is asserted in debug builds on every insertion
//! and removal.
use core::ptr;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    thread::ThreadCb,
    utils::Init,
    PortThreading,
};

/// A link embedded in a TCB, tying it into one list.
pub(crate) struct Link<Traits: PortThreading> {
    pub prev: Option<&'static ThreadCb<Traits>>,
    pub next: Option<&'static ThreadCb<Traits>>,
}

impl<Traits: PortThreading> Clone for Link<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for Link<Traits> {}

/// The head of an intrusive thread list.
pub(crate) struct ListHead<Traits: PortThreading> {
    pub first: Option<&'static ThreadCb<Traits>>,
    pub last: Option<&'static ThreadCb<Traits>>,
}

impl<Traits: PortThreading> Clone for ListHead<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for ListHead<Traits> {}

impl<Traits: PortThreading> Init for ListHead<Traits> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

/// The type of a link-cell selector: given a TCB, yields the link cell this
/// list threads through.
pub(crate) type LinkOf<Traits> =
    fn(&ThreadCb<Traits>) -> &CpuLockCell<Traits, Option<Link<Traits>>>;

/// Accessor for one intrusive list: the head cell plus the link-cell
/// selector.
pub(crate) struct ListAccessor<'a, Traits: PortThreading> {
    head: &'a CpuLockCell<Traits, ListHead<Traits>>,
    link_of: LinkOf<Traits>,
}

#[inline]
fn ptr_eq<T>(a: &T, b: &T) -> bool {
    ptr::eq(a, b)
}

impl<'a, Traits: PortThreading> ListAccessor<'a, Traits> {
    #[inline]
    pub(crate) fn new(
        head: &'a CpuLockCell<Traits, ListHead<Traits>>,
        link_of: LinkOf<Traits>,
    ) -> Self {
        Self { head, link_of }
    }

    #[inline]
    pub(crate) fn first(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        self.head.get(&*lock).first
    }

    #[inline]
    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.head.get(&*lock).first.is_none()
    }

    /// Get the successor of `item` within the list.
    #[inline]
    pub(crate) fn next(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        item: &'static ThreadCb<Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        let link = (self.link_of)(item).get(&*lock);
        debug_assert!(link.is_some(), "item is not linked");
        link.and_then(|l| l.next)
    }

    /// Append `item` at the back of the list.
    pub(crate) fn push_back(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        item: &'static ThreadCb<Traits>,
    ) {
        debug_assert!(
            (self.link_of)(item).get(&*lock).is_none(),
            "item is already linked"
        );

        let head = self.head.get(&*lock);
        match head.last {
            None => {
                self.head.replace(
                    &mut *lock,
                    ListHead {
                        first: Some(item),
                        last: Some(item),
                    },
                );
                (self.link_of)(item).replace(
                    &mut *lock,
                    Some(Link {
                        prev: None,
                        next: None,
                    }),
                );
            }
            Some(last) => {
                let mut last_link = (self.link_of)(last).get(&*lock).unwrap();
                last_link.next = Some(item);
                (self.link_of)(last).replace(&mut *lock, Some(last_link));
                (self.link_of)(item).replace(
                    &mut *lock,
                    Some(Link {
                        prev: Some(last),
                        next: None,
                    }),
                );
                self.head.replace(
                    &mut *lock,
                    ListHead {
                        first: head.first,
                        last: Some(item),
                    },
                );
            }
        }
    }

    /// Insert `item` right before `before`. `before == None` appends at the
    /// back.
    pub(crate) fn insert_before(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        item: &'static ThreadCb<Traits>,
        before: Option<&'static ThreadCb<Traits>>,
    ) {
        let Some(before) = before else {
            self.push_back(lock, item);
            return;
        };

        debug_assert!(
            (self.link_of)(item).get(&*lock).is_none(),
            "item is already linked"
        );

        let before_link = (self.link_of)(before)
            .get(&*lock)
            .expect("`before` is not linked");
        let prev = before_link.prev;

        (self.link_of)(item).replace(
            &mut *lock,
            Some(Link {
                prev,
                next: Some(before),
            }),
        );
        (self.link_of)(before).replace(
            &mut *lock,
            Some(Link {
                prev: Some(item),
                next: before_link.next,
            }),
        );

        match prev {
            Some(prev) => {
                let mut prev_link = (self.link_of)(prev).get(&*lock).unwrap();
                prev_link.next = Some(item);
                (self.link_of)(prev).replace(&mut *lock, Some(prev_link));
            }
            None => {
                let mut head = self.head.get(&*lock);
                debug_assert!(ptr_eq(head.first.unwrap(), before));
                head.first = Some(item);
                self.head.replace(&mut *lock, head);
            }
        }
    }

    /// Remove `item` from the list.
    pub(crate) fn remove(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        item: &'static ThreadCb<Traits>,
    ) {
        let link = (self.link_of)(item)
            .replace(&mut *lock, None)
            .expect("item is not linked");

        match link.prev {
            Some(prev) => {
                let mut prev_link = (self.link_of)(prev).get(&*lock).unwrap();
                prev_link.next = link.next;
                (self.link_of)(prev).replace(&mut *lock, Some(prev_link));
            }
            None => {
                let mut head = self.head.get(&*lock);
                debug_assert!(ptr_eq(head.first.unwrap(), item));
                head.first = link.next;
                self.head.replace(&mut *lock, head);
            }
        }

        match link.next {
            Some(next) => {
                let mut next_link = (self.link_of)(next).get(&*lock).unwrap();
                next_link.prev = link.prev;
                (self.link_of)(next).replace(&mut *lock, Some(next_link));
            }
            None => {
                let mut head = self.head.get(&*lock);
                debug_assert!(ptr_eq(head.last.unwrap(), item));
                head.last = link.prev;
                self.head.replace(&mut *lock, head);
            }
        }
    }

    /// Remove and return the first element.
    pub(crate) fn pop_front(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        let first = self.head.get(&*lock).first?;
        self.remove(lock.borrow_mut(), first);
        Some(first)
    }
}
