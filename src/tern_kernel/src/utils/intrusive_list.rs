//! Intrusive circular doubly-linked list backed by a container implementing
//! `core::ops::Index`.
//!
//! An unlinked element stores `None` in its link cell; a linked element's
//! `prev`/`next` always point at other linked elements (or itself, when it is
//! the sole element), which makes every structural operation O(1).
#![allow(dead_code)]
use core::{fmt, ops};

use super::Init;

/// Circular linked list header.
#[derive(Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self { first: None };
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to the neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// A virtual container of `T`s that can be indexed by `Ident<&'static T>`.
#[derive(Debug, Clone, Copy)]
pub struct Static;

impl<T> ops::Index<Ident<&'static T>> for Static {
    type Output = T;

    #[inline]
    fn index(&self, index: Ident<&'static T>) -> &Self::Output {
        index.0
    }
}

/// Reference wrapper that implements `PartialEq` and `Eq` by identity
/// comparison.
#[derive(Clone, Copy)]
pub struct Ident<T>(pub T);

impl<T> fmt::Debug for Ident<&'_ T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Do not print the pointee. This is a safe measure against infinite
        // recursion.
        f.debug_tuple("Ident").field(&(self.0 as *const T)).finish()
    }
}

impl<T: ?Sized> PartialEq for Ident<&'_ T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl<T: ?Sized> Eq for Ident<&'_ T> {}

/// Circular linked list header where elements are linked by
/// [`StaticLink`]`<Element>` (a pair of `&'static Element`).
pub type StaticListHead<Element> = ListHead<Ident<&'static Element>>;

/// Links to neighbor items with a `'static` lifetime.
pub type StaticLink<Element> = Link<Ident<&'static Element>>;

/// An abstract interface to a mutable cell, with the mutability mediated by a
/// `Key`.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    #[inline]
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        let ret = f(&mut x);
        self.set(key, x);
        ret
    }
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T {
        (*self).modify(key, f)
    }
}

/// `Cell`-based accessor to a linked list.
///
/// The list is trusted to be structurally sound; the kernel upholds this by
/// never leaking a linked element. Violations trip debug assertions.
pub struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    /// `Key` used to read or write cells.
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        ListAccessorCell {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    pub fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    fn link_of(&self, i: Index) -> Option<Link<Index>> {
        (self.map_link)(&self.pool[i]).get(&self.cell_key)
    }

    fn set_link_of(&mut self, i: Index, link: Option<Link<Index>>) {
        (self.map_link)(&self.pool[i.clone()]).set(&mut self.cell_key, link);
    }

    pub fn is_linked(&self, i: Index) -> bool {
        self.link_of(i).is_some()
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    #[inline]
    pub fn back(&self) -> Option<Index> {
        self.head()
            .first
            .map(|first| self.link_of(first).expect("inconsistent list").prev)
    }

    pub fn front_data(&self) -> Option<&Element> {
        self.front().map(|i| &self.pool[i])
    }

    /// Insert `item` before the position `at`. If `at` is `None`, `item` is
    /// inserted at the back of the list.
    pub fn insert(&mut self, item: Index, at: Option<Index>) {
        debug_assert!(!self.is_linked(item.clone()), "item is already linked");

        if let Some(first) = self.head().first {
            let (next, update_first) = match at {
                Some(at) => {
                    let update_first = at == first;
                    (at, update_first)
                }
                None => (first.clone(), false),
            };
            let prev = self.link_of(next.clone()).expect("inconsistent list").prev;

            self.set_link_of(
                item.clone(),
                Some(Link {
                    prev: prev.clone(),
                    next: next.clone(),
                }),
            );
            self.modify_link(prev, |l| l.next = item.clone());
            self.modify_link(next, |l| l.prev = item.clone());

            if update_first {
                self.set_head(ListHead {
                    first: Some(item),
                });
            }
        } else {
            debug_assert!(at.is_none(), "insertion point in an empty list");
            self.set_link_of(
                item.clone(),
                Some(Link {
                    prev: item.clone(),
                    next: item.clone(),
                }),
            );
            self.set_head(ListHead { first: Some(item) });
        }
    }

    pub fn push_back(&mut self, item: Index) {
        self.insert(item, None);
    }

    pub fn push_front(&mut self, item: Index) {
        let first = self.front();
        self.insert(item, first);
    }

    /// Remove `item` from the list.
    pub fn remove(&mut self, item: Index) {
        let link = self.link_of(item.clone()).expect("item is not linked");

        if link.next == item {
            // `item` is the only element
            debug_assert!(self.head().first == Some(item.clone()));
            self.set_head(ListHead { first: None });
        } else {
            if self.head().first == Some(item.clone()) {
                self.set_head(ListHead {
                    first: Some(link.next.clone()),
                });
            }
            let Link { prev, next } = link;
            let next2 = next.clone();
            let prev2 = prev.clone();
            self.modify_link(prev, |l| l.next = next2);
            self.modify_link(next, |l| l.prev = prev2);
        }

        self.set_link_of(item, None);
    }

    pub fn pop_front(&mut self) -> Option<Index> {
        let first = self.front()?;
        self.remove(first.clone());
        Some(first)
    }

    /// Get the element that comes after `i` in the list, or `None` if `i` is
    /// the last element.
    pub fn next(&self, i: Index) -> Option<Index> {
        let next = self.link_of(i).expect("item is not linked").next;
        if Some(next.clone()) == self.head().first {
            None
        } else {
            Some(next)
        }
    }

    /// Get the element that comes before `i` in the list, or `None` if `i` is
    /// the first element.
    pub fn prev(&self, i: Index) -> Option<Index> {
        if Some(i.clone()) == self.head().first {
            None
        } else {
            Some(self.link_of(i).expect("item is not linked").prev)
        }
    }

    fn modify_link(&mut self, i: Index, f: impl FnOnce(&mut Link<Index>)) {
        let mut link = self.link_of(i.clone()).expect("inconsistent list");
        f(&mut link);
        self.set_link_of(i, Some(link));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use std::vec::Vec;

    struct El {
        value: u32,
        link: Cell<Option<Link<usize>>>,
    }

    fn make_pool(values: &[u32]) -> Vec<El> {
        values
            .iter()
            .map(|&value| El {
                value,
                link: Cell::new(None),
            })
            .collect()
    }

    macro_rules! accessor {
        ($head:expr, $pool:expr) => {
            ListAccessorCell::new($head, $pool, |el: &El| &el.link, ())
        };
    }

    fn collect<MapLink: Fn(&El) -> &Cell<Option<Link<usize>>>>(
        acc: &ListAccessorCell<'_, &Cell<ListHead<usize>>, Vec<El>, MapLink, ()>,
    ) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = acc.front();
        while let Some(i) = cur {
            out.push(acc.pool()[i].value);
            cur = acc.next(i);
        }
        out
    }

    #[test]
    fn push_and_iterate() {
        let pool = make_pool(&[10, 20, 30]);
        let head = Cell::new(ListHead::new());
        let mut acc = accessor!(&head, &pool);

        acc.push_back(0);
        acc.push_back(1);
        acc.push_front(2);
        assert_eq!(collect(&acc), [30, 10, 20]);
        assert_eq!(acc.back(), Some(1));
    }

    #[test]
    fn insert_before() {
        let pool = make_pool(&[10, 20, 30]);
        let head = Cell::new(ListHead::new());
        let mut acc = accessor!(&head, &pool);

        acc.push_back(0);
        acc.push_back(1);
        acc.insert(2, Some(1));
        assert_eq!(collect(&acc), [10, 30, 20]);

        // inserting before the first element updates the head
        let pool2 = make_pool(&[1, 2]);
        let head2 = Cell::new(ListHead::new());
        let mut acc2 = accessor!(&head2, &pool2);
        acc2.push_back(0);
        acc2.insert(1, Some(0));
        assert_eq!(collect(&acc2), [2, 1]);
    }

    #[test]
    fn remove_and_pop() {
        let pool = make_pool(&[10, 20, 30, 40]);
        let head = Cell::new(ListHead::new());
        let mut acc = accessor!(&head, &pool);

        for i in 0..4 {
            acc.push_back(i);
        }
        acc.remove(2);
        assert_eq!(collect(&acc), [10, 20, 40]);
        assert!(!acc.is_linked(2));

        assert_eq!(acc.pop_front(), Some(0));
        assert_eq!(acc.pop_front(), Some(1));
        assert_eq!(acc.pop_front(), Some(3));
        assert_eq!(acc.pop_front(), None);
        assert!(acc.is_empty());
    }

    #[test]
    fn single_element() {
        let pool = make_pool(&[7]);
        let head = Cell::new(ListHead::new());
        let mut acc = accessor!(&head, &pool);

        acc.push_back(0);
        assert_eq!(acc.front(), Some(0));
        assert_eq!(acc.back(), Some(0));
        assert_eq!(acc.next(0), None);
        assert_eq!(acc.prev(0), None);
        acc.remove(0);
        assert!(acc.is_empty());
    }
}
