/// Intrusive doubly-linked lists over entry records.
///
/// Uses prev/next ids stored in each entry. Every carved entry sits on
/// exactly one of two lists: the free list, or the used list kept in store
/// order (oldest at the head, which is the eviction candidate).
use super::layout::{Entry, EntryId, NIL};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListHead {
    pub head: EntryId,
    pub tail: EntryId,
}

impl ListHead {
    pub const EMPTY: ListHead = ListHead {
        head: NIL,
        tail: NIL,
    };

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    #[inline]
    pub fn front(&self) -> Option<EntryId> {
        (self.head != NIL).then_some(self.head)
    }

    /// Append `id` at the tail.
    pub fn push_back(&mut self, entries: &mut [Entry], id: EntryId) {
        let e = &mut entries[id as usize];
        e.prev = self.tail;
        e.next = NIL;

        if self.tail != NIL {
            entries[self.tail as usize].next = id;
        } else {
            self.head = id;
        }

        self.tail = id;
    }

    /// Unlink `id`, which must be on this list.
    pub fn remove(&mut self, entries: &mut [Entry], id: EntryId) {
        let (prev, next) = {
            let e = &entries[id as usize];
            (e.prev, e.next)
        };

        if prev != NIL {
            entries[prev as usize].next = next;
        } else {
            self.head = next;
        }

        if next != NIL {
            entries[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }

        let e = &mut entries[id as usize];
        e.prev = NIL;
        e.next = NIL;
    }

    /// Unlink and return the head.
    pub fn pop_front(&mut self, entries: &mut [Entry]) -> Option<EntryId> {
        let id = self.front()?;
        self.remove(entries, id);
        Some(id)
    }

    /// Walk the list from head to tail, stopping after `limit` steps.
    ///
    /// The limit keeps a walk over a damaged list finite.
    pub fn iter<'a>(&self, entries: &'a [Entry], limit: usize) -> ListIter<'a> {
        ListIter {
            entries,
            cursor: self.head,
            remaining: limit,
        }
    }
}

pub struct ListIter<'a> {
    entries: &'a [Entry],
    cursor: EntryId,
    remaining: usize,
}

impl Iterator for ListIter<'_> {
    type Item = EntryId;

    fn next(&mut self) -> Option<EntryId> {
        if self.cursor == NIL || self.remaining == 0 {
            return None;
        }
        let id = self.cursor;
        self.cursor = self.entries.get(id as usize).map_or(NIL, |e| e.next);
        self.remaining -= 1;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: usize) -> Vec<Entry> {
        (0..n).map(|_| Entry::vacant()).collect()
    }

    fn ids(list: &ListHead, entries: &[Entry]) -> Vec<EntryId> {
        list.iter(entries, entries.len()).collect()
    }

    #[test]
    fn push_and_pop_in_fifo_order() {
        let mut entries = table(3);
        let mut list = ListHead::EMPTY;
        for id in 0..3 {
            list.push_back(&mut entries, id);
        }
        assert_eq!(ids(&list, &entries), vec![0, 1, 2]);
        assert_eq!(list.pop_front(&mut entries), Some(0));
        assert_eq!(list.pop_front(&mut entries), Some(1));
        assert_eq!(list.pop_front(&mut entries), Some(2));
        assert_eq!(list.pop_front(&mut entries), None);
        assert!(list.is_empty());
        assert_eq!(list.tail, NIL);
    }

    #[test]
    fn remove_from_middle_and_tail() {
        let mut entries = table(4);
        let mut list = ListHead::EMPTY;
        for id in 0..4 {
            list.push_back(&mut entries, id);
        }
        list.remove(&mut entries, 2);
        assert_eq!(ids(&list, &entries), vec![0, 1, 3]);
        list.remove(&mut entries, 3);
        assert_eq!(ids(&list, &entries), vec![0, 1]);
        assert_eq!(list.tail, 1);
        assert_eq!(entries[1].next, NIL);
    }

    #[test]
    fn splice_between_lists() {
        let mut entries = table(3);
        let mut free = ListHead::EMPTY;
        let mut used = ListHead::EMPTY;
        for id in 0..3 {
            free.push_back(&mut entries, id);
        }
        let id = free.pop_front(&mut entries).unwrap();
        used.push_back(&mut entries, id);
        let id = free.pop_front(&mut entries).unwrap();
        used.push_back(&mut entries, id);

        let oldest = used.pop_front(&mut entries).unwrap();
        free.push_back(&mut entries, oldest);

        assert_eq!(ids(&used, &entries), vec![1]);
        assert_eq!(ids(&free, &entries), vec![2, 0]);
    }

    #[test]
    fn iteration_is_bounded() {
        let mut entries = table(2);
        // a corrupt cycle
        entries[0].next = 1;
        entries[1].next = 0;
        let list = ListHead { head: 0, tail: 1 };
        assert_eq!(list.iter(&entries, 5).count(), 5);
    }
}
