use std::sync::Arc;

/// An immutable singly linked list. Every "modification" returns a new
/// list that shares as much of its suffix with the original as it can,
/// so a collision list copied into a snapshot costs one `Arc` clone.
pub(crate) struct List<T> {
    head: Option<Arc<Cons<T>>>,
    len: usize,
}

struct Cons<T> {
    item: T,
    next: Option<Arc<Cons<T>>>,
}

impl<T> Clone for List<T> {
    fn clone(&self) -> List<T> {
        List {
            head: self.head.clone(),
            len: self.len,
        }
    }
}

impl<T> Default for List<T> {
    fn default() -> List<T> {
        List { head: None, len: 0 }
    }
}

impl<T> Drop for List<T> {
    fn drop(&mut self) {
        // unlink iteratively so that long uniquely-owned chains don't
        // recurse once per element
        let mut next = self.head.take();
        while let Some(cons) = next {
            match Arc::try_unwrap(cons) {
                Ok(mut owned) => next = owned.next.take(),
                Err(_shared) => break,
            }
        }
    }
}

impl<T> List<T> {
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn head(&self) -> Option<&T> {
        self.head.as_ref().map(|cons| &cons.item)
    }

    /// Everything but the head, or `None` for the empty list.
    pub(crate) fn tail(&self) -> Option<List<T>> {
        let cons = self.head.as_ref()?;
        Some(List {
            head: cons.next.clone(),
            len: self.len - 1,
        })
    }

    /// Returns a new list with `item` prepended.
    pub(crate) fn add(&self, item: T) -> List<T> {
        List {
            head: Some(Arc::new(Cons {
                item,
                next: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    pub(crate) fn iter(&self) -> Iter<'_, T> {
        Iter {
            cursor: self.head.as_deref(),
        }
    }

    pub(crate) fn find<F>(&self, mut predicate: F) -> Option<&T>
    where
        F: FnMut(&T) -> bool,
    {
        self.iter().find(|item| predicate(item))
    }

    pub(crate) fn find_index<F>(&self, predicate: F) -> Option<usize>
    where
        F: FnMut(&T) -> bool,
    {
        self.iter().position(predicate)
    }
}

impl<T: Clone> List<T> {
    /// Returns a new list without the item at `index`, or `None` if
    /// `index` is out of bounds. Items before `index` are copied, the
    /// rest is shared.
    pub(crate) fn remove(&self, index: usize) -> Option<List<T>> {
        if index >= self.len {
            return None;
        }

        let mut prefix = Vec::with_capacity(index);
        let mut cursor = self.head.as_ref();
        for _ in 0..index {
            let cons = cursor?;
            prefix.push(cons.item.clone());
            cursor = cons.next.as_ref();
        }

        let mut ret = List {
            head: cursor?.next.clone(),
            len: self.len - index - 1,
        };

        for item in prefix.into_iter().rev() {
            ret = ret.add(item);
        }

        Some(ret)
    }
}

pub(crate) struct Iter<'a, T> {
    cursor: Option<&'a Cons<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let cons = self.cursor?;
        self.cursor = cons.next.as_deref();
        Some(&cons.item)
    }
}

#[cfg(test)]
mod test {
    use super::List;

    fn items(list: &List<usize>) -> Vec<usize> {
        list.iter().copied().collect()
    }

    #[test]
    fn empty_list() {
        let list = List::<usize>::default();
        assert_eq!(list.len(), 0);
        assert_eq!(list.head(), None);
        assert!(list.tail().is_none());
        assert_eq!(list.iter().count(), 0);
    }

    #[test]
    fn add_is_persistent() {
        let l1 = List::default().add(1);
        assert_eq!(l1.head(), Some(&1));
        assert_eq!(l1.tail().unwrap().len(), 0);

        let l2 = l1.add(2);
        assert_eq!(items(&l2), vec![2, 1]);
        assert_eq!(items(&l1), vec![1]);
        assert_eq!(l2.tail().unwrap().head(), Some(&1));
        assert_eq!(l2.len(), 2);
    }

    #[test]
    fn remove_shares_suffix() {
        let list = List::default().add(1).add(2).add(3).add(4);
        assert_eq!(items(&list), vec![4, 3, 2, 1]);

        let removed = list.remove(1).unwrap();
        assert_eq!(items(&removed), vec![4, 2, 1]);
        assert_eq!(removed.len(), 3);

        // untouched
        assert_eq!(items(&list), vec![4, 3, 2, 1]);

        assert_eq!(items(&list.remove(0).unwrap()), vec![3, 2, 1]);
        assert_eq!(items(&list.remove(3).unwrap()), vec![4, 3, 2]);
        assert!(list.remove(4).is_none());
        assert!(List::<usize>::default().remove(0).is_none());
    }

    #[test]
    fn find_and_find_index() {
        let list = List::default().add(1).add(2).add(3);

        assert_eq!(list.find(|i| *i == 2), Some(&2));
        assert_eq!(list.find(|i| *i == 7), None);

        assert_eq!(list.find_index(|i| *i == 3), Some(0));
        assert_eq!(list.find_index(|i| *i == 1), Some(2));
        assert_eq!(list.find_index(|i| *i == 7), None);
    }

    #[test]
    fn long_list_drops_without_recursion() {
        let mut list = List::default();
        for i in 0..1_000_000 {
            list = list.add(i);
        }
        assert_eq!(list.len(), 1_000_000);
        drop(list);
    }
}
