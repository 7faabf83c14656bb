use std::{cmp::Ordering, collections::BinaryHeap};

use crate::iter::CloseableIter;

mod external_sort;

pub use external_sort::{ExternalSorter, SortStats};

struct HeapItem<T> {
    head: T,
    source: usize,
}

impl<T: Ord> PartialEq for HeapItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for HeapItem<T> {}

impl<T: Ord> PartialOrd for HeapItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap: reversed, so the smallest head (and on ties the
// lowest source index) is on top.
impl<T: Ord> Ord for HeapItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .head
            .cmp(&self.head)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges sorted children into one sorted sequence. Equal items come out in
/// child order. The composite owns its children: each is closed once, as soon
/// as it runs dry or when the composite is closed or dropped.
pub struct SortedComposite<I, T>
where
    I: CloseableIter<T>,
    T: Ord,
{
    children: Vec<Option<I>>,
    heap: BinaryHeap<HeapItem<T>>,
    started: bool,
    closed: bool,
}

impl<I, T> SortedComposite<I, T>
where
    I: CloseableIter<T>,
    T: Ord,
{
    pub fn new<J>(j: J) -> Self
    where
        J: IntoIterator<Item = I>,
    {
        let children: Vec<Option<I>> = j.into_iter().map(Some).collect();
        SortedComposite {
            heap: BinaryHeap::with_capacity(children.len()),
            children,
            started: false,
            closed: false,
        }
    }

    /// Children that have not been closed yet.
    pub fn open_children(&self) -> usize {
        self.children.iter().filter(|c| c.is_some()).count()
    }

    fn advance(&mut self, source: usize) -> anyhow::Result<()> {
        let Some(child) = self.children[source].as_mut() else {
            return Ok(());
        };
        match child.next()? {
            Some(head) => self.heap.push(HeapItem { head, source }),
            None => {
                child.close();
                self.children[source] = None;
            }
        }
        Ok(())
    }
}

impl<I, T> CloseableIter<T> for SortedComposite<I, T>
where
    I: CloseableIter<T>,
    T: Ord,
{
    fn next(&mut self) -> anyhow::Result<Option<T>> {
        if self.closed {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
            for source in 0..self.children.len() {
                self.advance(source)?;
            }
        }
        let Some(HeapItem { head, source }) = self.heap.pop() else {
            return Ok(None);
        };
        self.advance(source)?;
        Ok(Some(head))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.heap.clear();
        for child in self.children.iter_mut() {
            if let Some(mut c) = child.take() {
                c.close();
            }
        }
    }
}

impl<I, T> Drop for SortedComposite<I, T>
where
    I: CloseableIter<T>,
    T: Ord,
{
    fn drop(&mut self) {
        self.close();
    }
}
