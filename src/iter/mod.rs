// Closeable lazy sequences. Everything a query hands back is one of these:
// a pull-based sequence that can fail mid-way and that must be told when the
// consumer is done, so the readers and connections underneath are released
// even when the sequence was not drained.

use crate::query::{Position, Query};

pub trait CloseableIter<T> {
    fn next(&mut self) -> anyhow::Result<Option<T>>;

    /// Releases whatever the iterator holds. Idempotent; `next` after
    /// `close` returns `None`.
    fn close(&mut self);
}

impl<T, I> CloseableIter<T> for Box<I>
where
    I: CloseableIter<T> + ?Sized,
{
    fn next(&mut self) -> anyhow::Result<Option<T>> {
        (**self).next()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

pub type BoxedLines = Box<dyn CloseableIter<String> + Send>;

/// Pulls everything out of `iter` and closes it, also on error.
pub fn drain<T, I>(iter: &mut I) -> anyhow::Result<Vec<T>>
where
    I: CloseableIter<T> + ?Sized,
{
    let mut out = Vec::new();
    let result = loop {
        match iter.next() {
            Ok(Some(v)) => out.push(v),
            Ok(None) => break Ok(out),
            Err(e) => break Err(e),
        }
    };
    iter.close();
    result
}

#[derive(Debug)]
pub struct VecIter<T> {
    items: std::vec::IntoIter<T>,
}

impl<T> VecIter<T> {
    pub fn new(items: Vec<T>) -> Self {
        VecIter {
            items: items.into_iter(),
        }
    }
}

impl<T> CloseableIter<T> for VecIter<T> {
    fn next(&mut self) -> anyhow::Result<Option<T>> {
        Ok(self.items.next())
    }

    fn close(&mut self) {
        self.items = Vec::new().into_iter();
    }
}

pub struct Peekable<I, T> {
    inner: I,
    head: Option<T>,
}

impl<I, T> Peekable<I, T>
where
    I: CloseableIter<T>,
{
    pub fn new(inner: I) -> Self {
        Peekable { inner, head: None }
    }

    pub fn peek(&mut self) -> anyhow::Result<Option<&T>> {
        if self.head.is_none() {
            self.head = self.inner.next()?;
        }
        Ok(self.head.as_ref())
    }

    pub fn has_next(&mut self) -> anyhow::Result<bool> {
        Ok(self.peek()?.is_some())
    }
}

impl<I, T> CloseableIter<T> for Peekable<I, T>
where
    I: CloseableIter<T>,
{
    fn next(&mut self) -> anyhow::Result<Option<T>> {
        match self.head.take() {
            Some(v) => Ok(Some(v)),
            None => self.inner.next(),
        }
    }

    fn close(&mut self) {
        self.head = None;
        self.inner.close();
    }
}

/// Restricts a sorted line sequence to the lines a query selects. Leading
/// lines before the bound are skipped; the first line past it ends the
/// sequence and closes the source right away.
pub struct Bounded<I> {
    inner: I,
    query: Query,
    done: bool,
}

impl<I> Bounded<I>
where
    I: CloseableIter<String>,
{
    pub fn new(inner: I, query: Query) -> Self {
        Bounded {
            inner,
            query,
            done: false,
        }
    }
}

impl<I> CloseableIter<String> for Bounded<I>
where
    I: CloseableIter<String>,
{
    fn next(&mut self) -> anyhow::Result<Option<String>> {
        while !self.done {
            let Some(line) = self.inner.next()? else {
                self.close();
                break;
            };
            match self.query.classify(&line) {
                Position::Before => continue,
                Position::Inside => return Ok(Some(line)),
                Position::After => self.close(),
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        if !self.done {
            self.done = true;
            self.inner.close();
        }
    }
}

/// The first `n` space-separated fields of a CDX line, joined as they were.
pub fn leading_fields(line: &str, n: usize) -> &str {
    match line.match_indices(' ').nth(n.saturating_sub(1)) {
        Some((idx, _)) if n > 0 => &line[..idx],
        _ if n == 0 => "",
        _ => line,
    }
}

fn field(line: &str, n: usize) -> Option<&str> {
    line.split(' ').nth(n)
}

/// Drops a line when it repeats the previous one's leading `key_fields`
/// fields and, if set, the `extra_field` too (e.g. the status code), which
/// is how the same capture indexed by two sources is folded into one.
pub struct Collapse<I> {
    inner: I,
    key_fields: usize,
    extra_field: Option<usize>,
    last: Option<String>,
}

impl<I> Collapse<I>
where
    I: CloseableIter<String>,
{
    pub fn new(inner: I, key_fields: usize, extra_field: Option<usize>) -> Self {
        Collapse {
            inner,
            key_fields,
            extra_field,
            last: None,
        }
    }

    fn same(&self, a: &str, b: &str) -> bool {
        if leading_fields(a, self.key_fields) != leading_fields(b, self.key_fields) {
            return false;
        }
        match self.extra_field {
            Some(n) => field(a, n) == field(b, n),
            None => true,
        }
    }
}

impl<I> CloseableIter<String> for Collapse<I>
where
    I: CloseableIter<String>,
{
    fn next(&mut self) -> anyhow::Result<Option<String>> {
        while let Some(line) = self.inner.next()? {
            if let Some(last) = &self.last {
                if self.same(last, &line) {
                    continue;
                }
            }
            self.last = Some(line.clone());
            return Ok(Some(line));
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}
