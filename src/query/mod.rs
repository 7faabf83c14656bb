use std::{
    cmp::Ordering as CmpOrdering,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::warn;

use crate::{
    iter::{drain, BoxedLines, CloseableIter, Collapse},
    merge::SortedComposite,
};


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchMode {
    /// Lines whose leading field(s) equal the key.
    Exact,
    /// Lines starting with the key.
    Prefix,
    /// `key <= line < end`.
    Range { end: String },
    /// Every line from the key onwards.
    From,
}

/// Where a line sits relative to a query in sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Before,
    Inside,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    key: String,
    mode: SearchMode,
}

impl Query {
    pub fn new(key: &str, mode: SearchMode) -> Self {
        Query {
            key: key.to_owned(),
            mode,
        }
    }

    pub fn exact(key: &str) -> Self {
        Self::new(key, SearchMode::Exact)
    }

    pub fn prefix(key: &str) -> Self {
        Self::new(key, SearchMode::Prefix)
    }

    pub fn range(start: &str, end: &str) -> Self {
        Self::new(
            start,
            SearchMode::Range {
                end: end.to_owned(),
            },
        )
    }

    pub fn from(key: &str) -> Self {
        Self::new(key, SearchMode::From)
    }

    /// The smallest line the query can select.
    pub fn start(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> &SearchMode {
        &self.mode
    }

    /// Classifies a line (or a block key, which is a line prefix). Lines are
    /// compared as bytes, the order CDX files are sorted in.
    pub fn classify(&self, line: &str) -> Position {
        let key = self.key.as_str();
        match &self.mode {
            // `key` followed by a byte below the separator sorts before the
            // matching lines.
            SearchMode::Exact => match line.strip_prefix(key).map(|r| r.bytes().next()) {
                Some(None) | Some(Some(b' ')) => Position::Inside,
                Some(Some(b)) if b < b' ' => Position::Before,
                Some(_) => Position::After,
                None if line < key => Position::Before,
                None => Position::After,
            },
            SearchMode::Prefix => {
                if line.starts_with(key) {
                    Position::Inside
                } else if line < key {
                    Position::Before
                } else {
                    Position::After
                }
            }
            SearchMode::Range { end } => match (line.cmp(key), line.cmp(end.as_str())) {
                (CmpOrdering::Less, _) => Position::Before,
                (_, CmpOrdering::Less) => Position::Inside,
                _ => Position::After,
            },
            SearchMode::From => {
                if line < key {
                    Position::Before
                } else {
                    Position::Inside
                }
            }
        }
    }
}

/// Set when a result may be missing lines: a cap was hit, a corrupt block was
/// skipped, or a source failed. Shared by every iterator of one query and
/// only final once the lines were drained.
#[derive(Debug, Clone, Default)]
pub struct TruncationFlag(Arc<AtomicBool>);

impl TruncationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct SearchResult {
    pub lines: BoxedLines,
    pub truncated: TruncationFlag,
}

impl SearchResult {
    /// Drains the lines; the flag is read afterwards.
    pub fn collect(mut self) -> anyhow::Result<(Vec<String>, bool)> {
        let lines = drain(&mut self.lines)?;
        Ok((lines, self.truncated.is_set()))
    }
}

/// Anything that answers CDX queries: a cluster, a plain sorted file, or a
/// set of those.
pub trait CdxSource: Send + Sync {
    fn name(&self) -> &str;

    /// Starts a lazy lookup. Implementations mark `truncated` when they know
    /// lines are missing.
    fn open(&self, query: &Query, truncated: &TruncationFlag) -> anyhow::Result<BoxedLines>;

    fn search(&self, query: &Query) -> anyhow::Result<SearchResult> {
        let truncated = TruncationFlag::new();
        let lines = self.open(query, &truncated)?;
        Ok(SearchResult { lines, truncated })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Any source error fails the query.
    FailFast,
    /// A failing source is dropped from the result and the query is marked
    /// truncated.
    SkipFailed,
}

/// Fans a query out to several sources and merges their answers in sort
/// order.
pub struct InputSet {
    name: String,
    sources: Vec<Arc<dyn CdxSource>>,
    policy: Option<ErrorPolicy>,
    collapse: Option<(usize, Option<usize>)>,
}

impl InputSet {
    pub fn new(name: &str, sources: Vec<Arc<dyn CdxSource>>) -> Self {
        InputSet {
            name: name.to_owned(),
            sources,
            policy: None,
            collapse: None,
        }
    }

    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Folds adjacent lines sharing `key_fields` leading fields (and the
    /// `extra_field`, if given).
    pub fn with_collapse(mut self, key_fields: usize, extra_field: Option<usize>) -> Self {
        self.collapse = Some((key_fields, extra_field));
        self
    }

    /// One source fails fast unless told otherwise; several skip failures.
    pub fn policy(&self) -> ErrorPolicy {
        match self.policy {
            Some(policy) => policy,
            None if self.sources.len() <= 1 => ErrorPolicy::FailFast,
            None => ErrorPolicy::SkipFailed,
        }
    }

    pub fn sources(&self) -> &[Arc<dyn CdxSource>] {
        &self.sources
    }
}

impl CdxSource for InputSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, query: &Query, truncated: &TruncationFlag) -> anyhow::Result<BoxedLines> {
        let policy = self.policy();
        let mut children: Vec<BoxedLines> = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match source.open(query, truncated) {
                Ok(lines) if policy == ErrorPolicy::SkipFailed => children.push(Box::new(
                    FailSoft::new(lines, source.name(), truncated.clone()),
                )),
                Ok(lines) => children.push(lines),
                Err(e) if policy == ErrorPolicy::SkipFailed => {
                    warn!("{}: skipping source {}: {:#}", self.name, source.name(), e);
                    truncated.mark();
                }
                Err(e) => {
                    for child in &mut children {
                        child.close();
                    }
                    return Err(e);
                }
            }
        }
        let merged: BoxedLines = match children.len() {
            1 => children.remove(0),
            _ => Box::new(SortedComposite::new(children)),
        };
        Ok(match self.collapse {
            Some((key_fields, extra)) => Box::new(Collapse::new(merged, key_fields, extra)),
            None => merged,
        })
    }
}

/// Turns an error from one source into the end of that source, marking the
/// query truncated.
struct FailSoft {
    inner: BoxedLines,
    source: String,
    truncated: TruncationFlag,
    done: bool,
}

impl FailSoft {
    fn new(inner: BoxedLines, source: &str, truncated: TruncationFlag) -> Self {
        FailSoft {
            inner,
            source: source.to_owned(),
            truncated,
            done: false,
        }
    }
}

impl CloseableIter<String> for FailSoft {
    fn next(&mut self) -> anyhow::Result<Option<String>> {
        if self.done {
            return Ok(None);
        }
        match self.inner.next() {
            Ok(Some(line)) => Ok(Some(line)),
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(e) => {
                warn!("source {} failed mid-query: {:#}", self.source, e);
                self.truncated.mark();
                self.close();
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        if !self.done {
            self.done = true;
            self.inner.close();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{CdxSource, ErrorPolicy, InputSet, Position, Query, TruncationFlag};
    use crate::{
        error::Error,
        iter::{BoxedLines, Bounded, CloseableIter, VecIter},
    };

    /// Serves fixed sorted lines, or fails, optionally after `fail_after`
    /// lines.
    struct Fixed {
        name: String,
        lines: Vec<String>,
        missing: bool,
        fail_after: Option<usize>,
        opens: Arc<AtomicUsize>,
    }

    impl Fixed {
        fn new(name: &str, lines: &[&str]) -> Self {
            Fixed {
                name: name.to_owned(),
                lines: lines.iter().map(|l| l.to_string()).collect(),
                missing: false,
                fail_after: None,
                opens: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn missing(name: &str) -> Self {
            Fixed {
                missing: true,
                ..Self::new(name, &[])
            }
        }
    }

    struct FailAfter {
        inner: VecIter<String>,
        left: usize,
        name: String,
    }

    impl CloseableIter<String> for FailAfter {
        fn next(&mut self) -> anyhow::Result<Option<String>> {
            if self.left == 0 {
                return Err(Error::Connection {
                    location: self.name.clone(),
                    message: "reset by peer".to_owned(),
                }
                .into());
            }
            self.left -= 1;
            self.inner.next()
        }

        fn close(&mut self) {
            self.inner.close()
        }
    }

    impl CdxSource for Fixed {
        fn name(&self) -> &str {
            &self.name
        }

        fn open(&self, query: &Query, _truncated: &TruncationFlag) -> anyhow::Result<BoxedLines> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.missing {
                return Err(Error::NotFound {
                    location: self.name.clone(),
                }
                .into());
            }
            let lines = VecIter::new(self.lines.clone());
            Ok(match self.fail_after {
                Some(left) => Box::new(Bounded::new(
                    FailAfter {
                        inner: lines,
                        left,
                        name: self.name.clone(),
                    },
                    query.clone(),
                )),
                None => Box::new(Bounded::new(lines, query.clone())),
            })
        }
    }

    #[test]
    fn test_classify() {
        let q = Query::exact("com,a)/");
        assert_eq!(q.classify("com,a)/ 2001"), Position::Inside);
        assert_eq!(q.classify("com,a)/"), Position::Inside);
        assert_eq!(q.classify("com,a)/x 2001"), Position::After);
        assert_eq!(q.classify("com,9)/ 2001"), Position::Before);
        assert_eq!(q.classify("com,a)/\t2001"), Position::Before);

        // The tab line sorts first, so a scan must pass it to reach the
        // matches.
        let mut lines = vec!["com,a)/ 2001", "com,a)/\tx", "com,a)/0"];
        lines.sort();
        let positions: Vec<Position> = lines.iter().map(|l| q.classify(l)).collect();
        assert_eq!(positions, vec![Position::Before, Position::Inside, Position::After]);

        let q = Query::prefix("com,a");
        assert_eq!(q.classify("com,ab)/ 1"), Position::Inside);
        assert_eq!(q.classify("com,b)/ 1"), Position::After);

        let q = Query::range("b", "d");
        assert_eq!(q.classify("a"), Position::Before);
        assert_eq!(q.classify("b"), Position::Inside);
        assert_eq!(q.classify("czz"), Position::Inside);
        assert_eq!(q.classify("d"), Position::After);

        let q = Query::from("m");
        assert_eq!(q.classify("l"), Position::Before);
        assert_eq!(q.classify("zzz"), Position::Inside);
    }

    fn three(failing_middle: bool) -> Vec<Arc<dyn CdxSource>> {
        let middle: Arc<dyn CdxSource> = if failing_middle {
            Arc::new(Fixed::missing("b.cdx"))
        } else {
            Arc::new(Fixed::new("b.cdx", &["com,x)/ 1", "com,x)/ 4"]))
        };
        vec![
            Arc::new(Fixed::new("a.cdx", &["com,x)/ 2", "com,x)/ 5", "com,y)/ 1"])),
            middle,
            Arc::new(Fixed::new("c.cdx", &["com,w)/ 1", "com,x)/ 3"])),
        ]
    }

    #[test]
    fn test_merge_across_sources() -> anyhow::Result<()> {
        let set = InputSet::new("all", three(false));
        let (lines, truncated) = set.search(&Query::exact("com,x)/"))?.collect()?;
        assert_eq!(
            lines,
            vec!["com,x)/ 1", "com,x)/ 2", "com,x)/ 3", "com,x)/ 4", "com,x)/ 5"]
        );
        assert!(!truncated);
        Ok(())
    }

    #[test]
    fn test_missing_source_is_skipped() -> anyhow::Result<()> {
        let set = InputSet::new("all", three(true));
        assert_eq!(set.policy(), ErrorPolicy::SkipFailed);
        let (lines, truncated) = set.search(&Query::exact("com,x)/"))?.collect()?;
        assert_eq!(lines, vec!["com,x)/ 2", "com,x)/ 3", "com,x)/ 5"]);
        assert!(truncated);

        // Same answer the second time.
        let (again, truncated) = set.search(&Query::exact("com,x)/"))?.collect()?;
        assert_eq!(again, lines);
        assert!(truncated);
        Ok(())
    }

    #[test]
    fn test_fail_fast() {
        let single = InputSet::new("one", vec![Arc::new(Fixed::missing("a.cdx"))]);
        assert_eq!(single.policy(), ErrorPolicy::FailFast);
        let err = single.search(&Query::prefix("com,")).err().unwrap();
        assert!(matches!(Error::find(&err), Some(Error::NotFound { .. })));

        let strict = InputSet::new("all", three(true)).with_policy(ErrorPolicy::FailFast);
        assert!(strict.search(&Query::prefix("com,")).is_err());
    }

    #[test]
    fn test_mid_iteration_failure() -> anyhow::Result<()> {
        let mut flaky = Fixed::new("b.cdx", &["com,x)/ 1", "com,x)/ 4", "com,x)/ 6"]);
        flaky.fail_after = Some(1);
        let set = InputSet::new(
            "all",
            vec![
                Arc::new(Fixed::new("a.cdx", &["com,x)/ 2", "com,x)/ 5"])),
                Arc::new(flaky),
            ],
        );
        let (lines, truncated) = set.search(&Query::exact("com,x)/"))?.collect()?;
        assert_eq!(lines, vec!["com,x)/ 1", "com,x)/ 2", "com,x)/ 5"]);
        assert!(truncated);

        let mut flaky = Fixed::new("b.cdx", &["com,x)/ 1", "com,x)/ 4"]);
        flaky.fail_after = Some(1);
        let single = InputSet::new("one", vec![Arc::new(flaky)]);
        assert!(single.search(&Query::exact("com,x)/"))?.collect().is_err());
        Ok(())
    }

    #[test]
    fn test_collapse_duplicates_across_sources() -> anyhow::Result<()> {
        let set = InputSet::new(
            "all",
            vec![
                Arc::new(Fixed::new("a.cdx", &["com,x)/ 1 200", "com,x)/ 2 200"])),
                Arc::new(Fixed::new("b.cdx", &["com,x)/ 1 200", "com,x)/ 3 200"])),
            ],
        )
        .with_collapse(2, None);
        let (lines, _) = set.search(&Query::exact("com,x)/"))?.collect()?;
        assert_eq!(lines, vec!["com,x)/ 1 200", "com,x)/ 2 200", "com,x)/ 3 200"]);
        Ok(())
    }
}
