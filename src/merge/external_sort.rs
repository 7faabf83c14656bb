// Sorting line sets larger than memory.
//
// Runs are produced by replacement selection: a heap of `memory_records`
// lines, each popped line is written to the current run, and the line read to
// replace it joins the current run if it is not smaller than the one just
// written, the next run otherwise. On random input runs come out about twice
// the heap size; sorted input is a single run.
//
// Runs are spread over `fan_in` tapes in a Fibonacci distribution (Knuth
// 5.4.2, algorithm D), padding with zero-length dummy runs, and merged
// polyphase: each phase merges runs from every tape but the output one until
// some tape empties, which then becomes the next output.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
    fs::File,
    io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write},
    path::PathBuf,
};

use anyhow::bail;
use log::debug;

use super::SortedComposite;
use crate::iter::CloseableIter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortStats {
    pub records: u64,
    pub runs: u64,
    pub phases: u32,
}

#[derive(Debug, Clone)]
pub struct ExternalSorter {
    memory_records: usize,
    fan_in: usize,
    scratch_dir: Option<PathBuf>,
}

struct Tape {
    file: File,
    reader: Option<BufReader<File>>,
    writer: Option<BufWriter<File>>,
    // Record count of every run on the tape, in order.
    runs: VecDeque<u64>,
}

impl Tape {
    fn new(dir: Option<&PathBuf>) -> anyhow::Result<Self> {
        let file = match dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Tape {
            file,
            reader: None,
            writer: None,
            runs: VecDeque::new(),
        })
    }

    fn rewind_for_write(&mut self) -> anyhow::Result<()> {
        self.reader = None;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.writer = Some(BufWriter::new(self.file.try_clone()?));
        Ok(())
    }

    fn rewind_for_read(&mut self) -> anyhow::Result<()> {
        if let Some(w) = self.writer.take() {
            w.into_inner().map_err(|e| e.into_error())?;
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.reader = Some(BufReader::new(self.file.try_clone()?));
        Ok(())
    }

    fn write_record(&mut self, record: &str) -> anyhow::Result<()> {
        let Some(w) = self.writer.as_mut() else {
            bail!("scratch tape is not open for writing");
        };
        w.write_all(record.as_bytes())?;
        w.write_all(b"\n")?;
        Ok(())
    }

    fn read_record(&mut self) -> anyhow::Result<Option<String>> {
        let Some(r) = self.reader.as_mut() else {
            bail!("scratch tape is not open for reading");
        };
        let mut line = String::new();
        if r.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(Some(line))
    }
}

/// Reads one run off a tape.
struct RunIter<'a> {
    tape: &'a mut Tape,
    left: u64,
}

impl<'a> CloseableIter<String> for RunIter<'a> {
    fn next(&mut self) -> anyhow::Result<Option<String>> {
        if self.left == 0 {
            return Ok(None);
        }
        self.left -= 1;
        match self.tape.read_record()? {
            Some(record) => Ok(Some(record)),
            None => bail!("scratch tape ended inside a run"),
        }
    }

    fn close(&mut self) {}
}

// Algorithm D bookkeeping: `a` holds the perfect distribution of the current
// level, `d` the runs each tape still needs to reach it.
struct Distribution {
    a: Vec<u64>,
    d: Vec<u64>,
    level: u32,
    j: usize,
    started: bool,
}

impl Distribution {
    fn new(tapes: usize) -> Self {
        let mut a = vec![1; tapes + 1];
        a[tapes] = 0;
        let d = a.clone();
        Distribution {
            a,
            d,
            level: 1,
            j: 0,
            started: false,
        }
    }

    fn next_tape(&mut self) -> usize {
        if self.started {
            let j = self.j;
            if self.d[j] < self.d[j + 1] {
                self.j += 1;
            } else {
                if self.d[j] == 0 {
                    self.raise_level();
                }
                self.j = 0;
            }
        }
        self.started = true;
        self.d[self.j] -= 1;
        self.j
    }

    fn raise_level(&mut self) {
        self.level += 1;
        let a0 = self.a[0];
        for i in 0..self.a.len() - 1 {
            self.d[i] = a0 + self.a[i + 1] - self.a[i];
            self.a[i] = a0 + self.a[i + 1];
        }
    }
}

impl ExternalSorter {
    /// `memory_records` lines are held in memory at once; runs are merged
    /// `fan_in` at a time.
    pub fn new(memory_records: usize, fan_in: usize) -> Self {
        ExternalSorter {
            memory_records: memory_records.max(1),
            fan_in: fan_in.max(2),
            scratch_dir: None,
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Sorts every line of `input` into `out`, one line per `\n`. Closes
    /// `input`.
    pub fn sort<I, W>(&self, input: &mut I, out: &mut W) -> anyhow::Result<SortStats>
    where
        I: CloseableIter<String> + ?Sized,
        W: Write,
    {
        let mut tapes = (0..=self.fan_in)
            .map(|_| Tape::new(self.scratch_dir.as_ref()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let result = self.distribute(input, &mut tapes);
        input.close();
        let mut stats = result?;
        stats.phases = self.merge_phases(&mut tapes)?;

        let Some(last) = tapes.iter_mut().find(|t| t.runs.len() == 1) else {
            bail!("polyphase merge did not converge to one run");
        };
        last.rewind_for_read()?;
        let mut run = RunIter {
            left: last.runs[0],
            tape: last,
        };
        while let Some(record) = run.next()? {
            out.write_all(record.as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        debug!(
            "sorted {} records in {} runs, {} merge phases",
            stats.records, stats.runs, stats.phases
        );
        Ok(stats)
    }

    fn distribute<I>(&self, input: &mut I, tapes: &mut [Tape]) -> anyhow::Result<SortStats>
    where
        I: CloseableIter<String> + ?Sized,
    {
        let mut stats = SortStats::default();
        for tape in tapes.iter_mut().take(self.fan_in) {
            tape.rewind_for_write()?;
        }
        let mut dist = Distribution::new(self.fan_in);

        let mut heap = BinaryHeap::with_capacity(self.memory_records);
        while heap.len() < self.memory_records {
            match input.next()? {
                Some(line) => heap.push(Reverse((0_u64, line))),
                None => break,
            }
        }

        // (run number, tape, records so far)
        let mut current: Option<(u64, usize, u64)> = None;
        while let Some(Reverse((run, line))) = heap.pop() {
            let (tape, count) = match current {
                Some((r, tape, count)) if r == run => (tape, count),
                _ => {
                    if let Some((_, tape, count)) = current {
                        tapes[tape].runs.push_back(count);
                    }
                    stats.runs += 1;
                    (dist.next_tape(), 0)
                }
            };
            tapes[tape].write_record(&line)?;
            stats.records += 1;
            current = Some((run, tape, count + 1));

            if let Some(next) = input.next()? {
                let next_run = if next >= line { run } else { run + 1 };
                heap.push(Reverse((next_run, next)));
            }
        }
        if let Some((_, tape, count)) = current {
            tapes[tape].runs.push_back(count);
        }

        for (tape, dummies) in tapes.iter_mut().zip(dist.d.iter()) {
            for _ in 0..*dummies {
                tape.runs.push_front(0);
            }
        }
        debug!(
            "distributed {} runs at level {} over {} tapes",
            stats.runs, dist.level, self.fan_in
        );
        Ok(stats)
    }

    fn merge_phases(&self, tapes: &mut [Tape]) -> anyhow::Result<u32> {
        let mut output = self.fan_in;
        for (i, tape) in tapes.iter_mut().enumerate() {
            if i == output {
                tape.rewind_for_write()?;
            } else {
                tape.rewind_for_read()?;
            }
        }

        let mut phases = 0;
        while tapes.iter().map(|t| t.runs.len()).sum::<usize>() > 1 {
            let (before, rest) = tapes.split_at_mut(output);
            let (out_tape, after) = rest.split_at_mut(1);
            let out_tape = &mut out_tape[0];
            let mut inputs: Vec<&mut Tape> = before.iter_mut().chain(after.iter_mut()).collect();

            let merges = inputs.iter().map(|t| t.runs.len()).min().unwrap_or(0);
            if merges == 0 {
                bail!("polyphase merge stalled with an empty input tape");
            }
            for _ in 0..merges {
                let children: Vec<RunIter<'_>> = inputs
                    .iter_mut()
                    .map(|t| {
                        let left = t.runs.pop_front().unwrap_or(0);
                        RunIter { tape: &mut **t, left }
                    })
                    .collect();
                let mut merged = SortedComposite::new(children);
                let mut count = 0;
                while let Some(record) = merged.next()? {
                    out_tape.write_record(&record)?;
                    count += 1;
                }
                merged.close();
                drop(merged);
                out_tape.runs.push_back(count);
            }
            phases += 1;

            let Some(emptied) = (0..tapes.len()).find(|&i| i != output && tapes[i].runs.is_empty())
            else {
                bail!("polyphase phase emptied no tape");
            };
            tapes[output].rewind_for_read()?;
            tapes[emptied].rewind_for_write()?;
            output = emptied;
        }
        Ok(phases)
    }
}
