//! Reading trees and alignments, writing results.
//!
//! Paths ending in `.gz` are transparently (de)compressed; `-` reads from
//! stdin.

use crate::alignment::Alignment;
use crate::error::{LikelihoodError, Result};
use crate::orchestrator::TreeOutcome;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use phylotree::tree::Tree as PhyloTree;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

/// Boxed reader handed out by [`open_input`].
pub type InputReader = Box<dyn BufRead + Send>;

fn is_gz(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".gz")
}

/// Open `path` for reading, `-` meaning stdin.
pub fn open_input<P: AsRef<Path>>(path: P) -> io::Result<InputReader> {
    let p = path.as_ref();
    if p.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }

    let f = File::open(p)?;
    if is_gz(p) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(f))))
    } else {
        Ok(Box::new(BufReader::new(f)))
    }
}

/// Lazily parsed `;`-terminated Newick trees.
///
/// Each item is one tree; a tree that fails to parse yields an error item
/// and the stream continues with the next one. An I/O error ends the stream.
pub struct NewickTrees<R> {
    reader: R,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead> NewickTrees<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for NewickTrees<R> {
    type Item = Result<PhyloTree>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        self.buf.clear();
        match self.reader.read_until(b';', &mut self.buf) {
            Ok(0) => {
                self.done = true;
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        }

        let text = match std::str::from_utf8(&self.buf) {
            Ok(t) => t.trim(),
            Err(e) => return Some(Err(LikelihoodError::TreeParse(e.to_string()))),
        };
        if text.is_empty() {
            self.done = true;
            return None;
        }
        if !text.ends_with(';') {
            self.done = true;
            return Some(Err(LikelihoodError::TreeParse(format!(
                "unterminated tree at end of input: '{}'",
                truncate(text, 40)
            ))));
        }

        Some(parse_tree(text))
    }
}

/// Parse one `;`-terminated tree. A bare `;` is an empty tree; a panic
/// inside the Newick parser (e.g. on a single-node tree) becomes a parse
/// error like any other.
fn parse_tree(text: &str) -> Result<PhyloTree> {
    if text[..text.len() - 1].trim().is_empty() {
        return Err(LikelihoodError::TreeParse("empty tree".into()));
    }
    match catch_unwind(AssertUnwindSafe(|| PhyloTree::from_newick(text))) {
        Ok(parsed) => parsed.map_err(|e| LikelihoodError::TreeParse(e.to_string())),
        Err(_) => Err(LikelihoodError::TreeParse(format!(
            "malformed tree '{}'",
            truncate(text, 40)
        ))),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Stream the trees of a Newick file (or stdin for `-`).
pub fn read_trees<P: AsRef<Path>>(path: P) -> io::Result<NewickTrees<InputReader>> {
    Ok(NewickTrees::new(open_input(path)?))
}

/// Read a FASTA alignment (plain or gzip).
pub fn read_alignment<P: AsRef<Path>>(path: P) -> Result<Alignment> {
    let alignment = Alignment::from_fasta(open_input(path.as_ref())?)?;
    tracing::debug!(
        path = %path.as_ref().display(),
        sequences = alignment.sequence_count(),
        length = alignment.length(),
        "read alignment"
    );
    Ok(alignment)
}

/// Write per-tree outcomes as TSV with a `tree\tlog_likelihood` header.
/// If `path` ends with `.gz`, the output is gzip-compressed. Failed trees are
/// written with `NA`.
pub fn write_results_tsv<P: AsRef<Path>>(path: P, outcomes: &[TreeOutcome]) -> io::Result<()> {
    let p = path.as_ref();
    if p.as_os_str() == "-" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "writing to stdout is not supported by write_results_tsv",
        ));
    }

    let mut out: Box<dyn Write> = if is_gz(p) {
        let f = File::create(p)?;
        let enc = GzEncoder::new(f, Compression::default());
        Box::new(BufWriter::new(enc))
    } else {
        Box::new(BufWriter::new(File::create(p)?))
    };

    writeln!(&mut out, "tree\tlog_likelihood")?;
    for outcome in outcomes {
        match &outcome.result {
            Ok(lnl) => writeln!(&mut out, "{}\t{}", outcome.index, lnl)?,
            Err(_) => writeln!(&mut out, "{}\tNA", outcome.index)?,
        }
    }

    out.flush()?;
    Ok(())
}
