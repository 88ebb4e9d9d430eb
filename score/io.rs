// ========================================================================================
//
//                         Reading requests, profiles and caches
//
// ========================================================================================
//
// The input of a run is a stream of JSON documents, one per line: the request first,
// then any number of profiles. Inputs may be gzip-compressed; compression is detected
// from the magic bytes rather than the file name so that piped input works too.
// Output is JSON Lines as well, plus an optional TSV of cluster labels.

use crate::cluster::{ClusterOutput, Clusters};
use crate::progress::{Progress, ProgressKind};
use crate::types::{Cache, Profile, Request};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const READ_BUFFER: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("Failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed JSON on line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("The input is empty; the first line must hold the request")]
    MissingRequest,
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Failed to write output: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to encode JSON output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to write TSV output: {0}")]
    Csv(#[from] csv::Error),
}

/// Wraps `reader` in a gzip decoder if its first bytes are the gzip magic number.
pub fn decompressing<R>(reader: R) -> io::Result<Box<dyn BufRead + Send>>
where
    R: Read + Send + 'static,
{
    let mut buffered = BufReader::with_capacity(READ_BUFFER, reader);
    let is_gzip = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        Ok(Box::new(BufReader::with_capacity(
            READ_BUFFER,
            MultiGzDecoder::new(buffered),
        )))
    } else {
        Ok(Box::new(buffered))
    }
}

/// Opens `path`, or stdin when no path is given, decompressing if needed.
pub fn open_input(path: Option<&Path>) -> io::Result<Box<dyn BufRead + Send>> {
    match path {
        Some(path) => decompressing(File::open(path)?),
        None => decompressing(io::stdin()),
    }
}

/// A line-oriented reader over one input stream: the request, then profiles.
pub struct InputReader<R> {
    reader: R,
    line: usize,
    buffer: String,
}

impl<R: BufRead> InputReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buffer: String::new(),
        }
    }

    fn next_line(&mut self) -> io::Result<Option<&str>> {
        loop {
            self.buffer.clear();
            if self.reader.read_line(&mut self.buffer)? == 0 {
                return Ok(None);
            }
            self.line += 1;
            if !self.buffer.trim().is_empty() {
                return Ok(Some(self.buffer.trim()));
            }
        }
    }

    /// Reads the request. Must be called before iterating over the profiles.
    pub fn request(&mut self) -> Result<Request, InputError> {
        let text = self.next_line()?.ok_or(InputError::MissingRequest)?;
        let request = serde_json::from_str(text);
        request.map_err(|source| InputError::Json {
            line: self.line,
            source,
        })
    }
}

impl<R: BufRead> Iterator for InputReader<R> {
    type Item = Result<Profile, InputError>;

    fn next(&mut self) -> Option<Self::Item> {
        let text = match self.next_line() {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => return Some(Err(e.into())),
        };
        let profile = serde_json::from_str(text);
        Some(profile.map_err(|source| InputError::Json {
            line: self.line,
            source,
        }))
    }
}

/// Reads a cache document written by [`write_cache`].
pub fn read_cache(path: &Path) -> Result<Cache, InputError> {
    let reader = decompressing(File::open(path)?)?;
    serde_json::from_reader(reader).map_err(|source| InputError::Json { line: 1, source })
}

pub fn write_cache(path: &Path, cache: &Cache) -> Result<(), OutputError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, cache)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Writes one JSON document per line as the documents arrive, reporting each as a
/// saved result.
pub fn write_outputs<W, I>(writer: W, outputs: I, progress: &Progress) -> Result<(), OutputError>
where
    W: Write,
    I: IntoIterator<Item = ClusterOutput>,
{
    let mut writer = BufWriter::new(writer);
    for output in outputs {
        serde_json::to_writer(&mut writer, &output)?;
        writer.write_all(b"\n")?;
        progress.emit(ProgressKind::SavedResult, 1);
    }
    writer.flush()?;
    Ok(())
}

/// Writes a TSV with one row per id and one column per cut, each cell holding the id
/// of the cluster's representative at that threshold.
pub fn write_labels<W: Write>(
    writer: W,
    clusters: &Clusters,
    cuts: &[i32],
) -> Result<(), OutputError> {
    let mut tsv = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer);

    let mut header = vec!["st".to_string()];
    header.extend(cuts.iter().map(|cut| format!("t{cut}")));
    tsv.write_record(&header)?;

    let columns: Vec<_> = cuts.iter().map(|&cut| clusters.labels(cut)).collect();
    for (i, st) in clusters.sts().iter().enumerate() {
        let mut row = vec![st.as_str()];
        row.extend(columns.iter().map(|labels| labels[i].as_str()));
        tsv.write_record(&row)?;
    }
    tsv.flush()?;
    Ok(())
}
