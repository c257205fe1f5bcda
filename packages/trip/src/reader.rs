//! Record-index range reads over normalized files.
//!
//! Because every normalized record is [`RECORD_LENGTH`] bytes, records
//! `[start, end)` live at bytes `[start * W, end * W)`. A [`RangeReader`]
//! requests exactly that span from the store, so disjoint readers never
//! overlap.

use taxi_object_store::{ObjectReader, ObjectStore};
use taxi_trip_models::{Category, Period, RECORD_LENGTH, TripRecord, file_name};
use tokio::io::{AsyncReadExt as _, BufReader};

use crate::TripError;

/// `RECORD_LENGTH` as a byte offset multiplier.
const WIDTH: u64 = RECORD_LENGTH as u64;

/// Number of whole records in the normalized file for `category` and
/// `period`.
///
/// # Errors
///
/// Returns [`TripError::NotFound`] if the file is missing, or a store error
/// if the lookup fails.
pub async fn record_count(
    store: &dyn ObjectStore,
    category: Category,
    period: Period,
) -> Result<u64, TripError> {
    let key = file_name(category, period);
    let meta = store.head(&key).await?.ok_or_else(|| TripError::NotFound {
        location: format!("{}/{key}", store.uri()),
    })?;
    Ok(meta.size / WIDTH)
}

/// Months of `category` with a normalized file in `store`, sorted.
///
/// Keys that don't parse as `<category>-<YYYY>-<MM>.csv` are ignored.
///
/// # Errors
///
/// Returns a store error if listing fails.
pub async fn available_periods(
    store: &dyn ObjectStore,
    category: Category,
) -> Result<Vec<Period>, TripError> {
    let prefix = format!("{category}-");
    let mut periods: Vec<Period> = store
        .list_keys(&prefix)
        .await?
        .iter()
        .filter_map(|key| {
            key.strip_prefix(&prefix)?
                .strip_suffix(".csv")?
                .parse()
                .ok()
        })
        .collect();
    periods.sort();
    periods.dedup();
    Ok(periods)
}

/// Forward-only reader over records `[start, end)` of one normalized file.
pub struct RangeReader {
    reader: BufReader<ObjectReader>,
    location: String,
    start: u64,
    end: u64,
    position: u64,
    exhausted: bool,
    malformed: u64,
}

impl RangeReader {
    /// Opens records `[start, end)` of `<category>-<YYYY>-<MM>.csv`.
    ///
    /// An empty range (`start >= end`) opens successfully and yields
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns a store error if the file is missing or cannot be read.
    pub async fn open(
        store: &dyn ObjectStore,
        category: Category,
        period: Period,
        start: u64,
        end: u64,
    ) -> Result<Self, TripError> {
        let key = file_name(category, period);
        let end = end.max(start);
        let reader = store.get_range(&key, start * WIDTH..end * WIDTH).await?;

        Ok(Self {
            reader: BufReader::new(reader),
            location: format!("{}/{key}", store.uri()),
            start,
            end,
            position: start,
            exhausted: start >= end,
            malformed: 0,
        })
    }

    /// `<store>/<key>` of the file being read.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The requested `[start, end)` record range.
    #[must_use]
    pub const fn range(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    /// Records consumed so far, including malformed ones.
    #[must_use]
    pub const fn consumed(&self) -> u64 {
        self.position - self.start
    }

    /// Records skipped because they failed to parse.
    #[must_use]
    pub const fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Reads the next raw fixed-width record.
    ///
    /// Returns `None` once `end` is reached or the file ends early. A
    /// trailing partial record is treated as end of data.
    ///
    /// # Errors
    ///
    /// Returns [`TripError::Read`] on I/O failure.
    pub async fn next_raw(&mut self) -> Result<Option<[u8; RECORD_LENGTH]>, TripError> {
        if self.exhausted || self.position >= self.end {
            self.exhausted = true;
            return Ok(None);
        }

        let mut buf = [0u8; RECORD_LENGTH];
        match self.reader.read_exact(&mut buf).await {
            Ok(_) => {
                self.position += 1;
                Ok(Some(buf))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::debug!(
                    "{}: short read at record {} of [{}, {})",
                    self.location,
                    self.position,
                    self.start,
                    self.end
                );
                self.exhausted = true;
                Ok(None)
            }
            Err(e) => Err(TripError::Read {
                location: self.location.clone(),
                source: e,
            }),
        }
    }

    /// Reads and parses the next record, skipping malformed ones.
    ///
    /// # Errors
    ///
    /// Returns [`TripError::Read`] on I/O failure.
    pub async fn next_record(&mut self) -> Result<Option<TripRecord>, TripError> {
        while let Some(raw) = self.next_raw().await? {
            match TripRecord::parse(&raw) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    self.malformed += 1;
                    log::warn!("{} record {}: {e}", self.location, self.position - 1);
                }
            }
        }
        Ok(None)
    }

    /// Reads up to `max` parsed records. An empty batch means the range is
    /// exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`TripError::Read`] on I/O failure.
    pub async fn next_batch(&mut self, max: usize) -> Result<Vec<TripRecord>, TripError> {
        let mut batch = Vec::with_capacity(max.min(65_536));
        while batch.len() < max {
            match self.next_record().await? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Releases the underlying stream.
    pub fn close(self) {
        log::debug!(
            "{}: closed after {} records [{}, {})",
            self.location,
            self.consumed(),
            self.start,
            self.end
        );
    }
}
