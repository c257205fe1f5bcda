//! Raw monthly CSV to normalized fixed-width file conversion.
//!
//! Reads `<category>_tripdata_<YYYY>-<MM>.csv` from a [`RawSource`], runs
//! every row through a [`RecordCodec`], and writes
//! `<category>-<YYYY>-<MM>.csv` to a [`Destination`]. Months are converted
//! concurrently, at most `procs` at a time.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use futures::TryStreamExt as _;
use taxi_object_store::{ObjectStore, PutOptions, PutOutcome};
use taxi_trip_models::{Category, Period, file_name, raw_file_name};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _, BufReader, BufWriter};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::io::StreamReader;

use crate::codec::RecordCodec;
use crate::progress::ProgressCallback;
use crate::TripError;

/// Public mirror of the upstream raw trip files.
pub const DEFAULT_RAW_SOURCE: &str = "https://s3.amazonaws.com/nyc-tlc/trip+data/";

type LineSource = Pin<Box<dyn AsyncBufRead + Send>>;
type LineSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Where raw monthly files are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSource {
    /// `http(s)://` base URL.
    Http(String),
    /// Local directory (`file://<dir>` or a bare path).
    Directory(PathBuf),
    /// Standard input (`-`).
    Stdin,
}

impl RawSource {
    /// Parses a raw source URI.
    ///
    /// # Errors
    ///
    /// Returns [`TripError::InvalidUri`] for unsupported schemes.
    pub fn parse(uri: &str) -> Result<Self, TripError> {
        if uri == "-" {
            return Ok(Self::Stdin);
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(Self::Http(uri.trim_end_matches('/').to_string()));
        }
        if let Some(dir) = uri.strip_prefix("file://") {
            return Ok(Self::Directory(PathBuf::from(dir)));
        }
        if uri.contains("://") {
            return Err(TripError::InvalidUri {
                uri: uri.to_string(),
            });
        }
        Ok(Self::Directory(PathBuf::from(uri)))
    }
}

/// Where normalized files are written.
pub enum Destination {
    /// Local directory; files are written in place.
    Directory(PathBuf),
    /// Object store; files are staged locally and uploaded.
    Store(Arc<dyn ObjectStore>),
    /// Standard output (`-`).
    Stdout,
}

impl Destination {
    /// Resolves a destination URI. `s3://` URIs open an S3 store in
    /// `region`.
    ///
    /// # Errors
    ///
    /// Returns [`TripError::NotFound`] if a local directory does not exist,
    /// or a store error for an invalid URI.
    pub async fn open(uri: &str, region: &str) -> Result<Self, TripError> {
        if uri == "-" {
            return Ok(Self::Stdout);
        }
        if uri.starts_with("s3://") {
            return Ok(Self::Store(taxi_object_store::open(uri, region).await?));
        }
        let dir = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        if !dir.is_dir() {
            return Err(TripError::NotFound {
                location: dir.display().to_string(),
            });
        }
        Ok(Self::Directory(dir))
    }

    fn describe(&self) -> String {
        match self {
            Self::Directory(dir) => format!("file://{}", dir.display()),
            Self::Store(store) => store.uri(),
            Self::Stdout => "-".to_string(),
        }
    }
}

/// Parameters of a conversion run.
pub struct ConvertOptions {
    /// Trip category to convert.
    pub category: Category,
    /// First month, inclusive.
    pub start: Period,
    /// Last month, inclusive.
    pub end: Period,
    /// Raw file source.
    pub source: RawSource,
    /// Normalized file destination.
    pub destination: Destination,
    /// Cap on records written per month.
    pub max_lines: Option<u64>,
    /// Tag uploaded objects with `color`, `year`, `month`.
    pub tagging: bool,
    /// Months converted concurrently.
    pub procs: usize,
    /// Upload with the bucket-owner-full-control ACL.
    pub cross_account: bool,
    /// Leave stored objects alone when they already match the output.
    pub skip_unchanged: bool,
}

/// Counters for one converted month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertStats {
    /// Month converted.
    pub period: Period,
    /// Data rows read (header and blank lines excluded).
    pub read: u64,
    /// Records written.
    pub written: u64,
    /// Rows dropped by the codec.
    pub rejected: u64,
    /// Where the output went.
    pub output: String,
    /// The destination already held identical content; nothing was
    /// uploaded.
    pub unchanged: bool,
}

/// Converts every month in `[options.start, options.end]`.
///
/// Returns one [`ConvertStats`] per month, in month order.
///
/// # Errors
///
/// Returns [`TripError::InvalidRange`] if `start` is after `end`, a model
/// error if the range is outside the category's published range, and the
/// first failure of any month otherwise.
pub async fn convert(
    options: ConvertOptions,
    progress: Arc<dyn ProgressCallback>,
) -> Result<Vec<ConvertStats>, TripError> {
    if options.start > options.end {
        return Err(TripError::InvalidRange {
            message: format!("start date {} is after end date {}", options.start, options.end),
        });
    }
    options.category.validate(options.start)?;
    options.category.validate(options.end)?;

    let months: Vec<Period> = options.start.through(options.end).collect();
    let serial = matches!(options.source, RawSource::Stdin)
        || matches!(options.destination, Destination::Stdout);
    let procs = if serial { 1 } else { options.procs.max(1) };

    log::info!(
        "Converting {} {} month(s) {}..{} -> {} ({procs} at a time)",
        months.len(),
        options.category,
        options.start,
        options.end,
        options.destination.describe()
    );
    progress.set_total(months.len() as u64);

    let options = Arc::new(options);
    let semaphore = Arc::new(Semaphore::new(procs));
    let mut join_set = JoinSet::new();

    for period in months {
        let options = Arc::clone(&options);
        let semaphore = Arc::clone(&semaphore);
        let progress = Arc::clone(&progress);
        join_set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(std::io::Error::other)?;
            progress.set_message(format!("{}-{period}", options.category));
            let result = convert_month(&options, period).await;
            progress.inc(1);
            result
        });
    }

    let mut stats = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        stats.push(joined??);
    }
    stats.sort_by_key(|s| s.period);

    let written: u64 = stats.iter().map(|s| s.written).sum();
    progress.finish(format!("{written} records written"));
    Ok(stats)
}

async fn convert_month(options: &ConvertOptions, period: Period) -> Result<ConvertStats, TripError> {
    let category = options.category;
    let codec = RecordCodec::new(category, period);
    let name = file_name(category, period);

    let (input, input_location) = open_input(&options.source, category, period).await?;
    log::info!(" read: {input_location}");

    let staged = match &options.destination {
        Destination::Directory(dir) => Some(dir.join(&name)),
        Destination::Store(store) => {
            let path = staging_path(store.as_ref(), &name);
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            Some(path)
        }
        Destination::Stdout => None,
    };

    let written = write_output(
        options,
        period,
        staged.as_deref(),
        input,
        &codec,
        &input_location,
    )
    .await;
    if let Destination::Store(_) = &options.destination
        && let Some(path) = &staged
    {
        tokio::fs::remove_file(path).await.ok();
    }
    let stats = match written {
        Ok(stats) => stats,
        Err(e) => {
            if let Destination::Directory(_) = &options.destination
                && let Some(path) = &staged
            {
                log::warn!("Removing partial output {}", path.display());
                tokio::fs::remove_file(path).await.ok();
            }
            return Err(e);
        }
    };
    log::info!(
        "write: {} ({} records, {} rejected{})",
        stats.output,
        stats.written,
        stats.rejected,
        if stats.unchanged { ", unchanged" } else { "" }
    );
    Ok(stats)
}

/// Local file a store upload is staged in, unique per store and key.
fn staging_path(store: &dyn ObjectStore, key: &str) -> PathBuf {
    let store_dir: String = store
        .uri()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    std::env::temp_dir()
        .join(format!("taxi-convert-{}", std::process::id()))
        .join(store_dir)
        .join(key)
}

/// Writes the normalized month to `staged` (or stdout) and publishes it.
async fn write_output(
    options: &ConvertOptions,
    period: Period,
    staged: Option<&Path>,
    input: LineSource,
    codec: &RecordCodec,
    input_location: &str,
) -> Result<ConvertStats, TripError> {
    let sink: LineSink = match staged {
        Some(path) => Box::pin(BufWriter::new(tokio::fs::File::create(path).await?)),
        None => Box::pin(tokio::io::stdout()),
    };
    let name = file_name(options.category, period);

    let (read, written, rejected) =
        pump(input, sink, codec, options.max_lines, input_location).await?;

    let (output, unchanged) = match (&options.destination, staged) {
        (Destination::Store(store), Some(path)) => {
            let outcome = publish(store.as_ref(), &name, path, options, period).await?;
            (format!("{}/{name}", store.uri()), outcome == PutOutcome::Skipped)
        }
        (_, Some(path)) => (format!("file://{}", path.display()), false),
        (_, None) => ("-".to_string(), false),
    };

    Ok(ConvertStats {
        period,
        read,
        written,
        rejected,
        output,
        unchanged,
    })
}

async fn open_input(
    source: &RawSource,
    category: Category,
    period: Period,
) -> Result<(LineSource, String), TripError> {
    let raw_name = raw_file_name(category, period);
    match source {
        RawSource::Http(base) => {
            let url = format!("{base}/{raw_name}");
            let response = reqwest::get(&url).await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(TripError::NotFound { location: url });
            }
            let stream = response
                .error_for_status()?
                .bytes_stream()
                .map_err(std::io::Error::other);
            Ok((Box::pin(StreamReader::new(stream)), url))
        }
        RawSource::Directory(dir) => {
            let path = dir.join(&raw_name);
            if !path.is_file() {
                return Err(TripError::NotFound {
                    location: path.display().to_string(),
                });
            }
            let file = tokio::fs::File::open(&path).await?;
            Ok((
                Box::pin(BufReader::new(file)),
                format!("file://{}", path.display()),
            ))
        }
        RawSource::Stdin => Ok((Box::pin(BufReader::new(tokio::io::stdin())), "-".to_string())),
    }
}

/// Streams raw lines through the codec. Returns `(read, written, rejected)`.
async fn pump(
    input: LineSource,
    mut output: LineSink,
    codec: &RecordCodec,
    max_lines: Option<u64>,
    location: &str,
) -> Result<(u64, u64, u64), TripError> {
    let read_err = |e: std::io::Error| TripError::Read {
        location: location.to_string(),
        source: e,
    };

    let mut lines = input.lines();
    let mut header = true;
    let (mut read, mut written, mut rejected) = (0u64, 0u64, 0u64);

    while let Some(line) = lines.next_line().await.map_err(read_err)? {
        if std::mem::take(&mut header) || line.trim().is_empty() {
            continue;
        }
        if max_lines.is_some_and(|max| written >= max) {
            break;
        }
        read += 1;
        match codec.normalize(&line) {
            Some(record) => {
                output.write_all(record.as_bytes()).await?;
                written += 1;
            }
            None => rejected += 1,
        }
    }

    output.flush().await?;
    Ok((read, written, rejected))
}

async fn publish(
    store: &dyn ObjectStore,
    key: &str,
    path: &Path,
    options: &ConvertOptions,
    period: Period,
) -> Result<PutOutcome, TripError> {
    let category = options.category;
    let put = PutOptions {
        cross_account: options.cross_account,
        force: !options.skip_unchanged,
    };
    let outcome = store.put_file(key, path, &put).await?;
    if outcome == PutOutcome::Skipped {
        return Ok(outcome);
    }

    if options.tagging {
        let tags = vec![
            ("color".to_string(), category.to_string()),
            ("year".to_string(), period.year.to_string()),
            ("month".to_string(), period.month.to_string()),
        ];
        store.tag(key, &tags).await?;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use taxi_object_store::LocalObjectStore;
    use taxi_trip_models::RECORD_LENGTH;

    use super::*;
    use crate::progress::null_progress;

    const HEADER: &str = "VendorID,lpep_pickup_datetime,Lpep_dropoff_datetime,Store_and_fwd_flag,\
        RateCodeID,Pickup_longitude,Pickup_latitude,Dropoff_longitude,Dropoff_latitude,\
        Passenger_count,Trip_distance,Fare_amount,Extra,MTA_tax,Tip_amount,Tolls_amount,\
        Ehail_fee,improvement_surcharge,Total_amount,Payment_type,Trip_type";

    fn row(minute: u32, pickup_longitude: &str) -> String {
        format!(
            "2,2016-01-01 00:{minute:02}:00,2016-01-01 00:{:02}:00,N,1,{pickup_longitude},40.68,\
             -73.92,40.69,1,1.46,8,0.5,0.5,1.86,0,,0.3,11.16,1,1",
            minute + 5
        )
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_raw(dir: &Path) {
        let body = format!(
            "{HEADER}\n\n{}\n{}\n{}\n",
            row(0, "-73.93"),
            row(10, "0"),
            row(20, "-73.95")
        );
        std::fs::write(dir.join("green_tripdata_2016-01.csv"), body).unwrap();
    }

    fn options(src: &Path, destination: Destination) -> ConvertOptions {
        let period = Period::new(2016, 1).unwrap();
        ConvertOptions {
            category: Category::Green,
            start: period,
            end: period,
            source: RawSource::Directory(src.to_path_buf()),
            destination,
            max_lines: None,
            tagging: true,
            procs: 2,
            cross_account: false,
            skip_unchanged: false,
        }
    }

    #[test]
    fn parses_raw_sources() {
        assert_eq!(RawSource::parse("-").unwrap(), RawSource::Stdin);
        assert_eq!(
            RawSource::parse("https://example.com/trip+data/").unwrap(),
            RawSource::Http("https://example.com/trip+data".to_string())
        );
        assert_eq!(
            RawSource::parse("file:///data/raw").unwrap(),
            RawSource::Directory(PathBuf::from("/data/raw"))
        );
        assert!(RawSource::parse("ftp://nope").is_err());
    }

    #[tokio::test]
    async fn converts_to_directory() {
        let src = scratch("taxi_convert_dir_src");
        let dst = scratch("taxi_convert_dir_dst");
        write_raw(&src);

        let stats = convert(
            options(&src, Destination::Directory(dst.clone())),
            null_progress(),
        )
        .await
        .unwrap();

        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].read, 3);
        assert_eq!(stats[0].written, 2);
        assert_eq!(stats[0].rejected, 1);

        let out = std::fs::read(dst.join("green-2016-01.csv")).unwrap();
        assert_eq!(out.len(), 2 * RECORD_LENGTH);
        assert!(out.starts_with(b"220838400,220838700,-73.930000,"));

        std::fs::remove_dir_all(&src).ok();
        std::fs::remove_dir_all(&dst).ok();
    }

    #[tokio::test]
    async fn caps_written_records() {
        let src = scratch("taxi_convert_cap_src");
        let dst = scratch("taxi_convert_cap_dst");
        write_raw(&src);

        let mut opts = options(&src, Destination::Directory(dst.clone()));
        opts.max_lines = Some(1);
        let stats = convert(opts, null_progress()).await.unwrap();
        assert_eq!(stats[0].written, 1);

        let out = std::fs::read(dst.join("green-2016-01.csv")).unwrap();
        assert_eq!(out.len(), RECORD_LENGTH);

        std::fs::remove_dir_all(&src).ok();
        std::fs::remove_dir_all(&dst).ok();
    }

    #[tokio::test]
    async fn uploads_and_tags_store_objects() {
        let src = scratch("taxi_convert_store_src");
        let dst = scratch("taxi_convert_store_dst");
        write_raw(&src);
        let store = Arc::new(LocalObjectStore::new(&dst));

        let stats = convert(
            options(&src, Destination::Store(store.clone())),
            null_progress(),
        )
        .await
        .unwrap();
        assert_eq!(stats[0].written, 2);

        let meta = store.head("green-2016-01.csv").await.unwrap().unwrap();
        assert_eq!(meta.size, 2 * RECORD_LENGTH as u64);
        let tags = store.read_tags("green-2016-01.csv").await.unwrap();
        assert_eq!(tags.get("month").map(String::as_str), Some("1"));
        assert_eq!(tags.get("color").map(String::as_str), Some("green"));

        std::fs::remove_dir_all(&src).ok();
        std::fs::remove_dir_all(&dst).ok();
    }

    #[tokio::test]
    async fn unchanged_upload_is_skipped() {
        let src = scratch("taxi_convert_unchanged_src");
        let dst = scratch("taxi_convert_unchanged_dst");
        write_raw(&src);
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&dst));

        let mut opts = options(&src, Destination::Store(Arc::clone(&store)));
        opts.skip_unchanged = true;
        let first = convert(opts, null_progress()).await.unwrap();
        assert!(!first[0].unchanged);

        let mut opts = options(&src, Destination::Store(Arc::clone(&store)));
        opts.skip_unchanged = true;
        let second = convert(opts, null_progress()).await.unwrap();
        assert!(second[0].unchanged);
        assert_eq!(second[0].written, 2);

        let forced = convert(
            options(&src, Destination::Store(Arc::clone(&store))),
            null_progress(),
        )
        .await
        .unwrap();
        assert!(!forced[0].unchanged);
        assert!(!staging_path(store.as_ref(), "green-2016-01.csv").exists());

        std::fs::remove_dir_all(&src).ok();
        std::fs::remove_dir_all(&dst).ok();
    }

    #[tokio::test]
    async fn failed_upload_removes_staged_file() {
        let src = scratch("taxi_convert_failed_upload_src");
        write_raw(&src);
        // A store rooted at a regular file cannot create its objects.
        let root = src.join("not-a-directory");
        std::fs::write(&root, b"").unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&root));

        let result = convert(
            options(&src, Destination::Store(Arc::clone(&store))),
            null_progress(),
        )
        .await;
        assert!(result.is_err());
        assert!(!staging_path(store.as_ref(), "green-2016-01.csv").exists());

        std::fs::remove_dir_all(&src).ok();
    }

    #[tokio::test]
    async fn failed_read_removes_partial_output() {
        let src = scratch("taxi_convert_failed_read_src");
        let dst = scratch("taxi_convert_failed_read_dst");
        let mut body = format!("{HEADER}\n{}\n", row(0, "-73.93")).into_bytes();
        body.extend_from_slice(b"\xff\xfe,not utf-8\n");
        std::fs::write(src.join("green_tripdata_2016-01.csv"), body).unwrap();

        let result = convert(
            options(&src, Destination::Directory(dst.clone())),
            null_progress(),
        )
        .await;
        assert!(matches!(result, Err(TripError::Read { .. })));
        assert!(!dst.join("green-2016-01.csv").exists());

        std::fs::remove_dir_all(&src).ok();
        std::fs::remove_dir_all(&dst).ok();
    }

    #[tokio::test]
    async fn rejects_inverted_or_unpublished_range() {
        let src = scratch("taxi_convert_range_src");
        let mut opts = options(&src, Destination::Stdout);
        opts.start = Period::new(2016, 2).unwrap();
        assert!(matches!(
            convert(opts, null_progress()).await,
            Err(TripError::InvalidRange { .. })
        ));

        let mut opts = options(&src, Destination::Stdout);
        opts.start = Period::new(2013, 1).unwrap();
        assert!(matches!(
            convert(opts, null_progress()).await,
            Err(TripError::Model(_))
        ));

        std::fs::remove_dir_all(&src).ok();
    }

    #[tokio::test]
    async fn missing_raw_file_is_not_found() {
        let src = scratch("taxi_convert_missing_src");
        let dst = scratch("taxi_convert_missing_dst");
        let result = convert(
            options(&src, Destination::Directory(dst.clone())),
            null_progress(),
        )
        .await;
        assert!(matches!(result, Err(TripError::NotFound { .. })));

        std::fs::remove_dir_all(&src).ok();
        std::fs::remove_dir_all(&dst).ok();
    }
}
