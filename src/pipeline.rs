use crate::{
    manifest::{self, ManifestRow},
    metadata::{self, LocationKey, SampleRecord},
    timeseries,
};
use anyhow::{anyhow, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::{
    any::Any,
    fs,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    time::Instant,
};

pub const DEFAULT_INFO_FILE: &str = "extracted_windows_data_info.csv";

/// How often a worker reports how far through its shard it is
const LOG_EVERY: usize = 1000;

#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Directory holding the crop metadata table
    pub windows_dir: PathBuf,
    /// Root of the per-year archive directories and the manifests
    pub savedir: PathBuf,
    /// Metadata table file name inside `windows_dir`
    pub info_file: String,
    /// Expected crop edge in pixels; other extents are reported, not rejected
    pub sample_size: usize,
    pub num_workers: usize,
}

impl StackConfig {
    pub fn new(windows_dir: impl Into<PathBuf>, savedir: impl Into<PathBuf>) -> Self {
        StackConfig {
            windows_dir: windows_dir.into(),
            savedir: savedir.into(),
            info_file: DEFAULT_INFO_FILE.to_string(),
            sample_size: 24,
            num_workers: 4,
        }
    }

    pub fn info_path(&self) -> PathBuf {
        self.windows_dir.join(&self.info_file)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub years: Vec<i32>,
    pub samples: usize,
    pub archives: usize,
    pub manifest_path: PathBuf,
}

/// Split `items` into at most `n` contiguous, non-empty segments whose
/// lengths differ by at most one. Earlier segments take the remainder.
pub fn split_num_segments<T>(items: &[T], n: usize) -> Vec<&[T]> {
    let n = n.max(1).min(items.len());
    if n == 0 {
        return Vec::new();
    }

    let base = items.len() / n;
    let extra = items.len() % n;
    let mut segments = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n {
        let len = base + usize::from(i < extra);
        segments.push(&items[start..start + len]);
        start += len;
    }
    segments
}

type Location<'a> = (LocationKey, Vec<&'a SampleRecord>);

/// Run the whole job: load the table, stack every (year, window) location on
/// a pool of `num_workers` threads and write the manifests. The first failing
/// location aborts the run before any manifest is written.
pub fn run(config: &StackConfig) -> Result<RunSummary> {
    let start_time = Instant::now();

    info!("Windows dir: {:?}", config.windows_dir);
    info!("Save dir: {:?}", config.savedir);
    info!("Num workers: {}", config.num_workers);

    let records = metadata::load_sample_table(&config.info_path())?;
    let years = metadata::years(&records);
    info!(
        "Found windows for years {}",
        years.iter().map(|y| y.to_string()).collect::<Vec<_>>().join(", ")
    );

    let num_workers = config.num_workers.max(1);
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .build()
        .map_err(|e| anyhow!("Failed to build thread pool: {:?}", e))?;

    fs::create_dir_all(&config.savedir)?;

    let year_groups: Vec<(i32, Vec<Location>)> = years
        .iter()
        .map(|&year| {
            let locations: Vec<Location> = metadata::group_by_location(&records, year)
                .into_iter()
                .map(|(key, idx)| (key, idx.into_iter().map(|i| &records[i]).collect::<Vec<_>>()))
                .collect();
            (year, locations)
        })
        .collect();
    let total_locations: usize = year_groups.iter().map(|(_, l)| l.len()).sum();

    let pb = ProgressBar::new(total_locations as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message("Stacking locations...");

    let mut rows: Vec<ManifestRow> = Vec::with_capacity(total_locations);

    for (year, locations) in &year_groups {
        let year_dir = config.savedir.join(year.to_string());
        fs::create_dir_all(&year_dir)?;

        let shards = split_num_segments(locations, num_workers);
        info!(
            "Year {}: {} locations across {} workers",
            year,
            locations.len(),
            shards.len()
        );

        let shard_rows = pool.install(|| {
            shards
                .par_iter()
                .enumerate()
                .map(|(rank, shard)| process_shard_safe(rank, shard, &year_dir, config.sample_size, &pb))
                .collect::<Result<Vec<Vec<ManifestRow>>>>()
        });

        match shard_rows {
            Ok(shard_rows) => rows.extend(shard_rows.into_iter().flatten()),
            Err(e) => {
                pb.abandon_with_message("Aborted");
                return Err(e);
            }
        }
    }

    pb.finish_with_message("All locations stacked.");

    manifest::write_manifest(&config.savedir, &rows)?;

    info!(
        "All done! Wrote {} archives from {} samples in {:.2} seconds",
        rows.len(),
        records.len(),
        start_time.elapsed().as_secs_f64()
    );

    Ok(RunSummary {
        years,
        samples: records.len(),
        archives: rows.len(),
        manifest_path: config.savedir.join(manifest::MANIFEST_FILE),
    })
}

/// Run one shard, turning a worker panic into an error
fn process_shard_safe(
    rank: usize,
    shard: &[Location],
    year_dir: &Path,
    sample_size: usize,
    pb: &ProgressBar,
) -> Result<Vec<ManifestRow>> {
    catch_worker_panic(rank, || process_shard(rank, shard, year_dir, sample_size, pb))
}

fn catch_worker_panic<T>(rank: usize, work: impl FnOnce() -> Result<T>) -> Result<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Panic occurred in worker {}: {}", rank, message);
            Err(anyhow!("Panic occurred in worker {}: {}", rank, message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn process_shard(
    rank: usize,
    shard: &[Location],
    year_dir: &Path,
    sample_size: usize,
    pb: &ProgressBar,
) -> Result<Vec<ManifestRow>> {
    let mut rows = Vec::with_capacity(shard.len());

    for (i, (key, records)) in shard.iter().enumerate() {
        if i % LOG_EVERY == 0 {
            info!("worker {}, location {} of {}", rank, i + 1, shard.len());
        }

        let row = match timeseries::reduce_location(*key, records, year_dir) {
            Ok(row) => row,
            Err(e) => {
                error!("Worker {} failed on location {}_{}: {:#}", rank, key.nij, key.wij, e);
                return Err(e);
            }
        };

        if row.dy != sample_size || row.dx != sample_size {
            warn!(
                "Location {}_{} of {} has extent {}x{}, expected {}x{}",
                row.n, row.w, row.year, row.dy, row.dx, sample_size, sample_size
            );
        }

        rows.push(row);
        pb.inc(1);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::tests::write_crop;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn segments_cover_items_in_order_with_balanced_lengths() {
        let items: Vec<u32> = (0..10).collect();
        let segments = split_num_segments(&items, 4);
        let lengths: Vec<_> = segments.iter().map(|s| s.len()).collect();
        assert_eq!(lengths, vec![3, 3, 2, 2]);
        assert_eq!(segments.concat(), items);
    }

    #[test]
    fn segments_never_empty() {
        let items = [1, 2];
        let segments = split_num_segments(&items, 8);
        assert_eq!(segments, vec![&[1][..], &[2][..]]);

        let none: [u8; 0] = [];
        assert!(split_num_segments(&none, 4).is_empty());

        assert_eq!(split_num_segments(&items, 0), vec![&[1, 2][..]]);
    }

    #[test]
    fn worker_panic_becomes_error_with_payload() {
        let err = catch_worker_panic(3, || -> Result<()> { panic!("bad crop") }).unwrap_err();
        assert_eq!(err.to_string(), "Panic occurred in worker 3: bad crop");

        let index = 7;
        let err = catch_worker_panic(1, || -> Result<()> { panic!("index {} out of range", index) }).unwrap_err();
        assert!(err.to_string().ends_with("index 7 out of range"));

        assert_eq!(catch_worker_panic(0, || Ok(5)).unwrap(), 5);
    }

    #[test]
    fn panicking_shard_fails_the_parallel_collect() {
        let pool = ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let shards: Vec<Vec<u32>> = vec![vec![1, 2], vec![3, 4], vec![5]];

        let result = pool.install(|| {
            shards
                .par_iter()
                .enumerate()
                .map(|(rank, shard)| {
                    catch_worker_panic(rank, || {
                        if shard.contains(&4) {
                            panic!("location {} unreadable", 4);
                        }
                        Ok(shard.len())
                    })
                })
                .collect::<Result<Vec<usize>>>()
        });

        let err = result.unwrap_err();
        assert!(err.to_string().contains("worker 1: location 4 unreadable"));
    }

    #[test]
    fn inconsistent_group_aborts_run_without_manifest() {
        let dir = TempDir::new().unwrap();
        let windows_dir = dir.path().join("windows");
        let savedir = dir.path().join("out");
        fs::create_dir_all(&windows_dir).unwrap();

        let a = windows_dir.join("a.npz");
        let b = windows_dir.join("b.npz");
        write_crop(&a, 24, 1);
        write_crop(&b, 24, 2);

        let mut table = fs::File::create(windows_dir.join(DEFAULT_INFO_FILE)).unwrap();
        writeln!(table, "sample_path,Date,Nij,Wij,il,jl").unwrap();
        writeln!(table, "{},20190110,0,0,0,0", a.display()).unwrap();
        writeln!(table, "{},20190120,0,0,24,0", b.display()).unwrap();
        drop(table);

        let mut config = StackConfig::new(&windows_dir, &savedir);
        config.num_workers = 2;
        let err = run(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("il"));
        assert!(!savedir.join(manifest::MANIFEST_FILE).exists());
    }
}
