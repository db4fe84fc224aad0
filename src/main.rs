// src/main.rs
use anyhow::Result;
use env_logger::{Builder, Env};
use log::info;
use s2_timeseries_stacking::{run, StackConfig};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "s2_timeseries_stack",
    about = "Stack per-date Sentinel-2 window crops into per-location timeseries archives"
)]
struct Opt {
    /// Directory containing the extracted windows and their metadata table
    #[structopt(short = "i", long = "windows-dir", parse(from_os_str))]
    windows_dir: PathBuf,

    /// Output directory (one sub-directory per year, plus the manifests)
    #[structopt(short = "o", long = "savedir", parse(from_os_str))]
    savedir: PathBuf,

    /// Metadata table file name inside the windows directory
    #[structopt(long = "info-file", default_value = "extracted_windows_data_info.csv")]
    info_file: String,

    /// Expected crop edge in pixels (default=24)
    #[structopt(short = "s", long = "sample-size", default_value = "24")]
    sample_size: usize,

    /// Number of worker threads (default=4)
    #[structopt(short = "n", long = "num-workers", default_value = "4")]
    num_workers: usize,
}

impl From<Opt> for StackConfig {
    fn from(opt: Opt) -> Self {
        StackConfig {
            windows_dir: opt.windows_dir,
            savedir: opt.savedir,
            info_file: opt.info_file,
            sample_size: opt.sample_size,
            num_workers: opt.num_workers,
        }
    }
}

fn main() -> Result<()> {
    // Initialize env_logger
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    builder.init();

    let opt = Opt::from_args();
    info!("Starting s2_timeseries_stack...");

    let config: StackConfig = opt.into();
    let summary = run(&config)?;
    info!(
        "Stacked {} samples into {} archives for years {:?}",
        summary.samples, summary.archives, summary.years
    );
    info!("Manifest: {:?}", summary.manifest_path);

    Ok(())
}
