use anyhow::{anyhow, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Component, Path, PathBuf},
};

/// Manifest of all archives written by a run
pub const MANIFEST_FILE: &str = "saved_timeseries_data_info.csv";
/// Archive paths relative to the save directory, one per line, no header
pub const DATA_PATHS_FILE: &str = "data_paths.csv";

/// One emitted timeseries archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub sample_path: PathBuf,
    #[serde(rename = "Year")]
    pub year: i32,
    #[serde(rename = "N")]
    pub n: i64,
    #[serde(rename = "W")]
    pub w: i64,
    pub dy: usize,
    pub dx: usize,
    pub dt: usize,
    pub win_i: i64,
    pub win_j: i64,
    pub status: String,
}

impl ManifestRow {
    pub const COMPLETED: &'static str = "completed";
}

/// Archive path relative to `savedir`, `/`-separated
pub fn relative_path(savedir: &Path, archive: &Path) -> Result<String> {
    let rel = archive
        .strip_prefix(savedir)
        .map_err(|_| anyhow!("Archive {:?} is not inside {:?}", archive, savedir))?;

    let parts = rel
        .components()
        .map(|c| match c {
            Component::Normal(p) => Ok(p.to_string_lossy().into_owned()),
            other => Err(anyhow!("Unexpected component {:?} in {:?}", other, rel)),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("/"))
}

/// Write the manifest CSV and the relative data path list into `savedir`
pub fn write_manifest(savedir: &Path, rows: &[ManifestRow]) -> Result<()> {
    let manifest_path = savedir.join(MANIFEST_FILE);
    let mut writer = csv::Writer::from_path(&manifest_path)
        .with_context(|| format!("Failed to create {:?}", manifest_path))?;
    if rows.is_empty() {
        writer.write_record(["sample_path", "Year", "N", "W", "dy", "dx", "dt", "win_i", "win_j", "status"])?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    let paths_path = savedir.join(DATA_PATHS_FILE);
    let file = File::create(&paths_path).with_context(|| format!("Failed to create {:?}", paths_path))?;
    let mut paths = BufWriter::new(file);
    for row in rows {
        writeln!(paths, "{}", relative_path(savedir, &row.sample_path)?)?;
    }
    paths.flush()?;

    info!("Wrote manifest of {} archives to {:?}", rows.len(), manifest_path);
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<Vec<ManifestRow>> {
    let mut reader = csv::Reader::from_path(path).with_context(|| format!("Failed to open {:?}", path))?;
    reader
        .deserialize::<ManifestRow>()
        .map(|r| r.with_context(|| format!("Malformed row in {:?}", path)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(savedir: &Path, year: i32, n: i64, w: i64, dt: usize) -> ManifestRow {
        ManifestRow {
            sample_path: savedir.join(year.to_string()).join(format!("{}_{}_{}.npz", n, w, year)),
            year,
            n,
            w,
            dy: 24,
            dx: 24,
            dt,
            win_i: n * 24,
            win_j: w * 24,
            status: ManifestRow::COMPLETED.to_string(),
        }
    }

    #[test]
    fn relative_path_strips_savedir() {
        let savedir = Path::new("/data/out");
        assert_eq!(
            relative_path(savedir, Path::new("/data/out/2019/1_2_2019.npz")).unwrap(),
            "2019/1_2_2019.npz"
        );
        assert!(relative_path(savedir, Path::new("/data/other/2019/1_2_2019.npz")).is_err());
    }

    #[test]
    fn manifest_has_header_and_one_row_per_archive() {
        let dir = TempDir::new().unwrap();
        let rows = vec![row(dir.path(), 2019, 0, 1, 12), row(dir.path(), 2020, 3, 4, 40)];
        write_manifest(dir.path(), &rows).unwrap();

        let text = std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "sample_path,Year,N,W,dy,dx,dt,win_i,win_j,status");
        assert_eq!(lines.count(), 2);
        assert_eq!(read_manifest(&dir.path().join(MANIFEST_FILE)).unwrap(), rows);

        let paths = std::fs::read_to_string(dir.path().join(DATA_PATHS_FILE)).unwrap();
        assert_eq!(paths, "2019/0_1_2019.npz\n2020/3_4_2020.npz\n");
    }

    #[test]
    fn empty_run_still_writes_header() {
        let dir = TempDir::new().unwrap();
        write_manifest(dir.path(), &[]).unwrap();

        let text = std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        assert_eq!(text.trim_end(), "sample_path,Year,N,W,dy,dx,dt,win_i,win_j,status");
        assert!(std::fs::read_to_string(dir.path().join(DATA_PATHS_FILE)).unwrap().is_empty());
    }
}
