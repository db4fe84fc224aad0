use crate::{
    manifest::ManifestRow,
    metadata::{LocationKey, SampleRecord},
    npz::{NpzReader, NpzWriter},
};
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use memmap2::MmapOptions;
use ndarray::{arr0, stack, Array0, Array1, Array2, Array3, ArrayView2, Axis};
use std::{
    collections::{BTreeMap, HashSet},
    fmt::Display,
    fs::{self, File},
    io::{BufWriter, Cursor},
    path::{Path, PathBuf},
};

/// Sentinel-2 bands carried by every crop, in archive order
pub const BANDS: [&str; 13] = [
    "B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B10", "B11", "B12",
];

/// 10m band whose extent is reported in the manifest
pub const REFERENCE_BAND: &str = "B02";

/// One crop: band name -> (height, width) pixels
pub type Crop = BTreeMap<&'static str, Array2<u16>>;

/// Stacked timeseries for one location and year
#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesBundle {
    /// band name -> (time, height, width)
    pub bands: BTreeMap<&'static str, Array3<u16>>,
    pub doy: Array1<u16>,
    pub year: Array0<i32>,
}

impl TimeseriesBundle {
    pub fn timesteps(&self) -> usize {
        self.doy.len()
    }

    /// (height, width) of the reference band
    pub fn extent(&self) -> Result<(usize, usize)> {
        let band = self
            .bands
            .get(REFERENCE_BAND)
            .ok_or_else(|| anyhow!("Reference band {} missing from bundle", REFERENCE_BAND))?;
        let (_, h, w) = band.dim();
        Ok((h, w))
    }

    /// Write to `<path>.part` and rename into place, so `path` only ever
    /// holds a complete archive. The partial file is removed on failure.
    pub fn write_npz(&self, path: &Path) -> Result<()> {
        let partial = partial_path(path);
        let result = self.encode_npz(&partial).and_then(|()| {
            fs::rename(&partial, path).with_context(|| format!("Failed to move {:?} to {:?}", partial, path))
        });
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }

    fn encode_npz(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        let mut npz = NpzWriter::new(BufWriter::new(file));
        for (name, data) in &self.bands {
            npz.add_array(name, data)?;
        }
        npz.add_array("doy", &self.doy)?;
        npz.add_array("year", &self.year)?;
        npz.finish()?
            .into_inner()
            .map_err(|e| anyhow!("Failed to flush {:?}: {}", path, e.error()))?;
        Ok(())
    }

    pub fn read_npz(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let mut npz = NpzReader::new(file).with_context(|| format!("Reading {:?}", path))?;
        let mut bands = BTreeMap::new();
        for band in BANDS {
            let data: Array3<u16> = npz.by_name(band).with_context(|| format!("Reading {:?}", path))?;
            bands.insert(band, data);
        }
        Ok(TimeseriesBundle {
            bands,
            doy: npz.by_name("doy").with_context(|| format!("Reading {:?}", path))?,
            year: npz.by_name("year").with_context(|| format!("Reading {:?}", path))?,
        })
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Archive file name for a location: `<Nij>_<Wij>_<year>.npz`
pub fn archive_name(key: LocationKey, year: i32) -> String {
    format!("{}_{}_{}.npz", key.nij, key.wij, year)
}

/// Sort by DOY and keep the first row of each DOY. The sort is stable, so
/// "first" means first in table order (some products were downloaded twice).
pub fn order_and_dedup<'a>(rows: &[&'a SampleRecord]) -> Vec<&'a SampleRecord> {
    let mut sorted = rows.to_vec();
    sorted.sort_by_key(|r| r.doy);
    let mut seen = HashSet::new();
    sorted.retain(|r| seen.insert(r.doy));
    sorted
}

fn check_field<T: PartialEq + Display>(name: &str, expected: T, found: T, path: &Path) -> Result<()> {
    if expected != found {
        bail!(
            "Inconsistent {} within location group: expected {}, found {} ({:?})",
            name,
            expected,
            found,
            path
        );
    }
    Ok(())
}

/// All rows of a group must agree on year, window indices and pixel offsets
pub fn check_consistency(rows: &[&SampleRecord]) -> Result<()> {
    let first = rows.first().ok_or_else(|| anyhow!("Empty location group"))?;
    for row in &rows[1..] {
        check_field("Year", first.year, row.year, &row.sample_path)?;
        check_field("Nij", first.nij, row.nij, &row.sample_path)?;
        check_field("Wij", first.wij, row.wij, &row.sample_path)?;
        check_field("il", first.il, row.il, &row.sample_path)?;
        check_field("jl", first.jl, row.jl, &row.sample_path)?;
    }
    Ok(())
}

/// Memory-map a crop archive and decode all bands
pub fn read_crop(path: &Path) -> Result<Crop> {
    let file = File::open(path).with_context(|| format!("Failed to open crop {:?}", path))?;

    // Crops are written once upstream and never modified while we read them
    let mmap = unsafe { MmapOptions::new().map(&file) }
        .with_context(|| format!("Failed to mmap {:?}", path))?;

    let mut npz = NpzReader::new(Cursor::new(&mmap[..])).with_context(|| format!("Reading crop {:?}", path))?;
    let mut crop = Crop::new();
    for band in BANDS {
        let data: Array2<u16> = npz
            .by_name(band)
            .with_context(|| format!("Band {} missing or unreadable in {:?}", band, path))?;
        crop.insert(band, data);
    }
    Ok(crop)
}

/// Stack crops along a new leading time axis, one array per band
pub fn stack_bands(crops: &[Crop], doys: &[u16], year: i32) -> Result<TimeseriesBundle> {
    if crops.is_empty() {
        bail!("Cannot stack an empty timeseries");
    }
    if crops.len() != doys.len() {
        bail!("Got {} crops but {} day-of-year values", crops.len(), doys.len());
    }

    let mut bands = BTreeMap::new();
    for band in BANDS {
        let views = crops
            .iter()
            .enumerate()
            .map(|(t, crop)| {
                crop.get(band)
                    .map(|a| a.view())
                    .ok_or_else(|| anyhow!("Band {} missing at timestep {}", band, t))
            })
            .collect::<Result<Vec<ArrayView2<u16>>>>()?;

        let shape = views[0].dim();
        if let Some((t, v)) = views.iter().enumerate().find(|(_, v)| v.dim() != shape) {
            bail!(
                "Band {} changes shape from {:?} to {:?} at timestep {} (doy {})",
                band,
                shape,
                v.dim(),
                t,
                doys[t]
            );
        }

        bands.insert(band, stack(Axis(0), &views)?);
    }

    Ok(TimeseriesBundle {
        bands,
        doy: Array1::from(doys.to_vec()),
        year: arr0(year),
    })
}

/// Build and persist the timeseries of one location, returning its manifest row
pub fn reduce_location(key: LocationKey, rows: &[&SampleRecord], year_dir: &Path) -> Result<ManifestRow> {
    let rows = order_and_dedup(rows);
    check_consistency(&rows).with_context(|| format!("Location {}_{}", key.nij, key.wij))?;

    let first = rows[0];
    if first.location() != key {
        bail!(
            "Rows of window {}_{} filed under location {}_{}",
            first.nij,
            first.wij,
            key.nij,
            key.wij
        );
    }

    let crops = rows
        .iter()
        .map(|r| read_crop(&r.sample_path))
        .collect::<Result<Vec<_>>>()?;
    let doys: Vec<u16> = rows.iter().map(|r| r.doy).collect();

    let bundle = stack_bands(&crops, &doys, first.year)
        .with_context(|| format!("Stacking location {}_{} of {}", key.nij, key.wij, first.year))?;
    let (dy, dx) = bundle.extent()?;

    let path: PathBuf = year_dir.join(archive_name(key, first.year));
    bundle.write_npz(&path)?;
    debug!("Wrote {:?} with {} timesteps", path, bundle.timesteps());

    Ok(ManifestRow {
        sample_path: path,
        year: first.year,
        n: key.nij,
        w: key.wij,
        dy,
        dx,
        dt: bundle.timesteps(),
        win_i: first.il,
        win_j: first.jl,
        status: ManifestRow::COMPLETED.to_string(),
    })
}
