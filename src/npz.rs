//! Minimal `.npz` access: a zip archive whose members are `<name>.npy` files,
//! as produced by `numpy.savez`.

use anyhow::{anyhow, Context, Result};
use ndarray::{Array, ArrayBase, Data, Dimension};
use ndarray_npy::{ReadNpyExt, ReadableElement, WritableElement, WriteNpyExt};
use std::io::{Read, Seek, Write};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

pub struct NpzReader<R: Read + Seek> {
    archive: ZipArchive<R>,
}

impl<R: Read + Seek> NpzReader<R> {
    pub fn new(reader: R) -> Result<Self> {
        let archive = ZipArchive::new(reader).context("Not a valid npz (zip) archive")?;
        Ok(NpzReader { archive })
    }

    /// Array names, with the `.npy` suffix removed
    #[cfg(test)]
    fn names(&self) -> Vec<String> {
        self.archive
            .file_names()
            .map(|f| f.strip_suffix(".npy").unwrap_or(f).to_string())
            .collect()
    }

    /// Read the array stored under `name` (member `name.npy`, or `name` verbatim)
    pub fn by_name<A, D>(&mut self, name: &str) -> Result<Array<A, D>>
    where
        A: ReadableElement,
        D: Dimension,
    {
        let with_suffix = format!("{}.npy", name);
        let member = [with_suffix.as_str(), name]
            .into_iter()
            .find(|m| self.archive.file_names().any(|f| f == *m))
            .ok_or_else(|| anyhow!("Array {:?} not found in archive", name))?
            .to_string();

        let entry = self.archive.by_name(&member)?;
        Array::<A, D>::read_npy(entry).with_context(|| format!("Failed to decode array {:?}", name))
    }
}

pub struct NpzWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    options: SimpleFileOptions,
}

impl<W: Write + Seek> NpzWriter<W> {
    /// Uncompressed writer, matching `numpy.savez`
    pub fn new(writer: W) -> Self {
        NpzWriter {
            zip: ZipWriter::new(writer),
            options: SimpleFileOptions::default()
                .compression_method(CompressionMethod::Stored),
        }
    }

    pub fn add_array<S, D>(&mut self, name: &str, array: &ArrayBase<S, D>) -> Result<()>
    where
        S: Data,
        S::Elem: WritableElement,
        D: Dimension,
    {
        self.zip.start_file(format!("{}.npy", name), self.options)?;
        array
            .write_npy(&mut self.zip)
            .with_context(|| format!("Failed to encode array {:?}", name))?;
        Ok(())
    }

    pub fn finish(self) -> Result<W> {
        Ok(self.zip.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr0, array, Array0, Array1, Array2};
    use std::io::Cursor;

    #[test]
    fn arrays_are_stored_as_npy_members() {
        let mut writer = NpzWriter::new(Cursor::new(Vec::new()));
        writer.add_array("B02", &array![[1u16, 2], [3, 4]]).unwrap();
        writer.add_array("year", &arr0(2019i32)).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let mut reader = NpzReader::new(Cursor::new(bytes)).unwrap();
        let mut names = reader.names();
        names.sort();
        assert_eq!(names, vec!["B02".to_string(), "year".to_string()]);

        let b02: Array2<u16> = reader.by_name("B02").unwrap();
        assert_eq!(b02, array![[1u16, 2], [3, 4]]);
        let year: Array0<i32> = reader.by_name("year").unwrap();
        assert_eq!(year.into_scalar(), 2019);
    }

    #[test]
    fn missing_or_mistyped_arrays_are_errors() {
        let mut writer = NpzWriter::new(Cursor::new(Vec::new()));
        writer.add_array("doy", &array![5u16, 9]).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let mut reader = NpzReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.by_name::<u16, ndarray::Ix1>("B01").is_err());
        assert!(reader.by_name::<f32, ndarray::Ix1>("doy").is_err());
        let doy: Array1<u16> = reader.by_name("doy").unwrap();
        assert_eq!(doy.to_vec(), vec![5, 9]);
    }

    #[test]
    fn garbage_is_not_an_archive() {
        assert!(NpzReader::new(Cursor::new(b"not a zip".to_vec())).is_err());
    }
}
