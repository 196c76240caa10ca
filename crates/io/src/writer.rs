use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use raycloud_core::CloudChunk;

use crate::error::{Error, Result};
use crate::header::{self, CloudKind, CloudSchema, COUNT_FIELD_WIDTH};

/// Buffered, bounded-memory binary record writer.
///
/// A session is opened with a header whose record count is a zero
/// placeholder; chunks of records are appended one batch at a time;
/// [`finish`] seeks back and patches the true count. Peak memory is one
/// chunk regardless of the total record count.
///
/// The count patch is the one non-atomic step: if the destination cannot
/// seek backwards, [`finish`] fails with [`Error::NonSeekableOutput`] and
/// the file is left structurally valid but with a wrong declared count.
///
/// [`finish`]: ChunkedWriter::finish
pub struct ChunkedWriter {
    out: BufWriter<File>,
    path: PathBuf,
    schema: CloudSchema,
    count_field_offset: u64,
    records_written: u64,
    times_optional: bool,
    warned_bad_values: bool,
}

impl ChunkedWriter {
    /// Create the destination file and write a header with a placeholder
    /// record count of zero.
    pub fn create(path: impl AsRef<Path>, schema: CloudSchema) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
        let mut out = BufWriter::new(file);
        let count_field_offset =
            header::write_header(&mut out, &schema).map_err(|e| Error::io(&path, e))?;
        Ok(Self {
            out,
            path,
            schema,
            count_field_offset,
            records_written: 0,
            times_optional: false,
            warned_bad_values: false,
        })
    }

    /// Allow chunks without timestamps; the 0.0 sentinel is substituted for
    /// every record. Without this, appending an untimed chunk is a
    /// programmer error.
    pub fn times_optional(mut self, yes: bool) -> Self {
        self.times_optional = yes;
        self
    }

    pub fn schema(&self) -> CloudSchema {
        self.schema
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// True once a non-finite input value has been clamped this session.
    pub fn has_warned_bad_values(&self) -> bool {
        self.warned_bad_values
    }

    /// Serialize and append one batch of records.
    ///
    /// Field vectors the schema requires must be present and equal length;
    /// violations are programmer errors and panic. Non-finite coordinate,
    /// origin or time values are clamped to 0.0 and logged at most once per
    /// session. Missing colors are written as opaque black.
    pub fn append(&mut self, chunk: &CloudChunk) -> Result<()> {
        let n = chunk.len();
        if n == 0 {
            return Ok(());
        }

        if chunk.times.is_empty() {
            assert!(
                self.times_optional,
                "chunk has no timestamps and the writer was not opened with times_optional"
            );
        } else {
            assert_eq!(chunk.times.len(), n, "times length mismatch");
        }
        if self.schema.kind == CloudKind::RayCloud {
            let origins = chunk
                .origins
                .as_ref()
                .expect("ray-cloud schema requires origins");
            assert_eq!(origins.ox.len(), n, "origins length mismatch");
        }
        if self.schema.normals {
            let normals = chunk
                .normals
                .as_ref()
                .expect("schema requires a normals block");
            assert_eq!(normals.len(), n, "normals length mismatch");
        }
        if self.schema.variances {
            let variances = chunk
                .variances
                .as_ref()
                .expect("schema requires a variances block");
            assert_eq!(variances.len(), n, "variances length mismatch");
        }
        if let Some(colors) = &chunk.colors {
            assert_eq!(colors.r.len(), n, "colors length mismatch");
        }

        let mut record: Vec<u8> = Vec::with_capacity(64);
        for i in 0..n {
            record.clear();

            let end_x = self.sanitize(chunk.x[i]);
            let end_y = self.sanitize(chunk.y[i]);
            let end_z = self.sanitize(chunk.z[i]);
            put_coord(&mut record, end_x);
            put_coord(&mut record, end_y);
            put_coord(&mut record, end_z);

            let time = if chunk.times.is_empty() {
                0.0
            } else {
                self.sanitize(chunk.times[i])
            };
            record.extend_from_slice(&time.to_le_bytes());

            if self.schema.kind == CloudKind::RayCloud {
                // Rays are stored relative to the return point.
                let o = chunk.origins.as_ref().unwrap();
                let ray_x = self.sanitize(o.ox[i]) - end_x;
                let ray_y = self.sanitize(o.oy[i]) - end_y;
                let ray_z = self.sanitize(o.oz[i]) - end_z;
                put_f32(&mut record, ray_x);
                put_f32(&mut record, ray_y);
                put_f32(&mut record, ray_z);
            }

            match &chunk.colors {
                Some(c) => record.extend_from_slice(&[c.r[i], c.g[i], c.b[i], c.a[i]]),
                None => record.extend_from_slice(&[0, 0, 0, 255]),
            }

            if self.schema.normals {
                let normals = chunk.normals.as_ref().unwrap();
                put_f32(&mut record, normals.nx[i]);
                put_f32(&mut record, normals.ny[i]);
                put_f32(&mut record, normals.nz[i]);
            }

            if self.schema.variances {
                let v = chunk.variances.as_ref().unwrap();
                record.extend_from_slice(&v.range[i].to_le_bytes());
                record.extend_from_slice(&v.angular[i].to_le_bytes());
                record.extend_from_slice(&v.aoi[i].to_le_bytes());
                record.extend_from_slice(&v.mixed[i].to_le_bytes());
                record.extend_from_slice(&v.total[i].to_le_bytes());
            }

            self.out
                .write_all(&record)
                .map_err(|e| Error::io(&self.path, e))?;
        }

        self.records_written += n as u64;
        Ok(())
    }

    /// Flush, patch the header's record count with the number of records
    /// actually written, and return that count.
    pub fn finish(self) -> Result<u64> {
        let ChunkedWriter {
            out,
            path,
            count_field_offset,
            records_written,
            ..
        } = self;

        let mut file = out
            .into_inner()
            .map_err(|e| Error::io(&path, e.into_error()))?;
        file.seek(SeekFrom::Start(count_field_offset))
            .map_err(|e| Error::NonSeekableOutput {
                path: path.clone(),
                source: e,
            })?;
        let digits = format!("{records_written:0width$}", width = COUNT_FIELD_WIDTH);
        debug_assert_eq!(digits.len(), COUNT_FIELD_WIDTH);
        file.write_all(digits.as_bytes())
            .map_err(|e| Error::io(&path, e))?;
        file.flush().map_err(|e| Error::io(&path, e))?;
        Ok(records_written)
    }

    /// Clamp non-finite values to 0.0, warning once per session.
    fn sanitize(&mut self, v: f64) -> f64 {
        if v.is_finite() {
            v
        } else {
            if !self.warned_bad_values {
                log::warn!(
                    "{}: non-finite values in cloud data, clamping to 0",
                    self.path.display()
                );
                self.warned_bad_values = true;
            }
            0.0
        }
    }
}

fn put_f32(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&(v as f32).to_le_bytes());
}

#[cfg(feature = "double-precision")]
fn put_coord(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[cfg(not(feature = "double-precision"))]
fn put_coord(buf: &mut Vec<u8>, v: f64) {
    put_f32(buf, v);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use tempfile::tempdir;

    fn sample_chunk(n: usize) -> CloudChunk {
        let mut chunk = CloudChunk::new();
        for i in 0..n {
            let end = Vector3::new(i as f64, 0.25 * i as f64, -1.5);
            let start = end + Vector3::new(0.0, 0.0, 2.0);
            chunk.push_ray(start, end, 0.1 * i as f64, [i as u8, 0, 255, 200]);
        }
        chunk
    }

    #[test]
    fn count_is_patched_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.ply");
        let mut writer = ChunkedWriter::create(&path, CloudSchema::ray_cloud()).unwrap();
        let offset = writer.count_field_offset as usize;
        writer.append(&sample_chunk(3)).unwrap();
        writer.append(&sample_chunk(2)).unwrap();
        let count = writer.finish().unwrap();
        assert_eq!(count, 5);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[offset..offset + COUNT_FIELD_WIDTH], b"000000000005");
    }

    #[test]
    fn empty_append_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.ply");
        let mut writer = ChunkedWriter::create(&path, CloudSchema::ray_cloud()).unwrap();
        writer.append(&CloudChunk::new()).unwrap();
        assert_eq!(writer.finish().unwrap(), 0);
    }

    #[test]
    #[should_panic]
    fn missing_times_panics_without_opt_in() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.ply");
        let mut writer = ChunkedWriter::create(&path, CloudSchema::point_cloud()).unwrap();
        let mut chunk = CloudChunk::new();
        chunk.push_point(Vector3::zeros(), 0.0, [0; 4]);
        chunk.times.clear();
        let _ = writer.append(&chunk);
    }

    #[test]
    fn missing_times_substitutes_sentinel_when_opted_in() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.ply");
        let mut writer = ChunkedWriter::create(&path, CloudSchema::point_cloud())
            .unwrap()
            .times_optional(true);
        let mut chunk = CloudChunk::new();
        chunk.push_point(Vector3::new(1.0, 2.0, 3.0), 9.9, [0; 4]);
        chunk.times.clear();
        writer.append(&chunk).unwrap();
        writer.finish().unwrap();

        let read = crate::reader::read_record(&path, 0).unwrap();
        assert_eq!(read.times, vec![0.0]);
    }

    #[test]
    fn non_finite_values_are_clamped_with_one_warning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.ply");
        let mut writer = ChunkedWriter::create(&path, CloudSchema::ray_cloud()).unwrap();
        let mut chunk = sample_chunk(2);
        chunk.x[0] = f64::NAN;
        chunk.times[1] = f64::INFINITY;
        assert!(!writer.has_warned_bad_values());
        writer.append(&chunk).unwrap();
        assert!(writer.has_warned_bad_values());
        writer.finish().unwrap();

        let first = crate::reader::read_record(&path, 0).unwrap();
        assert_eq!(first.x[0], 0.0);
        let second = crate::reader::read_record(&path, 1).unwrap();
        assert_eq!(second.times[0], 0.0);
    }

    #[test]
    #[should_panic]
    fn ray_schema_requires_origins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.ply");
        let mut writer = ChunkedWriter::create(&path, CloudSchema::ray_cloud()).unwrap();
        let mut chunk = CloudChunk::new();
        chunk.push_point(Vector3::zeros(), 0.0, [0; 4]);
        let _ = writer.append(&chunk);
    }
}
