use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use raycloud_core::{CloudChunk, Colors, Normals, Origins, Variances};

use crate::error::{Error, Result};
use crate::header::{parse_header, FileHeader, ScalarType};

#[derive(Debug, Clone, Copy)]
struct FieldRef {
    offset: usize,
    scalar: ScalarType,
}

/// Byte layout of one record, resolved from the header by property name.
/// Properties the reader does not know contribute to the stride only, so
/// unknown/extra trailing fields are tolerated.
#[derive(Debug, Clone)]
struct RecordLayout {
    stride: usize,
    x: FieldRef,
    y: FieldRef,
    z: FieldRef,
    time: Option<FieldRef>,
    ray: Option<[FieldRef; 3]>,
    color: Option<[FieldRef; 4]>,
    normal: Option<[FieldRef; 3]>,
    variance: Option<[FieldRef; 5]>,
}

impl RecordLayout {
    fn resolve(header: &FileHeader, path: &Path) -> Result<Self> {
        let field = |name: &str| -> Option<FieldRef> {
            header.property(name).map(|p| FieldRef {
                offset: p.offset,
                scalar: p.scalar,
            })
        };
        let triple = |a: &str, b: &str, c: &str| -> Option<[FieldRef; 3]> {
            Some([field(a)?, field(b)?, field(c)?])
        };

        let (x, y, z) = match (field("x"), field("y"), field("z")) {
            (Some(x), Some(y), Some(z)) => (x, y, z),
            _ => {
                return Err(Error::header(
                    path,
                    "missing required x, y, z vertex properties",
                ));
            }
        };

        let color = (|| {
            Some([
                field("red")?,
                field("green")?,
                field("blue")?,
                field("alpha")?,
            ])
        })();

        let variance = (|| {
            Some([
                field("range_variance")?,
                field("angular_variance")?,
                field("aoi_variance")?,
                field("mixed_pixel_variance")?,
                field("total_variance")?,
            ])
        })();

        Ok(Self {
            stride: header.record_stride(),
            x,
            y,
            z,
            time: field("time"),
            ray: triple("rayx", "rayy", "rayz"),
            color,
            normal: triple("nx", "ny", "nz"),
            variance,
        })
    }
}

fn read_scalar(record: &[u8], field: FieldRef) -> f64 {
    let o = field.offset;
    match field.scalar {
        ScalarType::Int8 => record[o] as i8 as f64,
        ScalarType::UInt8 => f64::from(record[o]),
        ScalarType::Int16 => f64::from(i16::from_le_bytes([record[o], record[o + 1]])),
        ScalarType::UInt16 => f64::from(u16::from_le_bytes([record[o], record[o + 1]])),
        ScalarType::Int32 => f64::from(i32::from_le_bytes([
            record[o],
            record[o + 1],
            record[o + 2],
            record[o + 3],
        ])),
        ScalarType::UInt32 => f64::from(u32::from_le_bytes([
            record[o],
            record[o + 1],
            record[o + 2],
            record[o + 3],
        ])),
        ScalarType::Float32 => f64::from(f32::from_le_bytes([
            record[o],
            record[o + 1],
            record[o + 2],
            record[o + 3],
        ])),
        ScalarType::Float64 => f64::from_le_bytes([
            record[o],
            record[o + 1],
            record[o + 2],
            record[o + 3],
            record[o + 4],
            record[o + 5],
            record[o + 6],
            record[o + 7],
        ]),
    }
}

fn decode_records(buf: &[u8], n: usize, layout: &RecordLayout) -> CloudChunk {
    let mut chunk = CloudChunk::with_capacity(n);
    if layout.ray.is_some() {
        chunk.origins = Some(Origins::default());
    }
    if layout.color.is_some() {
        chunk.colors = Some(Colors::default());
    }
    if layout.normal.is_some() {
        chunk.normals = Some(Normals::default());
    }
    if layout.variance.is_some() {
        chunk.variances = Some(Variances::default());
    }

    for i in 0..n {
        let record = &buf[i * layout.stride..(i + 1) * layout.stride];
        let x = read_scalar(record, layout.x);
        let y = read_scalar(record, layout.y);
        let z = read_scalar(record, layout.z);
        chunk.x.push(x);
        chunk.y.push(y);
        chunk.z.push(z);
        chunk
            .times
            .push(layout.time.map_or(0.0, |f| read_scalar(record, f)));

        if let Some(ray) = layout.ray {
            // Rays are stored relative to the return point.
            let origins = chunk.origins.as_mut().unwrap();
            origins.ox.push(x + read_scalar(record, ray[0]));
            origins.oy.push(y + read_scalar(record, ray[1]));
            origins.oz.push(z + read_scalar(record, ray[2]));
        }
        if let Some(color) = layout.color {
            let colors = chunk.colors.as_mut().unwrap();
            colors.r.push(read_scalar(record, color[0]).clamp(0.0, 255.0) as u8);
            colors.g.push(read_scalar(record, color[1]).clamp(0.0, 255.0) as u8);
            colors.b.push(read_scalar(record, color[2]).clamp(0.0, 255.0) as u8);
            colors.a.push(read_scalar(record, color[3]).clamp(0.0, 255.0) as u8);
        }
        if let Some(normal) = layout.normal {
            let normals = chunk.normals.as_mut().unwrap();
            normals.nx.push(read_scalar(record, normal[0]));
            normals.ny.push(read_scalar(record, normal[1]));
            normals.nz.push(read_scalar(record, normal[2]));
        }
        if let Some(variance) = layout.variance {
            let variances = chunk.variances.as_mut().unwrap();
            variances.range.push(read_scalar(record, variance[0]));
            variances.angular.push(read_scalar(record, variance[1]));
            variances.aoi.push(read_scalar(record, variance[2]));
            variances.mixed.push(read_scalar(record, variance[3]));
            variances.total.push(read_scalar(record, variance[4]));
        }
    }
    chunk
}

/// Buffered, bounded-memory, forward-only binary record reader.
///
/// Opening parses the header (errors propagate unchanged) and resolves the
/// record layout. Each [`read_chunk`] call advances by exactly the bytes
/// consumed; the sequence is finite and non-restartable. Reopen to
/// restart.
///
/// [`read_chunk`]: ChunkedReader::read_chunk
#[derive(Debug)]
pub struct ChunkedReader {
    input: BufReader<File>,
    path: PathBuf,
    header: FileHeader,
    layout: RecordLayout,
    consumed: u64,
}

impl ChunkedReader {
    /// Open a cloud file. Files without a `time` property are rejected;
    /// use [`open_with_options`] to accept them with the 0.0 sentinel.
    ///
    /// [`open_with_options`]: ChunkedReader::open_with_options
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, false)
    }

    pub fn open_with_options(path: impl AsRef<Path>, times_optional: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        let mut input = BufReader::new(file);
        let header = parse_header(&mut input, &path)?;
        let layout = RecordLayout::resolve(&header, &path)?;
        if layout.time.is_none() && !times_optional {
            return Err(Error::header(&path, "cloud has no `time` property"));
        }
        Ok(Self {
            input,
            path,
            header,
            layout,
            consumed: 0,
        })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Record count declared by the header.
    pub fn record_count(&self) -> u64 {
        self.header.record_count
    }

    /// True when the file carries per-record ray origins.
    pub fn is_ray_cloud(&self) -> bool {
        self.layout.ray.is_some()
    }

    pub fn has_colors(&self) -> bool {
        self.layout.color.is_some()
    }

    /// Read up to `max_records` records from the current position.
    ///
    /// Returns fewer at end of stream and an empty chunk once exhausted;
    /// never pads. A payload that ends in the middle of a record is a
    /// [`Error::TruncatedPayload`].
    pub fn read_chunk(&mut self, max_records: usize) -> Result<CloudChunk> {
        assert!(max_records >= 1, "chunk size must be at least 1");
        let remaining = self.header.record_count - self.consumed;
        let want = remaining.min(max_records as u64) as usize;
        if want == 0 {
            return Ok(CloudChunk::new());
        }

        let stride = self.layout.stride;
        let mut buf = vec![0u8; want * stride];
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.input.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(k) => filled += k,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io(&self.path, e)),
            }
        }
        if filled % stride != 0 {
            return Err(Error::TruncatedPayload {
                path: self.path.clone(),
                expected: stride,
                actual: filled % stride,
            });
        }

        let got = filled / stride;
        self.consumed += got as u64;
        Ok(decode_records(&buf, got, &self.layout))
    }

    /// Deliver the whole remaining stream to `apply`, one chunk at a time,
    /// in strict file order, non-overlapping, covering every record exactly
    /// once. The callback runs synchronously; its error aborts the
    /// traversal. Returns the number of records delivered.
    pub fn for_each_chunk<F>(mut self, chunk_size: usize, mut apply: F) -> Result<u64>
    where
        F: FnMut(CloudChunk) -> Result<()>,
    {
        assert!(chunk_size >= 1, "chunk size must be at least 1");
        let mut total = 0u64;
        loop {
            let chunk = self.read_chunk(chunk_size)?;
            if chunk.is_empty() {
                break;
            }
            total += chunk.len() as u64;
            apply(chunk)?;
        }
        Ok(total)
    }
}

/// Random-access utility: read the single record at `index`.
///
/// Opens its own handle; the chunked readers stay forward-only.
pub fn read_record(path: impl AsRef<Path>, index: u64) -> Result<CloudChunk> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut input = BufReader::new(file);
    let header = parse_header(&mut input, path)?;
    let layout = RecordLayout::resolve(&header, path)?;
    if index >= header.record_count {
        return Err(Error::OutOfRangeIndex {
            path: path.to_path_buf(),
            index,
            count: header.record_count,
        });
    }

    let mut file = input.into_inner();
    let offset = header.data_offset + index * layout.stride as u64;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io(path, e))?;
    let mut buf = vec![0u8; layout.stride];
    file.read_exact(&mut buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::TruncatedPayload {
                path: path.to_path_buf(),
                expected: layout.stride,
                actual: 0,
            }
        } else {
            Error::io(path, e)
        }
    })?;
    Ok(decode_records(&buf, 1, &layout))
}
