use std::io::{self, BufRead, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Width of the zero-padded record-count field. The placeholder written at
/// stream open and the patched value written at close occupy exactly this
/// many bytes, so the patch never shifts the rest of the header.
pub const COUNT_FIELD_WIDTH: usize = 12;

/// Scalar property types understood by the codec.
///
/// The registry is complete over the standard type names (both the classic
/// and the sized spellings); any name outside it fails header parsing hard
/// rather than corrupting subsequent field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl ScalarType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "char" | "int8" | "i1" => Some(ScalarType::Int8),
            "uchar" | "uint8" | "u1" => Some(ScalarType::UInt8),
            "short" | "int16" | "i2" => Some(ScalarType::Int16),
            "ushort" | "uint16" | "u2" => Some(ScalarType::UInt16),
            "int" | "int32" | "i4" => Some(ScalarType::Int32),
            "uint" | "uint32" | "u4" => Some(ScalarType::UInt32),
            "float" | "float32" | "f4" => Some(ScalarType::Float32),
            "double" | "float64" | "f8" => Some(ScalarType::Float64),
            _ => None,
        }
    }

    pub fn byte_size(self) -> usize {
        match self {
            ScalarType::Int8 | ScalarType::UInt8 => 1,
            ScalarType::Int16 | ScalarType::UInt16 => 2,
            ScalarType::Int32 | ScalarType::UInt32 | ScalarType::Float32 => 4,
            ScalarType::Float64 => 8,
        }
    }

    /// Canonical spelling used when writing headers.
    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Int8 => "char",
            ScalarType::UInt8 => "uchar",
            ScalarType::Int16 => "short",
            ScalarType::UInt16 => "ushort",
            ScalarType::Int32 => "int",
            ScalarType::UInt32 => "uint",
            ScalarType::Float32 => "float",
            ScalarType::Float64 => "double",
        }
    }
}

/// File width of the x/y/z coordinates, chosen at build time.
#[cfg(feature = "double-precision")]
pub const COORD_SCALAR: ScalarType = ScalarType::Float64;
#[cfg(not(feature = "double-precision"))]
pub const COORD_SCALAR: ScalarType = ScalarType::Float32;

/// One vertex property as declared in the header. `offset` is the running
/// sum of the sizes of all preceding properties, so offsets are contiguous
/// and non-overlapping by construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub scalar: ScalarType,
    pub size: usize,
    pub offset: usize,
}

/// Parsed header of a binary cloud file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHeader {
    /// Declared record count. Equal to the number of records actually
    /// written once the file has been finalized.
    pub record_count: u64,
    /// Vertex properties in declared order.
    pub properties: Vec<PropertyDescriptor>,
    /// Byte offset of the first digit of the record count, for patch-up.
    pub count_field_offset: u64,
    /// Byte offset of the first binary record.
    pub data_offset: u64,
}

impl FileHeader {
    /// Byte stride of one binary record.
    pub fn record_stride(&self) -> usize {
        self.properties.iter().map(|p| p.size).sum()
    }

    /// Find a property by name.
    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// The two record layouts the writer can produce, plus the optional blocks
/// appended by the processing passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudKind {
    /// Position, time, color.
    PointCloud,
    /// Position, time, ray offset back to the sensor, color.
    RayCloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloudSchema {
    pub kind: CloudKind,
    pub normals: bool,
    pub variances: bool,
}

impl CloudSchema {
    pub fn point_cloud() -> Self {
        Self {
            kind: CloudKind::PointCloud,
            normals: false,
            variances: false,
        }
    }

    pub fn ray_cloud() -> Self {
        Self {
            kind: CloudKind::RayCloud,
            normals: false,
            variances: false,
        }
    }

    pub fn with_normals(mut self) -> Self {
        self.normals = true;
        self
    }

    pub fn with_variances(mut self) -> Self {
        self.variances = true;
        self
    }

    /// Property names and types in declared (and therefore byte) order.
    pub fn properties(&self) -> Vec<(&'static str, ScalarType)> {
        let mut props = vec![
            ("x", COORD_SCALAR),
            ("y", COORD_SCALAR),
            ("z", COORD_SCALAR),
            ("time", ScalarType::Float64),
        ];
        if self.kind == CloudKind::RayCloud {
            props.push(("rayx", ScalarType::Float32));
            props.push(("rayy", ScalarType::Float32));
            props.push(("rayz", ScalarType::Float32));
        }
        props.push(("red", ScalarType::UInt8));
        props.push(("green", ScalarType::UInt8));
        props.push(("blue", ScalarType::UInt8));
        props.push(("alpha", ScalarType::UInt8));
        if self.normals {
            props.push(("nx", ScalarType::Float32));
            props.push(("ny", ScalarType::Float32));
            props.push(("nz", ScalarType::Float32));
        }
        if self.variances {
            props.push(("range_variance", ScalarType::Float64));
            props.push(("angular_variance", ScalarType::Float64));
            props.push(("aoi_variance", ScalarType::Float64));
            props.push(("mixed_pixel_variance", ScalarType::Float64));
            props.push(("total_variance", ScalarType::Float64));
        }
        props
    }
}

/// Byte index of the start of the third whitespace-separated token, used to
/// locate the count digits inside an `element vertex N` line.
fn third_token_start(line: &str) -> Option<usize> {
    let mut token = 0;
    let mut in_token = false;
    for (i, c) in line.char_indices() {
        if c.is_whitespace() {
            in_token = false;
        } else if !in_token {
            in_token = true;
            token += 1;
            if token == 3 {
                return Some(i);
            }
        }
    }
    None
}

/// Parse the text header of a binary cloud file.
///
/// Only the `binary_little_endian 1.0` variant is accepted; ASCII and
/// big-endian files fail with [`Error::UnsupportedFormat`]. Vertex
/// properties with unknown scalar types fail with
/// [`Error::UnknownPropertyType`], and a `list` property inside the vertex
/// element fails parsing outright; both would otherwise corrupt every
/// subsequent field offset. List properties of other elements (mesh faces)
/// are skipped; their payload lies beyond the vertex records and is never
/// read.
///
/// On success the stream is positioned at the first binary record.
pub fn parse_header<R: BufRead>(input: &mut R, path: &Path) -> Result<FileHeader> {
    let mut pos: u64 = 0;
    let mut line = String::new();

    let n = input.read_line(&mut line).map_err(|e| Error::io(path, e))?;
    if n == 0 || line.trim_end() != "ply" {
        return Err(Error::header(path, "missing `ply` magic line"));
    }
    pos += n as u64;

    let mut format_seen = false;
    let mut in_vertex = false;
    let mut vertex_seen = false;
    let mut record_count: u64 = 0;
    let mut count_field_offset: u64 = 0;
    let mut properties: Vec<PropertyDescriptor> = Vec::new();
    let mut offset: usize = 0;

    loop {
        line.clear();
        let n = input.read_line(&mut line).map_err(|e| Error::io(path, e))?;
        if n == 0 {
            return Err(Error::header(path, "missing `end_header`"));
        }
        let line_start = pos;
        pos += n as u64;

        let trimmed = line.trim_end();
        let mut parts = trimmed.split_whitespace();
        let keyword = match parts.next() {
            Some(k) => k,
            None => continue,
        };

        match keyword {
            "comment" | "obj_info" => {}
            "format" => {
                let fmt = parts.next().unwrap_or("");
                if fmt != "binary_little_endian" {
                    return Err(Error::UnsupportedFormat {
                        path: path.to_path_buf(),
                        found: fmt.to_string(),
                    });
                }
                format_seen = true;
            }
            "element" => {
                let name = parts.next().unwrap_or("");
                if name == "vertex" {
                    in_vertex = true;
                    vertex_seen = true;
                    let count_str = parts.next().ok_or_else(|| {
                        Error::header(path, "`element vertex` line has no count")
                    })?;
                    record_count = count_str.parse::<u64>().map_err(|_| {
                        Error::header(path, format!("invalid vertex count `{count_str}`"))
                    })?;
                    // Safe to unwrap: we just split three tokens out of it.
                    count_field_offset = line_start + third_token_start(trimmed).unwrap() as u64;
                } else {
                    in_vertex = false;
                }
            }
            "property" => {
                if !in_vertex {
                    continue;
                }
                let type_name = parts
                    .next()
                    .ok_or_else(|| Error::header(path, "malformed property line"))?;
                if type_name == "list" {
                    return Err(Error::header(
                        path,
                        "list property inside the vertex element is not supported",
                    ));
                }
                let prop_name = parts
                    .next()
                    .ok_or_else(|| Error::header(path, "property line has no name"))?;
                let scalar = ScalarType::parse(type_name).ok_or_else(|| {
                    Error::UnknownPropertyType {
                        path: path.to_path_buf(),
                        property: prop_name.to_string(),
                        type_name: type_name.to_string(),
                    }
                })?;
                let size = scalar.byte_size();
                properties.push(PropertyDescriptor {
                    name: prop_name.to_string(),
                    scalar,
                    size,
                    offset,
                });
                offset += size;
            }
            "end_header" => break,
            _ => {
                return Err(Error::header(
                    path,
                    format!("unexpected header keyword `{keyword}`"),
                ));
            }
        }
    }

    if !format_seen {
        return Err(Error::header(path, "missing format line"));
    }
    if !vertex_seen {
        return Err(Error::header(path, "missing `element vertex`"));
    }

    Ok(FileHeader {
        record_count,
        properties,
        count_field_offset,
        data_offset: pos,
    })
}

/// Write the header for the given schema with a placeholder count of zero.
///
/// Returns the byte offset of the count field, to be patched with the true
/// record count at stream close.
pub fn write_header<W: Write>(out: &mut W, schema: &CloudSchema) -> io::Result<u64> {
    let head = "ply\nformat binary_little_endian 1.0\ncomment generated by raycloud\n";
    out.write_all(head.as_bytes())?;
    let count_field_offset = (head.len() + "element vertex ".len()) as u64;
    writeln!(out, "element vertex {:0width$}", 0, width = COUNT_FIELD_WIDTH)?;
    for (name, scalar) in schema.properties() {
        writeln!(out, "property {} {}", scalar.name(), name)?;
    }
    out.write_all(b"end_header\n")?;
    Ok(count_field_offset)
}
