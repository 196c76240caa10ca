#![forbid(unsafe_code)]

pub mod error;
pub mod header;
pub mod reader;
pub mod writer;

pub use error::{Error, Result};
pub use header::{
    parse_header, write_header, CloudKind, CloudSchema, FileHeader, PropertyDescriptor,
    ScalarType, COUNT_FIELD_WIDTH,
};
pub use reader::{read_record, ChunkedReader};
pub use writer::ChunkedWriter;
