//! # dotdb codec
//!
//! The dynamic value type and path addressing for dotdb.
//!
//! This crate provides:
//! - [`Value`], the tagged union every stored document is made of
//! - [`Map`], the insertion-ordered object representation
//! - [`Path`], the dot-separated address into a value tree
//! - JSON encoding/decoding for persistence
//!
//! ## Usage
//!
//! ```
//! use dotdb_codec::{from_json, to_json, Path};
//!
//! let value = from_json("{\"name\":\"Alice\"}").unwrap();
//! assert_eq!(to_json(&value).unwrap(), "{\"name\":\"Alice\"}");
//!
//! let path = Path::parse("users.alice").unwrap();
//! assert_eq!(path.segments().len(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod path;
mod value;

pub use decoder::{from_json, from_json_slice};
pub use encoder::{to_json, to_json_pretty, to_json_vec};
pub use error::{CodecError, CodecResult};
pub use path::{segment_as_index, Path};
pub use value::{Map, Value};
