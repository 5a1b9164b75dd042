//! Codec module - attribute header encoding and selection.
//!
//! - [`AttributeCodec`] - flat JSON object <-> [`AttributeMap`] using `serde_json`
//! - [`AttributeFilter`] - which attributes travel with an outbound artifact
//!
//! # Design
//!
//! Codecs are implemented as marker structs with static methods rather than trait objects.
//! The payload itself is never transformed: content bytes go on the wire as-is.
//!
//! # Example
//!
//! ```
//! use flowwire::codec::{AttributeCodec, AttributeFilter, AttributeMap};
//!
//! let mut attrs = AttributeMap::new();
//! attrs.insert("filename".to_string(), "a.txt".to_string());
//! attrs.insert("secret".to_string(), "x".to_string());
//!
//! let selected = AttributeFilter::all().include(["filename"]).apply(&attrs);
//! let header = AttributeCodec::encode(&selected).unwrap();
//! assert_eq!(header, br#"{"filename":"a.txt"}"#);
//! ```

mod attributes;
mod filter;

pub use attributes::{AttributeCodec, AttributeMap};
pub use filter::{AttributeFilter, CORE_ATTRIBUTES};
