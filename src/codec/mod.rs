//! Codec module - JSON for the structured values carried inside commands.
//!
//! Open options and attribute values travel as JSON text inside the
//! colon-delimited command encoding. Everything else is raw bytes.
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects.
//!
//! # Example
//!
//! ```
//! use instrument_relay::codec::JsonCodec;
//!
//! let encoded = JsonCodec::encode(&5000).unwrap();
//! assert_eq!(encoded, b"5000");
//! let decoded: u32 = JsonCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, 5000);
//! ```

mod json;

pub use json::JsonCodec;
