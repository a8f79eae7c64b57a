//! Core data model types: addresses, envelopes, MIME bodies, flags and sequence sets.

pub mod address;
pub mod body;
pub mod envelope;
pub mod flags;
pub mod sequence;

pub use address::Address;
pub use body::{
    Body, BodySize, Disposition, Encoding, Located, MediaType, NestedMessage, Param, Part, Structure,
};
pub use envelope::Envelope;
pub use flags::{is_keyword_atom, FlagSet, SystemFlags};
pub use sequence::SequenceSet;
