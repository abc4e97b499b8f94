#![doc = include_str!("../readme.md")]

pub mod clock;
pub mod config;
pub mod decode;
pub mod errors;
pub mod filter;
pub mod model;
pub mod reassembly;
pub mod rsr;
pub mod spool;
pub mod synthesis;

pub mod prelude {
    /// This re-export is necessary to decode frame headers
    pub use deku::prelude::*;

    pub use crate::clock::Clock;
    pub use crate::config::Settings;
    pub use crate::decode::products::PayloadRecord;
    pub use crate::decode::time::PartialTime;
    pub use crate::decode::{
        decode_packet, parse_capture_line, CaptureLine, FrameRecord,
        PacketRecord, ParsedLine,
    };
    pub use crate::errors::{ErrorSink, FisbError};
    pub use crate::filter::ChangeFilter;
    pub use crate::model::{Product, ProductType};
    pub use crate::reassembly::{Assembled, AssembledKind, Reassembler};
    pub use crate::rsr::StationRegistry;
    pub use crate::synthesis::Synthesizer;
}
