//! MPEG transport stream parsing.
//!
//! Parses 188-byte transport packets, the PAT and PMT tables and PES headers,
//! and reassembles elementary stream frames with [`TsDemuxer`]. [`TsWriter`]
//! produces the same structures for round-trip tests.

pub mod crc;
pub mod demux;
pub mod error;
pub mod packet;
pub mod pat;
pub mod pes;
pub mod pmt;
pub mod psi;
pub mod writer;

pub use demux::{EsFrame, TsDemuxer, TsEvent, TsStats};
pub use error::TsError;
pub use packet::{AdaptationField, PID_NULL, PID_PAT, SYNC_BYTE, TS_PACKET_SIZE, TsPacket};
pub use pat::{Pat, PatProgram};
pub use pes::PesHeader;
pub use pmt::{Pmt, PmtStream, StreamType};
pub use writer::TsWriter;

/// Result type for TS parsing operations
pub type Result<T> = std::result::Result<T, TsError>;
