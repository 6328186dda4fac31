//! Traffic obfuscation layer
//!
//! Provides:
//! - Chunked transfer coding, so a leg looks like an unbounded HTTP body
//! - Padding frames, hiding payload sizes inside randomly padded frames
//! - Browser profiles for the client's User-Agent and TLS configuration
//!
//! Framing is chosen per direction. The two directions never need to match,
//! but both peers must agree on each direction's framing. When chunked and
//! padded framing are combined, padded frames travel as opaque chunk data:
//!
//! ```text
//! writer:  payload -> PaddingWriter -> ChunkedWriter -> leg
//! reader:  leg -> ChunkedReader -> PaddingReader -> payload
//! ```

mod chunked;
mod fingerprint;
mod padding;

pub use chunked::{ChunkedReader, ChunkedWriter};
pub use fingerprint::{BrowserProfile, FingerprintError};
#[cfg(feature = "tls")]
pub use fingerprint::{build_tls_config, RootTrust};
pub use padding::{
    decode_frame, encode_frame, ObfuscationError, PaddingConfig, PaddingReader, PaddingStrategy,
    PaddingWriter, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD, MAX_FRAME_SIZE,
};

use crate::config::CamouflageConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Boxed reader used for every stage of a read chain
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writer used for every stage of a write chain
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Framing applied to one direction of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Framing {
    /// Bytes pass through untouched
    #[default]
    #[serde(rename = "raw")]
    Raw,
    /// HTTP chunked transfer coding
    #[serde(rename = "chunked")]
    Chunked,
    /// Padding frames
    #[serde(rename = "padded")]
    Padded,
    /// Padding frames carried inside chunked transfer coding
    #[serde(rename = "chunked+padded")]
    ChunkedPadded,
}

impl Framing {
    /// Whether chunked transfer coding is applied
    pub fn chunked(self) -> bool {
        matches!(self, Framing::Chunked | Framing::ChunkedPadded)
    }

    /// Whether padding frames are applied
    pub fn padded(self) -> bool {
        matches!(self, Framing::Padded | Framing::ChunkedPadded)
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Framing::Raw => "raw",
            Framing::Chunked => "chunked",
            Framing::Padded => "padded",
            Framing::ChunkedPadded => "chunked+padded",
        })
    }
}

/// Framing for both directions of one endpoint of a tunnel
#[derive(Debug, Clone, Default)]
pub struct Codec {
    /// Framing of the bytes this endpoint reads
    pub read: Framing,
    /// Framing of the bytes this endpoint writes
    pub write: Framing,
    /// Frame sizing for padded writes
    pub padding: PaddingConfig,
}

impl Codec {
    /// The server reads the upload leg and writes the download leg
    pub fn for_server(camouflage: &CamouflageConfig) -> Self {
        Self {
            read: camouflage.upload_framing,
            write: camouflage.download_framing,
            padding: camouflage.padding.clone(),
        }
    }

    /// The client reads the download leg and writes the upload leg
    pub fn for_client(camouflage: &CamouflageConfig) -> Self {
        Self {
            read: camouflage.download_framing,
            write: camouflage.upload_framing,
            padding: camouflage.padding.clone(),
        }
    }

    /// Wrap the raw input of a tunnel with the configured decoders
    pub fn wrap_reader(&self, reader: BoxedReader) -> BoxedReader {
        let reader: BoxedReader = if self.read.chunked() {
            Box::new(ChunkedReader::new(BufReader::new(reader)))
        } else {
            reader
        };

        if self.read.padded() {
            Box::new(PaddingReader::spawn(reader))
        } else {
            reader
        }
    }

    /// Wrap the raw output of a tunnel with the configured encoders
    pub fn wrap_writer(&self, writer: BoxedWriter) -> BoxedWriter {
        let writer: BoxedWriter = if self.write.chunked() {
            Box::new(ChunkedWriter::new(writer))
        } else {
            writer
        };

        if self.write.padded() {
            Box::new(PaddingWriter::new(writer, self.padding.clone()))
        } else {
            writer
        }
    }
}
