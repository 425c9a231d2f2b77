//! Pluggable payload compression: wire method ids, an ordered registry built
//! once at startup, and the gzip/zlib codecs backing it.

use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

/// A named compression method with a fixed wire id.
///
/// The id block 0x10-0x2F is reserved for compression methods. Only gzip and
/// zlib have a backing codec in this build; the rest keep their ids so the
/// negotiation protocol can name them, but a registry never offers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Bz2,
    Gzip,
    Lzma,
    Zlib,
    Snappy,
}

impl Method {
    /// The single-byte wire id used in negotiation payloads.
    pub fn wire_id(self) -> u8 {
        match self {
            Method::Bz2 => 0x10,
            Method::Gzip => 0x11,
            Method::Lzma => 0x12,
            Method::Zlib => 0x13,
            Method::Snappy => 0x20,
        }
    }

    /// Look up a method by wire id. Unknown ids are skipped by callers, not errors.
    pub fn from_wire_id(id: u8) -> Option<Method> {
        match id {
            0x10 => Some(Method::Bz2),
            0x11 => Some(Method::Gzip),
            0x12 => Some(Method::Lzma),
            0x13 => Some(Method::Zlib),
            0x20 => Some(Method::Snappy),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::Bz2 => "bz2",
            Method::Gzip => "gzip",
            Method::Lzma => "lzma",
            Method::Zlib => "zlib",
            Method::Snappy => "snappy",
        }
    }

    /// Whether a codec for this method is compiled in.
    pub fn backed(self) -> bool {
        matches!(self, Method::Gzip | Method::Zlib)
    }
}

/// Ordered list of enabled methods, most preferred first.
///
/// Built once at process start and passed explicitly into envelope and
/// connection code; there is no ambient global method list.
#[derive(Debug, Clone)]
pub struct Registry {
    methods: Vec<Method>,
}

impl Registry {
    /// A registry offering exactly the given methods, in preference order.
    /// Methods without a backing codec are dropped.
    pub fn new(methods: Vec<Method>) -> Self {
        Self {
            methods: methods.into_iter().filter(|m| m.backed()).collect(),
        }
    }

    /// The default preference order: zlib, then gzip.
    pub fn with_defaults() -> Self {
        Self::new(vec![Method::Zlib, Method::Gzip])
    }

    /// A registry offering no compression at all.
    pub fn empty() -> Self {
        Self {
            methods: Vec::new(),
        }
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Wire ids of the enabled methods, in preference order.
    pub fn wire_ids(&self) -> Vec<u8> {
        self.methods.iter().map(|m| m.wire_id()).collect()
    }

    /// Ordered intersection with a remote capability list, preserving local
    /// preference order.
    pub fn negotiate(&self, remote: &[Method]) -> Vec<Method> {
        self.methods
            .iter()
            .copied()
            .filter(|m| remote.contains(m))
            .collect()
    }

    /// The first mutually usable method, if any.
    pub fn first_common(&self, remote: &[Method]) -> Option<Method> {
        self.methods.iter().copied().find(|m| remote.contains(m))
    }

    pub fn compress(&self, data: &[u8], method: Method) -> Result<Vec<u8>, CompressionError> {
        if !self.methods.contains(&method) {
            return Err(CompressionError::UnsupportedMethod(method));
        }
        match method {
            Method::Gzip => {
                let mut enc = GzEncoder::new(Vec::new(), Compression::default());
                enc.write_all(data).map_err(CompressionError::Compress)?;
                enc.finish().map_err(CompressionError::Compress)
            }
            Method::Zlib => {
                let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
                enc.write_all(data).map_err(CompressionError::Compress)?;
                enc.finish().map_err(CompressionError::Compress)
            }
            other => Err(CompressionError::UnsupportedMethod(other)),
        }
    }

    pub fn decompress(&self, data: &[u8], method: Method) -> Result<Vec<u8>, CompressionError> {
        if !self.methods.contains(&method) {
            return Err(CompressionError::UnsupportedMethod(method));
        }
        let mut out = Vec::new();
        match method {
            Method::Gzip => {
                GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(CompressionError::Decompress)?;
            }
            Method::Zlib => {
                ZlibDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(CompressionError::Decompress)?;
            }
            other => return Err(CompressionError::UnsupportedMethod(other)),
        }
        Ok(out)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Error compressing or decompressing a message body.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression method {} is not registered", .0.name())]
    UnsupportedMethod(Method),
    #[error("compression failed: {0}")]
    Compress(std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
}
