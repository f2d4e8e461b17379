//! Text payload encodings accepted by `WriteStream::write_str`.

use crate::error::{Result, StreamError};
use base64::Engine;
use bytes::Bytes;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Utf8,
    Hex,
    Base64,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Hex => "hex",
            Encoding::Base64 => "base64",
        }
    }

    /// Decode `text` into the bytes it represents.
    pub fn decode(&self, text: &str) -> Result<Bytes> {
        match self {
            Encoding::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Encoding::Hex => hex::decode(text)
                .map(Bytes::from)
                .map_err(|e| self.error(e.to_string())),
            Encoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map(Bytes::from)
                .map_err(|e| self.error(e.to_string())),
        }
    }

    fn error(&self, message: String) -> StreamError {
        StreamError::Encoding {
            encoding: self.name(),
            message,
        }
    }
}

impl FromStr for Encoding {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "hex" => Ok(Encoding::Hex),
            "base64" => Ok(Encoding::Base64),
            other => Err(StreamError::Encoding {
                encoding: "unknown",
                message: format!("unsupported encoding '{}'", other),
            }),
        }
    }
}
