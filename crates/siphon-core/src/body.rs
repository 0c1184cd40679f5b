//! Response bodies as carried over the instrumentation channel.
//!
//! The channel hands out bodies either as plain text or base64 encoded
//! binary. Synthesized responses are always sent base64 encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// A body plus the flag saying whether `data` is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    /// True when `data` is base64 encoded.
    pub encoded: bool,
    /// Body payload.
    pub data: String,
}

impl Body {
    /// Wraps plain text.
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            encoded: false,
            data: data.into(),
        }
    }

    /// Encodes raw bytes as base64.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            encoded: true,
            data: STANDARD.encode(bytes),
        }
    }

    /// Raw bytes of the body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        if self.encoded {
            STANDARD.decode(self.data.as_bytes())
        } else {
            Ok(self.data.as_bytes().to_vec())
        }
    }

    /// Returns the body in base64 form.
    pub fn into_base64(self) -> Self {
        if self.encoded {
            self
        } else {
            Self::from_bytes(self.data.as_bytes())
        }
    }

    /// Size of the decoded payload without decoding it.
    pub fn decoded_len(&self) -> u64 {
        if !self.encoded {
            return self.data.len() as u64;
        }
        let data = self.data.trim_end();
        let padding = data.bytes().rev().take_while(|b| *b == b'=').count().min(2);
        ((data.len() / 4) * 3).saturating_sub(padding) as u64
    }
}
