//! Frames spoken between the TCP broker client and [`BrokerServer`](super::broker::BrokerServer).
//!
//! Each frame is a named-`MsgPack` map inside a 4-byte length-delimited
//! envelope.
//!
//! | Direction | Frame | Meaning |
//! |-----------|-------|---------|
//! | C -> S | `publish` | enqueue a message; answered by `receipt` |
//! | C -> S | `consume` | open a subscription; answered by `receipt` |
//! | S -> C | `deliver` | one message for a subscription, identified by `tag` |
//! | C -> S | `ack` / `nack` | settle a delivery (`nack` requeues) |
//! | C -> S | `cancel` | close a subscription, requeueing its unsettled deliveries |

use bytes::Bytes;
use courier_core::{Address, CodecError, Headers};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::MessagingError;

/// Upper bound on a single frame.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One frame of the TCP broker protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Frame {
    Publish {
        seq: u64,
        address: Address,
        headers: Headers,
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
    },
    Receipt {
        seq: u64,
        error: Option<String>,
    },
    Consume {
        seq: u64,
        consumer: u64,
        address: Address,
        prefetch: u32,
    },
    Deliver {
        consumer: u64,
        tag: u64,
        headers: Headers,
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
    },
    Ack {
        tag: u64,
    },
    Nack {
        tag: u64,
    },
    Cancel {
        consumer: u64,
    },
}

impl Frame {
    /// # Errors
    ///
    /// Returns `MessagingError::Codec` if serialization fails.
    pub fn encode(&self) -> Result<Bytes, MessagingError> {
        rmp_serde::to_vec_named(self)
            .map(Bytes::from)
            .map_err(|e| MessagingError::Codec(CodecError::from(e)))
    }

    /// # Errors
    ///
    /// Returns `MessagingError::Codec` for a malformed frame.
    pub fn decode(raw: &[u8]) -> Result<Self, MessagingError> {
        rmp_serde::from_slice(raw).map_err(|e| MessagingError::Codec(CodecError::from(e)))
    }
}

/// Wraps a byte stream in the length-delimited frame codec.
pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_framed(io)
}
