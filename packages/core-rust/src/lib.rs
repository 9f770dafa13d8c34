//! `Courier` Core — request/reply/heartbeat wire model, body codecs, and broker addresses.

pub mod address;
pub mod clock;
pub mod messages;
pub mod types;

pub use address::{Address, AddressError, AddressKind, BindingKind, BrokerBinding, BrokerEndpoint};
pub use clock::{ClockSource, ManualClock, MonotonicClock, SystemClock};
pub use messages::{header, Codec, CodecError, FromMessage, Headers, Message};
pub use types::{
    generate_request_id, ContentReference, Heartbeat, Reply, ReplyStatus, Request,
    TransformOptions,
};
