//! Blaze protocol: gzip-compressed JSON envelopes over one multiplexed socket,
//! paired into request/reply by a caller-generated correlation id.

pub mod client;
pub mod codec;
pub mod correlator;
pub mod envelope;

pub use client::BlazeClient;
pub use correlator::Correlator;
pub use envelope::{action, BlazeError, BlazeMessage, MessageView, TransferView};
