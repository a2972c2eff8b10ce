// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Sighting report transport: topic handling, payload decoding, and broker subscribers.

pub mod decode;
pub mod source;
pub mod topic;
pub mod worker;

pub use decode::{DecodeError, decode_frame, decode_payload};
pub use source::{ChannelSource, SightingSource, SourceEvent};
pub use topic::{TopicPattern, TopicPatternError};
pub use worker::{TransportError, WsWorker};
