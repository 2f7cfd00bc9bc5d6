//! Fuzz target for [`FrameDecoder`]
//!
//! Peers are untrusted: every byte a Leader, Oversight agency or telecom
//! reads comes from the network.
//!
//! # Strategy
//!
//! - Raw streams: arbitrary bytes cut into arbitrary chunks
//! - Valid prefixes: well-formed frames followed by garbage
//! - Message types: every wire message type decoded from the same bytes
//!
//! # Invariants
//!
//! - NEVER panic on any input
//! - A declared length above `MAX_FRAME_SIZE` is rejected, never buffered
//! - Re-encoding a decoded message and decoding it again yields the same
//!   message

#![no_main]

use arbitrary::Arbitrary;
use chaining_proto::{
    AgencyId, BatchQuery, FrameDecoder, LENGTH_PREFIX_SIZE, LeaderMessage, MAX_FRAME_SIZE,
    OversightMessage, ProtoError, ResponseBatch, encode_frame, frame_length,
};
use libfuzzer_sys::fuzz_target;
use serde::{Serialize, de::DeserializeOwned};

#[derive(Debug, Arbitrary)]
enum Target {
    Leader,
    Oversight,
    Query,
    Response,
}

#[derive(Debug, Arbitrary)]
struct Input {
    target: Target,
    valid_prefix: Option<u32>,
    chunks: Vec<u8>,
    stream: Vec<u8>,
}

fn drain<T>(decoder: &mut FrameDecoder)
where
    T: DeserializeOwned + Serialize + PartialEq + std::fmt::Debug,
{
    loop {
        match decoder.next_frame::<T>() {
            Ok(Some(message)) => {
                let frame = encode_frame(&message).unwrap();
                let mut again = FrameDecoder::new();
                again.extend(&frame);
                assert_eq!(again.next_frame::<T>().unwrap(), Some(message));
            },
            Ok(None) | Err(_) => return,
        }
    }
}

fuzz_target!(|input: Input| {
    let mut stream = Vec::new();
    if let Some(agency) = input.valid_prefix {
        let hello = OversightMessage::Hello { agency: AgencyId(agency) };
        stream.extend_from_slice(&encode_frame(&hello).unwrap());
    }
    stream.extend_from_slice(&input.stream);

    if stream.len() >= LENGTH_PREFIX_SIZE {
        let prefix = [stream[0], stream[1], stream[2], stream[3]];
        let declared = u32::from_be_bytes(prefix) as usize;
        if declared > MAX_FRAME_SIZE {
            assert!(matches!(frame_length(prefix), Err(ProtoError::FrameTooLarge { .. })));
        }
    }

    let mut decoder = FrameDecoder::new();
    let mut rest = stream.as_slice();
    for &size in input.chunks.iter().chain(std::iter::once(&u8::MAX)) {
        let take = (usize::from(size) + 1).min(rest.len());
        let (chunk, tail) = rest.split_at(take);
        decoder.extend(chunk);
        rest = tail;

        match input.target {
            Target::Leader => drain::<LeaderMessage>(&mut decoder),
            Target::Oversight => drain::<OversightMessage>(&mut decoder),
            Target::Query => drain::<BatchQuery>(&mut decoder),
            Target::Response => drain::<ResponseBatch>(&mut decoder),
        }
        if rest.is_empty() {
            break;
        }
    }
});
