//! Application protocols carried by TALKREQ/TALKRESP.

use std::fmt::Debug;

use bytes::Bytes;

use crate::common::Id;

/// Answers inbound talk requests.
///
/// Runs on the actor thread, so it should return quickly.
pub trait TalkHandler: Debug + Send {
    /// Returns the response payload, an empty response means the protocol is unknown.
    fn handle(&mut self, from: &Id, protocol: &[u8], request: &[u8]) -> Bytes;
}

#[derive(Debug, Default, Clone, Copy)]
/// Knows no protocol and answers every request with an empty response.
pub struct DefaultTalkHandler;

impl TalkHandler for DefaultTalkHandler {
    fn handle(&mut self, _from: &Id, _protocol: &[u8], _request: &[u8]) -> Bytes {
        Bytes::new()
    }
}
