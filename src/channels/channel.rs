//! Channel trait and the stream type channels hand to the binary.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChannelError;
use crate::intake::{OutgoingReply, TurnRequest};

/// Inbound turn requests from a channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = TurnRequest> + Send>>;

/// A transport that produces inbound messages and delivers replies.
///
/// The intake engine only sees [`TurnRequest`] and [`OutgoingReply`]; the
/// transport framing stays inside the channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start listening. The stream ends when the channel closes.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Deliver a reply for a previously received request.
    async fn respond(
        &self,
        request: &TurnRequest,
        reply: OutgoingReply,
    ) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
