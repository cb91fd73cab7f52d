use tracing::{debug, trace};

use crate::error::RelayError;
use crate::transport::TransportCapability;

/// Who wrote a transcript line. `Local` is this side ("self").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    Message { origin: Origin, text: String },
    ChannelOpened,
    ChannelClosed,
}

impl TranscriptEntry {
    pub fn local(text: impl Into<String>) -> Self {
        TranscriptEntry::Message {
            origin: Origin::Local,
            text: text.into(),
        }
    }

    pub fn peer(text: impl Into<String>) -> Self {
        TranscriptEntry::Message {
            origin: Origin::Peer,
            text: text.into(),
        }
    }
}

/// Chat traffic over the data channel plus the ordered record of it.
#[derive(Debug)]
pub struct MessageRelay {
    channel: ChannelState,
    transcript: Vec<TranscriptEntry>,
}

impl Default for MessageRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRelay {
    pub fn new() -> Self {
        Self {
            channel: ChannelState::Connecting,
            transcript: Vec::new(),
        }
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    /// Sends one line of text. Nothing is recorded unless the transport took it.
    pub async fn send(
        &mut self,
        transport: Option<&dyn TransportCapability>,
        text: &str,
    ) -> Result<(), RelayError> {
        if self.channel != ChannelState::Open {
            return Err(RelayError::ChannelNotOpen);
        }
        let transport = transport.ok_or(RelayError::ChannelNotOpen)?;
        transport
            .send_text(text)
            .await
            .map_err(|err| RelayError::SendFailed(err.to_string()))?;
        trace!(len = text.len(), "message sent");
        self.transcript.push(TranscriptEntry::local(text));
        Ok(())
    }

    pub fn on_open(&mut self) {
        if self.channel == ChannelState::Connecting {
            debug!("data channel open");
            self.channel = ChannelState::Open;
            self.transcript.push(TranscriptEntry::ChannelOpened);
        }
    }

    pub fn on_close(&mut self) {
        if self.channel == ChannelState::Open {
            debug!("data channel closed");
            self.channel = ChannelState::Closed;
            self.transcript.push(TranscriptEntry::ChannelClosed);
        }
    }

    pub fn on_message(&mut self, text: String) {
        trace!(len = text.len(), "message received");
        self.transcript.push(TranscriptEntry::Message {
            origin: Origin::Peer,
            text,
        });
    }

    pub fn reset(&mut self) {
        self.channel = ChannelState::Connecting;
        self.transcript.clear();
    }
}
