//! Streaming output
//!
//! The generation loop pushes fragments into a [`TokenSink`]. Adapters let a
//! caller receive them as callbacks, over a std channel, or over a tokio
//! channel for async consumers.

use std::sync::mpsc::Sender;

use tokio::sync::mpsc::UnboundedSender;

/// Receiver side of a generation stream.
///
/// Calls arrive in generation order on the thread running the loop.
/// `on_done` is the only completion signal and fires at most once.
pub trait TokenSink {
    /// A non-empty text fragment. Delivered fragments are final.
    fn on_token(&mut self, fragment: &str);

    /// Generation finished, for any reason
    fn on_done(&mut self);

    /// Reports a failure or an unavailable backend
    fn on_error(&mut self, message: &str) {
        tracing::warn!("Generation error with no handler: {}", message);
    }

    /// A closed sink stops generation at the next iteration boundary
    fn is_closed(&self) -> bool {
        false
    }
}

/// Represents an event emitted during streaming inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// A generated text fragment
    Token(String),
    /// Generation completed
    Done,
    /// An error occurred
    Error(String),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done)
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Extracts the fragment if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error message if this is an Error variant
    pub fn as_error(&self) -> Option<&str> {
        match self {
            StreamToken::Error(s) => Some(s),
            _ => None,
        }
    }
}

/// Collects every event; handy for short generations and tests
impl TokenSink for Vec<StreamToken> {
    fn on_token(&mut self, fragment: &str) {
        self.push(StreamToken::Token(fragment.to_string()));
    }

    fn on_done(&mut self) {
        self.push(StreamToken::Done);
    }

    fn on_error(&mut self, message: &str) {
        self.push(StreamToken::Error(message.to_string()));
    }
}

/// Forwards events to a closure
pub struct FnSink<F>(pub F);

impl<F: FnMut(StreamToken)> TokenSink for FnSink<F> {
    fn on_token(&mut self, fragment: &str) {
        (self.0)(StreamToken::Token(fragment.to_string()));
    }

    fn on_done(&mut self) {
        (self.0)(StreamToken::Done);
    }

    fn on_error(&mut self, message: &str) {
        (self.0)(StreamToken::Error(message.to_string()));
    }
}

/// Sends events over a std channel. Closed once the receiver is dropped.
pub struct ChannelSink {
    tx: Sender<StreamToken>,
    closed: bool,
}

impl ChannelSink {
    pub fn new(tx: Sender<StreamToken>) -> Self {
        Self { tx, closed: false }
    }

    fn send(&mut self, event: StreamToken) {
        if !self.closed && self.tx.send(event).is_err() {
            tracing::debug!("Receiver dropped, closing stream");
            self.closed = true;
        }
    }
}

impl TokenSink for ChannelSink {
    fn on_token(&mut self, fragment: &str) {
        self.send(StreamToken::Token(fragment.to_string()));
    }

    fn on_done(&mut self) {
        self.send(StreamToken::Done);
    }

    fn on_error(&mut self, message: &str) {
        self.send(StreamToken::Error(message.to_string()));
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Sends events over a tokio channel for async consumers
pub struct AsyncChannelSink {
    tx: UnboundedSender<StreamToken>,
}

impl AsyncChannelSink {
    pub fn new(tx: UnboundedSender<StreamToken>) -> Self {
        Self { tx }
    }
}

impl TokenSink for AsyncChannelSink {
    fn on_token(&mut self, fragment: &str) {
        let _ = self.tx.send(StreamToken::Token(fragment.to_string()));
    }

    fn on_done(&mut self) {
        let _ = self.tx.send(StreamToken::Done);
    }

    fn on_error(&mut self, message: &str) {
        let _ = self.tx.send(StreamToken::Error(message.to_string()));
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_stream_token_variants() {
        let token = StreamToken::Token("hello".to_string());
        assert!(token.is_token());
        assert!(!token.is_done());
        assert_eq!(token.as_token(), Some("hello"));

        let done = StreamToken::Done;
        assert!(done.is_done());
        assert!(!done.is_error());

        let error = StreamToken::Error("boom".to_string());
        assert!(error.is_error());
        assert_eq!(error.as_error(), Some("boom"));
        assert_eq!(error.as_token(), None);
    }

    #[test]
    fn test_vec_sink_records_in_order() {
        let mut events: Vec<StreamToken> = Vec::new();
        events.on_token("a");
        events.on_token("b");
        events.on_done();
        assert_eq!(
            events,
            vec![
                StreamToken::Token("a".into()),
                StreamToken::Token("b".into()),
                StreamToken::Done
            ]
        );
    }

    #[test]
    fn test_fn_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = FnSink(|event: StreamToken| seen.push(event));
            sink.on_error("no model");
            sink.on_done();
        }
        assert_eq!(
            seen,
            vec![StreamToken::Error("no model".into()), StreamToken::Done]
        );
    }

    #[test]
    fn test_channel_sink_closes_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel();
        let mut sink = ChannelSink::new(tx);
        sink.on_token("x");
        assert!(!sink.is_closed());
        assert_eq!(rx.recv().unwrap(), StreamToken::Token("x".into()));

        drop(rx);
        sink.on_token("y");
        assert!(sink.is_closed());
    }

    #[test]
    fn test_async_sink_closes_when_receiver_dropped() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sink = AsyncChannelSink::new(tx);
        sink.on_token("x");
        assert_eq!(rx.try_recv().unwrap(), StreamToken::Token("x".into()));

        drop(rx);
        assert!(sink.is_closed());
    }
}
