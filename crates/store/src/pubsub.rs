//! Cancellable subscriptions to a pub/sub channel.
//!
//! A backend hands out a [`Subscription`] together with a [`SubscriptionFeed`].
//! The backend's forwarding task pushes messages into the feed; the consumer
//! pulls them with [`Subscription::next`]. Cancelling the subscription (or
//! dropping it) ends the sequence and signals the forwarding task to stop.
//!
//! A transport failure is delivered once as `Some(Err(_))`, after which the
//! sequence is finished.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};

/// Buffered messages per subscription before the producer waits.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// A message received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message was published on.
    pub channel: String,
    /// Message payload.
    pub payload: String,
}

impl Message {
    /// Creates a message.
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self { channel: channel.into(), payload: payload.into() }
    }
}

/// Consumer side of a channel subscription.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<StoreResult<Message>>,
    cancel: CancellationToken,
    finished: bool,
}

/// Producer side of a channel subscription, owned by a backend task.
#[derive(Debug, Clone)]
pub struct SubscriptionFeed {
    sender: mpsc::Sender<StoreResult<Message>>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Creates a connected subscription/feed pair for `channel`.
    #[must_use]
    pub fn channel_pair(channel: impl Into<String>) -> (SubscriptionFeed, Self) {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let feed = SubscriptionFeed { sender, cancel: cancel.clone() };
        let subscription = Self { channel: channel.into(), receiver, cancel, finished: false };
        (feed, subscription)
    }

    /// The channel this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// A token that cancels this subscription when triggered.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the subscription. Subsequent calls to [`next`](Self::next) return `None`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the next message.
    ///
    /// Returns `None` once the subscription has been cancelled, and
    /// `Some(Err(_))` exactly once if the underlying connection fails.
    pub async fn next(&mut self) -> Option<StoreResult<Message>> {
        if self.finished {
            return None;
        }

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.finished = true;
                None
            },
            item = self.receiver.recv() => match item {
                Some(Ok(message)) => Some(Ok(message)),
                Some(Err(err)) => {
                    self.finished = true;
                    Some(Err(err))
                },
                None => {
                    self.finished = true;
                    if self.cancel.is_cancelled() {
                        None
                    } else {
                        Some(Err(StoreError::connection("subscription stream closed")))
                    }
                },
            },
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SubscriptionFeed {
    /// Delivers an item to the consumer.
    ///
    /// Returns `false` when the consumer is gone or has cancelled, in which
    /// case the producer should stop.
    pub async fn send(&self, item: StoreResult<Message>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.sender.send(item) => sent.is_ok(),
        }
    }

    /// Resolves when the consumer cancels the subscription.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether the consumer has cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
