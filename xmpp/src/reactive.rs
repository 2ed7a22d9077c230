// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Minimal fan-out publish/subscribe plumbing.
//!
//! Every stream this crate exposes (pipeline output, session events,
//! handshaker events) is backed by a [`Publisher`]: subscribers get an
//! unbounded channel each, published items are cloned per subscriber, and a
//! dropped [`Subscription`] unsubscribes itself the next time something is
//! published.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Mutex;

use futures::Stream;
use tokio::sync::mpsc;

/// Fan-out sender: every subscriber receives every item published after it
/// subscribed, in publish order.
pub struct Publisher<T: Clone> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Publisher<T> {
    /// Creates a publisher with no subscribers.
    pub fn new() -> Publisher<T> {
        Publisher {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("publisher lock poisoned")
            .push(tx);
        Subscription { rx }
    }

    /// Delivers `item` to all live subscribers, pruning dropped ones.
    pub fn publish(&self, item: T) {
        self.subscribers
            .lock()
            .expect("publisher lock poisoned")
            .retain(|tx| tx.send(item.clone()).is_ok());
    }

    /// Number of live subscriptions, for bookkeeping and tests.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("publisher lock poisoned")
            .len()
    }
}

impl<T: Clone> Default for Publisher<T> {
    fn default() -> Publisher<T> {
        Publisher::new()
    }
}

/// Receiving end of a [`Publisher`]; a `futures` [`Stream`] of items.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Receives the next item, or `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt;

    #[tokio::test]
    async fn delivers_in_order_to_all_subscribers() {
        let publisher = Publisher::new();
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();
        for n in 0..4 {
            publisher.publish(n);
        }
        for n in 0..4 {
            assert_eq!(first.next().await, Some(n));
            assert_eq!(second.next().await, Some(n));
        }
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_items() {
        let publisher = Publisher::new();
        publisher.publish(1u8);
        let mut late = publisher.subscribe();
        publisher.publish(2u8);
        assert_eq!(late.next().await, Some(2));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let publisher = Publisher::new();
        let subscription = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);
        drop(subscription);
        publisher.publish(1u8);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stream_ends_with_the_publisher() {
        let publisher = Publisher::new();
        let mut subscription = publisher.subscribe();
        publisher.publish(1u8);
        drop(publisher);
        assert_eq!(subscription.next().await, Some(1));
        assert_eq!(subscription.next().await, None);
    }
}
