//! Notification fan-out.
//!
//! The membership task publishes every transition to a [`Notifier`], which pushes it onto one
//! bounded queue per [`Subscription`]. Publishing never blocks: a subscriber whose queue is full
//! is dropped. [`server`] exposes the same stream over TCP, as frames.

mod notifier;
pub mod server;

#[rustfmt::skip]
pub use {
  notifier::Notification,
  notifier::Notifier,
  notifier::Subscription,
};
