//! Fault injection and logging helpers for exercising a running cluster on one machine.

mod failure_config;
mod logging;
mod tunnel;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  logging::init_logging,
  tunnel::FrameMatch,
  tunnel::Tunnel,
  tunnel::TunnelAction,
  tunnel::TunnelRule,
};
