// SPDX-License-Identifier: MIT OR Apache-2.0
//! The agent capability seam.
//!
//! Agent variants are data — a name plus a constructor stored in the
//! registry — not a class hierarchy. Everything an implementation can do is
//! covered by [`Agent`]: a periodic cycle, an envelope handler, and a
//! close hook.

use afc_core::Envelope;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A unit of autonomous behaviour driven by a runner.
#[async_trait]
pub trait Agent: Send {
    /// Unique agent name.
    fn name(&self) -> &str;

    /// How often the runner drives [`run_cycle`](Self::run_cycle).
    fn cycle_period(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// One unit of periodic work.
    ///
    /// # Errors
    ///
    /// Any error counts against the agent and, repeated, leads to restart
    /// and quarantine.
    async fn run_cycle(&mut self) -> anyhow::Result<()>;

    /// React to an envelope routed to this agent.
    ///
    /// # Errors
    ///
    /// Handler failures are caught, logged, and counted; they never
    /// propagate to the publisher.
    async fn handle(&mut self, env: Envelope) -> anyhow::Result<()> {
        let _ = env;
        Ok(())
    }

    /// Release resources before the incarnation is dropped.
    async fn close(&mut self) {}
}

/// Constructor producing a fresh incarnation of an agent.
pub type AgentFactory = Arc<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

/// Neutral replacement installed by quarantine.
///
/// Cycles and envelope handling are no-ops until operator intervention
/// restores a real implementation.
#[derive(Debug, Clone)]
pub struct StubAgent {
    name: String,
}

impl StubAgent {
    /// Create a stub carrying the quarantined agent's name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Factory producing stubs for `name`.
    #[must_use]
    pub fn factory(name: impl Into<String>) -> AgentFactory {
        let name = name.into();
        Arc::new(move || Box::new(Self::new(name.clone())) as Box<dyn Agent>)
    }
}

#[async_trait]
impl Agent for StubAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_cycle(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_cycles_are_noops() {
        let mut stub = StubAgent::new("quarantined");
        assert_eq!(stub.name(), "quarantined");
        stub.run_cycle().await.unwrap();
        stub.handle(Envelope::new("a", "b")).await.unwrap();
        stub.close().await;
    }

    #[tokio::test]
    async fn factory_produces_fresh_incarnations() {
        let factory = StubAgent::factory("x");
        let a = factory();
        let b = factory();
        assert_eq!(a.name(), "x");
        assert_eq!(b.name(), "x");
    }
}
