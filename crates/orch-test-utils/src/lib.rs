//! orch-test-utils: shared test double for integration tests of the
//! orchestrator's message bus. Generalizes the teacher's
//! `rt-test-utils::MockWsClient`/`MockWsServer` pair from a WebSocket peer to
//! a `DEALER`-socket pilot peer, since the orchestrator's "server" side
//! (`RouterGateway`) is the orchestrator's own code under test, not something
//! that needs mocking.

pub mod mock_pilot;

pub use mock_pilot::{MockPilot, MockPilotError};
