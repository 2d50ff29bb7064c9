//! termgate-test-utils: test infrastructure for termgate.
//!
//! Provides:
//! - MockClient: scripted in-memory client connection that records
//!   everything the gateway sends back
//! - FakeBackend: session backend driven from the test, recording input,
//!   resizes and close calls

mod fake_backend;
mod mock_client;

pub use fake_backend::{BackendRecord, FakeBackend, FakeBackendHandle};
pub use mock_client::{MockClient, binary_payload, mock_client, stderr_text};
