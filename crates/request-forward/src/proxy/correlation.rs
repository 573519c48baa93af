//! Correlation IDs tying an inbound request to the forward it triggered.

use uuid::Uuid;

/// Sent upstream with every forward and echoed on the relayed response.
pub const CORRELATION_HEADER: &str = "x-forward-request-id";

/// Generate a new correlation ID (UUID v4).
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
