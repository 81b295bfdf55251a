//! Port-forward assignment response
//!
//! The remote service answers a form POST with `{"port": <integer>}` on
//! success, or `{"error": "<message>"}` when it refuses the request.

use serde::Deserialize;

use crate::error::ProtocolError;

/// Successful assignment returned by the port-forwarding service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortAssignment {
    /// Externally reachable port mapped through the tunnel
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct RawAssignment {
    port: Option<serde_json::Value>,
    error: Option<String>,
}

/// Decode the service body into the forwarded port
pub fn decode_port_assignment(body: &[u8]) -> Result<PortAssignment, ProtocolError> {
    let raw: RawAssignment = serde_json::from_slice(body)
        .map_err(|e| ProtocolError::Malformed(format!("not a port assignment: {}", e)))?;

    if let Some(error) = raw.error {
        return Err(ProtocolError::Rejected(error));
    }

    let value = raw
        .port
        .ok_or_else(|| ProtocolError::Malformed("missing \"port\" field".to_string()))?;

    let port = value
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)
        .ok_or_else(|| ProtocolError::Malformed(format!("invalid port value {}", value)))?;

    Ok(PortAssignment { port })
}
