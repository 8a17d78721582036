use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a server, mirrored from the hosting application.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Serving traffic.
    #[default]
    Up,
    /// Finishing existing sessions, refusing new ones.
    Draining,
    /// Shut down, or about to be.
    Down,
}

/// Liveness and description record for one node.
///
/// Written only by the node it describes; every other node learns it through
/// the store. Unknown fields in a stored payload are tolerated on decode so
/// that mixed-version fleets can coexist.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Globally unique identifier, stable for the node's lifetime.
    pub id: String,

    /// Role of the server within the framework (e.g. `connector`, `chat`).
    #[serde(rename = "type")]
    pub server_type: String,

    /// Host other nodes connect to.
    pub host: String,

    /// Port other nodes connect to.
    pub port: u16,

    /// Externally advertised host, when it differs from `host`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_host: Option<String>,

    /// Externally advertised port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,

    /// Current lifecycle state.
    #[serde(default)]
    pub state: ServerState,
}

impl TryFrom<Bytes> for ServerRecord {
    type Error = serde_json::Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        serde_json::from_slice(&bytes)
    }
}

impl TryInto<Bytes> for ServerRecord {
    type Error = serde_json::Error;

    fn try_into(self) -> Result<Bytes, Self::Error> {
        let json = serde_json::to_vec(&self)?;
        Ok(Bytes::from(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_tolerates_unknown_fields() {
        let payload = Bytes::from_static(
            br#"{"id":"chat-1","type":"chat","host":"10.0.0.7","port":4050,"state":"draining","pid":1234}"#,
        );

        let record = ServerRecord::try_from(payload).unwrap();

        assert_eq!(record.id, "chat-1");
        assert_eq!(record.state, ServerState::Draining);
        assert_eq!(record.client_host, None);
    }

    #[test]
    fn test_state_defaults_to_up_when_absent() {
        let payload =
            Bytes::from_static(br#"{"id":"gate-1","type":"gate","host":"10.0.0.8","port":3010}"#);

        let record = ServerRecord::try_from(payload).unwrap();

        assert_eq!(record.state, ServerState::Up);
    }
}
