/// Classification of a key-change notification message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyEventKind {
    /// Key created or overwritten: a node joined or updated its record.
    Set,

    /// Key explicitly removed: a node left gracefully.
    Del,

    /// TTL lapsed: a node is presumed crashed.
    Expired,

    /// TTL refreshed only; carries no membership change.
    Expire,

    /// Anything else; logged and ignored.
    Other(String),
}

impl KeyEventKind {
    /// Classifies a raw notification message.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        match message {
            "set" => Self::Set,
            "del" => Self::Del,
            "expired" => Self::Expired,
            "expire" => Self::Expire,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Extracts the server id from a keyspace channel name by stripping
/// everything up to and including the `__:<prefix>` header.
pub(crate) fn server_id_from_channel<'a>(channel: &'a str, prefix: &str) -> Option<&'a str> {
    let header = format!("__:{prefix}");
    channel
        .find(&header)
        .map(|pos| &channel[pos + header.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_messages() {
        assert_eq!(KeyEventKind::classify("set"), KeyEventKind::Set);
        assert_eq!(KeyEventKind::classify("del"), KeyEventKind::Del);
        assert_eq!(KeyEventKind::classify("expired"), KeyEventKind::Expired);
        assert_eq!(KeyEventKind::classify("expire"), KeyEventKind::Expire);
        assert_eq!(
            KeyEventKind::classify("rename_from"),
            KeyEventKind::Other("rename_from".to_string())
        );
    }

    #[test]
    fn test_server_id_from_channel() {
        let channel = "__keyspace@0__:fleet_monitor:area-3";

        assert_eq!(
            server_id_from_channel(channel, "fleet_monitor:"),
            Some("area-3")
        );
    }

    #[test]
    fn test_server_id_from_foreign_channel() {
        let channel = "__keyspace@0__:fleet_servers";

        assert_eq!(server_id_from_channel(channel, "fleet_monitor:"), None);
    }
}
