pub mod logging;

/// A broker message parsed into a string-keyed JSON mapping.
///
/// Every templated route and every sink route operates on this shape; the
/// raw payload is only used verbatim when a route carries no body template.
pub type MessageData = serde_json::Map<String, serde_json::Value>;

/// Parse a raw broker payload into a [`MessageData`] mapping.
///
/// Fails when the payload is not a JSON object.
pub fn parse_message(payload: &[u8]) -> Result<MessageData, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_object() {
        let data = parse_message(br#"{"id": 7, "name": "alice"}"#).unwrap();
        assert_eq!(data.get("id").unwrap().as_i64(), Some(7));
        assert_eq!(data.get("name").unwrap().as_str(), Some("alice"));
    }

    #[test]
    fn rejects_non_object_payloads() {
        assert!(parse_message(b"not json").is_err());
        assert!(parse_message(b"[1, 2, 3]").is_err());
    }
}
