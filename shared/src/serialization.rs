// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use anyhow::Result;

use crate::event::Event;
use crate::state::State;

/// The opaque serializer boundary between the core and the messaging
/// substrate. The core never assumes a format; runtimes pick an
/// implementation and use it for both events and persisted state bytes.
pub trait SerDe {
    fn serialize_event(&self, event: &Event) -> Result<Vec<u8>>;
    fn deserialize_event(&self, raw: &[u8]) -> Result<Event>;

    fn serialize_state(&self, state: &State) -> Result<Vec<u8>>;
    fn deserialize_state(&self, raw: &[u8]) -> Result<State>;
}

/// JSON wire format (the reference format for this runtime).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerde;

impl SerDe for JsonSerde {
    fn serialize_event(&self, event: &Event) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(event)?)
    }

    fn deserialize_event(&self, raw: &[u8]) -> Result<Event> {
        Ok(serde_json::from_slice(raw)?)
    }

    fn serialize_state(&self, state: &State) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(state)?)
    }

    fn deserialize_state(&self, raw: &[u8]) -> Result<State> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::address::FunctionType;
    use crate::event::{EventType, Payload, Request};

    #[test]
    fn state_bytes_round_trip() {
        let serde = JsonSerde;
        let state: State = [
            ("username".to_string(), json!("wouter")),
            ("balance".to_string(), json!(0)),
        ]
        .into_iter()
        .collect();

        let raw = serde.serialize_state(&state).unwrap();
        assert_eq!(serde.deserialize_state(&raw).unwrap(), state);
    }

    #[test]
    fn event_wire_layout() {
        let serde = JsonSerde;
        let mut payload = Payload::new();
        payload.insert("method_name".into(), json!("update_balance"));

        let event = Event::new(
            "abc",
            FunctionType::stateful("User").to_address().with_key("w"),
            EventType::Request(Request::InvokeStateful),
            payload,
        );
        let raw = serde.serialize_event(&event).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();

        assert_eq!(value["event_id"], json!("abc"));
        assert_eq!(value["event_type"], json!("Request.InvokeStateful"));
        assert_eq!(value["fun_address"]["function_type"]["name"], json!("User"));
        assert_eq!(value["fun_address"]["key"], json!("w"));
        assert_eq!(value["payload"]["method_name"], json!("update_balance"));
    }
}
