// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Map;

use crate::address::FunctionAddress;
use crate::Value;

/// Request events sent by clients or produced as flow continuations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    Ping,
    InitClass,
    InvokeStateful,
    GetState,
    UpdateState,
    FindClass,
    EventFlow,
}

/// Reply events routed back to the originating client by event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reply {
    Pong,
    SuccessfulCreateClass,
    SuccessfulInvocation,
    FailedInvocation,
    SuccessfulStateRequest,
    FoundClass,
    KeyNotFound,
}

/// The event taxonomy. On the wire an event type is its dotted name, e.g.
/// `"Request.InvokeStateful"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Request(Request),
    Reply(Reply),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(String);

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Request(r) => match r {
                Request::Ping => "Request.Ping",
                Request::InitClass => "Request.InitClass",
                Request::InvokeStateful => "Request.InvokeStateful",
                Request::GetState => "Request.GetState",
                Request::UpdateState => "Request.UpdateState",
                Request::FindClass => "Request.FindClass",
                Request::EventFlow => "Request.EventFlow",
            },
            EventType::Reply(r) => match r {
                Reply::Pong => "Reply.Pong",
                Reply::SuccessfulCreateClass => "Reply.SuccessfulCreateClass",
                Reply::SuccessfulInvocation => "Reply.SuccessfulInvocation",
                Reply::FailedInvocation => "Reply.FailedInvocation",
                Reply::SuccessfulStateRequest => "Reply.SuccessfulStateRequest",
                Reply::FoundClass => "Reply.FoundClass",
                Reply::KeyNotFound => "Reply.KeyNotFound",
            },
        };
        f.write_str(name)
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event_type = match s {
            "Request.Ping" => EventType::Request(Request::Ping),
            "Request.InitClass" => EventType::Request(Request::InitClass),
            "Request.InvokeStateful" => EventType::Request(Request::InvokeStateful),
            "Request.GetState" => EventType::Request(Request::GetState),
            "Request.UpdateState" => EventType::Request(Request::UpdateState),
            "Request.FindClass" => EventType::Request(Request::FindClass),
            "Request.EventFlow" => EventType::Request(Request::EventFlow),
            "Reply.Pong" => EventType::Reply(Reply::Pong),
            "Reply.SuccessfulCreateClass" => EventType::Reply(Reply::SuccessfulCreateClass),
            "Reply.SuccessfulInvocation" => EventType::Reply(Reply::SuccessfulInvocation),
            "Reply.FailedInvocation" => EventType::Reply(Reply::FailedInvocation),
            "Reply.SuccessfulStateRequest" => EventType::Reply(Reply::SuccessfulStateRequest),
            "Reply.FoundClass" => EventType::Reply(Reply::FoundClass),
            "Reply.KeyNotFound" => EventType::Reply(Reply::KeyNotFound),
            other => return Err(UnknownEventType(other.to_string())),
        };
        Ok(event_type)
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl EventType {
    pub fn is_request(&self) -> bool {
        matches!(self, EventType::Request(_))
    }
}

/// Free-form event payload; the keys are fixed per event type (see the wire
/// format description in the crate-level docs).
pub type Payload = Map<String, Value>;

/// A routed message: one request/reply pair shares an `event_id`, which also
/// identifies a single event-flow execution across hops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: EventType,
    pub fun_address: FunctionAddress,
    pub payload: Payload,
}

impl Event {
    pub fn new(
        event_id: impl Into<String>,
        fun_address: FunctionAddress,
        event_type: EventType,
        payload: Payload,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type,
            fun_address,
            payload,
        }
    }

    /// Builds the reply to this event: same id, same address, new kind.
    pub fn reply_to(&self, reply: Reply, payload: Payload) -> Event {
        Event {
            event_id: self.event_id.clone(),
            event_type: EventType::Reply(reply),
            fun_address: self.fun_address.clone(),
            payload,
        }
    }

    /// This event re-addressed to the next hop, with a fresh payload.
    pub fn continue_at(&self, fun_address: FunctionAddress, payload: Payload) -> Event {
        Event {
            event_id: self.event_id.clone(),
            event_type: EventType::Request(Request::EventFlow),
            fun_address,
            payload,
        }
    }

    pub fn payload_get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Fresh opaque event-id token. Ids are generated client-side; the runtime
/// only ever compares them.
pub fn fresh_event_id() -> String {
    let token: u128 = rand::random();
    format!("{:032x}", token)
}
