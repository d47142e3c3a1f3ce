// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The per-key event dispatcher. One operator exists per function type; the
//! messaging substrate shards its events by key and delivers them serially
//! per key. The operator is pure with respect to storage: it receives the
//! current state bytes and returns the bytes to persist, so any keyed state
//! backend can host it.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};

use stateflow_shared::event::{Event, EventType, Payload, Reply, Request};
use stateflow_shared::serialization::SerDe;
use stateflow_shared::{Arguments, FunctionType, State};

use crate::dataflow::{collapse_results, EventFlowGraph};
use crate::error::ExecutionError;
use crate::wrapper::{ClassWrapper, InvocationResult};

pub struct StatefulOperator<W, S> {
    fun_type: FunctionType,
    wrapper: W,
    serializer: S,
}

impl<W, S> StatefulOperator<W, S>
where
    W: ClassWrapper,
    S: SerDe,
{
    pub fn new(fun_type: FunctionType, wrapper: W, serializer: S) -> Self {
        Self {
            fun_type,
            wrapper,
            serializer,
        }
    }

    pub fn fun_type(&self) -> &FunctionType {
        &self.fun_type
    }

    /// First phase of class creation: run the constructor, derive the key,
    /// and re-emit the event, now keyed, carrying the initial state. The
    /// keyed partition commits it in [`handle`] iff the key is unoccupied.
    pub fn handle_create(&self, event: Event) -> Result<Event> {
        let args = payload_args(&event)?;

        match self.wrapper.init_class(&args) {
            InvocationResult::Failed { message } => {
                Ok(event.reply_to(Reply::FailedInvocation, error_payload(&message)))
            }
            InvocationResult::Success {
                updated_state,
                return_results: _,
            } => {
                let state = updated_state
                    .ok_or_else(|| anyhow!("constructor returned no initial state"))?;
                let key = self.wrapper.derive_key(&state)?;
                log::debug!("{}: initialized new instance {}", self.fun_type, key);

                let mut payload = Payload::new();
                payload.insert("init_class_state".into(), serde_json::to_value(&state)?);
                Ok(Event::new(
                    event.event_id.clone(),
                    event.fun_address.with_key(key),
                    EventType::Request(Request::InitClass),
                    payload,
                ))
            }
        }
    }

    /// Dispatches one request event against the state bytes of its key,
    /// returning the reply (or flow continuation) and the bytes to persist.
    /// State is persisted only on success; a failed invocation leaves the
    /// previous bytes untouched.
    pub fn handle(
        &self,
        event: Event,
        state: Option<Vec<u8>>,
    ) -> Result<(Event, Option<Vec<u8>>)> {
        let request = match event.event_type {
            EventType::Request(request) => request,
            EventType::Reply(_) => bail!("operator received a reply event: {}", event.event_type),
        };

        if request == Request::InitClass {
            return self.handle_init_class(event, state);
        }

        let Some(state_bytes) = state else {
            log::debug!("{}: event for unknown key {:?}", self.fun_type, event.fun_address.key);
            return Ok((event.reply_to(Reply::KeyNotFound, Payload::new()), None));
        };

        match request {
            Request::Ping => Ok((
                event.reply_to(Reply::Pong, Payload::new()),
                Some(state_bytes),
            )),
            Request::InvokeStateful => self.handle_invoke_stateful(event, state_bytes),
            Request::GetState => self.handle_get_state(event, state_bytes),
            Request::UpdateState => self.handle_update_state(event, state_bytes),
            Request::FindClass => Ok((
                event.reply_to(Reply::FoundClass, Payload::new()),
                Some(state_bytes),
            )),
            Request::EventFlow => self.handle_event_flow(event, state_bytes),
            Request::InitClass => unreachable!("handled above"),
        }
    }

    fn handle_init_class(
        &self,
        event: Event,
        state: Option<Vec<u8>>,
    ) -> Result<(Event, Option<Vec<u8>>)> {
        if state.is_some() {
            let key = event.fun_address.key.clone().unwrap_or_default();
            let reply = event.reply_to(
                Reply::FailedInvocation,
                error_payload(&format!("{} already exists", key)),
            );
            return Ok((reply, state));
        }

        let init_state = event
            .payload_get("init_class_state")
            .context("InitClass event has not been through handle_create")?;
        let state: State = serde_json::from_value(init_state.clone())?;
        let bytes = self.serializer.serialize_state(&state)?;

        let mut payload = Payload::new();
        payload.insert("key".into(), json!(event.fun_address.key));
        Ok((
            event.reply_to(Reply::SuccessfulCreateClass, payload),
            Some(bytes),
        ))
    }

    fn handle_invoke_stateful(
        &self,
        event: Event,
        state_bytes: Vec<u8>,
    ) -> Result<(Event, Option<Vec<u8>>)> {
        let method = event
            .payload_get("method_name")
            .and_then(Value::as_str)
            .context("InvokeStateful payload has no method_name")?
            .to_string();
        let args = payload_args(&event)?;
        let state = self.serializer.deserialize_state(&state_bytes)?;

        let (result, _instance) = self.wrapper.invoke_return_instance(&method, &state, &args);
        match result {
            InvocationResult::Failed { message } => {
                log::debug!("{}: {} failed: {}", self.fun_type, method, message);
                Ok((
                    event.reply_to(Reply::FailedInvocation, error_payload(&message)),
                    Some(state_bytes),
                ))
            }
            InvocationResult::Success {
                updated_state,
                return_results,
            } => {
                let bytes = match updated_state {
                    Some(updated) => self.serializer.serialize_state(&updated)?,
                    None => state_bytes,
                };
                let mut payload = Payload::new();
                payload.insert(
                    "return_results".into(),
                    collapse_results(&return_results),
                );
                Ok((
                    event.reply_to(Reply::SuccessfulInvocation, payload),
                    Some(bytes),
                ))
            }
        }
    }

    fn handle_get_state(
        &self,
        event: Event,
        state_bytes: Vec<u8>,
    ) -> Result<(Event, Option<Vec<u8>>)> {
        let attribute = event
            .payload_get("attribute")
            .and_then(Value::as_str)
            .context("GetState payload has no attribute")?;
        let state = self.serializer.deserialize_state(&state_bytes)?;

        let mut payload = Payload::new();
        payload.insert(
            "state".into(),
            state.get_attr(attribute).cloned().unwrap_or(Value::Null),
        );
        // Reads pass the original bytes through untouched.
        Ok((
            event.reply_to(Reply::SuccessfulStateRequest, payload),
            Some(state_bytes),
        ))
    }

    fn handle_update_state(
        &self,
        event: Event,
        state_bytes: Vec<u8>,
    ) -> Result<(Event, Option<Vec<u8>>)> {
        let attribute = event
            .payload_get("attribute")
            .and_then(Value::as_str)
            .context("UpdateState payload has no attribute")?
            .to_string();
        let value = event
            .payload_get("attribute_value")
            .cloned()
            .context("UpdateState payload has no attribute_value")?;

        let mut state = self.serializer.deserialize_state(&state_bytes)?;
        state.set_attr(attribute, value);
        let bytes = self.serializer.serialize_state(&state)?;
        Ok((
            event.reply_to(Reply::SuccessfulStateRequest, Payload::new()),
            Some(bytes),
        ))
    }

    /// Advances an in-flight flow: steps nodes while they are addressed to
    /// this partition, then either surfaces the terminal reply or freezes the
    /// graph into an EventFlow event for the next hop.
    fn handle_event_flow(
        &self,
        event: Event,
        state_bytes: Vec<u8>,
    ) -> Result<(Event, Option<Vec<u8>>)> {
        let flow_value = event
            .payload_get("flow")
            .context("EventFlow payload has no flow")?;
        let mut graph = match EventFlowGraph::from_value(flow_value) {
            Ok(graph) => graph,
            Err(e) => return Err(anyhow::Error::new(e)),
        };

        let mut state = self.serializer.deserialize_state(&state_bytes)?;
        let mut instance: Option<W::Instance> = None;

        loop {
            if graph.current_node().is_return() {
                let results = graph
                    .current_node()
                    .output
                    .get("results")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let mut payload = Payload::new();
                payload.insert("return_results".into(), collapse_results(&results));
                let bytes = self.serializer.serialize_state(&state)?;
                return Ok((
                    event.reply_to(Reply::SuccessfulInvocation, payload),
                    Some(bytes),
                ));
            }

            match graph.resolve_current_address() {
                Ok(Some(address)) if !self.is_local(&address, &event) => {
                    // Freeze and forward; the next hop resumes the graph.
                    let bytes = self.serializer.serialize_state(&state)?;
                    let mut payload = Payload::new();
                    payload.insert("flow".into(), graph.to_value());
                    payload.insert("current_flow".into(), json!(graph.current_id()));
                    log::debug!(
                        "{}: flow {} hops to {}",
                        self.fun_type,
                        event.event_id,
                        address
                    );
                    return Ok((event.continue_at(address, payload), Some(bytes)));
                }
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    return Ok((
                        event.reply_to(Reply::FailedInvocation, error_payload(&e.to_string())),
                        Some(state_bytes),
                    ))
                }
                Err(ExecutionError::Fatal(e)) => return Err(e),
                Err(e) => return Err(anyhow::Error::new(e)),
            }

            match graph.step(&self.wrapper, state, instance) {
                Ok((updated_state, updated_instance)) => {
                    state = updated_state;
                    instance = updated_instance;
                }
                Err(e) if e.is_recoverable() => {
                    log::debug!("{}: flow {} failed: {}", self.fun_type, event.event_id, e);
                    return Ok((
                        event.reply_to(Reply::FailedInvocation, error_payload(&e.to_string())),
                        Some(state_bytes),
                    ));
                }
                Err(ExecutionError::Fatal(e)) => return Err(e),
                Err(e) => return Err(anyhow::Error::new(e)),
            }
        }
    }

    fn is_local(&self, address: &stateflow_shared::FunctionAddress, event: &Event) -> bool {
        address.function_type == self.fun_type && address.key == event.fun_address.key
    }
}

fn payload_args(event: &Event) -> Result<Arguments> {
    match event.payload_get("args") {
        Some(value) => Ok(serde_json::from_value(value.clone())?),
        None => Ok(Arguments::empty()),
    }
}

fn error_payload(message: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("error_message".into(), json!(message));
    payload
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use stateflow_shared::serialization::JsonSerde;
    use stateflow_shared::FunctionAddress;

    use super::*;

    /// A tiny hand-written wrapper: a counter keyed by its name.
    struct CounterWrapper;

    struct Counter {
        name: String,
        count: i64,
    }

    impl Counter {
        fn from_state(state: &State) -> Counter {
            Counter {
                name: state
                    .get_attr("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                count: state.get_attr("count").and_then(Value::as_i64).unwrap_or(0),
            }
        }

        fn to_state(&self) -> State {
            [
                ("name".to_string(), json!(self.name)),
                ("count".to_string(), json!(self.count)),
            ]
            .into_iter()
            .collect()
        }
    }

    impl ClassWrapper for CounterWrapper {
        type Instance = Counter;

        fn init_class(&self, args: &Arguments) -> InvocationResult {
            let Some(name) = args.get("name").and_then(Value::as_str) else {
                return InvocationResult::failed("name is required");
            };
            let counter = Counter {
                name: name.to_string(),
                count: 0,
            };
            InvocationResult::success(counter.to_state(), vec![])
        }

        fn derive_key(&self, state: &State) -> anyhow::Result<String> {
            state
                .get_attr("name")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .ok_or_else(|| anyhow!("no name in state"))
        }

        fn invoke_return_instance(
            &self,
            method: &str,
            state: &State,
            args: &Arguments,
        ) -> (InvocationResult, Option<Counter>) {
            let mut counter = Counter::from_state(state);
            let result = self.invoke_with_instance(method, &mut counter, args);
            (result, Some(counter))
        }

        fn invoke_with_instance(
            &self,
            method: &str,
            instance: &mut Counter,
            args: &Arguments,
        ) -> InvocationResult {
            match method {
                "add" => {
                    let Some(x) = args.get("x").and_then(Value::as_i64) else {
                        return InvocationResult::failed("unsupported operand for add");
                    };
                    instance.count += x;
                    InvocationResult::success(instance.to_state(), vec![json!(instance.count)])
                }
                other => InvocationResult::failed(format!("unknown method {}", other)),
            }
        }
    }

    fn operator() -> StatefulOperator<CounterWrapper, JsonSerde> {
        StatefulOperator::new(FunctionType::stateful("Counter"), CounterWrapper, JsonSerde)
    }

    fn init_event() -> Event {
        let mut payload = Payload::new();
        payload.insert("args".into(), json!({"name": "wouter"}));
        Event::new(
            "evt-1",
            FunctionType::stateful("Counter").to_address(),
            EventType::Request(Request::InitClass),
            payload,
        )
    }

    fn invoke_event(key: &str, method: &str, args: Value) -> Event {
        let mut payload = Payload::new();
        payload.insert("method_name".into(), json!(method));
        payload.insert("args".into(), args);
        Event::new(
            "evt-2",
            FunctionAddress::new(FunctionType::stateful("Counter"), key),
            EventType::Request(Request::InvokeStateful),
            payload,
        )
    }

    #[test]
    fn init_class_two_phase() {
        let op = operator();
        let intermediate = op.handle_create(init_event()).unwrap();

        assert_eq!(intermediate.fun_address.key.as_deref(), Some("wouter"));
        assert!(intermediate.payload_get("init_class_state").is_some());

        let (reply, state) = op.handle(intermediate, None).unwrap();
        assert_eq!(
            reply.event_type,
            EventType::Reply(Reply::SuccessfulCreateClass)
        );
        assert_eq!(reply.payload_get("key"), Some(&json!("wouter")));
        assert!(state.is_some());
    }

    #[test]
    fn duplicate_init_fails_and_keeps_state() {
        let op = operator();
        let intermediate = op.handle_create(init_event()).unwrap();
        let existing = b"{\"name\":\"wouter\",\"count\":3}".to_vec();

        let (reply, state) = op.handle(intermediate, Some(existing.clone())).unwrap();
        assert_eq!(reply.event_type, EventType::Reply(Reply::FailedInvocation));
        assert!(reply.payload_get("error_message").is_some());
        assert_eq!(state, Some(existing));
    }

    #[test]
    fn invoke_stateful_success_updates_state() {
        let op = operator();
        let state = JsonSerde
            .serialize_state(&[
                ("name".to_string(), json!("wouter")),
                ("count".to_string(), json!(10)),
            ]
            .into_iter()
            .collect())
            .unwrap();

        let (reply, updated) = op
            .handle(invoke_event("wouter", "add", json!({"x": 5})), Some(state))
            .unwrap();
        assert_eq!(
            reply.event_type,
            EventType::Reply(Reply::SuccessfulInvocation)
        );
        assert_eq!(reply.payload_get("return_results"), Some(&json!(15)));

        let new_state = JsonSerde.deserialize_state(&updated.unwrap()).unwrap();
        assert_eq!(new_state.get_attr("count"), Some(&json!(15)));
    }

    #[test]
    fn invoke_stateful_failure_keeps_bytes_identical() {
        let op = operator();
        let bytes = JsonSerde
            .serialize_state(&[
                ("name".to_string(), json!("wouter")),
                ("count".to_string(), json!(10)),
            ]
            .into_iter()
            .collect())
            .unwrap();

        let (reply, updated) = op
            .handle(
                invoke_event("wouter", "add", json!({"x": "100"})),
                Some(bytes.clone()),
            )
            .unwrap();
        assert_eq!(reply.event_type, EventType::Reply(Reply::FailedInvocation));
        assert_eq!(updated, Some(bytes));
    }

    #[test]
    fn get_state_is_idempotent() {
        let op = operator();
        let bytes = JsonSerde
            .serialize_state(&[
                ("name".to_string(), json!("wouter")),
                ("count".to_string(), json!(11)),
            ]
            .into_iter()
            .collect())
            .unwrap();

        let mut payload = Payload::new();
        payload.insert("attribute".into(), json!("count"));
        let event = Event::new(
            "evt-3",
            FunctionAddress::new(FunctionType::stateful("Counter"), "wouter"),
            EventType::Request(Request::GetState),
            payload,
        );

        let (first_reply, first_bytes) = op.handle(event.clone(), Some(bytes.clone())).unwrap();
        let (second_reply, second_bytes) =
            op.handle(event, first_bytes.clone()).unwrap();

        assert_eq!(
            first_reply.event_type,
            EventType::Reply(Reply::SuccessfulStateRequest)
        );
        assert_eq!(first_reply.payload_get("state"), Some(&json!(11)));
        assert_eq!(first_reply.payload, second_reply.payload);
        assert_eq!(first_bytes, Some(bytes.clone()));
        assert_eq!(second_bytes, Some(bytes));
    }

    #[test]
    fn update_state_writes_attribute() {
        let op = operator();
        let bytes = JsonSerde
            .serialize_state(&[
                ("name".to_string(), json!("wouter")),
                ("count".to_string(), json!(11)),
            ]
            .into_iter()
            .collect())
            .unwrap();

        let mut payload = Payload::new();
        payload.insert("attribute".into(), json!("count"));
        payload.insert("attribute_value".into(), json!(8));
        let event = Event::new(
            "evt-4",
            FunctionAddress::new(FunctionType::stateful("Counter"), "wouter"),
            EventType::Request(Request::UpdateState),
            payload,
        );

        let (reply, updated) = op.handle(event, Some(bytes)).unwrap();
        assert_eq!(
            reply.event_type,
            EventType::Reply(Reply::SuccessfulStateRequest)
        );
        assert!(reply.payload.is_empty());
        let state = JsonSerde.deserialize_state(&updated.unwrap()).unwrap();
        assert_eq!(state.get_attr("count"), Some(&json!(8)));
    }

    #[test]
    fn unknown_key_replies_key_not_found() {
        let op = operator();
        let (reply, state) = op
            .handle(invoke_event("wouter", "add", json!({"x": 1})), None)
            .unwrap();
        assert_eq!(reply.event_type, EventType::Reply(Reply::KeyNotFound));
        assert!(state.is_none());
    }

    #[test]
    fn ping_pong() {
        let op = operator();
        let event = Event::new(
            "evt-5",
            FunctionAddress::new(FunctionType::stateful("Counter"), "wouter"),
            EventType::Request(Request::Ping),
            Payload::new(),
        );
        let (reply, _) = op.handle(event, Some(b"{}".to_vec())).unwrap();
        assert_eq!(reply.event_type, EventType::Reply(Reply::Pong));
    }
}
