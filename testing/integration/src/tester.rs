// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::collections::{HashMap, VecDeque};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};

use stateflow::dataflow::{EventFlowGraph, InternalClassRef};
use stateflow::wrapper::ClassWrapper;
use stateflow::{Dataflow, StatefulOperator};
use stateflow_shared::event::{fresh_event_id, Event, EventType, Payload, Reply, Request};
use stateflow_shared::serialization::{JsonSerde, SerDe};
use stateflow_shared::{Arguments, FunctionAddress, FunctionType, State};
use stateflow_store::{MemoryStateStore, StateStore};

/// Object-safe view of a stateful operator, so one router can host operators
/// over different wrapper types.
pub trait OperatorHandle {
    fn fun_type(&self) -> &FunctionType;
    fn handle_create(&self, event: Event) -> Result<Event>;
    fn handle(&self, event: Event, state: Option<Vec<u8>>) -> Result<(Event, Option<Vec<u8>>)>;
}

impl<W, S> OperatorHandle for StatefulOperator<W, S>
where
    W: ClassWrapper,
    S: SerDe,
{
    fn fun_type(&self) -> &FunctionType {
        StatefulOperator::fun_type(self)
    }

    fn handle_create(&self, event: Event) -> Result<Event> {
        StatefulOperator::handle_create(self, event)
    }

    fn handle(&self, event: Event, state: Option<Vec<u8>>) -> Result<(Event, Option<Vec<u8>>)> {
        StatefulOperator::handle(self, event, state)
    }
}

/// An in-memory messaging substrate double: routes request events to the
/// operator owning `(function_type, key)`, persists returned state in a
/// per-type store, and parks replies by event id. Every event crosses the
/// JSON wire format on its way through the queue.
pub struct Tester {
    dataflow: Dataflow,
    operators: HashMap<String, Box<dyn OperatorHandle>>,
    stores: HashMap<String, MemoryStateStore>,
    queue: VecDeque<Vec<u8>>,
    replies: HashMap<String, Event>,
    serializer: JsonSerde,
}

impl Tester {
    pub fn new(dataflow: Dataflow) -> Self {
        Self {
            dataflow,
            operators: HashMap::new(),
            stores: HashMap::new(),
            queue: VecDeque::new(),
            replies: HashMap::new(),
            serializer: JsonSerde,
        }
    }

    pub fn dataflow(&self) -> &Dataflow {
        &self.dataflow
    }

    pub fn register(&mut self, operator: impl OperatorHandle + 'static) {
        let scope = operator.fun_type().full_name();
        self.stores.insert(scope.clone(), MemoryStateStore::new());
        self.operators.insert(scope, Box::new(operator));
    }

    /// Enqueues an event and returns its id for reply matching.
    pub fn send(&mut self, event: Event) -> Result<String> {
        let id = event.event_id.clone();
        self.queue
            .push_back(self.serializer.serialize_event(&event)?);
        Ok(id)
    }

    /// Drains the queue, dispatching events until nothing is in flight.
    pub fn run(&mut self) -> Result<()> {
        while let Some(raw) = self.queue.pop_front() {
            let event = self.serializer.deserialize_event(&raw)?;
            if let EventType::Reply(_) = event.event_type {
                self.replies.insert(event.event_id.clone(), event);
                continue;
            }
            let produced = self.dispatch(event)?;
            self.queue
                .push_back(self.serializer.serialize_event(&produced)?);
        }
        Ok(())
    }

    fn dispatch(&mut self, event: Event) -> Result<Event> {
        let scope = event.fun_address.function_type.full_name();
        log::trace!("dispatching {} to {}", event.event_type, event.fun_address);
        let operator = self
            .operators
            .get(&scope)
            .with_context(|| format!("no operator registered for {}", scope))?;

        // Unkeyed creation first derives its key.
        if event.event_type == EventType::Request(Request::InitClass)
            && event.fun_address.key.is_none()
        {
            return operator.handle_create(event);
        }

        let key = event
            .fun_address
            .key
            .clone()
            .ok_or_else(|| anyhow!("request event without a key: {}", event.event_type))?;
        let store = self
            .stores
            .get(&scope)
            .expect("store registered alongside operator");
        let state = store.get(&key)?;

        let (produced, updated) = operator.handle(event, state)?;
        if let Some(bytes) = updated {
            store.put(&key, &bytes)?;
        }
        Ok(produced)
    }

    pub fn reply(&self, event_id: &str) -> Option<&Event> {
        self.replies.get(event_id)
    }

    fn expect_reply(&self, event_id: &str) -> Result<Event> {
        self.reply(event_id)
            .cloned()
            .with_context(|| format!("no reply for event {}", event_id))
    }

    pub fn state_of(&self, class: &str, key: &str) -> Result<Option<State>> {
        let scope = FunctionType::stateful(class).full_name();
        let store = self
            .stores
            .get(&scope)
            .with_context(|| format!("no store for {}", scope))?;
        match store.get(key)? {
            Some(bytes) => Ok(Some(self.serializer.deserialize_state(&bytes)?)),
            None => Ok(None),
        }
    }

    fn class_type(&self, class: &str) -> Result<FunctionType> {
        self.dataflow
            .get(class)
            .map(|c| c.fun_type.clone())
            .with_context(|| format!("unknown class {}", class))
    }

    /// A reference argument value for flow invocations.
    pub fn class_ref(&self, class: &str, key: &str) -> Result<Value> {
        Ok(InternalClassRef::new(key, self.class_type(class)?).to_value())
    }

    // Client-style entry points. Each sends one request, drains the queue,
    // and returns the reply.

    pub fn init_class(&mut self, class: &str, args: Value) -> Result<Event> {
        let mut payload = Payload::new();
        payload.insert("args".into(), args);
        let event = Event::new(
            fresh_event_id(),
            self.class_type(class)?.to_address(),
            EventType::Request(Request::InitClass),
            payload,
        );
        let id = self.send(event)?;
        self.run()?;
        self.expect_reply(&id)
    }

    pub fn invoke(&mut self, class: &str, key: &str, method: &str, args: Value) -> Result<Event> {
        let mut payload = Payload::new();
        payload.insert("method_name".into(), json!(method));
        payload.insert("args".into(), args);
        let event = Event::new(
            fresh_event_id(),
            FunctionAddress::new(self.class_type(class)?, key),
            EventType::Request(Request::InvokeStateful),
            payload,
        );
        let id = self.send(event)?;
        self.run()?;
        self.expect_reply(&id)
    }

    pub fn get_attribute(&mut self, class: &str, key: &str, attribute: &str) -> Result<Event> {
        let mut payload = Payload::new();
        payload.insert("attribute".into(), json!(attribute));
        let event = Event::new(
            fresh_event_id(),
            FunctionAddress::new(self.class_type(class)?, key),
            EventType::Request(Request::GetState),
            payload,
        );
        let id = self.send(event)?;
        self.run()?;
        self.expect_reply(&id)
    }

    pub fn set_attribute(
        &mut self,
        class: &str,
        key: &str,
        attribute: &str,
        value: Value,
    ) -> Result<Event> {
        let mut payload = Payload::new();
        payload.insert("attribute".into(), json!(attribute));
        payload.insert("attribute_value".into(), value);
        let event = Event::new(
            fresh_event_id(),
            FunctionAddress::new(self.class_type(class)?, key),
            EventType::Request(Request::UpdateState),
            payload,
        );
        let id = self.send(event)?;
        self.run()?;
        self.expect_reply(&id)
    }

    pub fn find_class(&mut self, class: &str, key: &str) -> Result<Event> {
        let event = Event::new(
            fresh_event_id(),
            FunctionAddress::new(self.class_type(class)?, key),
            EventType::Request(Request::FindClass),
            Payload::new(),
        );
        let id = self.send(event)?;
        self.run()?;
        self.expect_reply(&id)
    }

    pub fn ping(&mut self, class: &str, key: &str) -> Result<Event> {
        let event = Event::new(
            fresh_event_id(),
            FunctionAddress::new(self.class_type(class)?, key),
            EventType::Request(Request::Ping),
            Payload::new(),
        );
        let id = self.send(event)?;
        self.run()?;
        self.expect_reply(&id)
    }

    /// Instantiates a split method's flow with the given arguments and runs
    /// it to completion across however many hops it takes.
    pub fn invoke_flow(
        &mut self,
        class: &str,
        key: &str,
        method: &str,
        args: Vec<(&str, Value)>,
    ) -> Result<Event> {
        let descriptor = self
            .dataflow
            .get(class)
            .with_context(|| format!("unknown class {}", class))?;
        let method_desc = descriptor
            .get_method_by_name(method)
            .with_context(|| format!("unknown method {}.{}", class, method))?;
        if !method_desc.is_split() {
            bail!("{}.{} is not a split method", class, method);
        }

        let arguments = Arguments::new(
            args.into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        );
        let (graph, first_hop) =
            EventFlowGraph::instantiate(&method_desc.flow, &arguments, key)
                .map_err(anyhow::Error::new)?;

        let mut payload = Payload::new();
        payload.insert("flow".into(), graph.to_value());
        payload.insert("current_flow".into(), json!(graph.current_id()));

        let event = Event::new(
            fresh_event_id(),
            first_hop,
            EventType::Request(Request::EventFlow),
            payload,
        );
        let id = self.send(event)?;
        self.run()?;
        self.expect_reply(&id)
    }
}

/// Convenience assertions over replies.
pub fn expect_kind(event: &Event, reply: Reply) {
    assert_eq!(
        event.event_type,
        EventType::Reply(reply),
        "unexpected reply: {:?}",
        event
    );
}

pub fn return_results(event: &Event) -> Value {
    event
        .payload_get("return_results")
        .cloned()
        .unwrap_or(Value::Null)
}
