//! Text message processor.
//!
//! The application payload is a JSON object with exactly one key; the key
//! names the message type and its value is the message body:
//!
//! ```text
//! {"Login": {"name": "kos", "token": "..."}}
//! ```
//!
//! Types are keyed by their declared name (the last path segment of the
//! Rust type name), the analogue of the binary processor's numeric ids.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use tracing::warn;

use crate::chanrpc::ServerHandle;
use crate::error::{Error, Result};

use super::{
    Message, MessageId, MsgHandler, Processor, RawHandler, RawMessage, UserData, Value,
};

/// Declared name of a type: the last `::`-separated segment.
fn short_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

struct MsgInfo {
    name: &'static str,
    decode: Box<dyn Fn(&str) -> Result<Value> + Send + Sync>,
    encode: Box<dyn Fn(&dyn Any) -> Result<serde_json::Value> + Send + Sync>,
    handler: Option<MsgHandler>,
    router: Option<ServerHandle>,
    raw_handler: Option<RawHandler>,
}

/// Registry and codec for JSON messages.
#[derive(Default)]
pub struct JsonProcessor {
    msg_info: HashMap<&'static str, MsgInfo>,
    msg_name: HashMap<TypeId, &'static str>,
}

impl JsonProcessor {
    /// Create an empty processor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type under its declared name and return that
    /// name. Panics on a duplicate registration.
    pub fn register<T>(&mut self) -> &'static str
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let name = short_name::<T>();
        if self.msg_info.contains_key(name) {
            panic!("message {name} already registered");
        }

        self.msg_info.insert(
            name,
            MsgInfo {
                name,
                decode: Box::new(|raw| Ok(Box::new(serde_json::from_str::<T>(raw)?) as Value)),
                encode: Box::new(move |m| {
                    let m = m.downcast_ref::<T>().ok_or(Error::UnregisteredType(name))?;
                    Ok(serde_json::to_value(m)?)
                }),
                handler: None,
                router: None,
                raw_handler: None,
            },
        );
        self.msg_name.insert(TypeId::of::<T>(), name);
        name
    }

    fn info_mut<T: 'static>(&mut self) -> &mut MsgInfo {
        let name = self
            .msg_name
            .get(&TypeId::of::<T>())
            .unwrap_or_else(|| panic!("message type {} is not registered", std::any::type_name::<T>()));
        self.msg_info.get_mut(name).unwrap()
    }

    /// Install a synchronous handler for `T`, invoked with
    /// `(msg, user_data)` on the reader task of the producing connection.
    pub fn set_handler<T, F>(&mut self, f: F)
    where
        T: 'static,
        F: Fn(&T, &UserData) + Send + Sync + 'static,
    {
        self.info_mut::<T>().handler = Some(Box::new(move |m, user| {
            if let Some(m) = m.downcast_ref::<T>() {
                f(m, user);
            }
        }));
    }

    /// Route `T` to a chanrpc server. The call id is the declared name;
    /// args are `[msg, user_data]`.
    pub fn set_router<T: 'static>(&mut self, router: ServerHandle) {
        self.info_mut::<T>().router = Some(router);
    }

    /// Install a raw passthrough handler for a message name. Overwrites
    /// decoding for that name: the envelope value is delivered untouched.
    pub fn set_raw_handler<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&RawMessage, &UserData) + Send + Sync + 'static,
    {
        let info = self
            .msg_info
            .get_mut(name)
            .unwrap_or_else(|| panic!("message {name} is not registered"));
        info.raw_handler = Some(Box::new(f));
    }

    /// The chanrpc call id used when routing `T`.
    pub fn route_id<T: 'static>(&self) -> Option<&'static str> {
        self.msg_name.get(&TypeId::of::<T>()).copied()
    }
}

impl Processor for JsonProcessor {
    fn unmarshal(&self, data: &[u8]) -> Result<Message> {
        let envelope: HashMap<String, Box<RawValue>> = serde_json::from_slice(data)?;
        if envelope.len() != 1 {
            return Err(Error::Json(serde::de::Error::custom(
                "envelope must have exactly one key",
            )));
        }

        let (name, raw) = envelope
            .into_iter()
            .next()
            .expect("envelope has exactly one key");
        let info = self
            .msg_info
            .get(name.as_str())
            .ok_or_else(|| Error::UnknownMessageId(name.clone()))?;

        if info.raw_handler.is_some() {
            return Ok(Message::Raw(RawMessage {
                id: MessageId::Name(name),
                data: Bytes::copy_from_slice(raw.get().as_bytes()),
            }));
        }

        Ok(Message::Typed((info.decode)(raw.get())?))
    }

    fn route(&self, msg: Message, user_data: UserData) -> Result<()> {
        match msg {
            Message::Raw(raw) => {
                let MessageId::Name(ref name) = raw.id else {
                    return Err(Error::UnknownMessageId(raw.id.to_string()));
                };
                let info = self
                    .msg_info
                    .get(name.as_str())
                    .ok_or_else(|| Error::UnknownMessageId(name.clone()))?;
                if let Some(h) = &info.raw_handler {
                    h(&raw, &user_data);
                }
                Ok(())
            }
            Message::Typed(value) => {
                let type_id = (*value).type_id();
                let name = *self
                    .msg_name
                    .get(&type_id)
                    .ok_or(Error::UnregisteredType("<unknown>"))?;
                let info = &self.msg_info[name];

                if let Some(h) = &info.handler {
                    h(value.as_ref(), &user_data);
                }
                if let Some(router) = &info.router {
                    if let Err(e) = router.go(info.name, vec![value, user_data]) {
                        warn!("route {}: {e}", info.name);
                    }
                }
                Ok(())
            }
        }
    }

    fn marshal(&self, msg: &dyn Any) -> Result<Vec<Bytes>> {
        let name = *self
            .msg_name
            .get(&msg.type_id())
            .ok_or(Error::UnregisteredType("<unknown>"))?;
        let info = &self.msg_info[name];

        let body = (info.encode)(msg)?;
        let mut envelope = serde_json::Map::with_capacity(1);
        envelope.insert(name.to_string(), body);
        let data = serde_json::to_vec(&serde_json::Value::Object(envelope))?;
        Ok(vec![Bytes::from(data)])
    }
}
