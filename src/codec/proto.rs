//! Binary message processor.
//!
//! Application payloads are `[id:u16][protobuf bytes]`, id in the
//! configured byte order (big-endian by default). Ids are dense, assigned
//! in registration order; id 0 is the first registration. Unknown ids on
//! the wire cause the connection to be closed by the reader loop.
//!
//! An id with a raw handler installed short-circuits decoding: the payload
//! is delivered as a [`RawMessage`] untouched.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use bytes::Bytes;
use prost::Message as ProstMessage;
use tracing::warn;

use crate::chanrpc::ServerHandle;
use crate::error::{Error, Result};

use super::{
    ByteOrder, Message, MessageId, MsgHandler, Processor, RawHandler, RawMessage, UserData, Value,
};

struct MsgInfo {
    type_name: &'static str,
    decode: Box<dyn Fn(&[u8]) -> Result<Value> + Send + Sync>,
    encode: Box<dyn Fn(&dyn Any) -> Result<Vec<u8>> + Send + Sync>,
    handler: Option<MsgHandler>,
    router: Option<ServerHandle>,
    raw_handler: Option<RawHandler>,
}

/// Registry and codec for protobuf messages.
///
/// Registration happens during startup; once messages flow the processor is
/// shared read-only (`Arc<dyn Processor>`).
pub struct ProtoProcessor {
    order: ByteOrder,
    msg_info: Vec<MsgInfo>,
    msg_id: HashMap<TypeId, u16>,
}

impl Default for ProtoProcessor {
    fn default() -> Self {
        Self::new(ByteOrder::Big)
    }
}

impl ProtoProcessor {
    /// Create a processor with the given id byte order.
    pub fn new(order: ByteOrder) -> Self {
        Self {
            order,
            msg_info: Vec::new(),
            msg_id: HashMap::new(),
        }
    }

    /// Register a message type and return its assigned id.
    ///
    /// Ids are dense and assigned in registration order. Panics on a
    /// duplicate registration or past `u16::MAX` entries; both are startup
    /// programming errors.
    pub fn register<M>(&mut self) -> u16
    where
        M: ProstMessage + Default + 'static,
    {
        let type_id = TypeId::of::<M>();
        let type_name = std::any::type_name::<M>();
        if self.msg_id.contains_key(&type_id) {
            panic!("message type {type_name} already registered");
        }
        if self.msg_info.len() >= u16::MAX as usize {
            panic!("too many protobuf message types (max {})", u16::MAX);
        }

        let id = self.msg_info.len() as u16;
        self.msg_info.push(MsgInfo {
            type_name,
            decode: Box::new(|b| Ok(Box::new(M::decode(b)?) as Value)),
            encode: Box::new(move |m| {
                let m = m
                    .downcast_ref::<M>()
                    .ok_or(Error::UnregisteredType(type_name))?;
                Ok(m.encode_to_vec())
            }),
            handler: None,
            router: None,
            raw_handler: None,
        });
        self.msg_id.insert(type_id, id);
        id
    }

    fn info_mut<M: 'static>(&mut self) -> &mut MsgInfo {
        let id = *self
            .msg_id
            .get(&TypeId::of::<M>())
            .unwrap_or_else(|| panic!("message type {} is not registered", std::any::type_name::<M>()));
        &mut self.msg_info[id as usize]
    }

    /// Install a synchronous handler for `M`, invoked with
    /// `(msg, user_data)` on the reader task of the producing connection.
    pub fn set_handler<M, F>(&mut self, f: F)
    where
        M: 'static,
        F: Fn(&M, &UserData) + Send + Sync + 'static,
    {
        self.info_mut::<M>().handler = Some(Box::new(move |m, user| {
            if let Some(m) = m.downcast_ref::<M>() {
                f(m, user);
            }
        }));
    }

    /// Route `M` to a chanrpc server. The call id is the type's
    /// registration key; args are `[msg, user_data]`.
    pub fn set_router<M: 'static>(&mut self, router: ServerHandle) {
        self.info_mut::<M>().router = Some(router);
    }

    /// Install a raw passthrough handler for a wire id. Overwrites decoding
    /// for that id: the payload is delivered without being touched.
    pub fn set_raw_handler<F>(&mut self, id: u16, f: F)
    where
        F: Fn(&RawMessage, &UserData) + Send + Sync + 'static,
    {
        let info = self
            .msg_info
            .get_mut(id as usize)
            .unwrap_or_else(|| panic!("message id {id} is not registered"));
        info.raw_handler = Some(Box::new(f));
    }

    /// The chanrpc call id used when routing `M` (also usable for
    /// registering the receiving function).
    pub fn route_id<M: 'static>(&self) -> Option<&'static str> {
        self.msg_id
            .get(&TypeId::of::<M>())
            .map(|id| self.msg_info[*id as usize].type_name)
    }

    fn decode_id(&self, data: &[u8]) -> u16 {
        match self.order {
            ByteOrder::Big => u16::from_be_bytes([data[0], data[1]]),
            ByteOrder::Little => u16::from_le_bytes([data[0], data[1]]),
        }
    }
}

impl Processor for ProtoProcessor {
    fn unmarshal(&self, data: &[u8]) -> Result<Message> {
        if data.len() < 2 {
            return Err(Error::MessageTooShort {
                len: data.len() as u32,
                min: 2,
            });
        }

        let id = self.decode_id(data);
        let info = self
            .msg_info
            .get(id as usize)
            .ok_or_else(|| Error::UnknownMessageId(id.to_string()))?;

        if info.raw_handler.is_some() {
            return Ok(Message::Raw(RawMessage {
                id: MessageId::Id(id),
                data: Bytes::copy_from_slice(&data[2..]),
            }));
        }

        Ok(Message::Typed((info.decode)(&data[2..])?))
    }

    fn route(&self, msg: Message, user_data: UserData) -> Result<()> {
        match msg {
            Message::Raw(raw) => {
                let MessageId::Id(id) = raw.id else {
                    return Err(Error::UnknownMessageId(raw.id.to_string()));
                };
                let info = self
                    .msg_info
                    .get(id as usize)
                    .ok_or_else(|| Error::UnknownMessageId(id.to_string()))?;
                if let Some(h) = &info.raw_handler {
                    h(&raw, &user_data);
                }
                Ok(())
            }
            Message::Typed(value) => {
                let type_id = (*value).type_id();
                let id = *self
                    .msg_id
                    .get(&type_id)
                    .ok_or(Error::UnregisteredType("<unknown>"))?;
                let info = &self.msg_info[id as usize];

                if let Some(h) = &info.handler {
                    h(value.as_ref(), &user_data);
                }
                if let Some(router) = &info.router {
                    // A full or closed router must not tear down the
                    // producing connection.
                    if let Err(e) = router.go(info.type_name, vec![value, user_data]) {
                        warn!("route {}: {e}", info.type_name);
                    }
                }
                Ok(())
            }
        }
    }

    fn marshal(&self, msg: &dyn Any) -> Result<Vec<Bytes>> {
        let id = *self
            .msg_id
            .get(&msg.type_id())
            .ok_or(Error::UnregisteredType("<unknown>"))?;
        let info = &self.msg_info[id as usize];

        let id_bytes = match self.order {
            ByteOrder::Big => id.to_be_bytes(),
            ByteOrder::Little => id.to_le_bytes(),
        };
        let payload = (info.encode)(msg)?;
        Ok(vec![
            Bytes::copy_from_slice(&id_bytes),
            Bytes::from(payload),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(uint64, tag = "1")]
        seq: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Pong {
        #[prost(uint64, tag = "1")]
        seq: u64,
    }

    fn wire(p: &ProtoProcessor, msg: &dyn Any) -> Vec<u8> {
        let parts = p.marshal(msg).unwrap();
        parts.concat()
    }

    #[test]
    fn test_ids_dense_in_registration_order() {
        let mut p = ProtoProcessor::default();
        assert_eq!(p.register::<Ping>(), 0);
        assert_eq!(p.register::<Pong>(), 1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration_panics() {
        let mut p = ProtoProcessor::default();
        p.register::<Ping>();
        p.register::<Ping>();
    }

    #[test]
    fn test_marshal_unmarshal_identity() {
        let mut p = ProtoProcessor::default();
        p.register::<Ping>();

        let msg = Ping { seq: 77 };
        let data = wire(&p, &msg);
        match p.unmarshal(&data).unwrap() {
            Message::Typed(v) => assert_eq!(*v.downcast::<Ping>().unwrap(), msg),
            Message::Raw(_) => panic!("expected typed message"),
        }
    }

    #[test]
    fn test_wire_id_big_endian_prefix() {
        let mut p = ProtoProcessor::default();
        p.register::<Ping>();
        p.register::<Pong>();

        let data = wire(&p, &Pong { seq: 0 });
        assert_eq!(&data[..2], &[0x00, 0x01]);
    }

    #[test]
    fn test_wire_id_little_endian_prefix() {
        let mut p = ProtoProcessor::new(ByteOrder::Little);
        p.register::<Ping>();
        p.register::<Pong>();

        let data = wire(&p, &Pong { seq: 0 });
        assert_eq!(&data[..2], &[0x01, 0x00]);
    }

    #[test]
    fn test_unmarshal_rejects_truncation() {
        let p = ProtoProcessor::default();
        assert!(matches!(
            p.unmarshal(&[0x00]).unwrap_err(),
            Error::MessageTooShort { len: 1, min: 2 }
        ));
    }

    #[test]
    fn test_unmarshal_rejects_unknown_id() {
        let mut p = ProtoProcessor::default();
        p.register::<Ping>();
        let err = p.unmarshal(&[0x00, 0x09]).unwrap_err();
        assert!(matches!(err, Error::UnknownMessageId(id) if id == "9"));
    }

    #[test]
    fn test_marshal_unregistered_type() {
        let p = ProtoProcessor::default();
        let err = p.marshal(&Ping { seq: 1 }).unwrap_err();
        assert!(matches!(err, Error::UnregisteredType(_)));
    }

    #[test]
    fn test_handler_invoked_with_user_data() {
        let mut p = ProtoProcessor::default();
        p.register::<Ping>();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        p.set_handler::<Ping, _>(move |msg, user| {
            assert_eq!(msg.seq, 5);
            assert_eq!(*user.downcast_ref::<&str>().unwrap(), "agent");
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        // Ping{seq:5} arriving on the wire: the handler fires exactly once
        // and the unmarshal/route pipeline reports success.
        let data = wire(&p, &Ping { seq: 5 });
        let msg = p.unmarshal(&data).unwrap();
        p.route(msg, Box::new("agent")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_raw_passthrough_skips_decoding() {
        let mut p = ProtoProcessor::default();
        p.register::<Ping>();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        p.set_raw_handler(0, move |raw, _user| {
            assert_eq!(raw.id, MessageId::Id(0));
            // Payload delivered untouched even though it is not valid
            // protobuf.
            assert_eq!(&raw.data[..], &[0xde, 0xad, 0xbe, 0xef]);
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        let msg = p.unmarshal(&[0x00, 0x00, 0xde, 0xad, 0xbe, 0xef]).unwrap();
        assert!(matches!(msg, Message::Raw(_)));
        p.route(msg, Box::new(())).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_and_router_both_fire() {
        let mut p = ProtoProcessor::default();
        p.register::<Ping>();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        p.set_handler::<Ping, _>(move |_, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        let mut server = crate::chanrpc::Server::<()>::new(4);
        let route_id = p.route_id::<Ping>().unwrap();
        server.register(route_id, |_, _| {});
        p.set_router::<Ping>(server.handle());

        let data = wire(&p, &Ping { seq: 1 });
        let msg = p.unmarshal(&data).unwrap();
        p.route(msg, Box::new(())).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // The routed call is queued on the server's command channel.
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let ci = server.recv().await.unwrap();
            server.exec(&mut (), ci);
        });
    }
}
