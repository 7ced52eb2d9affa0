//! # gantry
//!
//! Server-side game framework: framed TCP/WebSocket gateways, an
//! in-process channel-RPC fabric, and single-threaded module event loops.
//!
//! ## Architecture
//!
//! ```text
//!           ┌──────────── module event loop (Skeleton) ────────────┐
//!           │  timers │ async completions │ chanrpc │ offload cbs  │
//!           │            │                    │                    │
//!  accept/dial ─► Agent ─► Processor ─► route ─► chanrpc Server ───┘
//!           │   (reader loop)                                      │
//!           └──────────────────────────────────────────────────────┘
//! ```
//!
//! Connections are read by one task and written through a bounded queue by
//! a dedicated writer task. Messages are decoded by a [`codec::Processor`]
//! and either handled inline or routed to a module's chanrpc server, where
//! all handler code for that module runs serialized on its own task.
//!
//! ## Example
//!
//! ```ignore
//! use gantry::prelude::*;
//!
//! let mut game = Skeleton::new(SkeletonConfig::default(), GameState::default());
//! game.register("new_agent", |cx, args| { /* ... */ });
//!
//! let mut processor = JsonProcessor::new();
//! processor.register::<Login>();
//! processor.set_router::<Login>(game.handle());
//!
//! let gate = Gate {
//!     tcp_addr: Some("0.0.0.0:3653".into()),
//!     processor: Some(Arc::new(processor)),
//!     agent_rpc: Some(game.handle()),
//!     ..Default::default()
//! };
//!
//! Application::new(Config::default())
//!     .register(GameModule::new(game))
//!     .register(gate)
//!     .serve()
//!     .await?;
//! ```

pub mod app;
pub mod chanrpc;
pub mod cluster;
pub mod codec;
pub mod conf;
pub mod error;
pub mod gate;
pub mod module;
pub mod net;
pub mod pool;
pub mod timer;

mod trace;

pub use app::Application;
pub use error::{Error, Result};

/// Common imports for applications built on the framework.
pub mod prelude {
    pub use crate::app::Application;
    pub use crate::chanrpc::{Args, CallId, Callback, ServerHandle, Value};
    pub use crate::codec::{
        ByteOrder, FrameCodec, JsonProcessor, LenWidth, Processor, ProtoProcessor,
    };
    pub use crate::conf::Config;
    pub use crate::error::{Error, Result};
    pub use crate::gate::{Agent, Gate, CLOSE_AGENT, NEW_AGENT};
    pub use crate::module::{Context, Module, Skeleton, SkeletonConfig, Supervisor};
    pub use crate::timer::CronExpr;
}
