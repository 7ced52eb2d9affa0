//! Cluster wiring.
//!
//! Thin glue over the TCP supervisors: an optional listener for inbound
//! peers and one auto-reconnecting client per configured peer address.
//! Cluster connections use a 2-byte length prefix with the widest message
//! bound the prefix allows, and run the same processor-driven agent loop
//! as the gate.

use std::sync::Arc;

use tracing::info;

use crate::chanrpc::ServerHandle;
use crate::codec::{ByteOrder, FrameCodec, LenWidth, Processor};
use crate::conf::ClusterConfig;
use crate::error::Result;
use crate::gate::tcp_factory;
use crate::net::{TcpClient, TcpServer};

/// The running cluster: at most one server plus the peer clients.
pub struct Cluster {
    server: Option<TcpServer>,
    clients: Vec<TcpClient>,
}

impl Cluster {
    /// Start the cluster per config. Messages are decoded and routed by
    /// `processor`; `agent_rpc` receives agent lifecycle notifications.
    pub async fn start(
        cfg: &ClusterConfig,
        processor: Option<Arc<dyn Processor>>,
        agent_rpc: Option<ServerHandle>,
    ) -> Result<Self> {
        let codec = FrameCodec::new(LenWidth::U16, 1, u32::MAX, ByteOrder::Big);

        let server = match &cfg.listen_addr {
            Some(addr) => {
                let mut server = TcpServer::new(
                    addr.clone(),
                    tcp_factory(processor.clone(), agent_rpc.clone()),
                )
                .max_conn_num(usize::MAX)
                .pending_write_num(cfg.pending_write_num)
                .codec(codec);
                server.start().await?;
                info!("cluster service startup: {addr}");
                Some(server)
            }
            None => None,
        };

        let mut clients = Vec::with_capacity(cfg.connect_addrs.len());
        for addr in &cfg.connect_addrs {
            let mut client = TcpClient::new(
                addr.clone(),
                tcp_factory(processor.clone(), agent_rpc.clone()),
            )
            .auto_reconnect(true)
            .pending_write_num(cfg.pending_write_num)
            .codec(codec);
            client.start();
            info!("cluster client startup: {addr}");
            clients.push(client);
        }

        Ok(Self { server, clients })
    }

    /// Stop the server, then every client.
    pub async fn stop(&mut self) {
        if let Some(server) = &mut self.server {
            server.close().await;
        }
        for client in &mut self.clients {
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chanrpc::Args;
    use crate::codec::ProtoProcessor;
    use crate::gate::{Agent, NEW_AGENT};
    use crate::module::{Context, Skeleton, SkeletonConfig};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Clone, PartialEq, prost::Message)]
    struct NodeHello {
        #[prost(string, tag = "1")]
        node: String,
    }

    #[tokio::test]
    async fn test_cluster_peers_exchange_messages() {
        // Node A: listens, greets every new peer agent.
        let mut processor_a = ProtoProcessor::default();
        processor_a.register::<NodeHello>();
        let processor_a = Arc::new(processor_a);

        let mut skel_a = Skeleton::new(SkeletonConfig::default(), Vec::<String>::new());
        skel_a.register(NEW_AGENT, |_cx: &mut Context<Vec<String>>, mut args: Args| {
            let agent = args.remove(0).downcast::<Agent>().expect("agent");
            agent.write_msg(&NodeHello {
                node: "a".to_string(),
            });
        });
        let rpc_a = skel_a.handle();
        let (stop_a, rx_a) = oneshot::channel();
        let task_a = tokio::spawn(async move {
            skel_a.run(rx_a).await;
            skel_a
        });

        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let mut cluster_a = Cluster::start(
            &ClusterConfig {
                listen_addr: Some(addr.to_string()),
                connect_addrs: vec![],
                pending_write_num: 0,
            },
            Some(processor_a),
            Some(rpc_a),
        )
        .await
        .unwrap();

        // Node B: connects to A and records the greeting.
        let mut processor_b = ProtoProcessor::default();
        processor_b.register::<NodeHello>();

        let mut skel_b = Skeleton::new(SkeletonConfig::default(), Vec::<String>::new());
        let route_id = processor_b.route_id::<NodeHello>().expect("registered");
        skel_b.register(route_id, |cx: &mut Context<Vec<String>>, mut args: Args| {
            let msg = args.remove(0).downcast::<NodeHello>().expect("hello");
            cx.state.push(msg.node);
        });
        processor_b.set_router::<NodeHello>(skel_b.handle());
        let (stop_b, rx_b) = oneshot::channel();
        let task_b = tokio::spawn(async move {
            skel_b.run(rx_b).await;
            skel_b
        });

        let mut cluster_b = Cluster::start(
            &ClusterConfig {
                listen_addr: None,
                connect_addrs: vec![addr.to_string()],
                pending_write_num: 0,
            },
            Some(Arc::new(processor_b)),
            None,
        )
        .await
        .unwrap();

        // Let the dial, the greeting, and the routed call settle.
        tokio::time::sleep(Duration::from_millis(300)).await;

        cluster_b.stop().await;
        cluster_a.stop().await;

        let _ = stop_b.send(());
        let skel_b = task_b.await.unwrap();
        assert_eq!(skel_b.state(), &vec!["a".to_string()]);

        let _ = stop_a.send(());
        task_a.await.unwrap();
    }
}
