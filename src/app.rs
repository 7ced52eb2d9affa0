//! Process lifecycle.
//!
//! One [`Application`] per process: register modules, hand over cluster
//! routing, then `serve()`. Modules initialize in registration order, the
//! cluster comes up, and the process waits for SIGINT/SIGTERM. On signal
//! the cluster stops first, then modules tear down in reverse order.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::chanrpc::ServerHandle;
use crate::cluster::Cluster;
use crate::codec::Processor;
use crate::conf::Config;
use crate::error::Result;
use crate::module::{Module, Supervisor};

/// Top-level application value; owns every process-wide subsystem.
pub struct Application {
    config: Config,
    supervisor: Supervisor,
    cluster_processor: Option<Arc<dyn Processor>>,
    cluster_agent_rpc: Option<ServerHandle>,
}

impl Application {
    /// Create an application from configuration.
    pub fn new(config: Config) -> Self {
        let mut supervisor = Supervisor::new();
        supervisor.set_stack_buf_len(config.stack_buf_len);
        Self {
            config,
            supervisor,
            cluster_processor: None,
            cluster_agent_rpc: None,
        }
    }

    /// Register a module. Modules initialize in registration order and
    /// tear down in reverse.
    pub fn register(mut self, module: impl Module) -> Self {
        self.supervisor.register(module);
        self
    }

    /// Processor and agent-notification server for cluster connections.
    pub fn cluster_routing(
        mut self,
        processor: Arc<dyn Processor>,
        agent_rpc: Option<ServerHandle>,
    ) -> Self {
        self.cluster_processor = Some(processor);
        self.cluster_agent_rpc = agent_rpc;
        self
    }

    /// Run until SIGINT/SIGTERM, then tear everything down.
    pub async fn serve(self) -> Result<()> {
        self.serve_until(wait_for_signal()).await
    }

    /// Run until `shutdown` resolves, then tear everything down. The
    /// signal-driven [`serve`](Self::serve) is this with the process
    /// signals as the future.
    pub async fn serve_until(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("gantry starting up");
        self.supervisor.init();

        let mut cluster = if self.config.cluster.is_empty() {
            None
        } else {
            Some(
                Cluster::start(
                    &self.config.cluster,
                    self.cluster_processor.clone(),
                    self.cluster_agent_rpc.clone(),
                )
                .await?,
            )
        };

        shutdown.await;
        info!("gantry closing down");

        if let Some(cluster) = &mut cluster {
            cluster.stop().await;
        }
        self.supervisor.destroy().await;
        Ok(())
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    struct Probe {
        inits: Arc<AtomicUsize>,
        destroys: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Module for Probe {
        fn on_init(&mut self) {
            self.inits.fetch_add(1, Ordering::SeqCst);
        }

        async fn run(&mut self, shutdown: oneshot::Receiver<()>) {
            let _ = shutdown.await;
        }

        fn on_destroy(&mut self) {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_serve_until_runs_full_lifecycle() {
        let inits = Arc::new(AtomicUsize::new(0));
        let destroys = Arc::new(AtomicUsize::new(0));

        let app = Application::new(Config::default())
            .register(Probe {
                inits: inits.clone(),
                destroys: destroys.clone(),
            })
            .register(Probe {
                inits: inits.clone(),
                destroys: destroys.clone(),
            });

        app.serve_until(async {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        })
        .await
        .unwrap();

        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert_eq!(destroys.load(Ordering::SeqCst), 2);
    }
}
