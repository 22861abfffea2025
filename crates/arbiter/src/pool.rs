use mediator_core::config::ArbiterConfig;
use mediator_core::Source;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Source metadata key selecting the worker pool an attempt runs under.
pub const WORKLOAD_KEY: &str = "workload";

/// Bounded permits for fan-out attempts. Network attempts mostly wait on
/// I/O and over-subscribe the cores; compute attempts get one permit per core.
#[derive(Debug, Clone)]
pub struct WorkerPools {
    network: Arc<Semaphore>,
    compute: Arc<Semaphore>,
    network_size: usize,
    compute_size: usize,
}

impl WorkerPools {
    pub fn new(network_size: usize, compute_size: usize) -> Self {
        let network_size = network_size.max(1);
        let compute_size = compute_size.max(1);
        Self {
            network: Arc::new(Semaphore::new(network_size)),
            compute: Arc::new(Semaphore::new(compute_size)),
            network_size,
            compute_size,
        }
    }

    /// Size from config, falling back to available parallelism for zeroes.
    pub fn from_config(config: &ArbiterConfig) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let network = match config.network_workers {
            0 => cores * 4,
            n => n,
        };
        let compute = match config.compute_workers {
            0 => cores,
            n => n,
        };
        Self::new(network, compute)
    }

    /// Pool for a source: compute when its metadata says `workload = compute`.
    pub fn for_source(&self, source: &Source) -> Arc<Semaphore> {
        match source.metadata().get(WORKLOAD_KEY).map(String::as_str) {
            Some("compute") => self.compute.clone(),
            _ => self.network.clone(),
        }
    }

    pub fn network_size(&self) -> usize {
        self.network_size
    }

    pub fn compute_size(&self) -> usize {
        self.compute_size
    }

    pub fn network_available(&self) -> usize {
        self.network.available_permits()
    }

    pub fn compute_available(&self) -> usize {
        self.compute.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_core::{AdapterConfig, SourceConfig};

    fn source(workload: Option<&str>) -> Source {
        let mut cfg = SourceConfig::new(
            "s1",
            AdapterConfig::AdMob {
                ad_unit_id: "ca-app-pub-1/2".into(),
            },
        );
        if let Some(w) = workload {
            cfg = cfg.meta(WORKLOAD_KEY, w);
        }
        cfg.build().unwrap()
    }

    #[test]
    fn test_sizes_from_parallelism() {
        let pools = WorkerPools::from_config(&ArbiterConfig::default());
        assert!(pools.compute_size() >= 1);
        assert_eq!(pools.network_size(), pools.compute_size() * 4);

        let pools = WorkerPools::from_config(&ArbiterConfig {
            network_workers: 7,
            compute_workers: 2,
            ..ArbiterConfig::default()
        });
        assert_eq!(pools.network_size(), 7);
        assert_eq!(pools.compute_size(), 2);
    }

    #[tokio::test]
    async fn test_workload_routes_to_pool() {
        let pools = WorkerPools::new(4, 1);
        let _net = pools.for_source(&source(None)).acquire_owned().await.unwrap();
        assert_eq!(pools.network_available(), 3);
        assert_eq!(pools.compute_available(), 1);

        let _cpu = pools
            .for_source(&source(Some("compute")))
            .acquire_owned()
            .await
            .unwrap();
        assert_eq!(pools.compute_available(), 0);
    }
}
