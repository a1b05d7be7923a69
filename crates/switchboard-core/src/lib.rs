//! Switchboard core orchestration layer.
//!
//! Sits between callers and a fleet of interchangeable backend service
//! instances, adding routing, weighted load balancing, request batching,
//! health monitoring, capability tracking and lifecycle management on
//! top of a uniform [`adapter::BackendAdapter`] abstraction.
//!
//! Most applications only touch [`manager::Manager`]:
//!
//! ```ignore
//! let manager = Manager::new(ManagerConfig::default(), None);
//! manager
//!     .register_backend(
//!         BackendRegistration::new("weather", 1.0, adapter),
//!         RouteProfile::new().with_keywords(vec!["forecast".into()]),
//!     )
//!     .await?;
//! let response = manager.execute("get_forecast", params).await?;
//! ```

pub mod adapter;
pub mod backend;
pub mod batch;
pub mod capability;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod manager;
pub mod pool;
pub mod router;

pub use adapter::{normalize_result, BackendAdapter, BackendCapabilities};
pub use backend::{AdapterRegistry, BackendRegistration, BackendStats};
pub use batch::{BatchConfig, BatchCoordinator, BatchStats};
pub use capability::{CapabilityManager, CapabilityRecord, CapabilityType};
pub use events::{CapabilityEvent, CapabilityEventKind, LifecycleEvent};
pub use health::{HealthCheckConfig, HealthMonitor, HealthReport, HealthStatus};
pub use lifecycle::{LifecycleConfig, LifecycleManager, LifecycleState};
pub use load_balancer::{LoadBalancer, LoadBalancerConfig, Strategy};
pub use manager::{Manager, ManagerConfig, ManagerStats};
pub use pool::{PoolConfig, PooledResource, ResourcePool};
pub use router::{RouteProfile, Router};
