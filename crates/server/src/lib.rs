//! TensorServe server
//!
//! Model discovery, the registry of live models, the data plane and the
//! repository handlers, assembled by [`TensorServer`].

pub mod cache;
pub mod dataplane;
pub mod handlers;
pub mod headers;
pub mod registry;
pub mod repository;
pub mod server;

pub use cache::{CacheKey, ResponseCache};
pub use dataplane::DataPlane;
pub use handlers::ModelRepositoryHandlers;
pub use registry::ModelRegistry;
pub use repository::{
    InMemoryModelRepository, ModelRepository, ModelRepositoryFactory, RepositoryRegistry, SchemalessModelRepository,
};
pub use server::TensorServer;
