pub mod config;
pub mod context;
pub mod digest;
pub mod driver;
pub mod error;
pub mod node;
pub mod path;
pub mod pipe;
pub mod reconcile;
pub mod regulator;
pub mod storage;
pub mod store;


pub use context::Context;
pub use digest::Digest;
pub use driver::{ContainerStorageDriver, StorageDriver, WalkControl, DRIVER_NAME};
pub use error::{Error, Result};
pub use node::FileInfo;
pub use regulator::Regulator;
pub use store::{ContainerStore, Store};
