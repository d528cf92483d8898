pub mod environment;
pub mod error;
pub mod filter;
pub mod labels;
pub mod naming;
pub mod types;


pub use environment::Environment;
pub use error::DomainError;
pub use filter::LabelFilter;
pub use labels::{Label, LabelSet};
pub use naming::{random_suffix, suffix_name, unique_name, RESOURCE_GROUP_MAX_LEN};
pub use types::{ClusterEntry, CustomerEnv, E2ESetup, NodePoolEntry, SetupModel};
