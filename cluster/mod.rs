pub mod format;
pub mod slink;
pub use format::ClusterOutput;
pub use slink::{ClusterError, Clusters};
