pub mod aggregate;
pub mod args;
pub mod blacklist;
pub mod collapse;
pub mod cross;
pub mod decode;
pub mod filter;
pub mod histogram;
pub mod lookup;
pub mod utils;
pub mod writer;

pub use args::{Args, Command, OutputFormat};
pub use collapse::{collapse_domain, MajorityResult};
pub use cross::{collapse_cross, ClusterIndex, DominantAsnMap};
pub use histogram::DomainAggregate;
pub use lookup::AsnTable;
