//! kgraph kubehub – cluster location and paged resource fetching.

#![forbid(unsafe_code)]

mod fetch;
mod kube_lister;
mod locator;

pub use fetch::{raw_from_value, FetchOutcome, Fetcher, ListPage, ResourceLister};
pub use kube_lister::{DiscoveredResource, KubeLister};
pub use locator::{ClusterDiscovery, ClusterLocator, Resolution, SkippedCluster, StaticDiscovery};
