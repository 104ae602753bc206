//! Built-in backend names

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use kvstore_common::StoreError;

/// Backends shipped with this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    #[serde(rename = "etcdv3")]
    Etcd,
    #[serde(rename = "zk")]
    Zookeeper,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Etcd, Backend::Zookeeper];

    /// Name the backend registers under.
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Etcd => kvstore_etcd::BACKEND_NAME,
            Backend::Zookeeper => kvstore_zookeeper::BACKEND_NAME,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Backend::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| StoreError::BackendNotSupported(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for backend in Backend::ALL {
            assert_eq!(backend.as_str().parse::<Backend>().unwrap(), backend);
        }
        assert_eq!(Backend::Etcd.to_string(), "etcdv3");
        assert_eq!(Backend::Zookeeper.to_string(), "zk");
    }

    #[test]
    fn test_unknown_name() {
        let err = "consul".parse::<Backend>().unwrap_err();
        assert!(matches!(err, StoreError::BackendNotSupported(name) if name == "consul"));
    }
}
