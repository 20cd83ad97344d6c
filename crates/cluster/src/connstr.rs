use crate::mem::MemCluster;
use crate::Cluster;
use std::sync::Arc;

/// Scheme prefix prepended to connection strings given without one.
pub const URI_START: &str = "mongodb://";

#[derive(thiserror::Error, Debug)]
pub enum ConnstrError {
    #[error("failed to parse connection string {connstr:?}")]
    Parse {
        connstr: String,
        #[source]
        source: url::ParseError,
    },
    #[error("no driver is available for scheme {0:?}")]
    UnsupportedScheme(String),
}

/// Normalize a cluster connection string: the default scheme prefix is
/// prepended when absent, and the result must parse as a URL.
pub fn normalize(connstr: &str) -> Result<url::Url, ConnstrError> {
    let full = if connstr.contains("://") {
        connstr.to_string()
    } else {
        format!("{URI_START}{connstr}")
    };

    url::Url::parse(&full).map_err(|source| ConnstrError::Parse {
        connstr: full,
        source,
    })
}

/// Open a Cluster facade for the given connection URL. `mem://` serves
/// an in-process cluster; other schemes require a linked driver.
pub fn dial(url: &url::Url, direct_load: bool) -> Result<Arc<dyn Cluster>, ConnstrError> {
    match url.scheme() {
        "mem" => Ok(Arc::new(MemCluster::from_url(url, direct_load))),
        scheme => Err(ConnstrError::UnsupportedScheme(scheme.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_prepends_default_scheme() {
        let url = normalize("host0:27017/db").unwrap();
        assert_eq!(url.scheme(), "mongodb");
        assert_eq!(url.host_str(), Some("host0"));

        let url = normalize("mem://local?shards=3").unwrap();
        assert_eq!(url.scheme(), "mem");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize("://").is_err());
    }

    #[test]
    fn test_dial_unsupported_scheme() {
        let url = normalize("mongodb://host0").unwrap();
        let err = dial(&url, false).unwrap_err();
        assert!(matches!(err, ConnstrError::UnsupportedScheme(s) if s == "mongodb"));
    }
}
