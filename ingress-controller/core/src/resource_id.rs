use std::{fmt, str::FromStr};

/// Identifies a cluster object by namespace and name.
///
/// Cluster-scoped objects use an empty namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid object key {0:?}: expected `namespace/name`")]
pub struct InvalidKey(String);

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }

    /// The file-name form of the key, with the separator replaced by a dash.
    pub fn dashed(&self) -> String {
        if self.namespace.is_empty() {
            return self.name.clone();
        }
        format!("{}-{}", self.namespace, self.name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            return self.name.fmt(f);
        }
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = InvalidKey;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        match key.split_once('/') {
            None if !key.is_empty() => Ok(Self::cluster(key)),
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(InvalidKey(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys() {
        let id = "default/echo".parse::<ResourceId>().unwrap();
        assert_eq!(id, ResourceId::new("default", "echo"));
        assert_eq!(id.to_string(), "default/echo");
        assert_eq!(id.dashed(), "default-echo");

        let class = "nginx".parse::<ResourceId>().unwrap();
        assert_eq!(class, ResourceId::cluster("nginx"));
        assert_eq!(class.to_string(), "nginx");

        assert!("".parse::<ResourceId>().is_err());
        assert!("/name".parse::<ResourceId>().is_err());
        assert!("ns/".parse::<ResourceId>().is_err());
        assert!("a/b/c".parse::<ResourceId>().is_err());
    }
}
