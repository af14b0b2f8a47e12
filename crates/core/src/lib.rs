//! kindwatch core types: what a dependency points at, and how kinds coalesce.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod config;

pub use config::Config;

/// Errors produced when parsing the textual forms of the core types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvk(String),
    #[error("invalid namespaced name: {0} (expect namespace/name or name)")]
    InvalidName(String),
    #[error("invalid tracked key: {0} (expect <gvk>:<namespace>/<name>)")]
    InvalidTrackedKey(String),
}

/// Group/Version/Kind of a resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Version-erased identity. Watches are shared at this granularity.
    pub fn group_kind(&self) -> GroupKind {
        GroupKind { group: self.group.clone(), kind: self.kind.clone() }
    }

    /// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for GroupVersionKind {
    type Err = ParseError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = key.split('/').collect();
        let gvk = match parts.as_slice() {
            [version, kind] => GroupVersionKind::new("", *version, *kind),
            [group, version, kind] if !group.is_empty() => GroupVersionKind::new(*group, *version, *kind),
            _ => return Err(ParseError::InvalidGvk(key.to_string())),
        };
        if gvk.version.is_empty() || gvk.kind.is_empty() {
            return Err(ParseError::InvalidGvk(key.to_string()));
        }
        Ok(gvk)
    }
}

/// Group/Kind: a [`GroupVersionKind`] with the version erased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into() }
    }
}

impl fmt::Display for GroupKind {
    // Kubernetes renders group-kinds as `Kind.group`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Namespaced identity of a single object. `namespace` is empty for cluster-scoped objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: String::new(), name: name.into() }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for NamespacedName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let nn = match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() => NamespacedName::new(ns, name),
            Some(_) => return Err(ParseError::InvalidName(s.to_string())),
            None => NamespacedName::cluster(s),
        };
        if nn.name.is_empty() || nn.name.contains('/') {
            return Err(ParseError::InvalidName(s.to_string()));
        }
        Ok(nn)
    }
}

/// The resource being depended upon: its type plus its namespaced identity.
///
/// Immutable once built; compare, hash and order by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackedKey {
    gvk: GroupVersionKind,
    target: NamespacedName,
}

impl TrackedKey {
    pub fn new(gvk: GroupVersionKind, target: NamespacedName) -> Self {
        Self { gvk, target }
    }

    pub fn group_version_kind(&self) -> &GroupVersionKind {
        &self.gvk
    }

    pub fn group_kind(&self) -> GroupKind {
        self.gvk.group_kind()
    }

    pub fn namespaced_name(&self) -> &NamespacedName {
        &self.target
    }

    pub fn namespace(&self) -> &str {
        &self.target.namespace
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }
}

impl fmt::Display for TrackedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.gvk, self.target)
    }
}

impl FromStr for TrackedKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (gvk, nn) = s
            .split_once(':')
            .ok_or_else(|| ParseError::InvalidTrackedKey(s.to_string()))?;
        Ok(TrackedKey::new(gvk.parse()?, nn.parse()?))
    }
}

/// A unit of downstream work: reconcile the named object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub namespaced_name: NamespacedName,
}

impl From<NamespacedName> for ReconcileRequest {
    fn from(namespaced_name: NamespacedName) -> Self {
        Self { namespaced_name }
    }
}

pub mod prelude {
    pub use super::{GroupKind, GroupVersionKind, NamespacedName, ParseError, ReconcileRequest, TrackedKey};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_kind_erases_version() {
        let v1 = TrackedKey::new(GroupVersionKind::new("g", "v1", "k"), NamespacedName::new("ns", "a"));
        let v2 = TrackedKey::new(GroupVersionKind::new("g", "v2", "k"), NamespacedName::new("ns", "b"));
        assert_ne!(v1, v2);
        assert_eq!(v1.group_kind(), v2.group_kind());
        assert_eq!(v1.group_kind(), GroupKind::new("g", "k"));
    }

    #[test]
    fn parse_gvk_keys() {
        assert_eq!("v1/ConfigMap".parse::<GroupVersionKind>().unwrap(), GroupVersionKind::new("", "v1", "ConfigMap"));
        assert_eq!(
            "apps/v1/Deployment".parse::<GroupVersionKind>().unwrap(),
            GroupVersionKind::new("apps", "v1", "Deployment")
        );
        assert!("Deployment".parse::<GroupVersionKind>().is_err());
        assert!("a/b/c/d".parse::<GroupVersionKind>().is_err());
        assert!("/v1/Kind".parse::<GroupVersionKind>().is_err());
        assert!("v1/".parse::<GroupVersionKind>().is_err());
    }

    #[test]
    fn parse_and_render_tracked_key() {
        let key: TrackedKey = "cert-manager.io/v1/Certificate:prod/web-tls".parse().unwrap();
        assert_eq!(key.group_version_kind().group, "cert-manager.io");
        assert_eq!(key.namespace(), "prod");
        assert_eq!(key.name(), "web-tls");
        assert_eq!(key.to_string(), "cert-manager.io/v1/Certificate:prod/web-tls");

        let node: TrackedKey = "v1/Node:worker-0".parse().unwrap();
        assert_eq!(node.namespace(), "");
        assert_eq!(node.to_string(), "v1/Node:worker-0");

        assert_eq!(
            "v1/ConfigMap".parse::<TrackedKey>(),
            Err(ParseError::InvalidTrackedKey("v1/ConfigMap".into()))
        );
        assert!("v1/ConfigMap:".parse::<TrackedKey>().is_err());
        assert!("v1/ConfigMap:a/b/c".parse::<TrackedKey>().is_err());
    }

    #[test]
    fn group_kind_display() {
        assert_eq!(GroupKind::new("", "Pod").to_string(), "Pod");
        assert_eq!(GroupKind::new("apps", "Deployment").to_string(), "Deployment.apps");
    }

    #[test]
    fn tracked_key_serializes_by_value() {
        let key: TrackedKey = "apps/v1/Deployment:default/web".parse().unwrap();
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["gvk"]["kind"], "Deployment");
        assert_eq!(json["target"]["name"], "web");
        let back: TrackedKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, key);
    }
}
