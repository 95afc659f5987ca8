use std::collections::BTreeSet;

/// Namespace that is never reconciled, regardless of configuration.
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Decides which namespaces are eligible for image mirroring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceFilter {
    ignored: BTreeSet<String>,
}

impl NamespaceFilter {
    pub fn new<I, S>(ignored: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ignored: BTreeSet<String> = ignored
            .into_iter()
            .map(|ns| ns.as_ref().trim().to_string())
            .filter(|ns| !ns.is_empty())
            .collect();
        ignored.insert(SYSTEM_NAMESPACE.to_string());
        Self { ignored }
    }

    /// Builds a filter from a comma separated list such as `"team-a, team-b"`.
    pub fn from_comma_separated(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn admit(&self, namespace: &str) -> bool {
        !self.ignored.contains(namespace)
    }

    pub fn ignored(&self) -> impl Iterator<Item = &str> {
        self.ignored.iter().map(String::as_str)
    }
}

impl Default for NamespaceFilter {
    fn default() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}
