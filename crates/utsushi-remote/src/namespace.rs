//! Which local paths are replaced by served ones.

use std::path::{Component, Path, PathBuf};

use utsushi_client::constants::NAMESPACE_NONE;

/// One bind: `staging/remote` is mounted over `local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub local: PathBuf,
    /// Relative to the served root.
    pub remote: PathBuf,
}

impl Bind {
    pub fn source(&self, staging: &Path) -> PathBuf {
        staging.join(&self.remote)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceSpec {
    /// `none`: no back-channel, no binds.
    Disabled,
    Binds(Vec<Bind>),
}

impl NamespaceSpec {
    /// Parses `path[:path...]`, where each component is either `path` or
    /// `local=remote`. Empty components are skipped.
    pub fn parse(spec: &str) -> Self {
        if spec.trim() == NAMESPACE_NONE {
            return Self::Disabled;
        }
        let binds = spec
            .split(':')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|component| {
                let (local, remote) = component.split_once('=').unwrap_or((component, component));
                Bind {
                    local: PathBuf::from(local),
                    remote: relative(remote),
                }
            })
            .collect();
        Self::Binds(binds)
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }

    pub fn binds(&self) -> &[Bind] {
        match self {
            Self::Disabled => &[],
            Self::Binds(binds) => binds,
        }
    }
}

/// Keeps only normal components so the path stays under the staging dir.
fn relative(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(local: &str, remote: &str) -> Bind {
        Bind {
            local: local.into(),
            remote: remote.into(),
        }
    }

    #[test]
    fn test_sentinel() {
        assert_eq!(NamespaceSpec::parse("none"), NamespaceSpec::Disabled);
        assert!(NamespaceSpec::parse("none").binds().is_empty());
    }

    #[test]
    fn test_plain_paths() {
        let spec = NamespaceSpec::parse("/lib:/usr/local:/home");
        assert_eq!(
            spec.binds(),
            &[bind("/lib", "lib"), bind("/usr/local", "usr/local"), bind("/home", "home")]
        );
    }

    #[test]
    fn test_empty_components_skipped() {
        let spec = NamespaceSpec::parse(":/home::/tmp:");
        assert_eq!(spec.binds(), &[bind("/home", "home"), bind("/tmp", "tmp")]);
        assert_eq!(NamespaceSpec::parse(""), NamespaceSpec::Binds(vec![]));
    }

    #[test]
    fn test_local_remote_pairs() {
        let spec = NamespaceSpec::parse("/opt/tools=/srv/tools:/data=/");
        assert_eq!(
            spec.binds(),
            &[bind("/opt/tools", "srv/tools"), bind("/data", "")]
        );
        assert_eq!(
            spec.binds()[1].source(Path::new("/tmp/utsushi")),
            PathBuf::from("/tmp/utsushi")
        );
    }
}
