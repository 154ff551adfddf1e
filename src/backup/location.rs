//! Source and destination addresses of a rule, and the synchronizer ports
//! they bind to.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use getset::Getters;
use std::fmt::{Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

pub const LOCAL_PROTOCOL: &str = "file";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    Local {
        path: PathBuf,
    },
    Remote {
        protocol: String,
        login: Option<String>,
        host: String,
        port: Option<u16>,
        path: PathBuf,
    },
}

impl Location {
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        Location::Local {
            path: normalize(&path.into()),
        }
    }

    pub fn remote<S: Into<String>, P: Into<PathBuf>>(
        protocol: S,
        login: Option<String>,
        host: S,
        port: Option<u16>,
        path: P,
    ) -> Self {
        Location::Remote {
            protocol: protocol.into(),
            login,
            host: host.into(),
            port,
            path: normalize(&path.into()),
        }
    }

    pub fn protocol(&self) -> &str {
        match self {
            Location::Local { .. } => LOCAL_PROTOCOL,
            Location::Remote { protocol, .. } => protocol,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Location::Local { path } | Location::Remote { path, .. } => path,
        }
    }

    fn same_host(&self, other: &Location) -> bool {
        match (self, other) {
            (Location::Local { .. }, Location::Local { .. }) => true,
            (
                Location::Remote {
                    protocol,
                    login,
                    host,
                    port,
                    ..
                },
                Location::Remote {
                    protocol: other_protocol,
                    login: other_login,
                    host: other_host,
                    port: other_port,
                    ..
                },
            ) => {
                protocol == other_protocol
                    && login == other_login
                    && host == other_host
                    && port == other_port
            }
            _ => false,
        }
    }

    /// True if `other` is this location or lies beneath it.
    pub fn contains(&self, other: &Location) -> bool {
        self.same_host(other) && other.path().starts_with(self.path())
    }

    pub fn overlaps(&self, other: &Location) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Path of `location` relative to this one, if it is contained.
    pub fn relative_path_of(&self, location: &Location) -> Option<PathBuf> {
        if !self.contains(location) {
            return None;
        }
        location
            .path()
            .strip_prefix(self.path())
            .ok()
            .map(Path::to_path_buf)
    }

    /// Options describing this location to a synchronizer bound at `key`
    /// (e.g. `Loc1`).
    pub fn to_options(&self, key: &str) -> Vec<(String, String)> {
        let mut options = vec![
            (key.to_string(), self.to_string()),
            (format!("{key}Protocol"), self.protocol().to_string()),
            (format!("{key}Path"), self.path().to_string_lossy().into_owned()),
        ];
        if let Location::Remote {
            login, host, port, ..
        } = self
        {
            options.push((format!("{key}Host"), host.clone()));
            if let Some(login) = login {
                options.push((format!("{key}Login"), login.clone()));
            }
            if let Some(port) = port {
                options.push((format!("{key}Port"), port.to_string()));
            }
        }
        options
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            c => normalized.push(c.as_os_str()),
        }
    }
    normalized
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Local { path } => write!(f, "{}", path.display()),
            Location::Remote {
                protocol,
                login,
                host,
                port,
                path,
            } => {
                write!(f, "{protocol}://")?;
                if let Some(login) = login {
                    write!(f, "{login}@")?;
                }
                write!(f, "{host}")?;
                if let Some(port) = port {
                    write!(f, ":{port}")?;
                }
                write!(f, "{}", path.display())
            }
        }
    }
}

impl FromStr for Location {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if !s.contains("://") {
            let path = Path::new(s);
            if !path.is_absolute() {
                return Err(Error::invalid_config(format!(
                    "local location {s:?} must be an absolute path"
                )));
            }
            return Ok(Location::local(path));
        }

        let url = url::Url::parse(s)?;
        let path = urlencoding::decode(url.path())
            .map_err(|e| Error::invalid_config(format!("location {s:?}: {e}")))?
            .into_owned();
        if url.scheme() == LOCAL_PROTOCOL {
            return Ok(Location::local(path));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::invalid_config(format!("location {s:?} has no host")))?;
        let login = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_owned);

        Ok(Location::remote(
            url.scheme(),
            login,
            host,
            url.port(),
            if path.is_empty() { "/".to_string() } else { path },
        ))
    }
}

/// Endpoint capability of a synchronizer.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
pub struct Port {
    #[getset(get = "pub")]
    protocols: Vec<String>,
    written_to: bool,
}

impl Port {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(protocols: I, written_to: bool) -> Self {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
            written_to,
        }
    }

    pub fn is_written_to(&self) -> bool {
        self.written_to
    }

    /// Adds protocols every port of a synchronizer accepts.
    pub fn with_extra_protocols(mut self, protocols: &[String]) -> Self {
        for protocol in protocols {
            if !self.protocols.contains(protocol) {
                self.protocols.push(protocol.clone());
            }
        }
        self
    }

    pub fn accepts(&self, location: &Location) -> bool {
        self.protocols.iter().any(|p| p == location.protocol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_and_remote() {
        let local: Location = "/home/user/./docs/../data".parse().unwrap();
        assert_eq!(local, Location::local("/home/user/data"));
        assert_eq!(local.protocol(), "file");

        let remote: Location = "ssh://backup@example.org:2222/srv/my%20backups".parse().unwrap();
        assert_eq!(
            remote,
            Location::remote(
                "ssh",
                Some("backup".to_string()),
                "example.org",
                Some(2222),
                "/srv/my backups"
            )
        );
        assert_eq!(remote.to_string(), "ssh://backup@example.org:2222/srv/my backups");

        assert!("relative/path".parse::<Location>().is_err());
        assert_eq!(
            "file:///tmp/x".parse::<Location>().unwrap(),
            Location::local("/tmp/x")
        );
    }

    #[test]
    fn test_containment_and_overlap() {
        let parent = Location::local("/data");
        let child = Location::local("/data/photos");
        let sibling = Location::local("/database");
        let remote = Location::remote("ssh", None, "host", None, "/data/photos");

        assert!(parent.contains(&child));
        assert!(!child.contains(&parent));
        assert!(child.overlaps(&parent));
        assert!(!parent.overlaps(&sibling));
        assert!(!parent.contains(&remote));
        assert_eq!(
            parent.relative_path_of(&child),
            Some(PathBuf::from("photos"))
        );
        assert_eq!(parent.relative_path_of(&sibling), None);
    }

    #[test]
    fn test_to_options() {
        let remote = Location::remote("ssh", Some("me".into()), "h", Some(22), "/p");
        let options = remote.to_options("Loc2");
        assert!(options.contains(&("Loc2".into(), "ssh://me@h:22/p".into())));
        assert!(options.contains(&("Loc2Protocol".into(), "ssh".into())));
        assert!(options.contains(&("Loc2Host".into(), "h".into())));
        assert!(options.contains(&("Loc2Login".into(), "me".into())));
        assert!(options.contains(&("Loc2Port".into(), "22".into())));
        assert!(options.contains(&("Loc2Path".into(), "/p".into())));
    }

    #[test]
    fn test_port_accepts() {
        let port = Port::new(["file", "ssh"], true);
        assert!(port.accepts(&Location::local("/x")));
        assert!(!port.accepts(&Location::remote("ftp", None, "h", None, "/")));
        assert!(port.is_written_to());
    }
}
