use std::{fmt, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// One consolidated checker for every identifier a container spec carries.
// No OsStrings or PathBufs for container-side values, they get sent over
// the wire verbatim and should be as cross platform as possible.

static DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());
static ENV_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

fn check_dns_label(field: &'static str, value: &str, max_len: usize) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(field, "must not be empty"));
    }
    if value.len() > max_len {
        return Err(Error::validation(
            field,
            format!("{value:?} exceeds {max_len} characters"),
        ));
    }
    if !DNS_LABEL.is_match(value) {
        return Err(Error::validation(
            field,
            format!("{value:?} is not a lowercase DNS label"),
        ));
    }
    Ok(())
}

pub(crate) fn check_env_key(key: &str) -> Result<()> {
    if ENV_KEY.is_match(key) {
        Ok(())
    } else {
        Err(Error::validation(
            "environment key",
            format!("{key:?} must match [A-Za-z_][A-Za-z0-9_]*"),
        ))
    }
}

pub(crate) fn check_env_value(key: &str, value: &str) -> Result<()> {
    if value.chars().all(|c| (' '..='~').contains(&c)) {
        Ok(())
    } else {
        Err(Error::validation(
            "environment value",
            format!("value of {key:?} contains non printable-ASCII characters"),
        ))
    }
}

pub(crate) fn check_port(field: &'static str, port: u16) -> Result<u16> {
    if port == 0 {
        Err(Error::validation(field, "port must be in 1..=65535"))
    } else {
        Ok(port)
    }
}

/// A container or workload name: a lowercase DNS label of at most 253
/// characters, usable verbatim as a Docker container name and as a
/// Kubernetes resource name.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerName(String);

impl ContainerName {
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref();
        check_dns_label("container name", name, 253)?;
        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A Kubernetes namespace: a DNS label of at most 63 characters.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct K8sNamespace(String);

impl K8sNamespace {
    pub fn new(namespace: impl AsRef<str>) -> Result<Self> {
        let namespace = namespace.as_ref();
        check_dns_label("namespace", namespace, 63)?;
        Ok(Self(namespace.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for K8sNamespace {
    fn default() -> Self {
        Self("default".to_owned())
    }
}

impl fmt::Display for K8sNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An image reference split into its segments. `Display` renders the usual
/// `registry/repository/name:tag` form with absent segments elided and the
/// tag defaulting to `latest`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    registry: Option<String>,
    repository: Option<String>,
    name: String,
    tag: Option<String>,
}

impl ImageRef {
    /// Parses `[registry/][repository/]name[:tag]`. The first segment is
    /// taken as a registry when it contains a `.` or a `:` (host names and
    /// host:port), matching the daemon's own heuristic.
    pub fn parse(reference: impl AsRef<str>) -> Result<Self> {
        let reference = reference.as_ref();
        if reference.is_empty() {
            return Err(Error::validation("image", "must not be empty"));
        }
        let (rest, tag) = match reference.rsplit_once(':') {
            // a ':' after the last '/' is a tag, otherwise a registry port
            Some((rest, tag)) if !tag.contains('/') => {
                if tag.is_empty() {
                    return Err(Error::validation(
                        "image",
                        format!("{reference:?} has an empty tag"),
                    ));
                }
                (rest, Some(tag.to_owned()))
            }
            _ => (reference, None),
        };
        let mut segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::validation(
                "image",
                format!("{reference:?} has empty path segments"),
            ));
        }
        let name = segments.pop().map(str::to_owned).unwrap_or_default();
        let registry = if segments
            .first()
            .is_some_and(|first| first.contains('.') || first.contains(':'))
        {
            Some(segments.remove(0).to_owned())
        } else {
            None
        };
        let repository = if segments.is_empty() {
            None
        } else {
            Some(segments.join("/"))
        };
        Ok(Self {
            registry,
            repository,
            name,
            tag,
        })
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn repository(&self) -> Option<&str> {
        self.repository.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// The reference without the tag, e.g. for `docker tag` style calls.
    pub fn repository_path(&self) -> String {
        let mut out = String::new();
        if let Some(registry) = &self.registry {
            out.push_str(registry);
            out.push('/');
        }
        if let Some(repository) = &self.repository {
            out.push_str(repository);
            out.push('/');
        }
        out.push_str(&self.name);
        out
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository_path(), self.tag())
    }
}

/// A byte count, parseable from plain integers or the IEC suffixes
/// `Ki`/`Mi`/`Gi`/`Ti`.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemorySize(u64);

impl MemorySize {
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let value = value.as_ref().trim();
        let (digits, multiplier) = match value {
            v if v.ends_with("Ki") => (&v[..v.len() - 2], 1u64 << 10),
            v if v.ends_with("Mi") => (&v[..v.len() - 2], 1 << 20),
            v if v.ends_with("Gi") => (&v[..v.len() - 2], 1 << 30),
            v if v.ends_with("Ti") => (&v[..v.len() - 2], 1 << 40),
            v => (v, 1),
        };
        let count: u64 = digits.trim().parse().map_err(|_| {
            Error::validation("memory", format!("{value:?} is not a byte quantity"))
        })?;
        count
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| Error::validation("memory", format!("{value:?} overflows")))
    }

    pub fn as_bytes(self) -> u64 {
        self.0
    }

    /// The Kubernetes resource quantity form (plain bytes).
    pub fn to_quantity(self) -> String {
        self.0.to_string()
    }
}

/// CPU in milli-units, parseable from `"500m"` or from (fractional) cores.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CpuMillis(u64);

impl CpuMillis {
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let value = value.as_ref().trim();
        if let Some(digits) = value.strip_suffix('m') {
            let millis: u64 = digits.trim().parse().map_err(|_| {
                Error::validation("cpu", format!("{value:?} is not a milli-CPU quantity"))
            })?;
            return Ok(Self(millis));
        }
        let cores: f64 = value
            .parse()
            .map_err(|_| Error::validation("cpu", format!("{value:?} is not a CPU quantity")))?;
        if !cores.is_finite() || cores < 0.0 {
            return Err(Error::validation("cpu", format!("{value:?} is negative")));
        }
        Ok(Self((cores * 1000.0).round() as u64))
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// The Kubernetes resource quantity form, e.g. `500m`.
    pub fn to_quantity(self) -> String {
        format!("{}m", self.0)
    }

    /// The daemon's `NanoCpus` form.
    pub fn as_nano_cpus(self) -> i64 {
        (self.0 as i64) * 1_000_000
    }
}

/// Docker network modes. Anything that is not one of the daemon's reserved
/// modes is a user-defined network, created on demand with the `bridge`
/// driver and removed at container teardown.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NetworkMode {
    Bridge,
    Host,
    None,
    /// Join the network namespace of another container.
    Container(String),
    /// A user-defined network name.
    Custom(String),
}

impl NetworkMode {
    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let value = value.as_ref();
        Ok(match value {
            "" => return Err(Error::validation("network", "must not be empty")),
            "bridge" => Self::Bridge,
            "host" => Self::Host,
            "none" => Self::None,
            other => match other.strip_prefix("container:") {
                Some(id) if !id.is_empty() => Self::Container(id.to_owned()),
                Some(_) => {
                    return Err(Error::validation(
                        "network",
                        "container: mode needs a name or id",
                    ))
                }
                None => {
                    check_dns_label("network", other, 253)?;
                    Self::Custom(other.to_owned())
                }
            },
        })
    }

    /// Whether this mode names a network this crate owns and must tear down.
    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom(_))
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => f.write_str("bridge"),
            Self::Host => f.write_str("host"),
            Self::None => f.write_str("none"),
            Self::Container(id) => write!(f, "container:{id}"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// An absolute unix path inside a container.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let path = path.as_ref();
        if !path.starts_with('/') {
            return Err(Error::validation(
                "remote path",
                format!("{path:?} is not absolute"),
            ));
        }
        if path.contains('\0') {
            return Err(Error::validation("remote path", "contains NUL"));
        }
        // normalize away a trailing slash, "/" stays intact
        let trimmed = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn join(&self, name: &str) -> Self {
        if self.0 == "/" {
            Self(format!("/{name}"))
        } else {
            Self(format!("{}/{name}", self.0))
        }
    }

    /// The final path component, empty for `/`.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// The containing directory, `/` at the root.
    pub fn parent(&self) -> Self {
        match self.0.rsplit_once('/') {
            Some(("", _)) | None => Self("/".to_owned()),
            Some((parent, _)) => Self(parent.to_owned()),
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
