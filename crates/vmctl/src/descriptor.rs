//! Locally persisted VM and security-group records.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Treat unset, empty and the literal `"None"` uniformly as absent.
#[must_use]
pub fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty() && *v != "None")
}

/// The persisted record of one managed VM.
///
/// Fields are stored verbatim so a save/load cycle reproduces exactly what
/// was written. Use the accessors to read them: they apply [`present`] so
/// callers never repeat the empty / `"None"` check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDescriptor {
    /// Provider-assigned instance id.
    pub id: Option<String>,
    /// Logical VM name.
    pub name: Option<String>,
    /// Public IPv4 address (or DNS name).
    pub ip: Option<String>,
    /// Region (zone on GCP, location on Azure).
    pub region: Option<String>,
    /// Machine size.
    pub instance_type: Option<String>,
    /// Image name as supplied by the user.
    pub image_name: Option<String>,
    /// Provider image id, once resolved.
    pub image_id: Option<String>,
    /// Key pair name.
    pub key_name: Option<String>,
    /// Directory holding the key files.
    pub key_path: Option<String>,
    /// Resolved private key file.
    pub key_file: Option<String>,
    /// SSH login user.
    pub user: Option<String>,
    /// Security group id.
    pub security_group_id: Option<String>,
    /// Security group name.
    pub security_group_name: Option<String>,
    /// Whether the provider network permits ICMP echo.
    pub pingable: bool,
    /// Provider-specific settings.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

macro_rules! accessor {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[must_use]
            pub fn $name(&self) -> Option<&str> {
                present(self.$name.as_deref())
            }
        )*
    };
}

impl VmDescriptor {
    accessor!(
        /// Instance id, if a VM exists.
        id,
        /// VM name.
        name,
        /// Public address.
        ip,
        /// Region or zone.
        region,
        /// Machine size.
        instance_type,
        /// Image name.
        image_name,
        /// Resolved image id.
        image_id,
        /// Key pair name.
        key_name,
        /// Key directory.
        key_path,
        /// Private key file.
        key_file,
        /// SSH user.
        user,
        /// Security group id.
        security_group_id,
        /// Security group name.
        security_group_name,
    );

    /// Whether a VM is recorded.
    #[must_use]
    pub fn has_vm(&self) -> bool {
        self.id().is_some()
    }

    /// Provider-specific option, with the same absent semantics as the fields.
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&str> {
        present(self.options.get(key).map(String::as_str))
    }

    /// Provider-specific option or a default.
    #[must_use]
    pub fn option_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.option(key).unwrap_or(default)
    }

    /// Set a provider-specific option.
    pub fn set_option(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.insert(key.into(), value.into());
    }

    /// Key file path built from `key_path + key_name + extension`, `~` expanded.
    #[must_use]
    pub fn key_file_candidate(&self, extension: &str) -> Option<PathBuf> {
        let name = self.key_name()?;
        let dir = self.key_path().unwrap_or("");
        Some(expand_home(&format!("{dir}{name}{extension}")))
    }

    /// `user@ip` destination for SSH, when both are known.
    #[must_use]
    pub fn ssh_destination(&self) -> Option<String> {
        Some(format!("{}@{}", self.user()?, self.ip()?))
    }

    /// Fill every absent field from `fallback`, keeping values already set.
    pub fn merge_defaults(&mut self, fallback: &VmDescriptor) {
        fn fill(slot: &mut Option<String>, value: &Option<String>) {
            if present(slot.as_deref()).is_none() && present(value.as_deref()).is_some() {
                slot.clone_from(value);
            }
        }
        fill(&mut self.id, &fallback.id);
        fill(&mut self.name, &fallback.name);
        fill(&mut self.ip, &fallback.ip);
        fill(&mut self.region, &fallback.region);
        fill(&mut self.instance_type, &fallback.instance_type);
        fill(&mut self.image_name, &fallback.image_name);
        fill(&mut self.image_id, &fallback.image_id);
        fill(&mut self.key_name, &fallback.key_name);
        fill(&mut self.key_path, &fallback.key_path);
        fill(&mut self.key_file, &fallback.key_file);
        fill(&mut self.user, &fallback.user);
        fill(&mut self.security_group_id, &fallback.security_group_id);
        fill(&mut self.security_group_name, &fallback.security_group_name);
        for (key, value) in &fallback.options {
            if self.option(key).is_none() {
                self.options.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Expand a leading `~` to the user's home directory.
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(path),
    }
}

/// Traffic direction of a security rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Inbound.
    Ingress,
    /// Outbound.
    Egress,
}

/// Protocol of a security rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// ICMP echo.
    Icmp,
    /// Every protocol.
    All,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Icmp => write!(f, "icmp"),
            Self::All => write!(f, "all"),
        }
    }
}

/// One firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    /// Protocol.
    pub protocol: Protocol,
    /// First port (`None` for ICMP / all).
    pub from_port: Option<u16>,
    /// Last port.
    pub to_port: Option<u16>,
    /// Source (ingress) or destination (egress) CIDR.
    pub cidr: String,
    /// Direction.
    pub direction: Direction,
    /// Human-readable description.
    pub description: String,
}

impl SecurityRule {
    fn tcp(port: u16, description: &str) -> Self {
        Self {
            protocol: Protocol::Tcp,
            from_port: Some(port),
            to_port: Some(port),
            cidr: "0.0.0.0/0".to_string(),
            direction: Direction::Ingress,
            description: description.to_string(),
        }
    }

    /// Rules installed on every security group this tool creates:
    /// SSH, HTTPS, DIGITS, ping, and open egress.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::tcp(22, "For SSH"),
            Self::tcp(443, "For SSL"),
            Self::tcp(5000, "For NVIDIA DIGITS"),
            Self {
                protocol: Protocol::Icmp,
                from_port: None,
                to_port: None,
                cidr: "0.0.0.0/0".to_string(),
                direction: Direction::Ingress,
                description: "To allow to be pinged".to_string(),
            },
            Self {
                protocol: Protocol::All,
                from_port: None,
                to_port: None,
                cidr: "0.0.0.0/0".to_string(),
                direction: Direction::Egress,
                description: "All open".to_string(),
            },
        ]
    }

    /// `from/to` port range, `-1/-1` when unbounded.
    #[must_use]
    pub fn port_range(&self) -> String {
        match (self.from_port, self.to_port) {
            (Some(from), Some(to)) => format!("{from}/{to}"),
            _ => "-1/-1".to_string(),
        }
    }
}

/// A provider security group as listed by `shownsg`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupDescriptor {
    /// Provider id.
    pub id: String,
    /// Group name.
    pub name: String,
    /// Description, if any.
    pub description: Option<String>,
    /// Rules, when the listing includes them.
    #[serde(default)]
    pub rules: Vec<SecurityRule>,
}
