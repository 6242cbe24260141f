//! Typed resource addressing.
//!
//! Every mutation targets a [`ResourceKey`]: a tagged union over the resource
//! kinds, each with its own canonical string form. Permission patterns
//! ([`ResourcePattern`]) are matched against that canonical form with
//! kind-specific rules:
//!
//! | Kind       | Canonical body                    | Case       | Prefix separator |
//! |------------|-----------------------------------|------------|------------------|
//! | `registry` | `HKCU\Software\Vendor\ValueName`  | insensitive| `\`              |
//! | `service`  | service name                      | insensitive| none             |
//! | `firewall` | rule name                         | insensitive| none             |
//! | `task`     | task name                         | insensitive| none             |
//! | `process`  | full command line                 | sensitive  | `/`, `\` or space |
//!
//! The full canonical key is `{kind}:{body}`, e.g. `registry:HKCU\Software\Test\v1`.
//!
//! Commands run through the platform shell, so prefix and glob patterns only
//! cover plain commands. A command containing shell control characters
//! (`;`, `|`, `&`, redirections, substitutions) matches nothing but an exact
//! grant on the whole command line.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{SysgateError, SysgateResult};

/// Name used for a registry key's unnamed (default) value.
pub const DEFAULT_VALUE_NAME: &str = "(Default)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Registry,
    Service,
    Firewall,
    Task,
    Process,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Registry => "registry",
            ResourceKind::Service => "service",
            ResourceKind::Firewall => "firewall",
            ResourceKind::Task => "task",
            ResourceKind::Process => "process",
        }
    }

    pub fn from_prefix(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "registry" | "reg" => Some(ResourceKind::Registry),
            "service" | "svc" => Some(ResourceKind::Service),
            "firewall" | "fw" => Some(ResourceKind::Firewall),
            "task" => Some(ResourceKind::Task),
            "process" | "proc" => Some(ResourceKind::Process),
            _ => None,
        }
    }

    /// Whether names of this kind compare case-sensitively.
    pub fn case_sensitive(&self) -> bool {
        matches!(self, ResourceKind::Process)
    }

    /// Hierarchy separators that make prefix patterns meaningful for this kind.
    fn separators(&self) -> &'static [u8] {
        match self {
            ResourceKind::Registry => b"\\",
            ResourceKind::Process => b"/\\ ",
            _ => b"",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry root hive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hive {
    CurrentUser,
    LocalMachine,
    ClassesRoot,
    Users,
    CurrentConfig,
}

impl Hive {
    pub fn short_name(&self) -> &'static str {
        match self {
            Hive::CurrentUser => "HKCU",
            Hive::LocalMachine => "HKLM",
            Hive::ClassesRoot => "HKCR",
            Hive::Users => "HKU",
            Hive::CurrentConfig => "HKCC",
        }
    }

    /// Accepts both the short (`HKCU`) and long (`HKEY_CURRENT_USER`) forms.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HKCU" | "HKEY_CURRENT_USER" => Some(Hive::CurrentUser),
            "HKLM" | "HKEY_LOCAL_MACHINE" => Some(Hive::LocalMachine),
            "HKCR" | "HKEY_CLASSES_ROOT" => Some(Hive::ClassesRoot),
            "HKU" | "HKEY_USERS" => Some(Hive::Users),
            "HKCC" | "HKEY_CURRENT_CONFIG" => Some(Hive::CurrentConfig),
            _ => None,
        }
    }

    /// Hives whose writes affect every user on the machine and need elevation.
    pub fn is_machine_wide(&self) -> bool {
        !matches!(self, Hive::CurrentUser)
    }
}

/// A single named value inside a registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryLocation {
    pub hive: Hive,
    /// Subkey path below the hive, `\`-separated, no leading or trailing separator.
    pub key: String,
    /// Value name; [`DEFAULT_VALUE_NAME`] addresses the key's default value.
    pub value: String,
}

impl RegistryLocation {
    /// Parse a key path such as `HKEY_CURRENT_USER\Software\Test` plus a value name.
    pub fn parse(key_path: &str, value: &str) -> SysgateResult<Self> {
        let segments = split_registry_path(key_path);
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| SysgateError::InvalidRequest("empty registry key path".into()))?;
        let hive = Hive::parse(first).ok_or_else(|| {
            SysgateError::InvalidRequest(format!("unknown registry hive '{}'", first))
        })?;
        if rest.is_empty() {
            return Err(SysgateError::InvalidRequest(format!(
                "registry key must name a subkey under {}",
                hive.short_name()
            )));
        }
        for segment in rest {
            validate_registry_segment(segment)?;
        }
        let value = value.trim();
        let value = if value.is_empty() {
            DEFAULT_VALUE_NAME.to_string()
        } else {
            validate_registry_segment(value)?;
            value.to_string()
        };
        Ok(Self {
            hive,
            key: rest.join("\\"),
            value,
        })
    }

    /// `HKCU\Software\Test`, the form `reg.exe` expects.
    pub fn key_path(&self) -> String {
        format!("{}\\{}", self.hive.short_name(), self.key)
    }

    /// `None` when addressing the default value.
    pub fn value_name(&self) -> Option<&str> {
        if self.value == DEFAULT_VALUE_NAME {
            None
        } else {
            Some(&self.value)
        }
    }
}

fn split_registry_path(path: &str) -> Vec<&str> {
    path.split(['\\', '/'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn validate_registry_segment(segment: &str) -> SysgateResult<()> {
    if segment.chars().any(|c| c.is_control() || c == '"') {
        return Err(SysgateError::InvalidRequest(format!(
            "registry path segment contains forbidden characters: {:?}",
            segment
        )));
    }
    Ok(())
}

/// Canonical form of a registry path body: short hive name, `\` separators.
/// Segments that are not a hive (e.g. a leading `*` in a glob) are left alone.
fn canonical_registry_body(body: &str) -> String {
    let segments = split_registry_path(body);
    let mut out: Vec<String> = Vec::with_capacity(segments.len());
    for (i, segment) in segments.iter().enumerate() {
        match (i, Hive::parse(segment)) {
            (0, Some(hive)) => out.push(hive.short_name().to_string()),
            _ => out.push((*segment).to_string()),
        }
    }
    out.join("\\")
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _.\-]{0,255}$").unwrap())
}

/// Service, firewall rule, and task names are passed verbatim to platform
/// tools, so they are restricted to a conservative character set.
pub fn validate_name(kind: ResourceKind, name: &str) -> SysgateResult<()> {
    if name_regex().is_match(name) {
        Ok(())
    } else {
        Err(SysgateError::InvalidRequest(format!(
            "invalid {} name '{}'",
            kind, name
        )))
    }
}

/// The identity of a mutable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceKey {
    Registry(RegistryLocation),
    Service { name: String },
    Firewall { name: String },
    Task { name: String },
    Process { command: String },
}

impl ResourceKey {
    pub fn registry(key_path: &str, value: &str) -> SysgateResult<Self> {
        RegistryLocation::parse(key_path, value).map(ResourceKey::Registry)
    }

    pub fn service(name: &str) -> SysgateResult<Self> {
        let name = name.trim();
        validate_name(ResourceKind::Service, name)?;
        Ok(ResourceKey::Service { name: name.to_string() })
    }

    pub fn firewall(name: &str) -> SysgateResult<Self> {
        let name = name.trim();
        validate_name(ResourceKind::Firewall, name)?;
        Ok(ResourceKey::Firewall { name: name.to_string() })
    }

    pub fn task(name: &str) -> SysgateResult<Self> {
        let name = name.trim();
        validate_name(ResourceKind::Task, name)?;
        Ok(ResourceKey::Task { name: name.to_string() })
    }

    /// Key for launching `command`: the whole command line, trimmed.
    pub fn process_for_command(command: &str) -> SysgateResult<Self> {
        let command = command.trim();
        if command.is_empty() {
            return Err(SysgateError::InvalidRequest("empty command".into()));
        }
        Ok(ResourceKey::Process {
            command: command.to_string(),
        })
    }

    /// Parse a canonical key (`service:wuauserv`, `registry:HKCU\...\Value`).
    /// The `registry:` prefix may be omitted when the body starts with a hive.
    pub fn parse(raw: &str) -> SysgateResult<Self> {
        let raw = raw.trim();
        let (kind, body) = match raw.split_once(':') {
            Some((prefix, rest)) if ResourceKind::from_prefix(prefix).is_some() => {
                (ResourceKind::from_prefix(prefix), rest)
            }
            _ => (None, raw),
        };
        let kind = match kind {
            Some(k) => k,
            None if starts_with_hive(body) => ResourceKind::Registry,
            None => {
                return Err(SysgateError::InvalidRequest(format!(
                    "resource key '{}' has no kind prefix",
                    raw
                )))
            }
        };
        match kind {
            ResourceKind::Registry => {
                let segments = split_registry_path(body);
                match segments.split_last() {
                    Some((value, key)) if key.len() >= 2 => {
                        ResourceKey::registry(&key.join("\\"), value)
                    }
                    _ => Err(SysgateError::InvalidRequest(format!(
                        "registry key '{}' must be HIVE\\Key\\Value",
                        body
                    ))),
                }
            }
            ResourceKind::Service => ResourceKey::service(body),
            ResourceKind::Firewall => ResourceKey::firewall(body),
            ResourceKind::Task => ResourceKey::task(body),
            ResourceKind::Process => ResourceKey::process_for_command(body),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceKey::Registry(_) => ResourceKind::Registry,
            ResourceKey::Service { .. } => ResourceKind::Service,
            ResourceKey::Firewall { .. } => ResourceKind::Firewall,
            ResourceKey::Task { .. } => ResourceKind::Task,
            ResourceKey::Process { .. } => ResourceKind::Process,
        }
    }

    /// Canonical identifier without the kind prefix.
    pub fn body(&self) -> String {
        match self {
            ResourceKey::Registry(loc) => format!("{}\\{}", loc.key_path(), loc.value),
            ResourceKey::Service { name }
            | ResourceKey::Firewall { name }
            | ResourceKey::Task { name } => name.clone(),
            ResourceKey::Process { command } => command.clone(),
        }
    }

    /// `{kind}:{body}`, the string used for locking, journaling and auditing.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.kind(), self.body())
    }

    /// Identity used for per-key locking. Names of case-insensitive kinds
    /// fold to lowercase so `HKCU\Foo` and `hkcu\foo` serialize together.
    pub fn lock_id(&self) -> String {
        if self.kind().case_sensitive() {
            self.canonical()
        } else {
            self.canonical().to_lowercase()
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Characters that let a shell run more than the command's own program.
const SHELL_CONTROL: &[char] = &[';', '&', '|', '<', '>', '`', '$', '(', ')', '\n', '\r'];

/// Whether `command` is a single program invocation with arguments.
pub fn is_plain_command(command: &str) -> bool {
    !command.contains(SHELL_CONTROL)
}

fn starts_with_hive(body: &str) -> bool {
    split_registry_path(body)
        .first()
        .is_some_and(|s| Hive::parse(s).is_some())
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// How a pattern matched a key. Ordered from least to most specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    Glob,
    Prefix,
    Exact,
}

/// Ordering key for competing matches: tier first, then pattern length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    pub tier: MatchTier,
    pub len: usize,
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal,
    Glob(glob::Pattern),
}

/// A permission target: an exact key, a path prefix, or a name glob,
/// optionally restricted to one resource kind.
#[derive(Debug, Clone)]
pub struct ResourcePattern {
    kind: Option<ResourceKind>,
    body: String,
    matcher: Matcher,
}

impl ResourcePattern {
    pub fn parse(raw: &str) -> SysgateResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SysgateError::InvalidRequest("empty resource pattern".into()));
        }

        let (mut kind, body) = match raw.split_once(':') {
            Some((prefix, rest)) if ResourceKind::from_prefix(prefix).is_some() => {
                (ResourceKind::from_prefix(prefix), rest.trim())
            }
            _ => (None, raw),
        };
        if kind.is_none() && starts_with_hive(body) {
            kind = Some(ResourceKind::Registry);
        }

        let body = match kind {
            Some(ResourceKind::Registry) => canonical_registry_body(body),
            _ => body.to_string(),
        };
        if body.is_empty() {
            return Err(SysgateError::InvalidRequest(format!(
                "resource pattern '{}' has an empty body",
                raw
            )));
        }

        let matcher = if body.contains(['*', '?', '[']) {
            let pattern = glob::Pattern::new(&body).map_err(|e| {
                SysgateError::InvalidRequest(format!("invalid glob '{}': {}", body, e))
            })?;
            Matcher::Glob(pattern)
        } else {
            Matcher::Literal
        };

        Ok(Self { kind, body, matcher })
    }

    /// Pattern matching every resource of `kind`.
    pub fn any_of(kind: ResourceKind) -> Self {
        Self {
            kind: Some(kind),
            body: "*".to_string(),
            // `*` always compiles
            matcher: Matcher::Glob(glob::Pattern::new("*").unwrap()),
        }
    }

    pub fn kind(&self) -> Option<ResourceKind> {
        self.kind
    }

    /// Returns how specifically this pattern covers `key`, or `None` if it doesn't.
    pub fn matches(&self, key: &ResourceKey) -> Option<Specificity> {
        let kind = key.kind();
        if self.kind.is_some_and(|k| k != kind) {
            return None;
        }
        let body = key.body();
        let case_sensitive = kind.case_sensitive();

        if bytes_eq(body.as_bytes(), self.body.as_bytes(), case_sensitive) {
            return Some(Specificity {
                tier: MatchTier::Exact,
                len: self.body.len(),
            });
        }
        // Anything short of the exact command line must not reach a compound command
        if kind == ResourceKind::Process && !is_plain_command(&body) {
            return None;
        }

        match &self.matcher {
            Matcher::Literal => {
                let pat = self.body.as_bytes();
                let target = body.as_bytes();
                if target.len() <= pat.len() || !bytes_eq(&target[..pat.len()], pat, case_sensitive) {
                    return None;
                }
                let boundary = target[pat.len()];
                if kind.separators().contains(&boundary) {
                    Some(Specificity {
                        tier: MatchTier::Prefix,
                        len: pat.len(),
                    })
                } else {
                    None
                }
            }
            Matcher::Glob(pattern) => {
                let options = glob::MatchOptions {
                    case_sensitive,
                    require_literal_separator: false,
                    require_literal_leading_dot: false,
                };
                pattern.matches_with(&body, options).then_some(Specificity {
                    tier: MatchTier::Glob,
                    len: self.body.len(),
                })
            }
        }
    }
}

fn bytes_eq(a: &[u8], b: &[u8], case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.eq_ignore_ascii_case(b)
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{}:{}", kind, self.body),
            None => f.write_str(&self.body),
        }
    }
}
