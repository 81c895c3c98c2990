//! The individual containment checks. Each one is independent, read-only
//! (apart from the two elevation attempts) and never aborts the probe.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::host::Host;
use super::report::{Finding, Verdict};
use crate::cmd::Outcome;
use crate::sandbox::contract::{EnvContract, EnvVar};
use crate::sandbox::layout::Layout;
use crate::sandbox::mounts;

const CONTAINER_MARKERS: &[&str] = &["/.dockerenv", "/run/.containerenv"];
const SUDOERS: &str = "/etc/sudoers";
const SUDOERS_DIR: &str = "/etc/sudoers.d";
const SYSTEM_PATHS: &[&str] = &["/", "/etc", "/usr", "/bin"];

static NOPASSWD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"NOPASSWD\s*:").expect("valid regex"));
static PASSWD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bPASSWD\s*:").expect("valid regex"));
static LIST_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*,\s*").expect("valid regex"));
static USER_ALIAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^User_Alias\s+([A-Z][A-Z0-9_]*)\s*=\s*(.+)$").expect("valid regex")
});
static DEFAULTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Defaults(?:([:@>!])(\S+))?\s+(.+)$").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckId {
    Identity,
    ContainerMarker,
    SudoOnPath,
    SudoersPolicy,
    SudoNonInteractive,
    PackageIndexUpdate,
    WorkspaceMount,
    ConfigSurface,
    WorkspaceWritable,
    SystemPathsReadOnly,
}

impl CheckId {
    /// Report order.
    pub const ALL: [CheckId; 10] = [
        CheckId::Identity,
        CheckId::ContainerMarker,
        CheckId::SudoOnPath,
        CheckId::SudoersPolicy,
        CheckId::SudoNonInteractive,
        CheckId::PackageIndexUpdate,
        CheckId::WorkspaceMount,
        CheckId::ConfigSurface,
        CheckId::WorkspaceWritable,
        CheckId::SystemPathsReadOnly,
    ];

    pub fn number(self) -> usize {
        Self::ALL
            .iter()
            .position(|c| *c == self)
            .map_or(0, |i| i + 1)
    }

    pub fn title(self) -> &'static str {
        match self {
            CheckId::Identity => "Effective identity",
            CheckId::ContainerMarker => "Container marker",
            CheckId::SudoOnPath => "Elevation tool on PATH",
            CheckId::SudoersPolicy => "Elevation policy",
            CheckId::SudoNonInteractive => "Non-interactive sudo",
            CheckId::PackageIndexUpdate => "Package index update",
            CheckId::WorkspaceMount => "Workspace mount",
            CheckId::ConfigSurface => "Configuration surface",
            CheckId::WorkspaceWritable => "Workspace writable",
            CheckId::SystemPathsReadOnly => "System paths read-only",
        }
    }

    pub fn run(self, host: &dyn Host) -> Finding {
        let (verdict, detail) = match self {
            CheckId::Identity => identity(host),
            CheckId::ContainerMarker => container_marker(host),
            CheckId::SudoOnPath => sudo_on_path(host),
            CheckId::SudoersPolicy => sudoers_policy(host),
            CheckId::SudoNonInteractive => sudo_non_interactive(host),
            CheckId::PackageIndexUpdate => package_index_update(host),
            CheckId::WorkspaceMount => workspace_mount(host),
            CheckId::ConfigSurface => config_surface(host),
            CheckId::WorkspaceWritable => workspace_writable(host),
            CheckId::SystemPathsReadOnly => system_paths_read_only(host),
        };
        debug!(check = ?self, verdict = verdict.label(), "probe:check");
        Finding::new(self, verdict, detail)
    }
}

type Check = (Verdict, Vec<String>);

fn identity(host: &dyn Host) -> Check {
    let uid = host.effective_uid();
    let name = host.user_name(uid).unwrap_or_else(|| "?".to_string());
    let line = format!("uid={} ({})", uid, name);
    if uid == 0 {
        (Verdict::Fail, vec![line, "running as root".to_string()])
    } else {
        (Verdict::Pass, vec![line])
    }
}

fn container_marker(host: &dyn Host) -> Check {
    let found: Vec<&str> = CONTAINER_MARKERS
        .iter()
        .copied()
        .filter(|m| host.exists(Path::new(m)))
        .collect();
    if found.is_empty() {
        (
            Verdict::Fail,
            vec![format!(
                "none of {} present; this may not be a container",
                CONTAINER_MARKERS.join(", ")
            )],
        )
    } else {
        (
            Verdict::Pass,
            found.iter().map(|m| format!("found {}", m)).collect(),
        )
    }
}

fn sudo_on_path(host: &dyn Host) -> Check {
    match host.find_in_path("sudo") {
        Some(path) => (
            Verdict::Fail,
            vec![format!("sudo found at {}", path.display())],
        ),
        None => (Verdict::Pass, vec!["sudo not found on PATH".to_string()]),
    }
}

fn sudoers_policy(host: &dyn Host) -> Check {
    let mut files = Vec::new();
    let mut unreadable = Vec::new();

    let main = PathBuf::from(SUDOERS);
    if host.exists(&main) {
        files.push(main);
    }
    match host.list_dir(Path::new(SUDOERS_DIR)) {
        Ok(entries) => files.extend(
            entries
                .into_iter()
                .filter(|p| is_included(p) && !host.is_dir(p)),
        ),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(_) => unreadable.push(SUDOERS_DIR.to_string()),
    }

    let uid = host.effective_uid();
    let principal = Principal {
        uid,
        name: host.user_name(uid),
        groups: host.group_names(),
    };

    let mut grants = Vec::new();
    let mut read = 0;
    for file in &files {
        match host.read_to_string(file) {
            Ok(text) => {
                read += 1;
                for rule in passwordless_rules_for(&text, &principal) {
                    grants.push(format!("{}: {}", file.display(), rule));
                }
            }
            Err(_) => unreadable.push(file.display().to_string()),
        }
    }

    let mut detail = Vec::new();
    if files.is_empty() && unreadable.is_empty() {
        detail.push("no sudo policy files present".to_string());
    } else {
        detail.push(format!("{} policy file(s) read", read));
    }
    detail.extend(unreadable.iter().map(|p| format!("unreadable: {}", p)));

    if !grants.is_empty() {
        detail.push("passwordless rules apply to the running user:".to_string());
        detail.extend(grants.into_iter().map(|g| format!("  {}", g)));
        (Verdict::Fail, detail)
    } else if !unreadable.is_empty() {
        (Verdict::Unknown, detail)
    } else {
        detail.push("no passwordless rule applies to the running user".to_string());
        (Verdict::Pass, detail)
    }
}

/// sudo's `#includedir` skips names containing `.` or ending in `~`.
fn is_included(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.contains('.') && !n.ends_with('~'))
}

struct Principal {
    uid: u32,
    name: Option<String>,
    groups: Vec<String>,
}

impl Principal {
    fn matches(&self, token: &str, aliases: &HashMap<String, Vec<String>>) -> bool {
        if token == "ALL" {
            return true;
        }
        if let Some(members) = aliases.get(token) {
            return self.matches_list(members.iter().map(String::as_str), &HashMap::new());
        }
        if let Some(group) = token.strip_prefix("%:").or_else(|| token.strip_prefix('%')) {
            return self.groups.iter().any(|g| g == group);
        }
        if let Some(uid) = token.strip_prefix('#') {
            return uid.parse::<u32>().is_ok_and(|u| u == self.uid);
        }
        self.name.as_deref() == Some(token)
    }

    /// The last item that matches decides; a `!` on it excludes.
    fn matches_list<'a>(
        &self,
        items: impl IntoIterator<Item = &'a str>,
        aliases: &HashMap<String, Vec<String>>,
    ) -> bool {
        items.into_iter().fold(false, |matched, item| {
            let (negated, token) = match item.strip_prefix('!') {
                Some(rest) => (true, rest.trim_start()),
                None => (false, item),
            };
            if self.matches(token, aliases) {
                !negated
            } else {
                matched
            }
        })
    }
}

/// Whether `authenticate` ends up disabled for this principal. Settings scoped
/// to the user override the generic ones; host, runas and command scoped
/// settings count as generic.
fn authentication_disabled(
    lines: &[String],
    principal: &Principal,
    aliases: &HashMap<String, Vec<String>>,
) -> bool {
    let mut generic = None;
    let mut scoped = None;
    for line in lines {
        let line = LIST_SEPARATOR.replace_all(line, ",");
        let Some(caps) = DEFAULTS.captures(&line) else {
            continue;
        };
        let setting = caps[3].split(',').fold(None, |current, param| match param.trim() {
            "!authenticate" => Some(false),
            "authenticate" => Some(true),
            _ => current,
        });
        let Some(authenticate) = setting else {
            continue;
        };
        match (caps.get(1).map(|m| m.as_str()), caps.get(2)) {
            (Some(":"), Some(users)) => {
                if principal.matches_list(users.as_str().split(','), aliases) {
                    scoped = Some(authenticate);
                }
            }
            _ => generic = Some(authenticate),
        }
    }
    scoped.or(generic) == Some(false)
}

/// Rules that let this principal elevate without a password: those tagged
/// `NOPASSWD:`, or every rule once `!authenticate` applies to it, unless the
/// rule itself asks for `PASSWD:`. A rule applies when its user list names the
/// principal directly, through one of its groups, a `User_Alias` or `ALL`.
fn passwordless_rules_for(text: &str, principal: &Principal) -> Vec<String> {
    let lines = logical_lines(text);

    let mut aliases: HashMap<String, Vec<String>> = HashMap::new();
    for line in &lines {
        if let Some(caps) = USER_ALIAS.captures(line) {
            let members = LIST_SEPARATOR
                .split(caps[2].trim())
                .map(str::to_string)
                .collect();
            aliases.insert(caps[1].to_string(), members);
        }
    }
    let unauthenticated = authentication_disabled(&lines, principal, &aliases);

    lines
        .into_iter()
        .filter(|line| !is_directive(line))
        .filter(|line| {
            NOPASSWD.is_match(line) || (unauthenticated && !PASSWD.is_match(line))
        })
        .filter(|line| {
            let Some((spec, _)) = line.split_once('=') else {
                return false;
            };
            let spec = LIST_SEPARATOR.replace_all(spec.trim(), ",");
            let users = spec.split_whitespace().next().unwrap_or("");
            principal.matches_list(users.split(','), &aliases)
        })
        .collect()
}

/// Joins backslash continuations and drops comments and blank lines.
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for raw in text.lines() {
        let raw = raw.trim_end();
        if let Some(head) = raw.strip_suffix('\\') {
            current.push_str(head);
            current.push(' ');
            continue;
        }
        current.push_str(raw);
        let line = current.trim().to_string();
        current.clear();
        if line.is_empty() || is_comment(&line) {
            continue;
        }
        lines.push(line);
    }
    lines
}

/// `#123` at the start of a rule is a uid, not a comment.
fn is_comment(line: &str) -> bool {
    match line.strip_prefix('#') {
        Some(rest) => !rest.starts_with(|c: char| c.is_ascii_digit()),
        None => false,
    }
}

fn is_directive(line: &str) -> bool {
    line.starts_with("Defaults")
        || line.starts_with("@include")
        || ["User_Alias", "Runas_Alias", "Host_Alias", "Cmnd_Alias", "Cmd_Alias"]
            .iter()
            .any(|k| line.starts_with(k))
}

fn attempt(outcome: io::Result<Outcome>, what: &str) -> Check {
    match outcome {
        Err(e) => (
            Verdict::Unknown,
            vec![format!("could not run {}: {}", what, e)],
        ),
        Ok(o) if o.timed_out => (
            Verdict::Unknown,
            vec![format!("{} timed out", what)],
        ),
        Ok(o) if o.succeeded() => (
            Verdict::Fail,
            vec![format!("{} succeeded", what)],
        ),
        Ok(o) => {
            let mut detail = vec![format!(
                "{} failed (exit code {})",
                what,
                o.exit_code.map_or("none".to_string(), |c| c.to_string())
            )];
            let first = o.first_line();
            if !first.is_empty() {
                detail.push(first.to_string());
            }
            (Verdict::Pass, detail)
        }
    }
}

fn sudo_non_interactive(host: &dyn Host) -> Check {
    if host.find_in_path("sudo").is_none() {
        return (Verdict::Pass, vec!["sudo not installed".to_string()]);
    }
    attempt(host.run("sudo", &["-n", "true"]), "sudo -n true")
}

fn package_index_update(host: &dyn Host) -> Check {
    if host.find_in_path("sudo").is_some() {
        return attempt(
            host.run("sudo", &["-n", "apt-get", "update"]),
            "sudo -n apt-get update",
        );
    }
    if host.find_in_path("apt-get").is_some() {
        return attempt(host.run("apt-get", &["update"]), "apt-get update");
    }
    (
        Verdict::Pass,
        vec!["neither sudo nor apt-get is available".to_string()],
    )
}

/// The workspace root from the environment, or the built-in default.
fn workspace_root(host: &dyn Host) -> PathBuf {
    host.env_var(EnvVar::WorkspaceDir.name())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| Layout::default().workspace_root().to_path_buf())
}

fn workspace_mount(host: &dyn Host) -> Check {
    let root = workspace_root(host);
    let entries = match host.mounts() {
        Ok(entries) => entries,
        Err(e) => return (Verdict::Unknown, vec![e.to_string()]),
    };
    match mounts::mount_at(&entries, &root) {
        Some(entry) => {
            let mut detail = vec![format!(
                "{} is mounted from {} ({} on {})",
                root.display(),
                entry.root,
                entry.fs_type,
                entry.source
            )];
            if entry.is_read_only() {
                detail.push("mount is read-only".to_string());
            }
            (Verdict::Pass, detail)
        }
        None => (
            Verdict::Fail,
            vec![
                format!("{} is not a mount point", root.display()),
                "agent state lives in the container layer and is lost with the container"
                    .to_string(),
            ],
        ),
    }
}

fn config_surface(host: &dyn Host) -> Check {
    match EnvContract::from_lookup(|name| host.env_var(name)) {
        Ok(contract) => {
            let mut detail: Vec<String> = contract
                .entries()
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            let config = contract.path(EnvVar::ConfigDir);
            if !host.exists(config) {
                detail.push(format!("{} does not exist", config.display()));
                return (Verdict::Fail, detail);
            }
            (Verdict::Pass, detail)
        }
        Err(e) => (Verdict::Fail, vec![e.to_string()]),
    }
}

fn workspace_writable(host: &dyn Host) -> Check {
    let root = workspace_root(host);
    if host.can_write(&root) {
        (
            Verdict::Pass,
            vec![format!("{} is writable", root.display())],
        )
    } else {
        (
            Verdict::Fail,
            vec![format!("{} is not writable", root.display())],
        )
    }
}

fn system_paths_read_only(host: &dyn Host) -> Check {
    let writable: Vec<&str> = SYSTEM_PATHS
        .iter()
        .copied()
        .filter(|p| host.can_write(Path::new(p)))
        .collect();
    if writable.is_empty() {
        (
            Verdict::Pass,
            vec![format!("none of {} writable", SYSTEM_PATHS.join(", "))],
        )
    } else {
        (
            Verdict::Fail,
            writable.iter().map(|p| format!("{} is writable", p)).collect(),
        )
    }
}
