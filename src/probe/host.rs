//! Access to the running instance, behind a trait so checks can be exercised
//! against a fake host in tests.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::{AccessFlags, Gid, Group, Uid, User, access, getegid, geteuid, getgroups};

use crate::cmd::{Cmd, Outcome};
use crate::sandbox::mounts::{self, MountEntry, MountInfoError};

/// What the probe and the entry guard need to know about the instance.
pub trait Host {
    fn effective_uid(&self) -> u32;

    fn user_name(&self, uid: u32) -> Option<String>;

    /// Names of the groups the current process belongs to.
    fn group_names(&self) -> Vec<String>;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    fn find_in_path(&self, program: &str) -> Option<PathBuf>;

    fn run(&self, program: &str, args: &[&str]) -> io::Result<Outcome>;

    fn env_var(&self, name: &str) -> Option<String>;

    fn mounts(&self) -> Result<Vec<MountEntry>, MountInfoError>;

    /// `access(2)` with `W_OK`; never writes anything.
    fn can_write(&self, path: &Path) -> bool;
}

/// The real instance the process is running in.
pub struct LiveHost {
    timeout: Duration,
}

impl LiveHost {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Host for LiveHost {
    fn effective_uid(&self) -> u32 {
        geteuid().as_raw()
    }

    fn user_name(&self, uid: u32) -> Option<String> {
        User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
    }

    fn group_names(&self) -> Vec<String> {
        let mut gids = getgroups().unwrap_or_default();
        let egid = getegid();
        if !gids.contains(&egid) {
            gids.push(egid);
        }
        gids.into_iter()
            .filter_map(|gid: Gid| Group::from_gid(gid).ok().flatten())
            .map(|g| g.name)
            .collect()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(path)?
            .map(|e| e.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    fn find_in_path(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    fn run(&self, program: &str, args: &[&str]) -> io::Result<Outcome> {
        Cmd::new(program).args(args).timeout(self.timeout).capture()
    }

    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn mounts(&self) -> Result<Vec<MountEntry>, MountInfoError> {
        mounts::read_self()
    }

    fn can_write(&self, path: &Path) -> bool {
        access(path, AccessFlags::W_OK).is_ok()
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory host for tests.

    use std::cell::RefCell;
    use std::collections::{BTreeMap, BTreeSet, HashMap};

    use super::*;
    use crate::sandbox::mounts::parse_mountinfo;

    #[derive(Default)]
    pub struct FakeHost {
        pub uid: u32,
        pub users: HashMap<u32, String>,
        pub groups: Vec<String>,
        /// Readable files and their contents.
        pub files: BTreeMap<PathBuf, String>,
        /// Files that exist but cannot be read.
        pub unreadable: BTreeSet<PathBuf>,
        pub dirs: BTreeSet<PathBuf>,
        pub programs: BTreeMap<String, PathBuf>,
        /// Outcomes keyed by "program arg arg".
        pub outcomes: HashMap<String, Outcome>,
        pub env: HashMap<String, String>,
        pub mountinfo: String,
        pub writable: BTreeSet<PathBuf>,
        /// Every command line `run` was asked to execute.
        pub ran: RefCell<Vec<String>>,
    }

    impl FakeHost {
        /// A correctly built sandbox instance with the workspace bind-mounted.
        pub fn healthy() -> Self {
            let mut host = FakeHost {
                uid: 1000,
                groups: vec!["lethe".to_string()],
                mountinfo: "\
1 0 0:1 / / rw - overlay overlay rw
2 1 8:1 /home/op/ws /workspace rw,relatime - ext4 /dev/sda1 rw
"
                .to_string(),
                ..Default::default()
            };
            host.users.insert(0, "root".to_string());
            host.users.insert(1000, "lethe".to_string());
            host.files.insert(PathBuf::from("/.dockerenv"), String::new());
            host.dirs.insert(PathBuf::from("/app/config"));
            host.dirs.insert(PathBuf::from("/workspace"));
            for p in ["/workspace", "/workspace/data/memory", "/app"] {
                host.writable.insert(PathBuf::from(p));
            }
            host.programs
                .insert("apt-get".to_string(), PathBuf::from("/usr/bin/apt-get"));
            host.outcomes.insert(
                "apt-get update".to_string(),
                Outcome {
                    exit_code: Some(100),
                    stderr: "E: Could not open lock file /var/lib/apt/lists/lock - open (13: Permission denied)\n".to_string(),
                    ..Default::default()
                },
            );
            for (k, v) in [
                ("WORKSPACE_DIR", "/workspace"),
                ("MEMORY_DIR", "/workspace/data/memory"),
                ("LETHE_CONFIG_DIR", "/app/config"),
            ] {
                host.env.insert(k.to_string(), v.to_string());
            }
            host
        }

        pub fn with_sudo(mut self) -> Self {
            self.programs
                .insert("sudo".to_string(), PathBuf::from("/usr/bin/sudo"));
            self
        }
    }

    impl Host for FakeHost {
        fn effective_uid(&self) -> u32 {
            self.uid
        }

        fn user_name(&self, uid: u32) -> Option<String> {
            self.users.get(&uid).cloned()
        }

        fn group_names(&self) -> Vec<String> {
            self.groups.clone()
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.contains_key(path)
                || self.unreadable.contains(path)
                || self.dirs.contains(path)
        }

        fn is_dir(&self, path: &Path) -> bool {
            self.dirs.contains(path)
        }

        fn read_to_string(&self, path: &Path) -> io::Result<String> {
            if self.unreadable.contains(path) {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
            if !self.dirs.contains(path) {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            Ok(self
                .files
                .keys()
                .chain(self.unreadable.iter())
                .chain(self.dirs.iter())
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect())
        }

        fn find_in_path(&self, program: &str) -> Option<PathBuf> {
            self.programs.get(program).cloned()
        }

        fn run(&self, program: &str, args: &[&str]) -> io::Result<Outcome> {
            let line = std::iter::once(program)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            self.ran.borrow_mut().push(line.clone());
            if !self.programs.contains_key(program) {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            Ok(self.outcomes.get(&line).cloned().unwrap_or(Outcome {
                exit_code: Some(1),
                stderr: format!("{}: not permitted\n", program),
                ..Default::default()
            }))
        }

        fn env_var(&self, name: &str) -> Option<String> {
            self.env.get(name).cloned()
        }

        fn mounts(&self) -> Result<Vec<MountEntry>, MountInfoError> {
            parse_mountinfo(&self.mountinfo)
        }

        fn can_write(&self, path: &Path) -> bool {
            self.writable.contains(path)
        }
    }
}
