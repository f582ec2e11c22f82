//! Mount argument construction for hmdfs instances
//!
//! An hmdfs mount is described by the owning user, the account (or auth
//! group) it serves, and a handful of feature switches that become entries
//! in the mount option string. All of the daemon's well-known paths — the
//! backing source tree, the mount destination, the cache directory, and the
//! kernel control file — are derived from these fields.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Everything needed to mount one hmdfs instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountArgument {
    pub user_id: i32,
    /// Account name, or the auth-group id for accountless mounts
    pub relative_path: String,
    pub accountless: bool,
    pub need_init_dir: bool,
    pub use_cache: bool,
    pub case_sensitive: bool,
    pub enable_merge_view: bool,
    pub enable_fixup_ownership: bool,
    pub enable_offline_stash: bool,
    pub external_fs: bool,
    /// Override for the kernel control node, used when the node is managed
    /// externally (and by tests, which point it at a scratch file)
    #[serde(default)]
    pub ctrl_path_override: Option<PathBuf>,
}

/* Mocklisp hash, as used by the kernel to name the control directory. */
fn mocklisp_hash(s: &str) -> u64 {
    let mut res: u64 = 0;
    for ch in s.bytes() {
        res = (res << 5).wrapping_sub(res).wrapping_add(u64::from(ch));
    }
    res
}

impl MountArgument {
    pub fn full_src(&self) -> String {
        if !self.accountless {
            format!("/data/misc_ce/{}/hmdfs/storage", self.user_id)
        } else {
            format!(
                "/data/misc_ce/{}/hmdfs/auth_groups/{}",
                self.user_id, self.relative_path
            )
        }
    }

    pub fn full_dst(&self) -> String {
        if !self.accountless {
            format!("/mnt/hmdfs/{}/", self.user_id)
        } else {
            format!("/mnt/hmdfs/auth_groups/{}/", self.relative_path)
        }
    }

    pub fn cache_path(&self) -> String {
        if !self.accountless {
            format!("/data/misc_ce/{}/hmdfs/cache/", self.user_id)
        } else {
            format!(
                "/data/misc_ce/{}/hmdfs/auth_groups/{}/cache/",
                self.user_id, self.relative_path
            )
        }
    }

    pub fn ctrl_path(&self) -> PathBuf {
        if let Some(ref path) = self.ctrl_path_override {
            return path.clone();
        }
        let hash = mocklisp_hash(&self.full_dst());
        PathBuf::from(format!("/sys/fs/hmdfs/{hash}/cmd"))
    }

    /// Option string handed to mount(2)
    pub fn options_string(&self) -> String {
        let mut opts = format!("local_dst={}", self.full_dst());
        if self.use_cache {
            opts.push_str(&format!(",cache_dir={}", self.cache_path()));
        }
        if self.case_sensitive {
            opts.push_str(",sensitive");
        }
        if self.enable_merge_view {
            opts.push_str(",merge");
        }
        if self.enable_fixup_ownership {
            opts.push_str(",fixupownership");
        }
        if !self.enable_offline_stash {
            opts.push_str(",no_offline_stash");
        }
        if self.external_fs {
            opts.push_str(",external_fs");
        }
        opts
    }

    pub fn flags(&self) -> u64 {
        0
    }
}

/// Well-known mount-argument presets
pub struct MountArgumentDescriptors;

impl MountArgumentDescriptors {
    /// The per-user default hmdfs instance
    pub fn alpha(user_id: i32, relative_path: impl Into<String>) -> MountArgument {
        MountArgument {
            user_id,
            relative_path: relative_path.into(),
            accountless: false,
            need_init_dir: true,
            use_cache: true,
            case_sensitive: false,
            enable_merge_view: true,
            enable_fixup_ownership: true,
            enable_offline_stash: true,
            external_fs: false,
            ctrl_path_override: None,
        }
    }

    /// An accountless auth-group instance
    pub fn auth_group(group_id: impl Into<String>) -> MountArgument {
        MountArgument {
            user_id: 0,
            relative_path: group_id.into(),
            accountless: true,
            need_init_dir: true,
            use_cache: true,
            case_sensitive: false,
            enable_merge_view: true,
            enable_fixup_ownership: true,
            enable_offline_stash: true,
            external_fs: false,
            ctrl_path_override: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpha_paths() {
        let arg = MountArgumentDescriptors::alpha(100, "account");
        assert_eq!(arg.full_src(), "/data/misc_ce/100/hmdfs/storage");
        assert_eq!(arg.full_dst(), "/mnt/hmdfs/100/");
        assert_eq!(arg.cache_path(), "/data/misc_ce/100/hmdfs/cache/");
    }

    #[test]
    fn test_auth_group_paths() {
        let arg = MountArgumentDescriptors::auth_group("g-123");
        assert_eq!(
            arg.full_src(),
            "/data/misc_ce/0/hmdfs/auth_groups/g-123"
        );
        assert_eq!(arg.full_dst(), "/mnt/hmdfs/auth_groups/g-123/");
    }

    #[test]
    fn test_options_string() {
        let arg = MountArgumentDescriptors::alpha(100, "account");
        assert_eq!(
            arg.options_string(),
            "local_dst=/mnt/hmdfs/100/,cache_dir=/data/misc_ce/100/hmdfs/cache/,merge,fixupownership"
        );

        let mut arg = arg;
        arg.case_sensitive = true;
        arg.enable_offline_stash = false;
        arg.external_fs = true;
        let opts = arg.options_string();
        assert!(opts.contains(",sensitive"));
        assert!(opts.contains(",no_offline_stash"));
        assert!(opts.ends_with(",external_fs"));
    }

    #[test]
    fn test_ctrl_path_is_stable() {
        let a = MountArgumentDescriptors::alpha(100, "account");
        let b = MountArgumentDescriptors::alpha(100, "account");
        assert_eq!(a.ctrl_path(), b.ctrl_path());
        assert!(a.ctrl_path().starts_with("/sys/fs/hmdfs"));

        let other = MountArgumentDescriptors::alpha(101, "account");
        assert_ne!(a.ctrl_path(), other.ctrl_path());
    }

    #[test]
    fn test_ctrl_path_override() {
        let mut arg = MountArgumentDescriptors::alpha(100, "account");
        arg.ctrl_path_override = Some(PathBuf::from("/tmp/ctrl"));
        assert_eq!(arg.ctrl_path(), PathBuf::from("/tmp/ctrl"));
    }
}
