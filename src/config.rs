//! World configuration.
//!
//! A [`WorldConfig`] is passed explicitly to [`World::create`] and
//! [`World::join`] instead of living in process-global state, so two worlds
//! in one process can use different settings.
//!
//! [`World::create`]: crate::world::World::create
//! [`World::join`]: crate::world::World::join

use std::path::PathBuf;

/// Settings applied when creating or joining a world.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Directory holding the pool backing files. Should live on a tmpfs
    /// mount; pages are only committed when touched.
    pub tmpfs_dir: PathBuf,

    /// Restrict backing files to the owner instead of applying
    /// [`shmfile_mode`](Self::shmfile_mode) / [`shmfile_gid`](Self::shmfile_gid).
    pub secure: bool,

    /// Punch holes (`MADV_REMOVE`) in freed whole-block ranges so tmpfs
    /// pages are returned to the kernel immediately.
    pub madv_remove: bool,

    /// File mode for pool backing files when not running secure.
    pub shmfile_mode: u32,

    /// Optional group owner for pool backing files when not running secure.
    pub shmfile_gid: Option<u32>,

    /// Size of the main pool created with the world, in bytes.
    pub main_pool_size: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            tmpfs_dir: PathBuf::from("/dev/shm"),
            secure: false,
            madv_remove: true,
            shmfile_mode: 0o660,
            shmfile_gid: None,
            main_pool_size: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_points_at_dev_shm() {
        let cfg = WorldConfig::default();
        assert_eq!(cfg.tmpfs_dir, PathBuf::from("/dev/shm"));
        assert!(cfg.madv_remove);
        assert!(!cfg.secure);
    }
}
