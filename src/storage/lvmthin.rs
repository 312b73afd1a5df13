use std::path::PathBuf;

use crate::config::StorageDefaults;
use crate::error::{AgentError, Result};
use crate::spec::Spec;

use super::{looks_like_raw_fs_image, run_command, run_command_stdout, StorageBackend};

/// A thin-provisioned snapshot per VM taken from a shared base volume that
/// is populated once per source image and reused thereafter.
pub struct LvmThinBackend {
    defaults: StorageDefaults,
    device_path: PathBuf,
}

impl LvmThinBackend {
    pub fn new(defaults: StorageDefaults, device_path: PathBuf) -> Self {
        Self {
            defaults,
            device_path,
        }
    }

    fn volume_group(&self) -> &str {
        self.defaults.volume_group.as_deref().unwrap_or("fc-hostd")
    }

    fn thinpool(&self) -> &str {
        self.defaults.thinpool.as_deref().unwrap_or("thinpool")
    }

    fn base_name(&self, spec: &Spec) -> String {
        let stem = PathBuf::from(&spec.rootfs_image_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        format!("base-{stem}")
    }

    fn snapshot_name(&self, spec: &Spec) -> String {
        format!("vm-{}", spec.name)
    }

    fn lv_exists(&self, name: &str) -> Result<bool> {
        match run_command_stdout(
            "lvs",
            &["--noheadings", "-o", "lv_name", self.volume_group()],
        ) {
            Ok(out) => Ok(out.lines().any(|l| l.trim() == name)),
            Err(_) => Ok(false),
        }
    }

    fn ensure_base(&self, spec: &Spec) -> Result<()> {
        let base = self.base_name(spec);
        if self.lv_exists(&base)? {
            return Ok(());
        }
        let source = PathBuf::from(&spec.rootfs_image_path);
        if !source.exists() {
            return Err(AgentError::NotFound(format!(
                "source image {} not found",
                source.display()
            )));
        }
        run_command(
            "lvcreate",
            &[
                "-T",
                &format!("{}/{}", self.volume_group(), self.thinpool()),
                "-V",
                spec.storage.size.as_deref().unwrap_or("1G"),
                "-n",
                &base,
            ],
        )?;
        let base_path = format!("/dev/{}/{}", self.volume_group(), base);
        if !looks_like_raw_fs_image(&source)? {
            run_command("mkfs.ext4", &[&base_path])?;
        }
        run_command(
            "dd",
            &[
                &format!("if={}", source.display()),
                &format!("of={base_path}"),
                "bs=4M",
                "conv=fsync",
            ],
        )
    }
}

impl StorageBackend for LvmThinBackend {
    fn prepare(&self, spec: &Spec) -> Result<()> {
        self.ensure_base(spec)?;
        let snapshot = self.snapshot_name(spec);
        if !self.lv_exists(&snapshot)? {
            run_command(
                "lvcreate",
                &[
                    "-s",
                    "-n",
                    &snapshot,
                    &format!("{}/{}", self.volume_group(), self.base_name(spec)),
                ],
            )?;
        }
        run_command("lvchange", &["-ay", &self.device_path.to_string_lossy()])
    }

    fn device_path(&self, _spec: &Spec) -> String {
        self.device_path.to_string_lossy().into_owned()
    }

    fn delete(&self, spec: &Spec) -> Result<()> {
        let snapshot = self.snapshot_name(spec);
        if !self.lv_exists(&snapshot)? {
            return Ok(());
        }
        run_command(
            "lvremove",
            &["-f", &format!("{}/{}", self.volume_group(), snapshot)],
        )
    }
}
