use std::path::PathBuf;

use crate::config::StorageDefaults;
use crate::error::{AgentError, Result};
use crate::spec::Spec;

use super::{looks_like_raw_fs_image, run_command, run_command_stdout, StorageBackend};

const DEFAULT_SIZE: &str = "1G";

/// A thick LVM logical volume per VM, created and populated on first
/// `prepare`.
pub struct LvmBackend {
    defaults: StorageDefaults,
    device_path: PathBuf,
}

impl LvmBackend {
    pub fn new(defaults: StorageDefaults, device_path: PathBuf) -> Self {
        Self {
            defaults,
            device_path,
        }
    }

    fn volume_group(&self) -> &str {
        self.defaults.volume_group.as_deref().unwrap_or("fc-hostd")
    }

    fn lv_name(&self, spec: &Spec) -> String {
        format!("vm-{}", spec.name)
    }

    fn exists(&self) -> Result<bool> {
        match run_command_stdout(
            "lvs",
            &["--noheadings", "-o", "lv_name", self.volume_group()],
        ) {
            Ok(out) => Ok(out.lines().any(|l| l.trim() == self.lv_name_from_path())),
            Err(_) => Ok(false),
        }
    }

    fn lv_name_from_path(&self) -> String {
        self.device_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl StorageBackend for LvmBackend {
    fn prepare(&self, spec: &Spec) -> Result<()> {
        let source = PathBuf::from(&spec.rootfs_image_path);
        if !source.exists() {
            return Err(AgentError::NotFound(format!(
                "source image {} not found",
                source.display()
            )));
        }

        if !self.exists()? {
            let size = spec.storage.size.clone().unwrap_or_else(|| DEFAULT_SIZE.to_string());
            run_command(
                "lvcreate",
                &[
                    "-L",
                    &size,
                    "-n",
                    &self.lv_name(spec),
                    self.volume_group(),
                ],
            )?;

            if !looks_like_raw_fs_image(&source)? {
                run_command("mkfs.ext4", &[&self.device_path.to_string_lossy()])?;
            }
            run_command(
                "dd",
                &[
                    &format!("if={}", source.display()),
                    &format!("of={}", self.device_path.display()),
                    "bs=4M",
                    "conv=fsync",
                ],
            )?;
        }
        run_command("lvchange", &["-ay", &self.device_path.to_string_lossy()])?;
        Ok(())
    }

    fn device_path(&self, _spec: &Spec) -> String {
        self.device_path.to_string_lossy().into_owned()
    }

    fn delete(&self, spec: &Spec) -> Result<()> {
        if !self.exists()? {
            return Ok(());
        }
        run_command(
            "lvremove",
            &["-f", &format!("{}/{}", self.volume_group(), self.lv_name(spec))],
        )
    }
}
