use std::path::PathBuf;

use crate::error::{AgentError, Result};
use crate::spec::Spec;

use super::StorageBackend;

/// Copies the source image byte-for-byte to `volume_file` on first
/// `prepare`; a later `prepare` is a no-op if the destination exists.
pub struct FileBackend {
    volume_file: PathBuf,
}

impl FileBackend {
    pub fn new(volume_file: PathBuf) -> Self {
        Self { volume_file }
    }
}

impl StorageBackend for FileBackend {
    fn prepare(&self, spec: &Spec) -> Result<()> {
        if self.volume_file.exists() {
            return Ok(());
        }
        let source = PathBuf::from(&spec.rootfs_image_path);
        if !source.exists() {
            return Err(AgentError::NotFound(format!(
                "source image {} not found",
                source.display()
            )));
        }
        if source.is_dir() {
            return Err(AgentError::InvalidArgument(format!(
                "source image {} is a directory",
                source.display()
            )));
        }
        if let Some(dir) = self.volume_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::copy(&source, &self.volume_file)?;
        std::fs::set_permissions(
            &self.volume_file,
            std::os::unix::fs::PermissionsExt::from_mode(0o644),
        )?;
        Ok(())
    }

    fn device_path(&self, _spec: &Spec) -> String {
        self.volume_file.to_string_lossy().into_owned()
    }

    fn delete(&self, _spec: &Spec) -> Result<()> {
        match std::fs::remove_file(&self.volume_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec_with_source(source: &str) -> Spec {
        Spec {
            name: "vm-a".into(),
            cpus: 1,
            mem_mib: 512,
            nics: vec![],
            storage: crate::spec::StorageSelection {
                driver: "file".into(),
                volume_group: None,
                thinpool: None,
                size: None,
                volume_file: None,
            },
            net: crate::spec::NetSelection {
                driver: "linux-bridge-vlan".into(),
                host_bridge: "br0".into(),
                uplink: None,
            },
            kernel_image_path: "/kernel/vmlinux.bin".into(),
            rootfs_image_path: source.to_string(),
            boot_args: "console=ttyS0".into(),
            ssh_public_key: None,
        }
    }

    #[test]
    fn copies_source_once_and_sets_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("rootfs.img");
        std::fs::write(&source, b"disk-image-bytes").unwrap();
        let volume = dir.path().join("volumes").join("vm-a.img");
        let backend = FileBackend::new(volume.clone());
        let spec = spec_with_source(source.to_str().unwrap());

        backend.prepare(&spec).unwrap();
        assert_eq!(std::fs::read(&volume).unwrap(), b"disk-image-bytes");

        std::fs::write(&source, b"changed").unwrap();
        backend.prepare(&spec).unwrap();
        assert_eq!(std::fs::read(&volume).unwrap(), b"disk-image-bytes");
    }

    #[test]
    fn missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().join("vm-a.img");
        let backend = FileBackend::new(volume);
        let spec = spec_with_source(dir.path().join("absent.img").to_str().unwrap());
        let err = backend.prepare(&spec).unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[test]
    fn directory_source_is_invalid_argument() {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().join("vm-a.img");
        let backend = FileBackend::new(volume);
        let spec = spec_with_source(dir.path().to_str().unwrap());
        let err = backend.prepare(&spec).unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)));
    }

    #[test]
    fn delete_absent_volume_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().join("never-created.img");
        let backend = FileBackend::new(volume);
        let spec = spec_with_source("/unused.img");
        backend.delete(&spec).unwrap();
    }
}
