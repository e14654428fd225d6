// xt_qtaguid control interface, used when the kernel cannot run the BPF
// accounting programs
//
// Every operation is a single line written to the module's ctrl file.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use crate::error::TrafficError;

#[derive(Debug, Clone)]
pub struct QtaguidCtrl {
    path: PathBuf,
}

impl QtaguidCtrl {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tag_socket(&self, fd: RawFd, tag: u32, uid: u32) -> Result<(), TrafficError> {
        self.write_command(&format!("t {} {} {}", fd, (tag as u64) << 32, uid))
    }

    pub fn untag_socket(&self, fd: RawFd) -> Result<(), TrafficError> {
        self.write_command(&format!("u {}", fd))
    }

    pub fn set_counter_set(&self, counter_set: u32, uid: u32) -> Result<(), TrafficError> {
        self.write_command(&format!("s {} {}", counter_set, uid))
    }

    pub fn delete_tag_data(&self, tag: u32, uid: u32) -> Result<(), TrafficError> {
        self.write_command(&format!("d {} {}", (tag as u64) << 32, uid))
    }

    fn write_command(&self, command: &str) -> Result<(), TrafficError> {
        log::debug!("qtaguid: {}", command);

        let result = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|mut ctrl| ctrl.write_all(command.as_bytes()));

        result.map_err(|io_error| {
            log::warn!(
                "qtaguid command '{}' failed on {}: {}",
                command,
                self.path.display(),
                io_error
            );
            TrafficError::Qtaguid {
                command: command.to_string(),
                path: self.path.clone(),
                io_error,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn ctrl_in(dir: &tempfile::TempDir) -> QtaguidCtrl {
        let path = dir.path().join("ctrl");
        fs::write(&path, b"").unwrap();
        QtaguidCtrl::new(path)
    }

    /// Runs `op` against an empty ctrl file and returns what it wrote
    fn written(ctrl: &QtaguidCtrl, op: impl FnOnce(&QtaguidCtrl) -> Result<(), TrafficError>) -> String {
        fs::write(ctrl.path(), b"").unwrap();
        op(ctrl).unwrap();
        fs::read_to_string(ctrl.path()).unwrap()
    }

    #[test]
    fn test_command_formats() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = ctrl_in(&dir);

        assert_eq!(
            written(&ctrl, |c| c.tag_socket(12, 3, 10005)),
            "t 12 12884901888 10005"
        );
        assert_eq!(written(&ctrl, |c| c.untag_socket(12)), "u 12");
        assert_eq!(written(&ctrl, |c| c.set_counter_set(1, 10005)), "s 1 10005");
        assert_eq!(written(&ctrl, |c| c.delete_tag_data(0, 10005)), "d 0 10005");
        assert_eq!(
            written(&ctrl, |c| c.delete_tag_data(7, 10005)),
            "d 30064771072 10005"
        );
    }

    #[test]
    fn test_missing_ctrl_surfaces_errno() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = QtaguidCtrl::new(dir.path().join("missing").join("ctrl"));

        let err = ctrl.untag_socket(3).unwrap_err();
        assert!(matches!(err, TrafficError::Qtaguid { .. }));
        assert_eq!(err.errno(), libc::ENOENT);
    }
}
