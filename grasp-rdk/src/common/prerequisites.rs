use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

use super::config::ServiceConfig;

#[derive(Error, Debug)]
pub enum PrerequisiteError {
    #[error("detection executable not found at {0}")]
    MissingExecutable(PathBuf),
    #[error("configuration file not found at {0}")]
    MissingConfig(PathBuf),
    #[error("cannot install auxiliary config {source_path} into {destination}: {error}")]
    InstallFailed {
        source_path: PathBuf,
        destination: PathBuf,
        error: io::Error,
    },
}

impl PrerequisiteError {
    /// The path an operator needs to fix.
    pub fn path(&self) -> &Path {
        match self {
            PrerequisiteError::MissingExecutable(path) => path,
            PrerequisiteError::MissingConfig(path) => path,
            PrerequisiteError::InstallFailed { destination, .. } => destination,
        }
    }
}

/// Checks that the detector and its configuration are in place before any
/// process is spawned, and lays auxiliary configs out where the detector
/// expects them relative to its own directory.
#[derive(Clone, Debug)]
pub struct PrerequisiteValidator {
    executable: PathBuf,
    primary_config: PathBuf,
    auxiliary_configs: Vec<PathBuf>,
    auxiliary_dir: PathBuf,
}

impl PrerequisiteValidator {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            executable: config.executable_path().to_path_buf(),
            primary_config: config.primary_config_path().to_path_buf(),
            auxiliary_configs: config.auxiliary_config_paths().to_vec(),
            auxiliary_dir: config.auxiliary_config_dir(),
        }
    }

    pub fn validate(&self) -> Result<(), PrerequisiteError> {
        if !self.executable.is_file() {
            return Err(PrerequisiteError::MissingExecutable(self.executable.clone()));
        }
        if !self.primary_config.is_file() {
            return Err(PrerequisiteError::MissingConfig(self.primary_config.clone()));
        }
        for source in &self.auxiliary_configs {
            self.install_auxiliary(source)?;
        }
        Ok(())
    }

    fn install_auxiliary(&self, source: &Path) -> Result<(), PrerequisiteError> {
        let Some(file_name) = source.file_name() else {
            return Err(PrerequisiteError::MissingConfig(source.to_path_buf()));
        };
        let destination = self.auxiliary_dir.join(file_name);
        if destination.is_file() {
            return Ok(());
        }
        if !source.is_file() {
            return Err(PrerequisiteError::MissingConfig(source.to_path_buf()));
        }
        let install_failed = |error| PrerequisiteError::InstallFailed {
            source_path: source.to_path_buf(),
            destination: destination.clone(),
            error,
        };
        fs::create_dir_all(&self.auxiliary_dir).map_err(install_failed)?;
        // the detector must never see a half-written config: copy next to the
        // destination, then rename into place
        let mut staged = tempfile::Builder::new()
            .prefix(".installing-")
            .tempfile_in(&self.auxiliary_dir)
            .map_err(install_failed)?;
        let mut reader = fs::File::open(source).map_err(install_failed)?;
        io::copy(&mut reader, staged.as_file_mut()).map_err(install_failed)?;
        staged
            .persist(&destination)
            .map_err(|err| install_failed(err.error))?;
        log::info!(
            "installed auxiliary config {} into {}",
            source.display(),
            destination.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{PrerequisiteError, PrerequisiteValidator};
    use crate::common::config::ServiceConfig;

    #[test_log::test]
    fn test_missing_executable_reported_first() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::new(dir.path().join("detect_grasps"), dir.path().join("nope.cfg"));
        let err = PrerequisiteValidator::new(&config).validate().unwrap_err();
        assert!(matches!(err, PrerequisiteError::MissingExecutable(_)));
        assert_eq!(err.path(), dir.path().join("detect_grasps"));
    }

    #[test_log::test]
    fn test_missing_primary_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("detect_grasps"), b"").unwrap();
        let config = ServiceConfig::new(dir.path().join("detect_grasps"), dir.path().join("eigen_params.cfg"));
        let err = PrerequisiteValidator::new(&config).validate().unwrap_err();
        assert!(matches!(err, PrerequisiteError::MissingConfig(ref p) if p.ends_with("eigen_params.cfg")));
    }

    #[test_log::test]
    fn test_auxiliary_config_installed_once() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        fs::create_dir_all(&build).unwrap();
        fs::write(build.join("detect_grasps"), b"").unwrap();
        fs::write(dir.path().join("eigen_params.cfg"), b"num_samples = 50").unwrap();
        fs::write(dir.path().join("hand_geometry.cfg"), b"finger_width = 0.01").unwrap();

        let config = ServiceConfig::new(build.join("detect_grasps"), dir.path().join("eigen_params.cfg"))
            .with_auxiliary_configs(vec![dir.path().join("hand_geometry.cfg")]);
        let validator = PrerequisiteValidator::new(&config);
        validator.validate().unwrap();
        let installed = build.join("cfg").join("hand_geometry.cfg");
        assert_eq!(fs::read(&installed).unwrap(), b"finger_width = 0.01");
        // nothing staged is left behind
        let entries: Vec<_> = fs::read_dir(build.join("cfg"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec!["hand_geometry.cfg"]);

        // an operator edit of the installed copy survives revalidation
        fs::write(&installed, b"finger_width = 0.02").unwrap();
        validator.validate().unwrap();
        assert_eq!(fs::read(&installed).unwrap(), b"finger_width = 0.02");

        // the source may disappear once the copy exists
        fs::remove_file(dir.path().join("hand_geometry.cfg")).unwrap();
        validator.validate().unwrap();
    }

    #[test_log::test]
    fn test_missing_auxiliary_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("detect_grasps"), b"").unwrap();
        fs::write(dir.path().join("eigen_params.cfg"), b"").unwrap();
        let config = ServiceConfig::new(dir.path().join("detect_grasps"), dir.path().join("eigen_params.cfg"))
            .with_auxiliary_configs(vec![dir.path().join("hand_geometry.cfg")]);
        let err = PrerequisiteValidator::new(&config).validate().unwrap_err();
        assert!(matches!(err, PrerequisiteError::MissingConfig(ref p) if p.ends_with("hand_geometry.cfg")));
        assert!(!dir.path().join("cfg").exists());
    }
}
