//! Optional explicit mount step for evidence images.
//!
//! Only used when the configuration carries a `mount` section. One mount is
//! shared by every preset of an evidence input and released once they finish.

use crate::config::MountConfig;
use crate::launcher::{capture_command, CommandLine, ProcessLauncher};
use crate::classifier::summarize_stderr;
use anyhow::{bail, Context, Result};
use std::path::Path;
use tempfile::TempDir;
use tqbundle_manifest::{AuditEntry, CommandRole};
use tracing::{debug, info, warn};

/// Substitute `{evidence}` and `{mountpoint}` in a command template.
pub fn render_template(template: &[String], evidence: &str, mountpoint: &str) -> Option<CommandLine> {
    let mut parts = template
        .iter()
        .map(|part| part.replace("{evidence}", evidence).replace("{mountpoint}", mountpoint));
    let program = parts.next()?;
    Some(CommandLine::new(program).args(parts))
}

/// A mounted evidence image.
pub struct EvidenceMount {
    evidence: String,
    mountpoint: Option<TempDir>,
    unmount: Vec<String>,
    released: bool,
    /// Mount and unmount commands run so far.
    pub audit: Vec<AuditEntry>,
}

impl EvidenceMount {
    /// Mount `evidence` on a fresh directory.
    pub async fn mount(
        launcher: &dyn ProcessLauncher,
        config: &MountConfig,
        evidence: &str,
    ) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("tqbundle-mnt-");
        let dir = match config.mount_root {
            Some(ref root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .context("Failed to create mountpoint")?;
        let mountpoint = dir.path().to_string_lossy().into_owned();

        let cmd = render_template(&config.mount, evidence, &mountpoint)
            .context("Mount command is empty")?;
        let shown = cmd.display();
        info!("Mounting {} at {}", evidence, mountpoint);

        let mut mount = Self {
            evidence: evidence.to_string(),
            mountpoint: Some(dir),
            unmount: config.unmount.clone(),
            released: false,
            audit: Vec::new(),
        };

        let output = match capture_command(launcher, cmd, None).await {
            Ok(output) => output,
            Err(e) => {
                mount.audit.push(AuditEntry::launch_failure(
                    shown,
                    CommandRole::Mount,
                    format!("{:#}", e),
                ));
                // Nothing was mounted.
                mount.released = true;
                return Err(e);
            }
        };
        mount.audit.push(AuditEntry::new(
            shown,
            CommandRole::Mount,
            output.started_at,
            output.completed_at,
            output.exit_code,
            output.stdout.len() as u64,
            output.stderr.len() as u64,
            (!output.success()).then(|| summarize_stderr(&output.stderr, output.exit_code)),
        ));
        if !output.success() {
            mount.released = true;
            bail!(
                "Mount of {} failed: {}",
                evidence,
                summarize_stderr(&output.stderr, output.exit_code)
            );
        }
        Ok(mount)
    }

    /// Directory the image is mounted on.
    pub fn path(&self) -> &Path {
        self.mountpoint
            .as_ref()
            .map(|d| d.path())
            .unwrap_or_else(|| Path::new(""))
    }

    /// Unmount and remove the mountpoint.
    pub async fn release(mut self, launcher: &dyn ProcessLauncher) -> Result<Vec<AuditEntry>> {
        self.released = true;
        let mountpoint = self.path().to_string_lossy().into_owned();
        let mut audit = std::mem::take(&mut self.audit);

        if let Some(cmd) = render_template(&self.unmount, &self.evidence, &mountpoint) {
            let shown = cmd.display();
            debug!("Unmounting {}", mountpoint);
            let output = capture_command(launcher, cmd, None).await;
            match output {
                Ok(output) => {
                    audit.push(AuditEntry::new(
                        shown,
                        CommandRole::Unmount,
                        output.started_at,
                        output.completed_at,
                        output.exit_code,
                        output.stdout.len() as u64,
                        output.stderr.len() as u64,
                        (!output.success())
                            .then(|| summarize_stderr(&output.stderr, output.exit_code)),
                    ));
                    if !output.success() {
                        bail!(
                            "Unmount of {} failed: {}",
                            mountpoint,
                            summarize_stderr(&output.stderr, output.exit_code)
                        );
                    }
                }
                Err(e) => {
                    audit.push(AuditEntry::launch_failure(
                        shown,
                        CommandRole::Unmount,
                        format!("{:#}", e),
                    ));
                    return Err(e);
                }
            }
        }

        if let Some(dir) = self.mountpoint.take() {
            dir.close().context("Failed to remove mountpoint")?;
        }
        Ok(audit)
    }
}

impl Drop for EvidenceMount {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mountpoint = self.path().to_string_lossy().into_owned();
        let Some(cmd) = render_template(&self.unmount, &self.evidence, &mountpoint) else {
            return;
        };
        warn!("Mount of {} dropped without release, unmounting", self.evidence);
        let status = std::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        if let Err(e) = status {
            warn!("Unmount of {} failed: {}", mountpoint, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template() {
        let template = vec![
            "mount-image".to_string(),
            "--ro".to_string(),
            "{evidence}".to_string(),
            "{mountpoint}".to_string(),
        ];
        let cmd = render_template(&template, "/cases/disk1.E01", "/mnt/x").unwrap();
        assert_eq!(cmd.program, "mount-image");
        assert_eq!(cmd.args, vec!["--ro", "/cases/disk1.E01", "/mnt/x"]);
        assert!(render_template(&[], "a", "b").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mount_and_release() {
        let launcher = crate::launcher::LocalLauncher::new();
        let root = tempfile::tempdir().unwrap();
        let config = MountConfig {
            mount: vec!["sh".into(), "-c".into(), "test -d \"$0\"".into(), "{mountpoint}".into()],
            unmount: vec!["true".into()],
            mount_root: Some(root.path().to_path_buf()),
        };

        let mount = EvidenceMount::mount(&launcher, &config, "/cases/disk1.img").await.unwrap();
        let path = mount.path().to_path_buf();
        assert!(path.starts_with(root.path()));
        assert!(path.is_dir());

        let audit = mount.release(&launcher).await.unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].role, CommandRole::Mount);
        assert_eq!(audit[1].role, CommandRole::Unmount);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_mount_is_error() {
        let launcher = crate::launcher::LocalLauncher::new();
        let config = MountConfig {
            mount: vec!["sh".into(), "-c".into(), "echo 'bad image' >&2; exit 1".into()],
            unmount: vec!["false".into()],
            mount_root: None,
        };
        let err = EvidenceMount::mount(&launcher, &config, "/cases/disk1.img")
            .await
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("bad image"));
    }
}
